use std::collections::HashSet;

use crate::app::device::commands::is_valid_package_name;
use crate::app::error::AppError;
use crate::app::inventory::Inventory;
use crate::app::models::{PackageName, Profile};

/// A validated selection: at least one well-formed package and an actionable
/// profile. Nothing reaches the device before this exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationRequest {
    packages: Vec<PackageName>,
    profile: Profile,
}

impl OptimizationRequest {
    pub fn new<I, S>(packages: I, profile: &str, trace_id: &str) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let profile = profile
            .parse::<Profile>()
            .map_err(|message| AppError::validation(message, trace_id))?;
        Self::with_profile(packages, profile, trace_id)
    }

    pub fn with_profile<I, S>(packages: I, profile: Profile, trace_id: &str) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for package in packages {
            let package = package.as_ref().trim();
            if !is_valid_package_name(package) {
                return Err(AppError::validation(
                    format!("Invalid package name: {package:?}"),
                    trace_id,
                ));
            }
            if seen.insert(package.to_string()) {
                ordered.push(package.to_string());
            }
        }
        if ordered.is_empty() {
            return Err(AppError::validation("Select at least one package", trace_id));
        }
        Ok(Self {
            packages: ordered,
            profile,
        })
    }

    /// Rejects packages that are not in the latest listing.
    pub fn validate_against(&self, inventory: &Inventory, trace_id: &str) -> Result<(), AppError> {
        let missing: Vec<&str> = self
            .packages
            .iter()
            .filter(|package| !inventory.contains(package))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(
                format!("Not installed as user apps: {}", missing.join(", ")),
                trace_id,
            ))
        }
    }

    pub fn packages(&self) -> &[PackageName] {
        &self.packages
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }
}
