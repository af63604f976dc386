use std::collections::BTreeSet;

use serde::Serialize;
use tracing::warn;

use crate::app::channel::PrivilegedChannel;
use crate::app::config::OptimizerSettings;
use crate::app::device::commands::DEXOPT_DUMP;
use crate::app::device::dexopt::parse_statuses;
use crate::app::device::packages::list_user_packages;
use crate::app::error::AppError;
use crate::app::models::{AppRecord, PackageName, StatusGroup};

/// Snapshot of installed user apps and their compilation status. Rebuilt from
/// scratch whenever fresh status is wanted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Inventory {
    pub records: Vec<AppRecord>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InventoryGroup {
    pub group: StatusGroup,
    pub records: Vec<AppRecord>,
}

impl Inventory {
    pub fn from_parts(packages: &BTreeSet<PackageName>, dump: &str) -> Self {
        let statuses = parse_statuses(dump, packages);
        // BTreeMap iteration keeps records sorted by package name.
        let records = statuses
            .into_iter()
            .map(|(package, status)| AppRecord { package, status })
            .collect();
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, package: &str) -> bool {
        self.records
            .binary_search_by(|record| record.package.as_str().cmp(package))
            .is_ok()
    }

    pub fn packages(&self) -> Vec<PackageName> {
        self.records.iter().map(|record| record.package.clone()).collect()
    }

    /// Case-insensitive match on package name or status name.
    pub fn filter(&self, query: &str) -> Inventory {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.clone();
        }
        Inventory {
            records: self
                .records
                .iter()
                .filter(|record| {
                    record.package.to_lowercase().contains(&query)
                        || record.status.as_str().contains(&query)
                })
                .cloned()
                .collect(),
        }
    }

    /// Non-empty groups in display order.
    pub fn grouped(&self) -> Vec<InventoryGroup> {
        StatusGroup::ORDER
            .into_iter()
            .filter_map(|group| {
                let records: Vec<AppRecord> = self
                    .records
                    .iter()
                    .filter(|record| record.status.group() == group)
                    .cloned()
                    .collect();
                (!records.is_empty()).then_some(InventoryGroup { group, records })
            })
            .collect()
    }
}

/// Lists packages, then reads their status. A dump that fails or times out
/// leaves every status `unknown`; a lost channel fails the load.
pub fn load_inventory(
    channel: &mut dyn PrivilegedChannel,
    settings: &OptimizerSettings,
) -> Result<Inventory, AppError> {
    let trace_id = channel.trace_id().to_string();
    let packages = list_user_packages(channel, settings.list_timeout())?;
    if packages.is_empty() {
        return Ok(Inventory::default());
    }

    let dump = match channel.run(DEXOPT_DUMP, settings.dump_timeout()) {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => {
            warn!(trace_id = %trace_id, exit_code = ?output.exit_code, "dexopt dump failed; statuses unknown");
            String::new()
        }
        Err(err) if err.is_connection() => return Err(err),
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err.error, "dexopt dump unavailable; statuses unknown");
            String::new()
        }
    };

    Ok(Inventory::from_parts(&packages, &dump))
}
