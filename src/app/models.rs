use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type PackageName = String;

/// Compilation state reported by the device for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompilationStatus {
    Everything,
    EverythingProfile,
    Speed,
    SpeedProfile,
    Space,
    SpaceProfile,
    Verify,
    Quicken,
    Extract,
    Unknown,
}

impl CompilationStatus {
    pub const ALL: [CompilationStatus; 10] = [
        CompilationStatus::Everything,
        CompilationStatus::EverythingProfile,
        CompilationStatus::Speed,
        CompilationStatus::SpeedProfile,
        CompilationStatus::Space,
        CompilationStatus::SpaceProfile,
        CompilationStatus::Verify,
        CompilationStatus::Quicken,
        CompilationStatus::Extract,
        CompilationStatus::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CompilationStatus::Everything => "everything",
            CompilationStatus::EverythingProfile => "everything-profile",
            CompilationStatus::Speed => "speed",
            CompilationStatus::SpeedProfile => "speed-profile",
            CompilationStatus::Space => "space",
            CompilationStatus::SpaceProfile => "space-profile",
            CompilationStatus::Verify => "verify",
            CompilationStatus::Quicken => "quicken",
            CompilationStatus::Extract => "extract",
            CompilationStatus::Unknown => "unknown",
        }
    }

    /// Maps a raw status token onto the closed set. Anything unrecognised is `Unknown`.
    pub fn from_token(token: &str) -> Self {
        let normalized = token.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .unwrap_or(CompilationStatus::Unknown)
    }

    pub fn group(self) -> StatusGroup {
        match self {
            CompilationStatus::Everything | CompilationStatus::EverythingProfile => {
                StatusGroup::FullyOptimized
            }
            CompilationStatus::Speed
            | CompilationStatus::SpeedProfile
            | CompilationStatus::Space
            | CompilationStatus::SpaceProfile => StatusGroup::PartiallyOptimized,
            CompilationStatus::Verify | CompilationStatus::Quicken => {
                StatusGroup::MinimallyOptimized
            }
            CompilationStatus::Extract | CompilationStatus::Unknown => StatusGroup::Unknown,
        }
    }
}

impl fmt::Display for CompilationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusGroup {
    FullyOptimized,
    PartiallyOptimized,
    MinimallyOptimized,
    Unknown,
}

impl StatusGroup {
    pub const ORDER: [StatusGroup; 4] = [
        StatusGroup::FullyOptimized,
        StatusGroup::PartiallyOptimized,
        StatusGroup::MinimallyOptimized,
        StatusGroup::Unknown,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StatusGroup::FullyOptimized => "Fully Optimized",
            StatusGroup::PartiallyOptimized => "Partially Optimized",
            StatusGroup::MinimallyOptimized => "Minimally Optimized",
            StatusGroup::Unknown => "Unknown Status",
        }
    }
}

/// A compilation strategy that may be requested. `extract` and `unknown` are
/// observed-only states and have no counterpart here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    Everything,
    EverythingProfile,
    Speed,
    SpeedProfile,
    Space,
    SpaceProfile,
    Verify,
    Quicken,
}

impl Profile {
    pub const ALL: [Profile; 8] = [
        Profile::Everything,
        Profile::EverythingProfile,
        Profile::Speed,
        Profile::SpeedProfile,
        Profile::Space,
        Profile::SpaceProfile,
        Profile::Verify,
        Profile::Quicken,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Everything => "everything",
            Profile::EverythingProfile => "everything-profile",
            Profile::Speed => "speed",
            Profile::SpeedProfile => "speed-profile",
            Profile::Space => "space",
            Profile::SpaceProfile => "space-profile",
            Profile::Verify => "verify",
            Profile::Quicken => "quicken",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Profile::Everything => "Fully AOT compiled - fastest",
            Profile::EverythingProfile => "Profile guided - almost full AOT",
            Profile::Speed => "Full speed optimization without profiles",
            Profile::SpeedProfile => "Profile-guided speed AOT",
            Profile::Space => "Space-efficient full-ish compile",
            Profile::SpaceProfile => "Profile-guided for storage efficiency",
            Profile::Verify => "Verified only",
            Profile::Quicken => "DEX optimized",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Profile::ALL
            .into_iter()
            .find(|profile| profile.as_str() == normalized)
            .ok_or_else(|| {
                let allowed = Profile::ALL
                    .iter()
                    .map(|profile| profile.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Unsupported profile '{value}' (expected one of: {allowed})")
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub package: PackageName,
    pub status: CompilationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub package: PackageName,
    pub profile: Profile,
    pub outcome: JobOutcome,
    pub duration: Duration,
    pub error_detail: Option<String>,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tokens_collapse_to_unknown() {
        assert_eq!(
            CompilationStatus::from_token(" Speed-Profile "),
            CompilationStatus::SpeedProfile
        );
        assert_eq!(CompilationStatus::from_token("extract"), CompilationStatus::Extract);
        assert_eq!(CompilationStatus::from_token("run-from-apk"), CompilationStatus::Unknown);
        assert_eq!(CompilationStatus::from_token(""), CompilationStatus::Unknown);
    }

    #[test]
    fn profile_rejects_observed_only_states() {
        assert_eq!("space".parse::<Profile>(), Ok(Profile::Space));
        assert_eq!("EVERYTHING-PROFILE".parse::<Profile>(), Ok(Profile::EverythingProfile));
        assert!("extract".parse::<Profile>().is_err());
        assert!("unknown".parse::<Profile>().is_err());
        let err = "fast".parse::<Profile>().unwrap_err();
        assert!(err.contains("speed-profile"));
    }

    #[test]
    fn groups_statuses() {
        assert_eq!(CompilationStatus::EverythingProfile.group(), StatusGroup::FullyOptimized);
        assert_eq!(CompilationStatus::Space.group(), StatusGroup::PartiallyOptimized);
        assert_eq!(CompilationStatus::Quicken.group(), StatusGroup::MinimallyOptimized);
        assert_eq!(CompilationStatus::Extract.group(), StatusGroup::Unknown);
    }
}
