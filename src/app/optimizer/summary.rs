use std::time::Duration;

use serde::Serialize;

use crate::app::error::AppError;
use crate::app::models::{JobOutcome, JobResult, PackageName};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub total_duration: Duration,
    pub unsuccessful: Vec<PackageName>,
    pub channel_error: Option<String>,
    pub cancelled: bool,
    /// Freshly compiled apps lose scoped-storage access until the next boot.
    pub reboot_recommended: bool,
}

impl RunSummary {
    pub fn from_results(results: &[JobResult], channel_error: Option<&AppError>) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            channel_error: channel_error.map(|err| err.error.clone()),
            ..RunSummary::default()
        };
        for result in results {
            summary.total_duration += result.duration;
            match result.outcome {
                JobOutcome::Succeeded => summary.succeeded += 1,
                JobOutcome::Failed => summary.failed += 1,
                JobOutcome::TimedOut => summary.timed_out += 1,
            }
            if !result.succeeded() {
                summary.unsuccessful.push(result.package.clone());
            }
        }
        summary.reboot_recommended = summary.succeeded > 0;
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.total > 0 && self.succeeded == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::Profile;

    fn result(package: &str, outcome: JobOutcome, millis: u64) -> JobResult {
        JobResult {
            package: package.to_string(),
            profile: Profile::Speed,
            outcome,
            duration: Duration::from_millis(millis),
            error_detail: None,
        }
    }

    #[test]
    fn counts_outcomes() {
        let results = vec![
            result("com.a", JobOutcome::Succeeded, 1200),
            result("com.b", JobOutcome::TimedOut, 900),
            result("com.c", JobOutcome::Failed, 30),
            result("com.d", JobOutcome::Succeeded, 70),
        ];
        let summary = RunSummary::from_results(&results, None);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_duration, Duration::from_millis(2200));
        assert_eq!(summary.unsuccessful, vec!["com.b", "com.c"]);
        assert!(summary.reboot_recommended);
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn nothing_succeeded_means_no_reboot_advice() {
        let error = AppError::connection("Privileged shell exited", "t");
        let summary = RunSummary::from_results(
            &[result("com.a", JobOutcome::Failed, 5)],
            Some(&error),
        );
        assert!(!summary.reboot_recommended);
        assert_eq!(summary.channel_error.as_deref(), Some("Privileged shell exited"));
    }
}
