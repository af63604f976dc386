use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::app::channel::PrivilegedChannel;
use crate::app::device::commands::compile_command;
use crate::app::error::AppError;
use crate::app::logging::CommandLog;
use crate::app::models::{CommandOutput, JobOutcome, JobResult, PackageName, Profile};
use crate::app::optimizer::request::OptimizationRequest;

pub const CHANNEL_LOST_DETAIL: &str = "channel lost";
pub const CANCELLED_DETAIL: &str = "cancelled by operator";

/// Set by the operator to stop the run. Observed only between packages.
pub type CancelFlag = Arc<AtomicBool>;

/// Lazily compiles one package per `next()`, in selection order.
///
/// Every selected package yields exactly one result: packages left over after a
/// lost channel or a cancellation are reported `Failed` without being attempted.
pub struct OptimizationRun<'a> {
    channel: &'a mut dyn PrivilegedChannel,
    log: Arc<dyn CommandLog>,
    profile: Profile,
    timeout: Duration,
    queue: VecDeque<PackageName>,
    cancel: CancelFlag,
    cancelled: bool,
    channel_error: Option<AppError>,
    trace_id: String,
}

pub fn run_optimization<'a>(
    channel: &'a mut dyn PrivilegedChannel,
    request: &OptimizationRequest,
    timeout: Duration,
    log: Arc<dyn CommandLog>,
    cancel: CancelFlag,
) -> OptimizationRun<'a> {
    let trace_id = channel.trace_id().to_string();
    info!(
        trace_id = %trace_id,
        profile = %request.profile(),
        packages = request.packages().len(),
        timeout_secs = timeout.as_secs(),
        "starting optimization run"
    );
    OptimizationRun {
        channel,
        log,
        profile: request.profile(),
        timeout,
        queue: request.packages().iter().cloned().collect(),
        cancel,
        cancelled: false,
        channel_error: None,
        trace_id,
    }
}

impl OptimizationRun<'_> {
    /// The connection error that ended the run early, if any.
    pub fn channel_error(&self) -> Option<&AppError> {
        self.channel_error.as_ref()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn compile(&mut self, package: PackageName) -> JobResult {
        let started = Instant::now();
        let (outcome, detail) = match compile_command(self.profile, &package, &self.trace_id) {
            Ok(command) => match self.channel.run(&command, self.timeout) {
                Ok(output) => classify_output(&output),
                Err(err) if err.is_timeout() => (JobOutcome::TimedOut, Some(err.error)),
                Err(err) if err.is_connection() => {
                    warn!(trace_id = %self.trace_id, package = %package, error = %err.error, "channel lost during run");
                    let detail = format!("{CHANNEL_LOST_DETAIL}: {}", err.error);
                    self.channel_error = Some(err);
                    (JobOutcome::Failed, Some(detail))
                }
                Err(err) => (JobOutcome::Failed, Some(err.error)),
            },
            Err(err) => (JobOutcome::Failed, Some(err.error)),
        };
        self.finish(package, outcome, detail, started.elapsed())
    }

    fn skip(&mut self, package: PackageName, detail: &str) -> JobResult {
        self.finish(
            package,
            JobOutcome::Failed,
            Some(detail.to_string()),
            Duration::ZERO,
        )
    }

    fn finish(
        &mut self,
        package: PackageName,
        outcome: JobOutcome,
        error_detail: Option<String>,
        duration: Duration,
    ) -> JobResult {
        let result = JobResult {
            package,
            profile: self.profile,
            outcome,
            duration,
            error_detail,
        };
        self.log.record_job(&result);
        info!(
            trace_id = %self.trace_id,
            package = %result.package,
            outcome = result.outcome.as_str(),
            duration_ms = result.duration.as_millis() as u64,
            "package finished"
        );
        result
    }
}

impl Iterator for OptimizationRun<'_> {
    type Item = JobResult;

    fn next(&mut self) -> Option<JobResult> {
        let package = self.queue.pop_front()?;
        if self.channel_error.is_some() {
            return Some(self.skip(package, CHANNEL_LOST_DETAIL));
        }
        if !self.cancelled && self.cancel.load(Ordering::SeqCst) {
            info!(trace_id = %self.trace_id, remaining = self.queue.len() + 1, "run cancelled by operator");
            self.cancelled = true;
        }
        if self.cancelled {
            return Some(self.skip(package, CANCELLED_DETAIL));
        }
        Some(self.compile(package))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.len(), Some(self.queue.len()))
    }
}

impl ExactSizeIterator for OptimizationRun<'_> {}

/// `cmd package compile` can exit 0 and still print `Failure`/`Error` on stdout.
fn classify_output(output: &CommandOutput) -> (JobOutcome, Option<String>) {
    let reported_failure = output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Failure") || line.starts_with("Error"));
    match (output.success(), reported_failure) {
        (true, None) => (JobOutcome::Succeeded, None),
        (true, Some(line)) => (JobOutcome::Failed, Some(line.to_string())),
        (false, _) => (JobOutcome::Failed, Some(failure_detail(output))),
    }
}

fn failure_detail(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    match output.exit_code {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".to_string(),
    }
}
