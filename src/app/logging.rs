use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::app::error::AppError;
use crate::app::models::{CommandOutput, JobResult};

pub fn init_logging(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// Append-only record of every channel command and every job result.
///
/// Read by humans only; nothing in the program parses it back.
pub trait CommandLog: Send + Sync {
    fn append(&self, line: &str);

    fn record_command(&self, command: &str, outcome: &Result<CommandOutput, AppError>) {
        let summary = match outcome {
            Ok(output) => format!(
                "exit={} stdout_bytes={} stderr_bytes={}",
                output
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                output.stdout.len(),
                output.stderr.len()
            ),
            Err(err) => format!("error={} code={}", err.error, err.code),
        };
        self.append(&format!("command `{command}` {summary}"));
    }

    fn record_job(&self, result: &JobResult) {
        let mut line = format!(
            "job package={} profile={} outcome={} duration_ms={}",
            result.package,
            result.profile,
            result.outcome.as_str(),
            result.duration.as_millis()
        );
        if let Some(detail) = result.error_detail.as_deref() {
            line.push_str(&format!(" detail={}", detail.replace('\n', " | ")));
        }
        self.append(&line);
    }
}

fn timestamped(line: &str) -> String {
    format!(
        "{} {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        line
    )
}

pub struct FileCommandLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileCommandLog {
    pub fn open(path: &Path, trace_id: &str) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create log dir: {err}"), trace_id)
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AppError::system(format!("Failed to open log file: {err}"), trace_id))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandLog for FileCommandLog {
    fn append(&self, line: &str) {
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(err) = writeln!(file, "{}", timestamped(line)) {
            warn!(path = %self.path.display(), error = %err, "failed to append to run log");
        }
    }
}

#[derive(Default)]
pub struct MemoryCommandLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl CommandLog for MemoryCommandLog {
    fn append(&self, line: &str) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push(timestamped(line));
        }
    }
}

pub struct NullCommandLog;

impl CommandLog for NullCommandLog {
    fn append(&self, _line: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::{JobOutcome, Profile};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn file_log_appends_across_reopen() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("nested").join("run.log");

        let log = FileCommandLog::open(&path, "trace").expect("open");
        log.append("first");
        drop(log);
        let log = FileCommandLog::open(&path, "trace").expect("reopen");
        log.append("second");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }

    #[test]
    fn records_commands_and_jobs_one_line_each() {
        let log = MemoryCommandLog::new();
        log.record_command(
            "pm list packages -3",
            &Ok(CommandOutput {
                stdout: "package:com.a\n".to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            }),
        );
        log.record_command(
            "cmd package compile -m speed -f com.a",
            &Err(AppError::timeout("Command timed out", "trace")),
        );
        log.record_job(&JobResult {
            package: "com.a".to_string(),
            profile: Profile::Speed,
            outcome: JobOutcome::Failed,
            duration: Duration::from_millis(1500),
            error_detail: Some("Failure\nline two".to_string()),
        });

        let lines = log.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("`pm list packages -3` exit=0"));
        assert!(lines[1].contains("code=ERR_TIMEOUT"));
        assert!(lines[2].contains("outcome=failed duration_ms=1500"));
        assert!(lines[2].contains("detail=Failure | line two"));
    }
}
