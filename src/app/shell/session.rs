use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::error::AppError;
use crate::app::logging::CommandLog;
use crate::app::models::CommandOutput;
use crate::app::shell::environment::ShellTransport;

pub const MARKER_PREFIX: &str = "__art_optimizer_";
const STDERR_GRACE: Duration = Duration::from_secs(2);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

static SESSION_OPEN: AtomicBool = AtomicBool::new(false);

/// Held by the one live session in this process.
struct SessionGuard;

impl SessionGuard {
    fn acquire(trace_id: &str) -> Result<Self, AppError> {
        SESSION_OPEN
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| SessionGuard)
            .map_err(|_| {
                AppError::connection("A privileged session is already open in this process", trace_id)
            })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION_OPEN.store(false, Ordering::SeqCst);
    }
}

enum ReadOutcome {
    Complete { lines: Vec<String>, tail: String },
    TimedOut,
    Disconnected,
}

/// One interactive shell process fed through stdin.
///
/// Each command is followed by a uniquely named marker echoed on both streams,
/// so completion and `$?` are detected without relying on a prompt. Markers of
/// commands that timed out stay queued as stale: whatever arrives before them
/// belongs to the abandoned command and is dropped.
pub struct ShellSession {
    transport: ShellTransport,
    session_id: String,
    trace_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
    stale_stdout: VecDeque<String>,
    stale_stderr: VecDeque<String>,
    log: Arc<dyn CommandLog>,
    closed: bool,
    _guard: SessionGuard,
}

impl ShellSession {
    pub fn spawn(
        transport: ShellTransport,
        log: Arc<dyn CommandLog>,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let guard = SessionGuard::acquire(trace_id)?;

        let mut command = Command::new(&transport.program);
        command
            .args(&transport.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C must not reach a running compile.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|err| {
                AppError::connection(
                    format!("Failed to start {}: {err}", transport.describe()),
                    trace_id,
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::connection("Failed to capture stdin", trace_id))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::connection("Failed to capture stdout", trace_id))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::connection("Failed to capture stderr", trace_id))?;

        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();
        forward_lines(stdout, stdout_tx);
        forward_lines(stderr, stderr_tx);

        let session_id = Uuid::new_v4().to_string();
        log.append(&format!(
            "session {session_id} opened via `{}`",
            transport.describe()
        ));
        debug!(trace_id = %trace_id, session_id = %session_id, transport = %transport.describe(), "privileged shell started");

        Ok(Self {
            transport,
            session_id,
            trace_id: trace_id.to_string(),
            child,
            stdin: Some(stdin),
            stdout_rx,
            stderr_rx,
            stale_stdout: VecDeque::new(),
            stale_stderr: VecDeque::new(),
            log,
            closed: false,
            _guard: guard,
        })
    }

    pub fn transport(&self) -> &ShellTransport {
        &self.transport
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Runs one command. Takes `&mut self`, so only one command is ever in flight.
    pub fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AppError> {
        let result = self.execute_inner(command, timeout);
        self.log.record_command(command, &result);
        match &result {
            Ok(output) => debug!(
                trace_id = %self.trace_id,
                command = %command,
                exit_code = ?output.exit_code,
                "command finished"
            ),
            Err(err) => warn!(
                trace_id = %self.trace_id,
                command = %command,
                code = %err.code,
                error = %err.error,
                "command did not complete"
            ),
        }
        result
    }

    fn execute_inner(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AppError> {
        if self.closed {
            return Err(AppError::connection("Privileged shell is closed", &self.trace_id));
        }
        if command.trim().is_empty() {
            return Err(AppError::validation("Command is empty", &self.trace_id));
        }
        if !self.stale_stdout.is_empty() {
            self.settle_previous(timeout)?;
        }

        let id = Uuid::new_v4().simple().to_string();
        let marker = format!("{MARKER_PREFIX}{id}__");
        // Quoted in two halves so a shell that echoes its input never prints the marker itself.
        let spoken = format!("\"{MARKER_PREFIX}\"\"{id}__\"");
        let script = format!("{{\n{command}\n}} </dev/null\necho {spoken} $?\necho {spoken} >&2\n");

        let write_result = match self.stdin.as_mut() {
            Some(stdin) => stdin
                .write_all(script.as_bytes())
                .and_then(|_| stdin.flush()),
            None => Err(std::io::Error::other("stdin already closed")),
        };
        if let Err(err) = write_result {
            self.mark_lost();
            return Err(AppError::connection(
                format!("Privileged shell is gone: {err}"),
                &self.trace_id,
            ));
        }

        let deadline = Instant::now() + timeout;
        let (stdout_lines, tail) =
            match collect_until_marker(&self.stdout_rx, &mut self.stale_stdout, &marker, deadline) {
                ReadOutcome::Complete { lines, tail } => (lines, tail),
                ReadOutcome::TimedOut => {
                    self.stale_stdout.push_back(marker.clone());
                    self.stale_stderr.push_back(marker);
                    return Err(AppError::timeout(
                        format!(
                            "Command did not finish within {}s; its effect on the device is unknown",
                            timeout.as_secs()
                        ),
                        &self.trace_id,
                    ));
                }
                ReadOutcome::Disconnected => {
                    self.mark_lost();
                    return Err(AppError::connection(
                        "Privileged shell exited while a command was running",
                        &self.trace_id,
                    ));
                }
            };
        let exit_code = tail
            .split_whitespace()
            .next()
            .and_then(|code| code.parse::<i32>().ok());

        let stderr_deadline = Instant::now() + STDERR_GRACE;
        let stderr_lines = match collect_until_marker(
            &self.stderr_rx,
            &mut self.stale_stderr,
            &marker,
            stderr_deadline,
        ) {
            ReadOutcome::Complete { lines, .. } => lines,
            ReadOutcome::TimedOut => {
                self.stale_stderr.push_back(marker);
                Vec::new()
            }
            ReadOutcome::Disconnected => Vec::new(),
        };

        Ok(CommandOutput {
            stdout: stdout_lines.join("\n"),
            stderr: stderr_lines.join("\n"),
            exit_code,
        })
    }

    /// Waits, up to `limit`, for commands abandoned on timeout to finish.
    /// Nothing new is written while one is still running.
    fn settle_previous(&mut self, limit: Duration) -> Result<(), AppError> {
        let deadline = Instant::now() + limit;
        match discard_until_settled(&self.stdout_rx, &mut self.stale_stdout, deadline) {
            ReadOutcome::Complete { .. } => {}
            ReadOutcome::TimedOut => {
                return Err(AppError::timeout(
                    format!(
                        "Channel is still busy with a previous command after waiting {}s",
                        limit.as_secs()
                    ),
                    &self.trace_id,
                ));
            }
            ReadOutcome::Disconnected => {
                self.mark_lost();
                return Err(AppError::connection(
                    "Privileged shell exited while finishing a previous command",
                    &self.trace_id,
                ));
            }
        }
        let stderr_deadline = Instant::now() + STDERR_GRACE;
        // Stderr markers still pending are handled by `collect_until_marker`.
        let _ = discard_until_settled(&self.stderr_rx, &mut self.stale_stderr, stderr_deadline);
        debug!(trace_id = %self.trace_id, "previous command finished; channel free");
        Ok(())
    }

    fn mark_lost(&mut self) {
        self.closed = true;
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Asks the shell to exit, then kills it if it lingers.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"exit\n");
            let _ = stdin.flush();
        }
        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if start.elapsed() < CLOSE_GRACE => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        self.log.append(&format!("session {} closed", self.session_id));
        debug!(trace_id = %self.trace_id, session_id = %self.session_id, "privileged shell closed");
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward_lines(stream: impl Read + Send + 'static, tx: Sender<String>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else {
                break;
            };
            let line = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string();
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn collect_until_marker(
    rx: &Receiver<String>,
    stale: &mut VecDeque<String>,
    marker: &str,
    deadline: Instant,
) -> ReadOutcome {
    let mut lines = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = match rx.recv_timeout(remaining) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => return ReadOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => return ReadOutcome::Disconnected,
        };

        if let Some(pos) = line.find(marker) {
            if pos > 0 {
                lines.push(line[..pos].to_string());
            }
            let tail = line[pos + marker.len()..].trim().to_string();
            return ReadOutcome::Complete { lines, tail };
        }

        let stale_done = stale
            .front()
            .is_some_and(|stale_marker| line.contains(stale_marker.as_str()));
        if stale_done {
            // Everything read so far was output of the abandoned command.
            stale.pop_front();
            lines.clear();
            continue;
        }
        lines.push(line);
    }
}

fn discard_until_settled(
    rx: &Receiver<String>,
    stale: &mut VecDeque<String>,
    deadline: Instant,
) -> ReadOutcome {
    while let Some(stale_marker) = stale.front() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(line) if line.contains(stale_marker.as_str()) => {
                stale.pop_front();
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => return ReadOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => return ReadOutcome::Disconnected,
        }
    }
    ReadOutcome::Complete {
        lines: Vec::new(),
        tail: String::new(),
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::session_lock;
    use super::*;
    use crate::app::logging::MemoryCommandLog;

    fn sh_session(log: Arc<MemoryCommandLog>) -> ShellSession {
        ShellSession::spawn(ShellTransport::new("sh", &[]), log, "trace-session").expect("spawn sh")
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));

        let ok = session
            .execute("echo hello; echo world", Duration::from_secs(5))
            .expect("echo");
        assert_eq!(ok.stdout, "hello\nworld");
        assert_eq!(ok.exit_code, Some(0));

        let failed = session
            .execute("echo oops >&2; false", Duration::from_secs(5))
            .expect("false");
        assert_eq!(failed.stderr, "oops");
        assert_eq!(failed.exit_code, Some(1));
        assert!(!failed.success());
    }

    #[test]
    fn output_without_trailing_newline_is_kept() {
        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));
        let output = session
            .execute("printf 'no-newline'", Duration::from_secs(5))
            .expect("printf");
        assert_eq!(output.stdout, "no-newline");
        assert_eq!(output.exit_code, Some(0));
    }

    #[test]
    fn late_output_of_timed_out_command_is_not_misattributed() {
        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));

        let err = session
            .execute("sleep 1; echo late; echo late-err >&2", Duration::from_millis(200))
            .expect_err("expected timeout");
        assert!(err.is_timeout());

        let next = session
            .execute("echo next", Duration::from_secs(5))
            .expect("next command");
        assert_eq!(next.stdout, "next");
        assert_eq!(next.stderr, "");
        assert_eq!(next.exit_code, Some(0));
    }

    #[test]
    fn next_command_gets_its_own_budget_after_a_timeout() {
        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));

        let err = session
            .execute("sleep 2; echo slow", Duration::from_millis(300))
            .expect_err("expected timeout");
        assert!(err.is_timeout());

        // Waits for `sleep 2` to end first; the 1s budget only starts afterwards.
        let started = Instant::now();
        let quick = session
            .execute("echo quick", Duration::from_secs(1))
            .expect("quick command after the slow one finished");
        assert_eq!(quick.stdout, "quick");
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[test]
    fn busy_channel_does_not_queue_the_next_command() {
        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));

        session
            .execute("sleep 2", Duration::from_millis(200))
            .expect_err("expected timeout");
        let busy = session
            .execute("echo queued", Duration::from_millis(300))
            .expect_err("previous command still running");
        assert!(busy.is_timeout());
        assert!(busy.error.contains("still busy"));

        let after = session
            .execute("echo after", Duration::from_secs(5))
            .expect("channel free again");
        assert_eq!(after.stdout, "after");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn shell_runs_in_its_own_process_group() {
        fn process_group(stat: &str) -> Option<String> {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().nth(2).map(str::to_string)
        }

        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));
        let shell_stat = session
            .execute("cat /proc/$$/stat", Duration::from_secs(5))
            .expect("read shell stat");
        let own_stat = std::fs::read_to_string("/proc/self/stat").expect("read own stat");

        let shell_group = process_group(&shell_stat.stdout).expect("shell pgrp");
        let own_group = process_group(&own_stat).expect("own pgrp");
        assert_ne!(shell_group, own_group);
    }

    #[test]
    fn exited_shell_is_a_connection_error() {
        let _lock = session_lock();
        let mut session = sh_session(Arc::new(MemoryCommandLog::new()));

        let err = session
            .execute("exit 3", Duration::from_secs(5))
            .expect_err("shell exits");
        assert!(err.is_connection());
        assert!(session.is_closed());

        let err = session
            .execute("echo again", Duration::from_secs(5))
            .expect_err("closed session");
        assert!(err.is_connection());
    }

    #[test]
    fn only_one_session_per_process() {
        let _lock = session_lock();
        let log = Arc::new(MemoryCommandLog::new());
        let mut first = sh_session(Arc::clone(&log));
        let err = ShellSession::spawn(ShellTransport::new("sh", &[]), log.clone(), "t")
            .err()
            .expect("second session refused");
        assert!(err.is_connection());

        first.close();
        drop(first);
        let second = ShellSession::spawn(ShellTransport::new("sh", &[]), log, "t");
        assert!(second.is_ok());
    }

    #[test]
    fn commands_are_recorded_in_the_run_log() {
        let _lock = session_lock();
        let log = Arc::new(MemoryCommandLog::new());
        {
            let mut session = sh_session(Arc::clone(&log));
            session.execute("true", Duration::from_secs(5)).expect("true");
        }
        let lines = log.lines();
        assert!(lines.iter().any(|line| line.contains("opened via `sh`")));
        assert!(lines.iter().any(|line| line.contains("command `true` exit=0")));
        assert!(lines.iter().any(|line| line.contains("closed")));
    }
}
