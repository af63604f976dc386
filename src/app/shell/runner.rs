use std::io::Read;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::AppError;
use crate::app::models::CommandOutput;

/// Runs a host program to completion. Used for one-shot checks, never for the
/// privileged session itself.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn {program}: {err}"), trace_id))?;

    // Both pipes are drained concurrently so a chatty child cannot stall on a full buffer.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain_stdout(stdout);
    let stderr_handle = drain_stderr(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        format!("{program} timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll {program}: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn drain_stdout(stream: ChildStdout) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || drain(stream))
}

fn drain_stderr(stream: ChildStderr) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || drain(stream))
}

fn drain(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}
