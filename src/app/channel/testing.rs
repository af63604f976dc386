use std::collections::VecDeque;
use std::time::Duration;

use crate::app::channel::{ChannelKind, PrivilegedChannel};
use crate::app::error::AppError;
use crate::app::models::CommandOutput;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Output(CommandOutput),
    Timeout,
    Lost,
}

impl Step {
    pub(crate) fn ok(stdout: &str) -> Self {
        Step::Output(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    pub(crate) fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Step::Output(CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
        })
    }
}

/// In-memory device: answers commands from a script, in order of registration.
pub(crate) struct ScriptedChannel {
    kind: ChannelKind,
    rules: Vec<(String, VecDeque<Step>)>,
    fallback: Step,
    lost: bool,
    pub(crate) commands: Vec<String>,
    pub(crate) timeouts_seen: Vec<Duration>,
    pub(crate) closed: bool,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self {
            kind: ChannelKind::Root,
            rules: Vec::new(),
            fallback: Step::ok("Success"),
            lost: false,
            commands: Vec::new(),
            timeouts_seen: Vec::new(),
            closed: false,
        }
    }

    pub(crate) fn with_kind(mut self, kind: ChannelKind) -> Self {
        self.kind = kind;
        self
    }

    /// The next command containing `pattern` gets `step`. Repeated calls queue.
    pub(crate) fn on(mut self, pattern: &str, step: Step) -> Self {
        match self.rules.iter_mut().find(|(existing, _)| existing == pattern) {
            Some((_, steps)) => steps.push_back(step),
            None => self.rules.push((pattern.to_string(), VecDeque::from([step]))),
        }
        self
    }
}

impl PrivilegedChannel for ScriptedChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn trace_id(&self) -> &str {
        "trace-scripted"
    }

    fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AppError> {
        self.commands.push(command.to_string());
        self.timeouts_seen.push(timeout);
        if self.lost || self.closed {
            return Err(AppError::connection("Privileged shell is closed", "trace-scripted"));
        }
        let step = self
            .rules
            .iter_mut()
            .find(|(pattern, steps)| command.contains(pattern.as_str()) && !steps.is_empty())
            .and_then(|(_, steps)| steps.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Output(output) => Ok(output),
            Step::Timeout => Err(AppError::timeout("Command timed out", "trace-scripted")),
            Step::Lost => {
                self.lost = true;
                Err(AppError::connection(
                    "Privileged shell exited while a command was running",
                    "trace-scripted",
                ))
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
