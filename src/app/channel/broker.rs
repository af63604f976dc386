use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::app::channel::{ChannelKind, PrivilegedChannel};
use crate::app::error::AppError;
use crate::app::logging::CommandLog;
use crate::app::models::CommandOutput;
use crate::app::shell::environment::ShellTransport;
use crate::app::shell::session::{ShellSession, MARKER_PREFIX};

const HANDSHAKE_TOKEN: &str = "art-optimizer-broker-ready";

/// Shell relayed by a broker service (a `rish`/`shizuku` launcher on the
/// device, or `adb shell` from a host). Runs with shell-user privilege.
pub struct BrokerChannel {
    session: ShellSession,
}

impl BrokerChannel {
    pub fn open(
        transport: ShellTransport,
        log: Arc<dyn CommandLog>,
        open_timeout: Duration,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let mut session = ShellSession::spawn(transport, log, trace_id)?;
        let handshake = format!("echo {HANDSHAKE_TOKEN}; id -u");
        let answer = match session.execute(&handshake, open_timeout) {
            Ok(output) => clean_broker_output(&handshake, &output.stdout),
            Err(err) => {
                session.close();
                return Err(AppError::connection(
                    format!(
                        "Broker {} did not answer: {}",
                        session.transport().describe(),
                        err.error
                    ),
                    trace_id,
                ));
            }
        };

        let mut lines = answer.lines().map(str::trim);
        if !lines.any(|line| line == HANDSHAKE_TOKEN) {
            session.close();
            return Err(AppError::connection(
                format!(
                    "Broker {} is not relaying commands; is its service running?",
                    session.transport().describe()
                ),
                trace_id,
            ));
        }
        let uid = lines.find_map(|line| line.parse::<u32>().ok());
        info!(
            trace_id = %trace_id,
            transport = %session.transport().describe(),
            uid = ?uid,
            "broker relaying commands"
        );
        Ok(Self { session })
    }
}

impl PrivilegedChannel for BrokerChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Broker
    }

    fn trace_id(&self) -> &str {
        self.session.trace_id()
    }

    fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AppError> {
        let mut output = self.session.execute(command, timeout)?;
        output.stdout = clean_broker_output(command, &output.stdout);
        Ok(output)
    }

    fn close(&mut self) {
        self.session.close();
    }
}

fn prompt_re() -> &'static Regex {
    static PROMPT: OnceLock<Regex> = OnceLock::new();
    PROMPT.get_or_init(|| {
        Regex::new(r"^(?:[\w.-]+@[\w.-]+:\S*\s*)?[$#] ").expect("prompt pattern")
    })
}

/// Interactive brokers may echo the script and print prompts around it. Only
/// that frame is removed: a leading echo of the whole command, a prompt in
/// front of the first line, and prompt or script lines trailing the output.
fn clean_broker_output(command: &str, stdout: &str) -> String {
    let quoted_marker = format!("\"{MARKER_PREFIX}\"");
    let lines: Vec<&str> = stdout
        .lines()
        .filter(|line| !line.contains(quoted_marker.as_str()))
        .collect();
    let bare = |line: &str| prompt_re().replace(line, "").trim().to_string();

    let echoed: Vec<&str> = std::iter::once("{")
        .chain(command.lines().map(str::trim).filter(|line| !line.is_empty()))
        .collect();
    let start = if lines.len() >= echoed.len()
        && lines.iter().zip(&echoed).all(|(line, input)| bare(*line) == *input)
    {
        echoed.len()
    } else {
        0
    };

    let mut end = lines.len();
    while end > start {
        let line = lines[end - 1];
        let stripped = bare(line);
        let prompt_only = !line.trim().is_empty() && stripped.is_empty();
        if prompt_only || stripped == "} </dev/null" {
            end -= 1;
        } else {
            break;
        }
    }

    let mut kept: Vec<String> = lines[start..end].iter().map(|line| line.to_string()).collect();
    if let Some(first) = kept.first_mut() {
        *first = prompt_re().replace(first, "").to_string();
    }
    kept.join("\n")
}
