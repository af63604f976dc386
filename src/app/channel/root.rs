use std::sync::Arc;
use std::time::Duration;

use crate::app::channel::{ChannelKind, PrivilegedChannel};
use crate::app::error::AppError;
use crate::app::logging::CommandLog;
use crate::app::models::CommandOutput;
use crate::app::shell::environment::ShellTransport;
use crate::app::shell::session::ShellSession;

/// Shell escalated through `su` or passwordless `sudo`.
pub struct RootChannel {
    session: ShellSession,
}

impl RootChannel {
    pub fn open(
        transport: ShellTransport,
        log: Arc<dyn CommandLog>,
        open_timeout: Duration,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let mut session = ShellSession::spawn(transport, log, trace_id)?;
        let uid = match session.execute("id -u", open_timeout) {
            Ok(output) => output.stdout.trim().to_string(),
            Err(err) => {
                session.close();
                return Err(AppError::connection(
                    format!(
                        "{} did not answer: {}",
                        session.transport().describe(),
                        err.error
                    ),
                    trace_id,
                ));
            }
        };
        if !is_root_uid(&uid) {
            session.close();
            return Err(AppError::connection(
                format!(
                    "{} runs as uid '{uid}', not root",
                    session.transport().describe()
                ),
                trace_id,
            ));
        }
        Ok(Self { session })
    }
}

/// True when any line of `id -u` output is `0`; some `su` builds print a banner first.
pub(crate) fn is_root_uid(output: &str) -> bool {
    output.lines().map(str::trim).any(|line| line == "0")
}

impl PrivilegedChannel for RootChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Root
    }

    fn trace_id(&self) -> &str {
        self.session.trace_id()
    }

    fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AppError> {
        self.session.execute(command, timeout)
    }

    fn close(&mut self) {
        self.session.close();
    }
}
