use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::app::config::ChannelSettings;
use crate::app::error::AppError;
use crate::app::logging::CommandLog;
use crate::app::models::CommandOutput;
use crate::app::shell::environment::{
    backend_candidates, detect_environment, locate_program, resolve_transport, HostEnvironment,
};

pub mod broker;
pub mod root;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::BrokerChannel;
pub use root::RootChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Root,
    Broker,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Root => f.write_str("root"),
            ChannelKind::Broker => f.write_str("broker"),
        }
    }
}

/// A live privileged shell. Everything above this layer is written against
/// this trait and never asks which variant it holds.
pub trait PrivilegedChannel {
    fn kind(&self) -> ChannelKind;

    fn trace_id(&self) -> &str;

    /// Runs one command. `ERR_TIMEOUT` when it outlives `timeout`,
    /// `ERR_CONNECTION` when the shell is gone.
    fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AppError>;

    fn close(&mut self);
}

/// Classifies the environment once, then opens the first variant that works.
pub fn open_channel(
    settings: &ChannelSettings,
    log: Arc<dyn CommandLog>,
    trace_id: &str,
) -> Result<Box<dyn PrivilegedChannel>, AppError> {
    let env = detect_environment();
    open_channel_with(env, settings, trace_id, locate_program, |kind| {
        let transport = resolve_transport(kind, env, settings, trace_id)?;
        let channel: Box<dyn PrivilegedChannel> = match kind {
            ChannelKind::Root => Box::new(RootChannel::open(
                transport,
                Arc::clone(&log),
                settings.open_timeout(),
                trace_id,
            )?),
            ChannelKind::Broker => Box::new(BrokerChannel::open(
                transport,
                Arc::clone(&log),
                settings.open_timeout(),
                trace_id,
            )?),
        };
        Ok(channel)
    })
}

/// Tries each candidate variant in order; the last failure is returned when none opens.
pub fn open_channel_with<L, O>(
    env: HostEnvironment,
    settings: &ChannelSettings,
    trace_id: &str,
    locate: L,
    mut open: O,
) -> Result<Box<dyn PrivilegedChannel>, AppError>
where
    L: Fn(&str) -> Option<PathBuf>,
    O: FnMut(ChannelKind) -> Result<Box<dyn PrivilegedChannel>, AppError>,
{
    let mut last_error = None;
    for kind in backend_candidates(settings.backend, env, settings, locate) {
        match open(kind) {
            Ok(channel) => {
                info!(trace_id = %trace_id, environment = %env, channel = %kind, "privileged channel ready");
                return Ok(channel);
            }
            Err(err) => {
                warn!(trace_id = %trace_id, environment = %env, channel = %kind, error = %err.error, "channel unavailable");
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| AppError::connection("No privileged channel is available", trace_id)))
}
