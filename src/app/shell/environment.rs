use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::app::channel::ChannelKind;
use crate::app::config::{BackendPreference, ChannelSettings};
use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEnvironment {
    /// Running in a terminal on the device itself.
    OnDevice,
    /// Running on a workstation that reaches the device over adb.
    HostBridge,
}

impl fmt::Display for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEnvironment::OnDevice => f.write_str("on-device"),
            HostEnvironment::HostBridge => f.write_str("host-bridge"),
        }
    }
}

pub fn detect_environment() -> HostEnvironment {
    let android_env = std::env::var_os("ANDROID_ROOT").is_some()
        || std::env::var_os("ANDROID_DATA").is_some();
    classify_environment(android_env, Path::new("/system/bin/app_process").exists())
}

pub fn classify_environment(android_env: bool, app_process_present: bool) -> HostEnvironment {
    if android_env || app_process_present {
        HostEnvironment::OnDevice
    } else {
        HostEnvironment::HostBridge
    }
}

/// Program plus arguments that, once spawned, reads shell commands from stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTransport {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellTransport {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

pub fn locate_program(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Order in which channel variants are attempted for a preference.
pub fn backend_candidates(
    preference: BackendPreference,
    env: HostEnvironment,
    settings: &ChannelSettings,
    locate: impl Fn(&str) -> Option<PathBuf>,
) -> Vec<ChannelKind> {
    match preference {
        BackendPreference::Root => vec![ChannelKind::Root],
        BackendPreference::Broker => vec![ChannelKind::Broker],
        BackendPreference::Auto => {
            let escalation_available = match env {
                HostEnvironment::OnDevice => {
                    locate(&settings.su_program).is_some()
                        || locate(&settings.sudo_program).is_some()
                }
                // Whether the device is rooted is only known after connecting.
                HostEnvironment::HostBridge => true,
            };
            if escalation_available {
                vec![ChannelKind::Root, ChannelKind::Broker]
            } else {
                vec![ChannelKind::Broker]
            }
        }
    }
}

pub fn resolve_transport(
    kind: ChannelKind,
    env: HostEnvironment,
    settings: &ChannelSettings,
    trace_id: &str,
) -> Result<ShellTransport, AppError> {
    resolve_transport_with(kind, env, settings, trace_id, locate_program)
}

pub fn resolve_transport_with(
    kind: ChannelKind,
    env: HostEnvironment,
    settings: &ChannelSettings,
    trace_id: &str,
    locate: impl Fn(&str) -> Option<PathBuf>,
) -> Result<ShellTransport, AppError> {
    match (env, kind) {
        (HostEnvironment::OnDevice, ChannelKind::Root) => {
            if locate(&settings.su_program).is_some() {
                return Ok(ShellTransport::new(settings.su_program.clone(), &[]));
            }
            if locate(&settings.sudo_program).is_some() {
                return Ok(ShellTransport::new(settings.sudo_program.clone(), &["-n", "sh"]));
            }
            Err(AppError::connection(
                format!(
                    "Neither {} nor {} is available for root access",
                    settings.su_program, settings.sudo_program
                ),
                trace_id,
            ))
        }
        (HostEnvironment::OnDevice, ChannelKind::Broker) => {
            let mut candidates = vec![settings.broker_program.as_str(), "rish", "shizuku"];
            candidates.dedup();
            candidates
                .into_iter()
                .find(|name| locate(name).is_some())
                .map(|name| ShellTransport::new(name, &[]))
                .ok_or_else(|| {
                    AppError::connection(
                        format!(
                            "Broker shell {} not found; is the broker service running and its launcher installed?",
                            settings.broker_program
                        ),
                        trace_id,
                    )
                })
        }
        (HostEnvironment::HostBridge, kind) => {
            if locate(&settings.adb_program).is_none() {
                return Err(AppError::connection(
                    format!("{} not found on this host", settings.adb_program),
                    trace_id,
                ));
            }
            let args: &[&str] = match kind {
                ChannelKind::Root => &["shell", "su"],
                ChannelKind::Broker => &["shell"],
            };
            Ok(ShellTransport::new(settings.adb_program.clone(), args))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only(present: &'static [&'static str]) -> impl Fn(&str) -> Option<PathBuf> {
        move |name: &str| {
            present
                .iter()
                .any(|candidate| *candidate == name)
                .then(|| PathBuf::from(format!("/bin/{name}")))
        }
    }

    #[test]
    fn classifies_environment() {
        assert_eq!(classify_environment(true, false), HostEnvironment::OnDevice);
        assert_eq!(classify_environment(false, true), HostEnvironment::OnDevice);
        assert_eq!(classify_environment(false, false), HostEnvironment::HostBridge);
    }

    #[test]
    fn on_device_root_prefers_su_then_sudo() {
        let settings = ChannelSettings::default();
        let su = resolve_transport_with(
            ChannelKind::Root,
            HostEnvironment::OnDevice,
            &settings,
            "t",
            only(&["su", "sudo"]),
        )
        .expect("su");
        assert_eq!(su, ShellTransport::new("su", &[]));

        let sudo = resolve_transport_with(
            ChannelKind::Root,
            HostEnvironment::OnDevice,
            &settings,
            "t",
            only(&["sudo"]),
        )
        .expect("sudo");
        assert_eq!(sudo.describe(), "sudo -n sh");

        let err = resolve_transport_with(
            ChannelKind::Root,
            HostEnvironment::OnDevice,
            &settings,
            "t",
            only(&[]),
        )
        .expect_err("no escalation");
        assert!(err.is_connection());
    }

    #[test]
    fn on_device_broker_falls_back_to_known_launchers() {
        let settings = ChannelSettings::default();
        let transport = resolve_transport_with(
            ChannelKind::Broker,
            HostEnvironment::OnDevice,
            &settings,
            "t",
            only(&["shizuku"]),
        )
        .expect("broker");
        assert_eq!(transport.program, "shizuku");
    }

    #[test]
    fn host_bridge_goes_through_adb() {
        let settings = ChannelSettings::default();
        let root = resolve_transport_with(
            ChannelKind::Root,
            HostEnvironment::HostBridge,
            &settings,
            "t",
            only(&["adb"]),
        )
        .expect("root");
        assert_eq!(root.describe(), "adb shell su");
        let broker = resolve_transport_with(
            ChannelKind::Broker,
            HostEnvironment::HostBridge,
            &settings,
            "t",
            only(&["adb"]),
        )
        .expect("broker");
        assert_eq!(broker.describe(), "adb shell");
        assert!(resolve_transport_with(
            ChannelKind::Broker,
            HostEnvironment::HostBridge,
            &settings,
            "t",
            only(&[]),
        )
        .is_err());
    }

    #[test]
    fn auto_prefers_root_when_escalation_exists() {
        let settings = ChannelSettings::default();
        assert_eq!(
            backend_candidates(
                BackendPreference::Auto,
                HostEnvironment::OnDevice,
                &settings,
                only(&["su"])
            ),
            vec![ChannelKind::Root, ChannelKind::Broker]
        );
        assert_eq!(
            backend_candidates(
                BackendPreference::Auto,
                HostEnvironment::OnDevice,
                &settings,
                only(&["rish"])
            ),
            vec![ChannelKind::Broker]
        );
        assert_eq!(
            backend_candidates(
                BackendPreference::Broker,
                HostEnvironment::OnDevice,
                &settings,
                only(&["su"])
            ),
            vec![ChannelKind::Broker]
        );
    }
}
