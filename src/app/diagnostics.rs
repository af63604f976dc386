//! Advisory environment checks for the root setup. Nothing here mutates the device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::app::channel::root::is_root_uid;
use crate::app::channel::{ChannelKind, PrivilegedChannel, RootChannel};
use crate::app::config::ChannelSettings;
use crate::app::error::AppError;
use crate::app::logging::CommandLog;
use crate::app::shell::environment::{
    detect_environment, locate_program, resolve_transport, HostEnvironment,
};
use crate::app::shell::runner::run_command_with_timeout;

pub const CHECK_INTERPRETER: &str = "shell interpreter";
pub const CHECK_DEPENDENCIES: &str = "dependencies";
pub const CHECK_CHANNEL: &str = "privileged channel";
pub const CHECK_DEVICE_COMMANDS: &str = "device commands";

const DEVICE_TOOLS: [&str; 3] = ["pm", "cmd", "dumpsys"];
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(check: &str, detail: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(check: &str, detail: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub checks: Vec<CheckResult>,
}

impl DiagnosticReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn fail_count(&self) -> usize {
        self.checks.iter().filter(|check| !check.passed).count()
    }
}

/// Runs the full battery against a freshly opened root channel.
pub fn run_diagnostics(
    settings: &ChannelSettings,
    log: Arc<dyn CommandLog>,
    trace_id: &str,
) -> DiagnosticReport {
    let env = detect_environment();
    run_diagnostics_with(env, settings, trace_id, locate_program, || {
        let transport = resolve_transport(ChannelKind::Root, env, settings, trace_id)?;
        let channel = RootChannel::open(transport, log, settings.open_timeout(), trace_id)?;
        Ok(Box::new(channel) as Box<dyn PrivilegedChannel>)
    })
}

pub fn run_diagnostics_with<L, O>(
    env: HostEnvironment,
    settings: &ChannelSettings,
    trace_id: &str,
    locate: L,
    open_root: O,
) -> DiagnosticReport
where
    L: Fn(&str) -> Option<PathBuf>,
    O: FnOnce() -> Result<Box<dyn PrivilegedChannel>, AppError>,
{
    let mut checks = vec![
        check_shell_interpreter(trace_id),
        check_dependencies(env, settings, &locate),
    ];
    match open_root() {
        Ok(mut channel) => {
            checks.extend(diagnose(channel.as_mut(), settings.open_timeout()));
            channel.close();
        }
        Err(err) => {
            checks.push(CheckResult::fail(CHECK_CHANNEL, err.error));
            checks.push(CheckResult::fail(
                CHECK_DEVICE_COMMANDS,
                "not checked: no privileged channel",
            ));
        }
    }
    let report = DiagnosticReport { checks };
    info!(
        trace_id = %trace_id,
        checks = report.checks.len(),
        failed = report.fail_count(),
        "diagnostics finished"
    );
    report
}

/// Channel-side checks: root identity, then the device tool surface.
pub fn diagnose(channel: &mut dyn PrivilegedChannel, timeout: Duration) -> Vec<CheckResult> {
    vec![
        check_channel(channel, timeout),
        check_device_commands(channel, timeout),
    ]
}

pub fn check_shell_interpreter(trace_id: &str) -> CheckResult {
    let args = vec![
        "-c".to_string(),
        r#"echo "${BASH_VERSION:-${ZSH_VERSION:-posix}}""#.to_string(),
    ];
    match run_command_with_timeout("sh", &args, CHECK_TIMEOUT, trace_id) {
        Ok(output) if output.success() => {
            let flavour = output.stdout.trim();
            let location = locate_program("sh")
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "sh".to_string());
            CheckResult::pass(CHECK_INTERPRETER, format!("{location} ({flavour})"))
        }
        Ok(output) => CheckResult::fail(
            CHECK_INTERPRETER,
            format!("sh exited with {:?}: {}", output.exit_code, output.stderr.trim()),
        ),
        Err(err) => CheckResult::fail(CHECK_INTERPRETER, err.error),
    }
}

pub fn check_dependencies(
    env: HostEnvironment,
    settings: &ChannelSettings,
    locate: impl Fn(&str) -> Option<PathBuf>,
) -> CheckResult {
    let required: Vec<&str> = match env {
        HostEnvironment::HostBridge => vec![settings.adb_program.as_str()],
        HostEnvironment::OnDevice => Vec::new(),
    };
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for program in required {
        match locate(program) {
            Some(path) => found.push(path.display().to_string()),
            None => missing.push(program.to_string()),
        }
    }
    let escalation = match env {
        HostEnvironment::OnDevice => [&settings.su_program, &settings.sudo_program]
            .into_iter()
            .find_map(|program| locate(program.as_str())),
        // `su` lives on the device; only the bridge is checked from here.
        HostEnvironment::HostBridge => None,
    };
    match (env, escalation) {
        (HostEnvironment::OnDevice, Some(path)) => found.push(path.display().to_string()),
        (HostEnvironment::OnDevice, None) => {
            missing.push(format!("{} or {}", settings.su_program, settings.sudo_program))
        }
        (HostEnvironment::HostBridge, _) => {}
    }

    if missing.is_empty() {
        let detail = if found.is_empty() {
            "nothing required".to_string()
        } else {
            found.join(", ")
        };
        CheckResult::pass(CHECK_DEPENDENCIES, detail)
    } else {
        CheckResult::fail(CHECK_DEPENDENCIES, format!("not found: {}", missing.join(", ")))
    }
}

pub fn check_channel(channel: &mut dyn PrivilegedChannel, timeout: Duration) -> CheckResult {
    if channel.kind() != ChannelKind::Root {
        return CheckResult::fail(CHECK_CHANNEL, format!("{} channel is not root", channel.kind()));
    }
    match channel.run("id -u", timeout) {
        Ok(output) if output.success() && is_root_uid(&output.stdout) => {
            CheckResult::pass(CHECK_CHANNEL, "uid 0")
        }
        Ok(output) => CheckResult::fail(
            CHECK_CHANNEL,
            format!("id -u answered '{}'", output.stdout.trim()),
        ),
        Err(err) => CheckResult::fail(CHECK_CHANNEL, err.error),
    }
}

pub fn check_device_commands(channel: &mut dyn PrivilegedChannel, timeout: Duration) -> CheckResult {
    let script = format!(
        "for tool in {}; do command -v \"$tool\" >/dev/null 2>&1 || echo \"missing:$tool\"; done; echo \"sdk:$(getprop ro.build.version.sdk)\"",
        DEVICE_TOOLS.join(" ")
    );
    let output = match channel.run(&script, timeout) {
        Ok(output) => output,
        Err(err) => return CheckResult::fail(CHECK_DEVICE_COMMANDS, err.error),
    };

    let mut missing = Vec::new();
    let mut sdk = None;
    for line in output.stdout.lines().map(str::trim) {
        if let Some(tool) = line.strip_prefix("missing:") {
            missing.push(tool.to_string());
        } else if let Some(level) = line.strip_prefix("sdk:") {
            sdk = Some(level.trim().to_string()).filter(|level| !level.is_empty());
        }
    }
    let sdk = sdk.unwrap_or_else(|| "unknown".to_string());
    if missing.is_empty() {
        CheckResult::pass(
            CHECK_DEVICE_COMMANDS,
            format!("{} available; SDK {sdk}", DEVICE_TOOLS.join(", ")),
        )
    } else {
        CheckResult::fail(
            CHECK_DEVICE_COMMANDS,
            format!("missing {}; SDK {sdk}", missing.join(", ")),
        )
    }
}
