use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::app::channel::PrivilegedChannel;
use crate::app::error::AppError;
use crate::app::models::Profile;

pub const LIST_USER_PACKAGES: &str = "pm list packages -3";
pub const DEXOPT_DUMP: &str = "dumpsys package dexopt";
pub const REBOOT: &str = "reboot";

const REBOOT_TIMEOUT: Duration = Duration::from_secs(30);

fn package_name_re() -> &'static Regex {
    static PACKAGE: OnceLock<Regex> = OnceLock::new();
    PACKAGE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+$").expect("package pattern")
    })
}

pub fn is_valid_package_name(value: &str) -> bool {
    package_name_re().is_match(value)
}

/// Package names are interpolated into a shell line, so only well-formed ones pass.
pub fn compile_command(profile: Profile, package: &str, trace_id: &str) -> Result<String, AppError> {
    if !is_valid_package_name(package) {
        return Err(AppError::validation(
            format!("Invalid package name: {package:?}"),
            trace_id,
        ));
    }
    Ok(format!("cmd package compile -m {} -f {package}", profile.as_str()))
}

/// Reboots the device. Refused unless the operator confirmed.
pub fn reboot_device(channel: &mut dyn PrivilegedChannel, confirmed: bool) -> Result<(), AppError> {
    let trace_id = channel.trace_id().to_string();
    if !confirmed {
        return Err(AppError::validation(
            "Reboot requires explicit confirmation",
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, "rebooting device");
    match channel.run(REBOOT, REBOOT_TIMEOUT) {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(AppError::command(
            format!("Reboot failed: {}", output.stderr.trim()),
            trace_id,
        )),
        // The shell dies with the device; that is the expected outcome.
        Err(err) if err.is_connection() || err.is_timeout() => Ok(()),
        Err(err) => Err(err),
    }
}
