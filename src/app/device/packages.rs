use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::app::channel::PrivilegedChannel;
use crate::app::device::commands::{is_valid_package_name, LIST_USER_PACKAGES};
use crate::app::error::AppError;
use crate::app::models::PackageName;

/// Lists user-installed packages. An empty set is a valid answer; a failing
/// command is an error.
pub fn list_user_packages(
    channel: &mut dyn PrivilegedChannel,
    timeout: Duration,
) -> Result<BTreeSet<PackageName>, AppError> {
    let trace_id = channel.trace_id().to_string();
    let output = channel.run(LIST_USER_PACKAGES, timeout)?;
    if !output.success() {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        return Err(AppError::command(
            format!("List packages failed: {detail}"),
            trace_id,
        ));
    }
    let packages = parse_package_list(&output.stdout);
    info!(trace_id = %trace_id, count = packages.len(), "listed user packages");
    Ok(packages)
}

pub fn parse_package_list(output: &str) -> BTreeSet<PackageName> {
    let mut packages = BTreeSet::new();
    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let payload = line.strip_prefix("package:").unwrap_or(line);
        // `pm list packages -f` prints `path=name`.
        let name = payload
            .rsplit_once('=')
            .map(|(_, pkg)| pkg)
            .unwrap_or(payload)
            .trim();
        if !is_valid_package_name(name) {
            debug!(line = %line, "skipping unrecognised package line");
            continue;
        }
        packages.insert(name.to_string());
    }
    packages
}
