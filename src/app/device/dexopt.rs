//! Reads per-package compilation state out of `dumpsys package dexopt`.
//!
//! The dump is free-form. Each package block opens with its name in brackets,
//! followed by per-architecture lines carrying a `[status=...]` token:
//!
//! ```text
//!   [com.example.app]
//!     path: /data/app/~~x/com.example.app-y/base.apk
//!       arm64: [status=speed-profile] [reason=bg-dexopt] [primary-abi]
//!         [location is /data/app/~~x/com.example.app-y/oat/arm64/base.odex]
//!       arm: [status=verify] [reason=install]
//! ```
//!
//! The first architecture line of a block decides the package's status.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::app::models::{CompilationStatus, PackageName};

fn header_re() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^\s*\[([A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\]\s*$")
            .expect("header pattern")
    })
}

fn arch_re() -> &'static Regex {
    static ARCH: OnceLock<Regex> = OnceLock::new();
    ARCH.get_or_init(|| {
        Regex::new(r"^\s*(arm64|arm|x86_64|x86|riscv64)\s*:").expect("arch pattern")
    })
}

fn status_re() -> &'static Regex {
    static STATUS: OnceLock<Regex> = OnceLock::new();
    STATUS.get_or_init(|| Regex::new(r"\[status=([^\]]*)\]").expect("status pattern"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState<'a> {
    SeekingPackage,
    SeekingArchLine { package: &'a str },
}

/// Returns a status for every requested package. Packages without a block, or
/// whose block has no architecture line, stay `Unknown`; so do unrecognised
/// status tokens.
pub fn parse_statuses(
    dump: &str,
    packages: &BTreeSet<PackageName>,
) -> BTreeMap<PackageName, CompilationStatus> {
    let mut statuses: BTreeMap<PackageName, CompilationStatus> = packages
        .iter()
        .map(|package| (package.clone(), CompilationStatus::Unknown))
        .collect();
    let mut resolved: BTreeSet<&str> = BTreeSet::new();
    let mut state = ScanState::SeekingPackage;

    for line in dump.lines() {
        if let Some(header) = header_re().captures(line).and_then(|caps| caps.get(1)) {
            // A new header closes whatever block was open.
            let name = header.as_str();
            state = match packages.get(name) {
                Some(package) if !resolved.contains(package.as_str()) => {
                    ScanState::SeekingArchLine {
                        package: package.as_str(),
                    }
                }
                _ => ScanState::SeekingPackage,
            };
            continue;
        }

        let ScanState::SeekingArchLine { package } = state else {
            continue;
        };
        if !arch_re().is_match(line) {
            continue;
        }

        let status = match status_re().captures(line).and_then(|caps| caps.get(1)) {
            Some(token) => {
                let status = CompilationStatus::from_token(token.as_str());
                if status == CompilationStatus::Unknown {
                    debug!(package = %package, token = %token.as_str(), "unrecognised compilation status");
                }
                status
            }
            None => {
                debug!(package = %package, line = %line.trim(), "architecture line without status");
                CompilationStatus::Unknown
            }
        };
        statuses.insert(package.to_string(), status);
        resolved.insert(package);
        state = ScanState::SeekingPackage;
    }

    statuses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<PackageName> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn reads_first_architecture_of_each_block() {
        let dump = "[com.a]\n  arm64: [status=speed-profile]\n[com.b]\n  arm: [status=verify]";
        let statuses = parse_statuses(dump, &set(&["com.a", "com.b"]));
        assert_eq!(statuses["com.a"], CompilationStatus::SpeedProfile);
        assert_eq!(statuses["com.b"], CompilationStatus::Verify);
    }

    #[test]
    fn first_architecture_wins() {
        let dump = "[com.a]\n  arm64: [status=speed]\n  arm: [status=verify]\n";
        let statuses = parse_statuses(dump, &set(&["com.a"]));
        assert_eq!(statuses["com.a"], CompilationStatus::Speed);
    }

    #[test]
    fn missing_package_is_unknown() {
        let dump = "[com.a]\n  arm64: [status=speed]\n";
        let statuses = parse_statuses(dump, &set(&["com.a", "com.missing"]));
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["com.missing"], CompilationStatus::Unknown);
    }

    #[test]
    fn unrecognised_token_never_leaks_through() {
        let dump = "[com.a]\n  arm64: [status=run-from-apk]\n[com.b]\n  arm64: [status=spedd]\n";
        let statuses = parse_statuses(dump, &set(&["com.a", "com.b"]));
        assert_eq!(statuses["com.a"], CompilationStatus::Unknown);
        assert_eq!(statuses["com.b"], CompilationStatus::Unknown);
    }

    #[test]
    fn block_without_architecture_does_not_borrow_the_next_one() {
        let dump = "[com.a]\n  path: /data/app/a/base.apk\n[com.b]\n  arm64: [status=everything]\n";
        let statuses = parse_statuses(dump, &set(&["com.a", "com.b"]));
        assert_eq!(statuses["com.a"], CompilationStatus::Unknown);
        assert_eq!(statuses["com.b"], CompilationStatus::Everything);
    }

    #[test]
    fn architecture_line_without_token_is_unknown() {
        let dump = "[com.a]\n  arm64: [reason=install]\n  arm: [status=speed]\n";
        let statuses = parse_statuses(dump, &set(&["com.a"]));
        assert_eq!(statuses["com.a"], CompilationStatus::Unknown);
    }

    #[test]
    fn parses_a_device_style_dump() {
        let dump = r#"Dexopt state:
  [com.google.android.youtube]
    path: /data/app/~~Qx==/com.google.android.youtube-Zw==/base.apk
      arm64: [status=Speed-Profile] [reason=bg-dexopt] [primary-abi]
        [location is /data/app/~~Qx==/com.google.android.youtube-Zw==/oat/arm64/base.odex]
  [com.termux]
    path: /data/app/~~Ab==/com.termux-Cd==/base.apk
      arm64: [status=verify] [reason=install] [primary-abi]
  [org.unrequested.app]
    path: /data/app/~~Ef==/org.unrequested.app-Gh==/base.apk
      arm64: [status=everything] [reason=cmdline]
  [com.example.x86]
    path: /data/app/~~Ij==/com.example.x86-Kl==/base.apk
      x86_64: [status=extract] [reason=first-boot]

Dexopt lock:
"#;
        let statuses = parse_statuses(
            dump,
            &set(&["com.google.android.youtube", "com.termux", "com.example.x86"]),
        );
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses["com.google.android.youtube"], CompilationStatus::SpeedProfile);
        assert_eq!(statuses["com.termux"], CompilationStatus::Verify);
        assert_eq!(statuses["com.example.x86"], CompilationStatus::Extract);
    }

    #[test]
    fn empty_dump_leaves_everything_unknown() {
        let statuses = parse_statuses("", &set(&["com.a"]));
        assert_eq!(statuses["com.a"], CompilationStatus::Unknown);
    }
}
