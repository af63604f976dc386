use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::app::channel::{open_channel, PrivilegedChannel};
use crate::app::config::{
    backup_config_path, config_path, load_config, load_config_from_path, save_config,
    save_config_to_path, AppConfig, BackendPreference,
};
use crate::app::device::commands::reboot_device;
use crate::app::device::packages::list_user_packages;
use crate::app::diagnostics::{run_diagnostics, DiagnosticReport};
use crate::app::error::AppError;
use crate::app::inventory::{load_inventory, Inventory};
use crate::app::logging::{init_logging, CommandLog, FileCommandLog, NullCommandLog};
use crate::app::models::{JobResult, Profile};
use crate::app::optimizer::{
    run_optimization, CancelFlag, OptimizationRequest, OptimizationRun, RunSummary,
};

#[derive(Parser, Debug)]
#[command(
    name = "art_optimizer",
    version,
    about = "Compile installed Android apps ahead of time through a root or broker shell"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file (default: ~/.art_optimizer_config.json)")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, help = "Override the configured backend")]
    pub backend: Option<BackendPreference>,
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,
    #[arg(short = 'd', long, help = "Run environment diagnostics and exit")]
    pub diagnose: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show user apps and their compilation status (the default).
    List {
        #[arg(long, help = "Group apps by optimization level")]
        group: bool,
        #[arg(long, help = "Only apps whose name or status contains this text")]
        filter: Option<String>,
    },
    /// Compile the selected apps with one profile, one at a time.
    Optimize {
        #[arg(short, long, help = "speed-profile, speed, verify, quicken, space-profile, space, everything-profile or everything")]
        profile: String,
        #[arg(long, help = "Per-app timeout in seconds")]
        timeout: Option<u64>,
        #[arg(long, conflicts_with = "packages", help = "Every user app")]
        all: bool,
        packages: Vec<String>,
    },
    /// Reboot the device.
    Reboot {
        #[arg(long)]
        yes: bool,
    },
    /// Show the effective configuration.
    Config {
        #[arg(long, help = "Overwrite the config file with defaults")]
        reset: bool,
    },
}

struct Context {
    config: AppConfig,
    config_path: PathBuf,
    explicit_config: bool,
    log: Arc<dyn CommandLog>,
    json: bool,
    trace_id: String,
}

impl Context {
    fn open_channel(&self) -> Result<Box<dyn PrivilegedChannel>, AppError> {
        open_channel(&self.config.channel, Arc::clone(&self.log), &self.trace_id)
    }
}

pub fn execute(cli: Cli, trace_id: &str) -> Result<ExitCode, AppError> {
    let explicit_config = cli.config.is_some();
    let config_path = cli.config.clone().unwrap_or_else(config_path);
    let loaded = if explicit_config {
        load_config_from_path(&config_path)
    } else {
        load_config()
    };
    let mut config = loaded.map_err(|err| AppError::new(err.code, err.error, trace_id))?;
    init_logging(&config.logging.log_level);
    if let Some(backend) = cli.backend {
        config.channel.backend = backend;
    }
    info!(
        trace_id = %trace_id,
        config = %config_path.display(),
        backend = ?config.channel.backend,
        "art_optimizer starting"
    );

    let log = command_log(&config, trace_id);
    let ctx = Context {
        config,
        config_path,
        explicit_config,
        log,
        json: cli.json,
        trace_id: trace_id.to_string(),
    };

    if cli.diagnose {
        return diagnose(&ctx);
    }
    match cli.command.unwrap_or(Commands::List {
        group: false,
        filter: None,
    }) {
        Commands::List { group, filter } => list(&ctx, group, filter.as_deref()),
        Commands::Optimize {
            profile,
            timeout,
            all,
            packages,
        } => optimize(&ctx, &profile, timeout, all, &packages),
        Commands::Reboot { yes } => reboot(&ctx, yes),
        Commands::Config { reset } => show_config(&ctx, reset),
    }
}

fn command_log(config: &AppConfig, trace_id: &str) -> Arc<dyn CommandLog> {
    if !config.logging.log_to_file {
        return Arc::new(NullCommandLog);
    }
    let path = config.logging.resolved_log_path();
    match FileCommandLog::open(&path, trace_id) {
        Ok(log) => Arc::new(log),
        Err(err) => {
            warn!(trace_id = %trace_id, path = %path.display(), error = %err.error, "run log disabled");
            Arc::new(NullCommandLog)
        }
    }
}

fn print_json<T: Serialize>(value: &T, trace_id: &str) -> Result<(), AppError> {
    let payload = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::system(format!("Failed to serialize output: {err}"), trace_id))?;
    println!("{payload}");
    Ok(())
}

fn list(ctx: &Context, group: bool, filter: Option<&str>) -> Result<ExitCode, AppError> {
    let mut channel = ctx.open_channel()?;
    let inventory = load_inventory(channel.as_mut(), &ctx.config.optimizer)?;
    channel.close();

    let inventory = match filter {
        Some(query) => inventory.filter(query),
        None => inventory,
    };
    if ctx.json {
        if group {
            print_json(&inventory.grouped(), &ctx.trace_id)?;
        } else {
            print_json(&inventory, &ctx.trace_id)?;
        }
    } else {
        print!("{}", render_inventory(&inventory, group));
    }
    Ok(ExitCode::SUCCESS)
}

fn optimize(
    ctx: &Context,
    profile: &str,
    timeout: Option<u64>,
    all: bool,
    packages: &[String],
) -> Result<ExitCode, AppError> {
    let trace_id = ctx.trace_id.as_str();
    let profile: Profile = profile
        .parse()
        .map_err(|message| AppError::validation(message, trace_id))?;
    let timeout = match timeout {
        Some(0) => {
            return Err(AppError::validation("--timeout must be at least 1 second", trace_id));
        }
        Some(secs) => Duration::from_secs(secs),
        None => ctx.config.optimizer.command_timeout(),
    };
    let selected = if all {
        None
    } else if packages.is_empty() {
        return Err(AppError::validation(
            "Name the packages to optimize, or pass --all",
            trace_id,
        ));
    } else {
        Some(OptimizationRequest::with_profile(packages, profile, trace_id)?)
    };

    let mut channel = ctx.open_channel()?;
    let listed = list_user_packages(channel.as_mut(), ctx.config.optimizer.list_timeout())?;
    let request = match selected {
        Some(request) => {
            request.validate_against(&Inventory::from_parts(&listed, ""), trace_id)?;
            request
        }
        None if listed.is_empty() => {
            println!("No user apps installed.");
            return Ok(ExitCode::SUCCESS);
        }
        None => OptimizationRequest::with_profile(&listed, profile, trace_id)?,
    };

    if !ctx.json {
        println!(
            "Optimizing {} app(s) with profile {} (timeout {}s per app)",
            request.packages().len(),
            request.profile(),
            timeout.as_secs()
        );
    }
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&cancel), trace_id);
    let run = run_optimization(
        channel.as_mut(),
        &request,
        timeout,
        Arc::clone(&ctx.log),
        cancel,
    );
    let json = ctx.json;
    let summary = drive_run(run, |index, total, result| {
        if json {
            match serde_json::to_string(result) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "failed to serialize job result"),
            }
        } else {
            println!("{}", render_result(index, total, result));
        }
    });
    channel.close();

    if json {
        print_json(&summary, trace_id)?;
    } else {
        print!("{}", render_summary(&summary));
    }
    Ok(if summary.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Consumes a run, reporting each result as it arrives.
fn drive_run(
    mut run: OptimizationRun<'_>,
    mut emit: impl FnMut(usize, usize, &JobResult),
) -> RunSummary {
    let total = run.len();
    let mut results = Vec::with_capacity(total);
    for (index, result) in run.by_ref().enumerate() {
        emit(index + 1, total, &result);
        results.push(result);
    }
    let mut summary = RunSummary::from_results(&results, run.channel_error());
    summary.cancelled = run.was_cancelled();
    summary
}

/// First Ctrl-C stops the run once the app being compiled is done; a second exits at once.
fn install_interrupt_handler(cancel: CancelFlag, trace_id: &str) {
    let installed = ctrlc::set_handler(move || {
        if request_cancel(&cancel) {
            eprintln!("Interrupted again; exiting without waiting for the running compile.");
            std::process::exit(130);
        }
        eprintln!("Stopping after the current app finishes (Ctrl-C again to exit now).");
    });
    if let Err(err) = installed {
        warn!(trace_id = %trace_id, error = %err, "Ctrl-C handler not installed");
    }
}

/// Returns whether cancellation had already been requested.
fn request_cancel(cancel: &AtomicBool) -> bool {
    cancel.swap(true, Ordering::SeqCst)
}

fn reboot(ctx: &Context, yes: bool) -> Result<ExitCode, AppError> {
    if !yes {
        return Err(AppError::validation(
            "Reboot requires --yes",
            ctx.trace_id.as_str(),
        ));
    }
    let mut channel = ctx.open_channel()?;
    reboot_device(channel.as_mut(), true)?;
    channel.close();
    println!("Reboot requested.");
    Ok(ExitCode::SUCCESS)
}

fn show_config(ctx: &Context, reset: bool) -> Result<ExitCode, AppError> {
    let config = if reset {
        let defaults = AppConfig::default();
        let saved = if ctx.explicit_config {
            save_config_to_path(&defaults, &ctx.config_path, &backup_config_path(&ctx.config_path))
        } else {
            save_config(&defaults)
        };
        saved.map_err(|err| AppError::new(err.code, err.error, ctx.trace_id.as_str()))?;
        info!(trace_id = %ctx.trace_id, path = %ctx.config_path.display(), "config reset to defaults");
        defaults
    } else {
        ctx.config.clone()
    };
    if !ctx.json {
        println!("# {}", ctx.config_path.display());
    }
    print_json(&config, &ctx.trace_id)?;
    Ok(ExitCode::SUCCESS)
}

fn diagnose(ctx: &Context) -> Result<ExitCode, AppError> {
    let report = run_diagnostics(&ctx.config.channel, Arc::clone(&ctx.log), &ctx.trace_id);
    if ctx.json {
        print_json(&report, &ctx.trace_id)?;
    } else {
        print!("{}", render_report(&report));
    }
    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn render_inventory(inventory: &Inventory, group: bool) -> String {
    let mut out = String::new();
    if inventory.is_empty() {
        out.push_str("No user apps found.\n");
        return out;
    }
    if group {
        for section in inventory.grouped() {
            let _ = writeln!(out, "{} ({})", section.group.label(), section.records.len());
            for record in &section.records {
                let _ = writeln!(out, "  {:<48} {}", record.package, record.status);
            }
        }
    } else {
        for record in &inventory.records {
            let _ = writeln!(out, "{:<50} {}", record.package, record.status);
        }
    }
    let _ = writeln!(out, "{} app(s)", inventory.len());
    out
}

fn render_result(index: usize, total: usize, result: &JobResult) -> String {
    let mut line = format!(
        "[{index}/{total}] {} {} ({:.1}s)",
        result.package,
        result.outcome.as_str(),
        result.duration.as_secs_f64()
    );
    if let Some(detail) = result.error_detail.as_deref() {
        let _ = write!(line, ": {}", detail.lines().next().unwrap_or_default());
    }
    line
}

fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\nSucceeded {}, failed {}, timed out {} of {} in {:.1}s",
        summary.succeeded,
        summary.failed,
        summary.timed_out,
        summary.total,
        summary.total_duration.as_secs_f64()
    );
    if summary.cancelled {
        let _ = writeln!(out, "Cancelled by operator; the remaining apps were not attempted.");
    }
    if let Some(error) = summary.channel_error.as_deref() {
        let _ = writeln!(out, "Privileged channel lost: {error}");
    }
    if !summary.unsuccessful.is_empty() {
        let _ = writeln!(out, "Retry with: {}", summary.unsuccessful.join(" "));
    }
    if summary.reboot_recommended {
        let _ = writeln!(
            out,
            "Reboot recommended so compiled apps regain storage access: art_optimizer reboot --yes"
        );
    }
    out
}

fn render_report(report: &DiagnosticReport) -> String {
    let mut out = String::new();
    for check in &report.checks {
        let status = if check.passed { "PASS" } else { "FAIL" };
        let _ = writeln!(out, "[{status}] {}: {}", check.check, check.detail);
    }
    let _ = writeln!(
        out,
        "{}/{} checks passed",
        report.checks.len() - report.fail_count(),
        report.checks.len()
    );
    out
}
