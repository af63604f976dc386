pub mod app;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use uuid::Uuid;

use app::cli::{execute, Cli};

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let trace_id = Uuid::new_v4().to_string();
    match execute(cli, &trace_id) {
        Ok(code) => code,
        Err(err) => {
            error!(trace_id = %err.trace_id, code = %err.code, error = %err.error, "command failed");
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}
