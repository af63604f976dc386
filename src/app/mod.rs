pub mod channel;
pub mod cli;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod models;
pub mod optimizer;
pub mod shell;
