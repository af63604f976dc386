pub mod commands;
pub mod dexopt;
pub mod packages;
