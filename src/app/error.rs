use serde::Serialize;
use std::fmt;

pub const ERR_CONNECTION: &str = "ERR_CONNECTION";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_COMMAND: &str = "ERR_COMMAND";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    /// The channel could not be opened, or it went away mid-run.
    pub fn connection(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONNECTION, message, trace_id)
    }

    /// A single command exceeded its bound; its effect on the device is unknown.
    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    /// The command ran and reported failure.
    pub fn command(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_COMMAND, message, trace_id)
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn is_connection(&self) -> bool {
        self.code == ERR_CONNECTION
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ERR_TIMEOUT
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
