use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    #[default]
    Auto,
    Root,
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    pub backend: BackendPreference,
    pub su_program: String,
    pub sudo_program: String,
    pub broker_program: String,
    pub adb_program: String,
    pub open_timeout_secs: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            su_program: "su".to_string(),
            sudo_program: "sudo".to_string(),
            broker_program: "rish".to_string(),
            adb_program: "adb".to_string(),
            open_timeout_secs: 15,
        }
    }
}

impl ChannelSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerSettings {
    pub command_timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub dump_timeout_secs: u64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 900,
            list_timeout_secs: 60,
            dump_timeout_secs: 180,
        }
    }
}

impl OptimizerSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
            log_path: String::new(),
        }
    }
}

impl LoggingSettings {
    /// Empty `log_path` resolves to the platform data directory.
    pub fn resolved_log_path(&self) -> PathBuf {
        let configured = self.log_path.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("art_optimizer")
            .join("art_optimizer.log")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel: ChannelSettings::default(),
            optimizer: OptimizerSettings::default(),
            logging: LoggingSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ART_OPTIMIZER_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".art_optimizer_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_config_path(&path))
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config_from_value(&value)))
}

/// Deserializes section by section so one malformed section only resets itself.
fn config_from_value(value: &serde_json::Value) -> AppConfig {
    fn section<T: for<'de> Deserialize<'de> + Default>(value: &serde_json::Value, key: &str) -> T {
        value
            .get(key)
            .cloned()
            .and_then(|raw| serde_json::from_value(raw).ok())
            .unwrap_or_default()
    }

    AppConfig {
        channel: section(value, "channel"),
        optimizer: section(value, "optimizer"),
        logging: section(value, "logging"),
        version: value
            .get("version")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
    }
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();

    for (value, fallback) in [
        (&mut config.channel.su_program, &defaults.channel.su_program),
        (&mut config.channel.sudo_program, &defaults.channel.sudo_program),
        (&mut config.channel.broker_program, &defaults.channel.broker_program),
        (&mut config.channel.adb_program, &defaults.channel.adb_program),
    ] {
        if value.trim().is_empty() {
            *value = fallback.clone();
        } else {
            *value = value.trim().to_string();
        }
    }

    if config.channel.open_timeout_secs == 0 {
        config.channel.open_timeout_secs = defaults.channel.open_timeout_secs;
    }
    if config.optimizer.command_timeout_secs == 0 {
        config.optimizer.command_timeout_secs = defaults.optimizer.command_timeout_secs;
    }
    if config.optimizer.list_timeout_secs == 0 {
        config.optimizer.list_timeout_secs = defaults.optimizer.list_timeout_secs;
    }
    if config.optimizer.dump_timeout_secs == 0 {
        config.optimizer.dump_timeout_secs = defaults.optimizer.dump_timeout_secs;
    }

    let level = config.logging.log_level.trim().to_ascii_lowercase();
    config.logging.log_level = match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => defaults.logging.log_level,
    };
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tmp");
        let config = load_config_from_path(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.optimizer.command_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn malformed_section_only_resets_itself() {
        let value = serde_json::json!({
            "channel": { "backend": "broker", "broker_program": "shizuku" },
            "optimizer": "not-an-object",
            "logging": { "log_level": "DEBUG" }
        });
        let config = validate_config(config_from_value(&value));
        assert_eq!(config.channel.backend, BackendPreference::Broker);
        assert_eq!(config.channel.broker_program, "shizuku");
        assert_eq!(config.channel.su_program, "su");
        assert_eq!(config.optimizer, OptimizerSettings::default());
        assert_eq!(config.logging.log_level, "debug");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.channel.su_program = "   ".to_string();
        config.channel.open_timeout_secs = 0;
        config.optimizer.command_timeout_secs = 0;
        config.logging.log_level = "loud".to_string();
        let validated = validate_config(config);
        assert_eq!(validated.channel.su_program, "su");
        assert_eq!(validated.channel.open_timeout_secs, 15);
        assert_eq!(validated.optimizer.command_timeout_secs, 900);
        assert_eq!(validated.logging.log_level, "info");
    }

    #[test]
    fn save_keeps_one_backup() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        let backup = backup_config_path(&path);

        let mut config = AppConfig::default();
        save_config_to_path(&config, &path, &backup).expect("first save");
        assert!(!backup.exists());

        config.optimizer.command_timeout_secs = 42;
        save_config_to_path(&config, &path, &backup).expect("second save");
        assert!(backup.exists());

        let reloaded = load_config_from_path(&path).expect("reload");
        assert_eq!(reloaded.optimizer.command_timeout_secs, 42);
        let previous = load_config_from_path(&backup).expect("backup");
        assert_eq!(previous.optimizer.command_timeout_secs, 900);
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
        LOCK.get_or_init(|| std::sync::Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn default_location_follows_env_override() {
        let _lock = env_lock();
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("override.json");
        std::env::set_var("ART_OPTIMIZER_CONFIG_PATH", &path);

        let mut config = AppConfig::default();
        config.channel.backend = BackendPreference::Root;
        save_config(&config).expect("save");
        let loaded = load_config().expect("load");
        let location = config_path();
        std::env::remove_var("ART_OPTIMIZER_CONFIG_PATH");

        assert_eq!(location, path);
        assert!(path.exists());
        assert_eq!(loaded.channel.backend, BackendPreference::Root);
    }
}
