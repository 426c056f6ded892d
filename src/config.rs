//! Persistent bridge configuration model and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;

const CONFIG_FILE_NAME: &str = "castbridge.toml";

/// Root configuration persisted to `castbridge.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Cast session and polling preferences.
    pub cast: CastConfig,
    #[serde(default)]
    /// Log output preferences.
    pub logging: LoggingConfig,
}

/// Cast session timing preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CastConfig {
    /// Receiver status sampling cadence while connected.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on how long an anti-echo flag may stay raised.
    #[serde(default = "default_echo_grace_ms")]
    pub echo_grace_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
    /// How long one status sample may wait for the receiver's reply.
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
    /// Consecutive failed samples before the receiver is reported unreachable.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

/// Log level applied by the binary at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Log output preferences.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    900
}

fn default_echo_grace_ms() -> u64 {
    1_500
}

fn default_connect_timeout_ms() -> u64 {
    6_000
}

fn default_discovery_window_ms() -> u64 {
    1_800
}

fn default_status_timeout_ms() -> u64 {
    700
}

fn default_max_poll_failures() -> u32 {
    3
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            echo_grace_ms: default_echo_grace_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_window_ms: default_discovery_window_ms(),
            status_timeout_ms: default_status_timeout_ms(),
            max_poll_failures: default_max_poll_failures(),
        }
    }
}

impl CastConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn echo_grace(&self) -> Duration {
        Duration::from_millis(self.echo_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

/// Clamps values that would saturate the receiver control channel or never fire.
pub fn sanitize_config(config: Config) -> Config {
    let cast = config.cast;
    Config {
        cast: CastConfig {
            poll_interval_ms: cast.poll_interval_ms.clamp(250, 5_000),
            echo_grace_ms: cast.echo_grace_ms.clamp(100, 10_000),
            connect_timeout_ms: cast.connect_timeout_ms.clamp(500, 60_000),
            discovery_window_ms: cast.discovery_window_ms.clamp(250, 30_000),
            status_timeout_ms: cast.status_timeout_ms.clamp(100, 5_000),
            max_poll_failures: cast.max_poll_failures.max(1),
        },
        logging: config.logging,
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_FILE_NAME)
}

/// Reads the config file, writing defaults first when it does not exist yet.
pub fn load_or_create(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create config directory: {err}"))?;
        }
        let default_text = toml::to_string(&Config::default())
            .map_err(|err| format!("failed to serialize default config: {err}"))?;
        std::fs::write(path, default_text)
            .map_err(|err| format!("failed to write default config: {err}"))?;
    }
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {err}", path.display()))?;
    let parsed = toml::from_str::<Config>(&content)
        .map_err(|err| format!("failed to parse config {}: {err}", path.display()))?;
    Ok(sanitize_config(parsed))
}
