use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CarelinkConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub scroll: ScrollConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Page origin the client runs under; drives endpoint selection.
    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_local_port")]
    pub local_port: u16,

    #[serde(default = "default_production_host")]
    pub production_host: String,

    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,

    #[serde(default = "default_reconnection_delay")]
    pub reconnection_delay_ms: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// How long an optimistic entry may wait for its server echo.
    #[serde(default = "default_optimistic_window")]
    pub optimistic_window_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_ms: u64,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollConfig {
    #[serde(default = "default_scroll_threshold")]
    pub threshold_px: f64,

    #[serde(default = "default_scroll_debounce")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Bearer token given directly (takes precedence over the token file).
    #[serde(default)]
    pub token: Option<String>,

    /// File holding the persisted bearer token.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

fn default_base_url() -> String {
    "http://localhost:5000/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_local_port() -> u16 {
    5000
}

fn default_production_host() -> String {
    "api.carelink.health".to_string()
}

fn default_reconnection_attempts() -> u32 {
    5
}

fn default_reconnection_delay() -> u64 {
    1000
}

fn default_auth_timeout() -> u64 {
    10
}

fn default_optimistic_window() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_poll_jitter() -> u64 {
    250
}

fn default_event_buffer() -> usize {
    256
}

fn default_scroll_threshold() -> f64 {
    100.0
}

fn default_scroll_debounce() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            local_port: default_local_port(),
            production_host: default_production_host(),
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay_ms: default_reconnection_delay(),
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            optimistic_window_ms: default_optimistic_window(),
            poll_interval_ms: default_poll_interval(),
            poll_jitter_ms: default_poll_jitter(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            threshold_px: default_scroll_threshold(),
            debounce_ms: default_scroll_debounce(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl SocketConfig {
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl ChatConfig {
    pub fn optimistic_window(&self) -> Duration {
        Duration::from_millis(self.optimistic_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }
}

impl CarelinkConfig {
    pub fn load() -> ChatResult<Self> {
        Self::load_from_paths(get_config_paths())
    }

    pub fn load_from_paths(paths: Vec<PathBuf>) -> ChatResult<Self> {
        load_dotenv_files();

        let mut builder = ConfigBuilder::builder();

        for path in paths {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CARELINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut carelink_config: CarelinkConfig = config.try_deserialize()?;

        if let Ok(url) = std::env::var("CARELINK_API_URL") {
            carelink_config.api.base_url = url;
        }

        if let Ok(token) = std::env::var("CARELINK_AUTH_TOKEN") {
            carelink_config.auth.token = Some(token);
        }

        if let Ok(level) = std::env::var("CARELINK_LOG_LEVEL") {
            carelink_config.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            carelink_config.logging.level = level;
        }

        carelink_config.validate()?;

        Ok(carelink_config)
    }

    pub fn validate(&self) -> ChatResult<()> {
        if self.api.base_url.is_empty() {
            return Err(ChatError::InvalidConfigValue {
                key: "api.base_url".to_string(),
                message: "Must not be empty".to_string(),
            });
        }

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(ChatError::InvalidConfigValue {
                key: "api.base_url".to_string(),
                message: "Must start with http:// or https://".to_string(),
            });
        }

        if self.api.request_timeout_secs == 0 {
            return Err(ChatError::InvalidConfigValue {
                key: "api.request_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.socket.reconnection_attempts == 0 {
            return Err(ChatError::InvalidConfigValue {
                key: "socket.reconnection_attempts".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if self.socket.production_host.trim().is_empty() {
            return Err(ChatError::InvalidConfigValue {
                key: "socket.production_host".to_string(),
                message: "Must not be empty".to_string(),
            });
        }

        if self.chat.poll_interval_ms == 0 {
            return Err(ChatError::InvalidConfigValue {
                key: "chat.poll_interval_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.chat.event_buffer == 0 {
            return Err(ChatError::InvalidConfigValue {
                key: "chat.event_buffer".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.scroll.threshold_px < 0.0 {
            return Err(ChatError::InvalidConfigValue {
                key: "scroll.threshold_px".to_string(),
                message: "Must not be negative".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level_lower = self.logging.level.to_lowercase();
        if !valid_levels.contains(&level_lower.as_str()) && !level_lower.contains('=') {
            return Err(ChatError::InvalidConfigValue {
                key: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Must be one of: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        Ok(())
    }

    pub fn log_level(&self) -> &str {
        &self.logging.level
    }
}

fn get_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("config").join("default.toml"));
        paths.push(cwd.join("config").join("local.toml"));
        paths.push(cwd.join("carelink.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("carelink").join("config.toml"));
    }

    paths
}

fn load_dotenv_files() {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
        paths.push(cwd.join(".env.local"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("carelink").join(".env"));
    }

    for path in paths {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("carelink"))
}

pub fn get_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("carelink"))
}

/// Default location of the persisted bearer token.
pub fn default_token_path() -> Option<PathBuf> {
    get_data_dir().map(|d| d.join("token"))
}
