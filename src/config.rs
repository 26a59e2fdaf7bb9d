use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::changelog::dn::parse_base;
use crate::error::SentinelError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub audit_log_path: PathBuf,
    /// Suppresses notifications until the first poll finds nothing new.
    pub initial_sync: bool,
    pub changelog: ChangelogConfig,
    pub directory: DirectoryConfig,
    pub notify: NotifyConfig,
    pub token: TokenConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
    pub url: String,
    pub poll_interval_ms: u64,
    pub check_window: usize,
    pub batch_limit: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Root component every tracked DN must end with.
    pub base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub whitelist: Vec<String>,
    pub alert_throttle_secs: u64,
    pub operator_prefix: String,
    pub user_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub slot: u8,
    pub timeout_secs: u64,
    pub chalresp_program: String,
    pub personalize_program: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub listen: Option<SocketAddr>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://sentinel.db".to_string(),
            audit_log_path: PathBuf::from("audit.jsonl"),
            initial_sync: false,
            changelog: ChangelogConfig::default(),
            directory: DirectoryConfig::default(),
            notify: NotifyConfig::default(),
            token: TokenConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            poll_interval_ms: 1000,
            check_window: 2,
            batch_limit: 2000,
            request_timeout_secs: 10,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base: "o=smartdc".to_string(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            alert_throttle_secs: 4 * 3600,
            operator_prefix: "[sentinel] ".to_string(),
            user_prefix: String::new(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            slot: 2,
            timeout_secs: 60,
            chalresp_program: "ykchalresp".to_string(),
            personalize_program: "ykpersonalize".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the config file (if any), then `SENTINEL__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SentinelError> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from("sentinel.toml"), false),
        };

        let settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("notify.whitelist"),
            )
            .build()
            .map_err(|e| SentinelError::ConfigError(format!("Failed to load configuration: {}", e)))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| SentinelError::ConfigError(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded from {:?}", file);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.changelog.poll_interval_ms == 0 {
            return Err(SentinelError::ConfigError(
                "changelog.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.changelog.check_window < 2 {
            return Err(SentinelError::ConfigError(format!(
                "changelog.check_window ({}) must be at least 2",
                self.changelog.check_window
            )));
        }
        // The batch starts at the committed serial, so one slot is the base.
        if self.changelog.batch_limit < 2 {
            return Err(SentinelError::ConfigError(format!(
                "changelog.batch_limit ({}) must be at least 2",
                self.changelog.batch_limit
            )));
        }
        if self.token.timeout_secs == 0 {
            return Err(SentinelError::ConfigError(
                "token.timeout_secs must be positive".to_string(),
            ));
        }

        parse_base(&self.directory.base)
            .map_err(|e| SentinelError::ConfigError(format!("directory.base: {}", e)))?;

        Ok(())
    }
}
