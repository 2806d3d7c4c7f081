use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{QuorumError, Result};

const CONFIG_FILE: &str = "quorum.toml";
const ENV_PREFIX: &str = "QUORUM";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ApiSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.quorummessenger.com".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InviteSettings {
    /// Base for one-time links that carry key material in the fragment.
    pub private_base: String,
    /// Base for reusable links backed by the server-side eval pool.
    pub public_base: String,
}

impl Default for InviteSettings {
    fn default() -> Self {
        Self {
            private_base: "https://qm.one/".to_string(),
            public_base: "https://qm.one/invite/".to_string(),
        }
    }
}

impl InviteSettings {
    pub fn base(&self, public: bool) -> &str {
        if public {
            &self.public_base
        } else {
            &self.private_base
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MessagingSettings {
    pub max_message_length: usize,
    pub max_mentions_per_message: usize,
    pub rate_limit_max_messages: usize,
    pub rate_limit_window_ms: i64,
    pub edit_window_ms: i64,
    pub max_pinned_messages: usize,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            max_message_length: 2500,
            max_mentions_per_message: 20,
            rate_limit_max_messages: 10,
            rate_limit_window_ms: 10_000,
            edit_window_ms: 15 * 60 * 1000,
            max_pinned_messages: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SyncSettings {
    pub request_expiry_ms: i64,
    pub candidate_settle_ms: u64,
    pub chunk_size_bytes: usize,
    pub public_invite_spares: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            request_expiry_ms: 30_000,
            candidate_settle_ms: 1_000,
            chunk_size_bytes: 5 * 1024 * 1024,
            public_invite_spares: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ActionQueueSettings {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub batch_size: usize,
    pub max_queue_size: usize,
    pub max_age_days: i64,
    pub poll_interval_ms: u64,
}

impl Default for ActionQueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 2_000,
            max_backoff_ms: 5 * 60 * 1000,
            batch_size: 10,
            max_queue_size: 1000,
            max_age_days: 7,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageSettings {
    pub data_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quorum");
        Self {
            data_dir: dir.to_string_lossy().to_string(),
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    pub api: ApiSettings,
    pub invites: InviteSettings,
    pub messaging: MessagingSettings,
    pub sync: SyncSettings,
    pub action_queue: ActionQueueSettings,
    pub storage: StorageSettings,
}

/// Loads, holds and persists [`AppConfig`].
///
/// Sources are layered: defaults, then `quorum.toml` in the config
/// directory, then `QUORUM__SECTION__KEY` environment variables.
pub struct ConfigService {
    config: AppConfig,
    config_path: PathBuf,
}

impl ConfigService {
    pub fn new() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quorum");
        match Self::load_from(&dir) {
            Ok(service) => service,
            Err(e) => {
                log::warn!("Failed to load config, using defaults: {}", e);
                Self {
                    config: AppConfig::default(),
                    config_path: dir.join(CONFIG_FILE),
                }
            }
        }
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| QuorumError::Config(format!("defaults: {}", e)))?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::new(&config_path.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| QuorumError::Config(format!("build: {}", e)))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| QuorumError::Config(format!("deserialize: {}", e)))?;

        log::info!("Loaded configuration from {:?}", config_path);
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn with_config(config: AppConfig, dir: &Path) -> Self {
        Self {
            config,
            config_path: dir.join(CONFIG_FILE),
        }
    }

    pub fn get(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn messaging(&self) -> &MessagingSettings {
        &self.config.messaging
    }

    pub fn update(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = toml::to_string_pretty(&self.config)
            .map_err(|e| QuorumError::Config(format!("serialize: {}", e)))?;
        std::fs::write(&self.config_path, body)?;
        log::info!("Saved configuration to {:?}", self.config_path);
        Ok(())
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new()
    }
}
