//! # Engine Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     LINKSTASH_SNAPSHOT_MAX_ATTEMPTS=5                                  │
//! │     LINKSTASH_REQUEST_TIMEOUT_MS=10000                                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/linkstash/engine.toml (Linux)                            │
//! │     ~/Library/Application Support/com.linkstash.linkstash/engine.toml  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # engine.toml
//! [session]
//! snapshot_max_attempts = 5
//! mutation_max_attempts = 3
//! resubscribe_max_attempts = 0   # 0 = retry forever
//! initial_backoff_ms = 250
//! max_backoff_ms = 30000
//! backoff_multiplier = 2.0
//! request_timeout_ms = 10000
//! buffer_capacity = 10000
//! command_buffer = 64
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

// =============================================================================
// Session Settings
// =============================================================================

/// Retry, timeout and capacity settings for a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Snapshot fetch attempts before the session is suspended.
    #[serde(default = "default_snapshot_attempts")]
    pub snapshot_max_attempts: u32,

    /// Submit attempts per mutation for retryable failures.
    #[serde(default = "default_mutation_attempts")]
    pub mutation_max_attempts: u32,

    /// Resubscribe attempts after a disconnect.
    /// Set to 0 for infinite retries.
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_max_attempts: u32,

    /// Initial backoff duration (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor between attempts.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Per-request timeout for snapshot, subscribe and submit (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Maximum events held while the snapshot is loading.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Capacity of the session command channel.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_snapshot_attempts() -> u32 {
    5
}
fn default_mutation_attempts() -> u32 {
    3
}
fn default_resubscribe_attempts() -> u32 {
    0 // Infinite
}
fn default_initial_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_buffer_capacity() -> usize {
    10_000
}
fn default_command_buffer() -> usize {
    64
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            snapshot_max_attempts: default_snapshot_attempts(),
            mutation_max_attempts: default_mutation_attempts(),
            resubscribe_max_attempts: default_resubscribe_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_multiplier(),
            request_timeout_ms: default_request_timeout(),
            buffer_capacity: default_buffer_capacity(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl SessionSettings {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Retry policy for snapshot fetches.
    pub fn snapshot_policy(&self) -> RetryPolicy {
        self.policy(self.snapshot_max_attempts)
    }

    /// Retry policy for mutation submits.
    pub fn mutation_policy(&self) -> RetryPolicy {
        self.policy(self.mutation_max_attempts)
    }

    /// Retry policy for resubscribing after a disconnect.
    pub fn resubscribe_policy(&self) -> RetryPolicy {
        self.policy(self.resubscribe_max_attempts)
    }

    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
            timeout: self.request_timeout(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Session behaviour settings.
    #[serde(default)]
    pub session: SessionSettings,
}

impl EngineConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (engine.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let s = &self.session;

        if s.snapshot_max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "snapshot_max_attempts must be greater than 0".into(),
            ));
        }

        if s.mutation_max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "mutation_max_attempts must be greater than 0".into(),
            ));
        }

        if s.initial_backoff_ms > s.max_backoff_ms {
            return Err(SyncError::InvalidConfig(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                s.initial_backoff_ms, s.max_backoff_ms
            )));
        }

        if s.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }

        if s.request_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }

        if s.buffer_capacity == 0 || s.command_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "buffer_capacity and command_buffer must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        let s = &mut self.session;
        override_from_env("LINKSTASH_SNAPSHOT_MAX_ATTEMPTS", &mut s.snapshot_max_attempts);
        override_from_env("LINKSTASH_MUTATION_MAX_ATTEMPTS", &mut s.mutation_max_attempts);
        override_from_env(
            "LINKSTASH_RESUBSCRIBE_MAX_ATTEMPTS",
            &mut s.resubscribe_max_attempts,
        );
        override_from_env("LINKSTASH_INITIAL_BACKOFF_MS", &mut s.initial_backoff_ms);
        override_from_env("LINKSTASH_MAX_BACKOFF_MS", &mut s.max_backoff_ms);
        override_from_env("LINKSTASH_REQUEST_TIMEOUT_MS", &mut s.request_timeout_ms);
        override_from_env("LINKSTASH_BUFFER_CAPACITY", &mut s.buffer_capacity);
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "linkstash", "linkstash")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => {
                debug!(key, value = %raw, "Overriding setting from environment");
                *target = value;
            }
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}
