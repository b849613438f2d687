//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport connection settings.
    pub network: NetworkConfig,
    /// Entity synchronization settings.
    pub sync: SyncConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// What to do once the connect attempt cap has been reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Warn loudly at the cap, then keep retrying until cancelled.
    Unbounded,
    /// Give up with an error at the cap.
    Bounded,
}

/// What to do when an entity id is registered locally but no live replica
/// entity can be resolved for it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Abort the session with a hard error.
    Fail,
    /// Log and keep the message queued until the id resolves or is tombstoned.
    Requeue,
}

/// Transport connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server host name or IP.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Milliseconds between keepalive pings.
    pub ping_interval_ms: u64,
    /// Milliseconds without any inbound traffic before the link is declared dead.
    pub disconnect_timeout_ms: u64,
    /// Connect attempts before the retry policy kicks in.
    pub max_connect_attempts: u32,
    /// Fixed delay between connect attempts in milliseconds.
    pub connect_retry_delay_ms: u64,
    /// Jitter applied to the retry delay (0.0 - 1.0, 0 disables).
    pub connect_retry_jitter: f64,
    /// Behaviour once `max_connect_attempts` is exceeded.
    pub connect_retry: RetryPolicy,
    /// Socket reads slower than this (ms) log a warning.
    pub slow_read_warning_ms: u64,
    /// Sleep at the end of each transport loop iteration (ms).
    pub loop_sleep_ms: u64,
    /// Size of the socket read buffer in bytes.
    pub read_buffer_size: usize,
    /// Largest variable-length field accepted from the wire, in bytes.
    pub max_field_len: u32,
}

/// Entity synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Unresolved passes after which a message produces one diagnostic.
    pub bounce_warning_threshold: u32,
    /// Passes a deletion tombstone survives before eviction.
    pub tombstone_retention_passes: u32,
    /// Handling of registered ids whose replica cannot be found.
    pub unresolved_registered: UnresolvedPolicy,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config in debug builds.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 34251,
            ping_interval_ms: 3_000,
            disconnect_timeout_ms: 60_000,
            max_connect_attempts: 10,
            connect_retry_delay_ms: 50,
            connect_retry_jitter: 0.0,
            connect_retry: RetryPolicy::Unbounded,
            slow_read_warning_ms: 1_000,
            loop_sleep_ms: 1,
            read_buffer_size: 64 * 1024,
            max_field_len: 16 * 1024 * 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bounce_warning_threshold: 100,
            tombstone_retention_passes: 1_000,
            unresolved_registered: UnresolvedPolicy::Fail,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
        }
    }
}

/// Platform config directory for Meridian, e.g. `~/.config/meridian`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("meridian"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path,
            source,
        })
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject settings that parse but cannot drive a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if net.server_port == 0 {
            return Err(ConfigError::Invalid {
                field: "network.server_port",
                reason: "port 0 is not connectable".to_string(),
            });
        }
        if net.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "network.ping_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if net.disconnect_timeout_ms <= net.ping_interval_ms {
            return Err(ConfigError::Invalid {
                field: "network.disconnect_timeout_ms",
                reason: format!(
                    "{} ms would expire before the first pong (ping interval {} ms)",
                    net.disconnect_timeout_ms, net.ping_interval_ms
                ),
            });
        }
        if !(0.0..=1.0).contains(&net.connect_retry_jitter) {
            return Err(ConfigError::Invalid {
                field: "network.connect_retry_jitter",
                reason: format!("{} is outside 0.0..=1.0", net.connect_retry_jitter),
            });
        }
        if net.read_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "network.read_buffer_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ron::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("ping_interval_ms: 3000"));
        assert!(ron_str.contains("connect_retry: Unbounded"));
        assert!(ron_str.contains("unresolved_registered: Fail"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (server_port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.server_port, 9000);
        assert_eq!(config.network.max_connect_attempts, 10);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_policies_parse_from_ron() {
        let ron_str =
            "(network: (connect_retry: Bounded), sync: (unresolved_registered: Requeue))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.connect_retry, RetryPolicy::Bounded);
        assert_eq!(config.sync.unresolved_registered, UnresolvedPolicy::Requeue);
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_address = "10.0.0.1".to_string();
        config.sync.tombstone_retention_passes = 42;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("meridian");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.sync.bounce_warning_threshold = 5;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().sync.bounce_warning_threshold, 5);
        assert!(modified.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_reload_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::default().reload(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_timeout_below_ping_interval() {
        let mut config = Config::default();
        config.network.disconnect_timeout_ms = 1_000;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "network.disconnect_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_jitter() {
        let mut config = Config::default();
        config.network.connect_retry_jitter = 1.5;
        assert!(config.validate().is_err());
    }
}
