//! Configuration system for the Meridian client.
//!
//! Runtime tunables for the transport loop and the entity synchronization
//! manager, persisted to disk as RON. Every section is `#[serde(default)]`
//! so older files keep loading when new settings appear.

mod config;
mod error;

pub use config::{
    Config, DebugConfig, NetworkConfig, RetryPolicy, SyncConfig, UnresolvedPolicy,
    default_config_dir,
};
pub use error::ConfigError;
