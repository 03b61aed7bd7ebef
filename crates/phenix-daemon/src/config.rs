//! Configuration for phenixd

use phenix_control::{ControlPlaneConfig, LifecycleConfig, DEFAULT_SUBSCRIBER_BUFFER};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Lifecycle operation tuning
    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    /// Live notification tuning
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// YAML file with roles, users, topologies and experiments to start from
    #[serde(default)]
    pub seed: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            enable_cors: true,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When disabled every request runs as an unrestricted global admin
    #[serde(default)]
    pub enabled: bool,
}

/// Lifecycle operation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Interval between progress polls of long operations
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Minimum pending duration for redeploys, 0 disables it
    #[serde(default)]
    pub min_pending_ms: u64,

    /// Stop waiting for the fabric after this many seconds
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval(),
            min_pending_ms: 0,
            operation_timeout_secs: None,
        }
    }
}

impl From<&LifecycleSettings> for LifecycleConfig {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
            min_pending: (settings.min_pending_ms > 0)
                .then(|| Duration::from_millis(settings.min_pending_ms)),
            operation_timeout: settings.operation_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Live notification tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broadcasts queued per subscriber before new ones are dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_progress_interval() -> u64 {
    2000
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables with PHENIX_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("PHENIX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Settings handed to the control plane
    pub fn control_plane(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            lifecycle: LifecycleConfig::from(&self.lifecycle),
            subscriber_buffer: self.broker.subscriber_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.listen_addr.port(), 3000);
        assert!(config.server.enable_cors);
        assert!(!config.auth.enabled);
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_lifecycle_defaults() {
        let config = DaemonConfig::default().control_plane();
        assert_eq!(config.lifecycle.progress_interval, Duration::from_secs(2));
        assert!(config.lifecycle.min_pending.is_none());
        assert!(config.lifecycle.operation_timeout.is_none());
        assert_eq!(config.subscriber_buffer, 256);
    }

    #[test]
    fn test_lifecycle_overrides() {
        let settings = LifecycleSettings {
            progress_interval_ms: 500,
            min_pending_ms: 5000,
            operation_timeout_secs: Some(60),
        };
        let lifecycle = LifecycleConfig::from(&settings);
        assert_eq!(lifecycle.progress_interval, Duration::from_millis(500));
        assert_eq!(lifecycle.min_pending, Some(Duration::from_secs(5)));
        assert_eq!(lifecycle.operation_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_load_without_file() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.lifecycle.progress_interval_ms, 2000);
        assert_eq!(config.logging.level, "info");
    }
}
