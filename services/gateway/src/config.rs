use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the detection gateway
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Transient upload storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Inference service configuration
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON formatted logs
    #[serde(default = "default_true")]
    pub json_logs: bool,
    /// Prometheus exporter port (0 = disabled)
    #[serde(default)]
    pub metrics_port: u16,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum inbound request body in megabytes (0 = unlimited)
    #[serde(default)]
    pub body_limit_mb: usize,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Transient file store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding uploads while a request is in flight
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

/// Downstream inference service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Prediction endpoint accepting a multipart `file` field
    #[serde(default = "default_inference_url")]
    pub url: String,
    /// Whole-request timeout in seconds (0 = no bound)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "detect-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_inference_url() -> String {
    "http://127.0.0.1:8000/predict".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl GatewayConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(config::File::with_name("/etc/detect-gateway/gateway").required(false))
            // GATEWAY__INFERENCE__URL -> inference.url
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values the deserializer cannot check
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        match reqwest::Url::parse(&self.inference.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::InvalidValue {
                    key: "inference.url".to_string(),
                    message: format!("unsupported scheme '{}'", url.scheme()),
                })
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    key: "inference.url".to_string(),
                    message: e.to_string(),
                })
            }
        }

        if self.storage.upload_dir.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "storage.upload_dir".to_string(),
                message: "upload directory must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Inbound body limit in bytes, `None` when unlimited
    pub fn body_limit_bytes(&self) -> Option<usize> {
        match self.server.body_limit_mb {
            0 => None,
            mb => Some(mb * 1024 * 1024),
        }
    }
}

impl InferenceConfig {
    /// Request timeout as Duration, `None` when unbounded
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            json_logs: true,
            metrics_port: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_mb: 0,
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.upload_dir, "uploads");
        assert_eq!(config.inference.url, "http://127.0.0.1:8000/predict");
        assert_eq!(config.body_limit_bytes(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_disables_bound() {
        let inference = InferenceConfig {
            request_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(inference.request_timeout(), None);
        assert_eq!(
            InferenceConfig::default().request_timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_body_limit_in_bytes() {
        let mut config = GatewayConfig::default();
        config.server.body_limit_mb = 5;
        assert_eq!(config.body_limit_bytes(), Some(5 * 1024 * 1024));
    }

    #[test]
    fn test_rejects_bad_inference_url() {
        let mut config = GatewayConfig::default();
        config.inference.url = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "inference.url"
        ));

        config.inference.url = "ftp://models/predict".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_port() {
        let mut config = GatewayConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
