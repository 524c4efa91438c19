//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::admission::{ClockPolicy, FixedWindow, KeySource};
use crate::error::{FloodgateError, Result};

/// Prefix of environment variables overriding file configuration,
/// e.g. `FLOODGATE__ADMISSION__LIMIT=50`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission controller settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSettings {
    /// Maximum admitted requests per client per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Width of a window in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// How many past windows are kept before their counters are evicted
    #[serde(default = "default_retention_windows")]
    pub retention_windows: u64,

    /// How requests are mapped to client keys
    #[serde(default)]
    pub key_source: KeySource,

    /// Reaction to a clock moving backwards
    #[serde(default)]
    pub clock_policy: ClockPolicy,

    /// Maximum counters evicted by a single request
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,

    /// Period of the background sweep in milliseconds; 0 disables it
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Whether to attach `X-RateLimit-*` headers to admitted responses
    #[serde(default = "default_emit_headers")]
    pub emit_headers: bool,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_duration_ms: default_window_duration_ms(),
            retention_windows: default_retention_windows(),
            key_source: KeySource::default(),
            clock_policy: ClockPolicy::default(),
            sweep_batch: default_sweep_batch(),
            sweep_interval_ms: default_sweep_interval_ms(),
            emit_headers: default_emit_headers(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_duration_ms() -> u64 {
    1000
}

fn default_retention_windows() -> u64 {
    10
}

fn default_sweep_batch() -> usize {
    64
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_emit_headers() -> bool {
    true
}

impl AdmissionSettings {
    /// Settings with the given quota and the remaining fields defaulted.
    pub fn with_limit(limit: u64, window_duration_ms: u64) -> Self {
        Self {
            limit,
            window_duration_ms,
            ..Self::default()
        }
    }

    /// Check the settings and return the window geometry they describe.
    pub fn validate(&self) -> Result<FixedWindow> {
        if self.limit == 0 {
            return Err(FloodgateError::Config("limit must be at least 1".to_string()));
        }
        if self.retention_windows == 0 {
            return Err(FloodgateError::Config(
                "retention_windows must be at least 1".to_string(),
            ));
        }
        if self.sweep_batch == 0 {
            return Err(FloodgateError::Config("sweep_batch must be at least 1".to_string()));
        }
        self.key_source.validate()?;

        FixedWindow::from_millis(self.window_duration_ms).ok_or_else(|| {
            FloodgateError::Config("window_duration_ms must be at least 1".to_string())
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from an optional file, then apply
    /// `FLOODGATE__*` environment overrides.
    ///
    /// The file format is inferred from its extension.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            if !path.exists() {
                return Err(FloodgateError::Config(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.admission.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)?;
        config.admission.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Serializes tests that read or write `FLOODGATE__*` variables.
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn test_defaults_match_reference_behavior() {
        let config = FloodgateConfig::default();

        assert_eq!(config.admission.limit, 100);
        assert_eq!(config.admission.window_duration_ms, 1000);
        assert_eq!(config.admission.retention_windows, 10);
        assert_eq!(config.admission.key_source, KeySource::Peer);
        assert_eq!(config.admission.clock_policy, ClockPolicy::Recompute);
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert!(config.admission.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
admission:
  limit: 5
  window_duration_ms: 60000
  retention_windows: 2
  clock_policy: monotonic
  key_source:
    type: header
    name: x-api-key
logging:
  format: json
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.admission.limit, 5);
        assert_eq!(config.admission.window_duration_ms, 60_000);
        assert_eq!(config.admission.retention_windows, 2);
        assert_eq!(config.admission.clock_policy, ClockPolicy::Monotonic);
        assert_eq!(
            config.admission.key_source,
            KeySource::Header {
                name: "x-api-key".to_string()
            }
        );
        assert_eq!(config.admission.sweep_batch, 64);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_settings_fail_fast() {
        let cases = [
            AdmissionSettings {
                limit: 0,
                ..AdmissionSettings::default()
            },
            AdmissionSettings {
                window_duration_ms: 0,
                ..AdmissionSettings::default()
            },
            AdmissionSettings {
                retention_windows: 0,
                ..AdmissionSettings::default()
            },
            AdmissionSettings {
                sweep_batch: 0,
                ..AdmissionSettings::default()
            },
        ];

        for settings in cases {
            let err = settings.validate().unwrap_err();
            assert!(matches!(err, FloodgateError::Config(_)), "{:?}", settings);
        }
    }

    #[test]
    fn test_from_yaml_rejects_invalid_admission() {
        let result = FloodgateConfig::from_yaml("admission:\n  limit: 0\n");
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let _env = ENV_LOCK.lock();
        let path = std::env::temp_dir().join(format!("floodgate-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "admission:\n  limit: 42\n  window_duration_ms: 250\n").unwrap();

        let config = FloodgateConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.admission.limit, 42);
        assert_eq!(config.admission.window_duration_ms, 250);
        assert_eq!(config.admission.retention_windows, 10);
    }

    #[test]
    fn test_env_overrides_file() {
        let _env = ENV_LOCK.lock();
        let path = std::env::temp_dir().join(format!("floodgate-env-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  listen_addr: \"127.0.0.1:8080\"\nadmission:\n  limit: 42\n  window_duration_ms: 250\n",
        )
        .unwrap();

        std::env::set_var("FLOODGATE__ADMISSION__LIMIT", "7");
        std::env::set_var("FLOODGATE__SERVER__LISTEN_ADDR", "0.0.0.0:9100");
        let result = FloodgateConfig::load(Some(&path));
        std::env::remove_var("FLOODGATE__ADMISSION__LIMIT");
        std::env::remove_var("FLOODGATE__SERVER__LISTEN_ADDR");
        std::fs::remove_file(&path).unwrap();

        let config = result.unwrap();
        assert_eq!(config.admission.limit, 7);
        assert_eq!(config.server.listen_addr, "0.0.0.0:9100".parse::<SocketAddr>().unwrap());
        // Values without an override still come from the file.
        assert_eq!(config.admission.window_duration_ms, 250);
    }

    #[test]
    fn test_env_override_is_validated() {
        let _env = ENV_LOCK.lock();

        std::env::set_var("FLOODGATE__ADMISSION__LIMIT", "0");
        let result = FloodgateConfig::load(None);
        std::env::remove_var("FLOODGATE__ADMISSION__LIMIT");

        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let path = Path::new("/nonexistent/floodgate.yaml");
        assert!(matches!(
            FloodgateConfig::load(Some(path)),
            Err(FloodgateError::Config(_))
        ));
    }
}
