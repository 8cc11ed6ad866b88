use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults;
use crate::error::{InspectorError, Result};

/// Inspector configuration
///
/// Fields missing from a config file take their default, so a file only
/// needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InspectorConfig {
    /// adb executable used by the device bridge
    pub adb_path: PathBuf,

    /// Abstract socket prefix marking a debug channel
    pub socket_prefix: String,

    /// Delay between socket polls per device (milliseconds)
    pub poll_interval_ms: u64,

    /// Handshake schema version this host was built against
    pub supported_schema_version: u32,

    /// How many times one body may be requested from a server
    pub max_body_fetch_attempts: u32,

    /// Timeout for opening a tunnel connection (milliseconds)
    pub connect_timeout_ms: u64,

    /// Upper bound on tunnel, untunnel and shell calls (milliseconds)
    pub bridge_timeout_ms: u64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        let adb_path = std::env::var(defaults::ADB_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(defaults::DEFAULT_ADB_PATH));

        Self {
            adb_path,
            socket_prefix: defaults::DEFAULT_SOCKET_PREFIX.to_string(),
            poll_interval_ms: defaults::DEFAULT_POLL_INTERVAL_MS,
            supported_schema_version: defaults::DEFAULT_SUPPORTED_SCHEMA_VERSION,
            max_body_fetch_attempts: defaults::DEFAULT_MAX_BODY_FETCH_ATTEMPTS,
            connect_timeout_ms: defaults::DEFAULT_CONNECT_TIMEOUT_MS,
            bridge_timeout_ms: defaults::DEFAULT_BRIDGE_TIMEOUT_MS,
        }
    }
}

impl InspectorConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            InspectorError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<config_dir>/snapo/config.json`, or defaults when it doesn't exist
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("snapo");
        path.push(defaults::CONFIG_FILE_NAME);
        Some(path)
    }

    /// Reject values the polling and fetch loops cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.socket_prefix.is_empty() {
            return Err(InspectorError::Config(
                "socket_prefix must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(InspectorError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_body_fetch_attempts == 0 {
            return Err(InspectorError::Config(
                "max_body_fetch_attempts must be greater than zero".to_string(),
            ));
        }
        if self.bridge_timeout_ms == 0 {
            return Err(InspectorError::Config(
                "bridge_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    pub fn with_adb_path(mut self, adb_path: impl Into<PathBuf>) -> Self {
        self.adb_path = adb_path.into();
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_socket_prefix(mut self, socket_prefix: impl Into<String>) -> Self {
        self.socket_prefix = socket_prefix.into();
        self
    }

    pub fn with_max_body_fetch_attempts(mut self, attempts: u32) -> Self {
        self.max_body_fetch_attempts = attempts;
        self
    }

    pub fn with_bridge_timeout_ms(mut self, bridge_timeout_ms: u64) -> Self {
        self.bridge_timeout_ms = bridge_timeout_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = InspectorConfig::new();
        assert_eq!(config.socket_prefix, "snapo_server_");
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.supported_schema_version, 1);
        assert_eq!(config.max_body_fetch_attempts, 3);
        assert_eq!(config.bridge_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"poll_interval_ms": 500, "socket_prefix": "custom_"}}"#).unwrap();

        let config = InspectorConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.socket_prefix, "custom_");
        assert_eq!(config.max_body_fetch_attempts, 3);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"poll_interval_ms": 0}}"#).unwrap();

        let err = InspectorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, InspectorError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = InspectorConfig::load(Path::new("/nonexistent/snapo.json")).unwrap_err();
        assert!(matches!(err, InspectorError::Config(_)));
    }

    #[test]
    fn test_builder() {
        let config = InspectorConfig::new()
            .with_adb_path("/opt/android/adb")
            .with_poll_interval_ms(100)
            .with_max_body_fetch_attempts(1)
            .with_bridge_timeout_ms(250);
        assert_eq!(config.bridge_timeout_ms, 250);
        assert!(config.clone().with_bridge_timeout_ms(0).validate().is_err());
        assert_eq!(config.adb_path, PathBuf::from("/opt/android/adb"));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_body_fetch_attempts, 1);
    }
}
