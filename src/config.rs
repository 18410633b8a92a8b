//! Agent configuration. Loaded once at startup and handed to each component by value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Marker value meaning "detect from the host".
pub const AUTO: &str = "auto";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration validation failed: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Management server endpoint and credential
    pub server: ServerConfig,
    /// Host identity overrides
    pub node: NodeConfig,
    /// Heartbeat and delivery cadence
    pub monitoring: MonitoringConfig,
    /// Per-collector switches and scan intervals
    pub collectors: CollectorsConfig,
    /// Entries merged on top of the built-in policy seeds
    pub policy: PolicyConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Explicit hostname or `"auto"`
    pub hostname: String,
    /// Explicit IPv4 address or `"auto"`
    pub ip_address: String,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub heartbeat_interval_secs: u64,
    /// Backoff after a failed heartbeat
    pub heartbeat_retry_secs: u64,
    pub event_batch_size: usize,
    pub event_batch_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    pub process_monitor: ScanConfig,
    pub network_monitor: ScanConfig,
    pub registry_monitor: ScanConfig,
    pub process_control: ProcessControlConfig,
}

/// A partially specified section falls back to enabled, every 30 seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessControlConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    /// `kill`, `suspend` or `alert`
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub blacklisted_processes: Vec<String>,
    pub protected_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            request_timeout_secs: 15,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: AUTO.to_string(),
            ip_address: AUTO.to_string(),
            group: None,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            heartbeat_retry_secs: 10,
            event_batch_size: 10,
            event_batch_interval_secs: 5,
        }
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            process_monitor: ScanConfig::new(true, 10),
            network_monitor: ScanConfig::new(true, 30),
            registry_monitor: ScanConfig::new(true, 60),
            process_control: ProcessControlConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::new(true, 30)
    }
}

impl Default for ProcessControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval_secs: 5,
            action: "alert".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ScanConfig {
    pub fn new(enabled: bool, scan_interval_secs: u64) -> Self {
        Self {
            enabled,
            scan_interval_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        secs(self.scan_interval_secs)
    }
}

impl ProcessControlConfig {
    pub fn scan(&self) -> ScanConfig {
        ScanConfig::new(self.enabled, self.scan_interval_secs)
    }
}

impl MonitoringConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_retry(&self) -> Duration {
        secs(self.heartbeat_retry_secs)
    }

    pub fn event_batch_interval(&self) -> Duration {
        secs(self.event_batch_interval_secs)
    }
}

/// Zero would spin a timer; clamp to one second.
fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}

impl AgentConfig {
    /// Load from a JSON file. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str::<AgentConfig>(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// `AEGIS_CONFIG_PATH`, else `./config.json`, else the per-user config dir.
    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var("AEGIS_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        let local = PathBuf::from("config.json");
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|d| d.join("aegis-agent").join("config.json"))
            .unwrap_or(local)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("AEGIS_API_URL") {
            self.server.api_url = url;
        }
        if let Ok(key) = std::env::var("AEGIS_API_KEY") {
            self.server.api_key = key;
        }
    }

    /// Checks that must hold before the agent can talk to the server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server.api_url is required".into()));
        }
        if self.server.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("server.api_key is required".into()));
        }
        if self.monitoring.event_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.event_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let c = AgentConfig::load(Path::new("definitely-not-here.json")).unwrap();
        assert_eq!(c.monitoring.event_batch_size, 10);
        assert_eq!(c.collectors.process_monitor.scan_interval_secs, 10);
        assert_eq!(c.collectors.network_monitor.scan_interval_secs, 30);
        assert_eq!(c.node.hostname, AUTO);
        assert_eq!(c.collectors.process_control.action, "alert");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "server": {{ "api_url": "http://10.0.0.1:5000", "api_key": "k" }},
                "node": {{ "group": "finance" }},
                "collectors": {{ "process_control": {{ "enabled": true, "action": "kill" }} }}
            }}"#
        )
        .unwrap();
        let c = AgentConfig::load(f.path()).unwrap();
        assert_eq!(c.server.api_url, "http://10.0.0.1:5000");
        assert_eq!(c.node.group.as_deref(), Some("finance"));
        assert_eq!(c.node.ip_address, AUTO);
        assert!(c.collectors.process_control.enabled);
        assert_eq!(c.collectors.process_control.action, "kill");
        assert_eq!(c.collectors.process_control.scan_interval_secs, 5);
        assert!(c.collectors.registry_monitor.enabled);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        assert!(matches!(
            AgentConfig::load(f.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn validate_requires_server() {
        let c = AgentConfig::default();
        assert!(c.validate().is_err());
        let mut c = AgentConfig::default();
        c.server.api_url = "http://localhost:5000".into();
        c.server.api_key = "secret".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_interval_is_clamped() {
        assert_eq!(ScanConfig::new(true, 0).interval(), Duration::from_secs(1));
    }
}
