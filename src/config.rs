//! Configuration System
//!
//! Loads configuration from a TOML file with environment variable
//! overrides (`LANTERN_*`). Every field has a serde default so a
//! partial file, or none at all, yields a runnable configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub batch: BatchSection,

    #[serde(default)]
    pub input: InputSection,

    #[serde(default)]
    pub http: HttpSection,

    #[serde(default)]
    pub cq: CqSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Index engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Shards per partition.
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// Concurrently open partitions.
    #[serde(default = "default_num_caches")]
    pub num_caches: usize,

    /// Time span of one partition, in seconds.
    #[serde(default = "default_index_duration")]
    pub index_duration_secs: u64,

    /// How long after a partition's end time to keep it, in seconds.
    #[serde(default = "default_retention_period")]
    pub retention_period_secs: u64,

    /// How often retention is enforced, in seconds.
    #[serde(default = "default_retention_check")]
    pub retention_check_interval_secs: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("lantern").to_string_lossy().to_string())
        .unwrap_or_else(|| "./lantern_data".to_string())
}

fn default_num_shards() -> usize {
    4
}

fn default_num_caches() -> usize {
    2
}

fn default_index_duration() -> u64 {
    24 * 60 * 60
}

fn default_retention_period() -> u64 {
    7 * 24 * 60 * 60
}

fn default_retention_check() -> u64 {
    60 * 60
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            num_shards: default_num_shards(),
            num_caches: default_num_caches(),
            index_duration_secs: default_index_duration(),
            retention_period_secs: default_retention_period(),
            retention_check_interval_secs: default_retention_check(),
        }
    }
}

/// Batching pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Maximum time a partial batch waits before flushing, in
    /// milliseconds.
    #[serde(default = "default_batch_duration")]
    pub duration_ms: u64,

    /// Bound of the inbound event channel.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

fn default_batch_size() -> usize {
    300
}

fn default_batch_duration() -> u64 {
    1000
}

fn default_max_outstanding() -> usize {
    5000
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            duration_ms: default_batch_duration(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

/// Network ingest configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InputSection {
    /// TCP listen address, e.g. "0.0.0.0:5514"; empty disables TCP.
    #[serde(default = "default_tcp_bind")]
    pub tcp_bind: String,

    /// UDP listen address; empty disables UDP.
    #[serde(default)]
    pub udp_bind: String,

    /// Syslog format: rfc3164, rfc5424 or syslog.
    #[serde(default = "default_format")]
    pub format: String,

    /// PEM certificate path; together with `tls_key` enables TLS on
    /// the TCP listener.
    #[serde(default)]
    pub tls_cert: Option<String>,

    #[serde(default)]
    pub tls_key: Option<String>,
}

fn default_tcp_bind() -> String {
    "0.0.0.0:5514".to_string()
}

fn default_format() -> String {
    "rfc5424".to_string()
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            tcp_bind: default_tcp_bind(),
            udp_bind: String::new(),
            format: default_format(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

/// Continuous-query scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CqSection {
    #[serde(default = "default_cq_enabled")]
    pub enabled: bool,

    #[serde(default = "default_run_interval")]
    pub run_interval_secs: u64,
}

fn default_cq_enabled() -> bool {
    true
}

fn default_run_interval() -> u64 {
    60
}

impl Default for CqSection {
    fn default() -> Self {
        Self {
            enabled: default_cq_enabled(),
            run_interval_secs: default_run_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides only.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LANTERN_DATA_DIR") {
            self.engine.data_dir = dir;
        }
        if let Ok(v) = std::env::var("LANTERN_NUM_SHARDS") {
            if let Ok(n) = v.parse() {
                self.engine.num_shards = n;
            }
        }
        if let Ok(v) = std::env::var("LANTERN_NUM_CACHES") {
            if let Ok(n) = v.parse() {
                self.engine.num_caches = n;
            }
        }
        if let Ok(v) = std::env::var("LANTERN_TCP_BIND") {
            self.input.tcp_bind = v;
        }
        if let Ok(v) = std::env::var("LANTERN_UDP_BIND") {
            self.input.udp_bind = v;
        }
        if let Ok(v) = std::env::var("LANTERN_FORMAT") {
            self.input.format = v;
        }
        if let Ok(v) = std::env::var("LANTERN_HTTP_BIND") {
            self.http.bind = v;
        }
        if let Ok(v) = std::env::var("LANTERN_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("LANTERN_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content.
pub fn generate_default_config() -> String {
    r#"# Lantern Configuration
#
# Environment variables override these settings:
# - LANTERN_DATA_DIR
# - LANTERN_TCP_BIND / LANTERN_UDP_BIND / LANTERN_FORMAT
# - LANTERN_HTTP_BIND
# - LANTERN_LOG_LEVEL / LANTERN_LOG_FORMAT

[engine]
# Directory holding the time partitions
data_dir = "./lantern_data"

# Shards per partition
num_shards = 4

# Concurrently open partitions
num_caches = 2

# Time span of one partition (seconds)
index_duration_secs = 86400

# Retention window after a partition's end time (seconds)
retention_period_secs = 604800

# Retention enforcement interval (seconds)
retention_check_interval_secs = 3600

[batch]
# Events per batch
size = 300

# Maximum wait before a partial batch flushes (ms)
duration_ms = 1000

# Bound on queued, unprocessed events
max_outstanding = 5000

[input]
# Syslog over TCP; empty string disables
tcp_bind = "0.0.0.0:5514"

# Syslog over UDP; empty string disables
udp_bind = ""

# Wire format: rfc3164, rfc5424 or syslog (relaxed)
format = "rfc5424"

# Optional TLS for the TCP listener
# tls_cert = "/etc/lantern/cert.pem"
# tls_key = "/etc/lantern/key.pem"

[http]
# Query API listen address
bind = "0.0.0.0:8080"

[cq]
# Continuous query scheduler
enabled = true
run_interval_secs = 60

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (development) or json (production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.num_shards, 4);
        assert_eq!(config.engine.num_caches, 2);
        assert_eq!(config.engine.index_duration_secs, 86400);
        assert_eq!(config.batch.size, 300);
        assert_eq!(config.input.format, "rfc5424");
        assert!(config.cq.enabled);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nnum_shards = 8\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.num_shards, 8);
        assert_eq!(config.engine.num_caches, 2);
        assert_eq!(config.http.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_generated_default_parses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, generate_default_config()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.retention_period_secs, 604800);
        assert_eq!(config.batch.max_outstanding, 5000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "engine = not toml [").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
