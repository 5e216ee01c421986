//! Configuration for the shipping pipeline.
//!
//! Configuration sources are applied in order, later sources overriding
//! earlier ones:
//!
//! 1. Hard-coded defaults ([`Config::default`])
//! 2. The YAML configuration file (see [`yaml`])
//! 3. A small set of `LC_*` environment variables (see [`env`])
//!
//! Validation runs once after all sources are merged. A configuration error
//! at startup is fatal; a failed reload keeps the previous configuration
//! running.

pub mod env;
pub mod log_level;
pub mod yaml;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::env::EnvSource;
use crate::config::log_level::LogLevel;
use crate::config::yaml::YamlSource;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which stream transport carries the framed protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP. For test rigs and deployments that terminate TLS elsewhere.
    Tcp,
    /// TLS with server verification against `ssl_ca` and an optional client
    /// certificate. The default.
    #[default]
    Tls,
}

/// One group of file patterns sharing custom fields and a dead time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileGroup {
    /// Glob patterns selecting the files to tail.
    pub paths: Vec<String>,
    /// User-defined fields added to every event from this group.
    pub fields: Map<String, Value>,
    /// Per-group override of the general dead time, in seconds.
    pub dead_time: Option<u64>,
    /// Codec decoding this group's files. Defaults to `plain`.
    pub codec: Option<String>,
}

/// Fully merged agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // General.
    /// Directory holding the durable registrar state file.
    pub persist_dir: PathBuf,
    /// Period of the prospector's discovery scan.
    pub prospect_interval: Duration,
    /// Event-count threshold at which the spooler flushes a batch.
    pub spool_size: usize,
    /// Flush-if-idle timeout of the spooler.
    pub spool_timeout: Duration,
    /// How long an idle or vanished file is kept before its state is
    /// released.
    pub dead_time: Duration,
    /// Verbosity of the agent's own logs.
    pub log_level: LogLevel,
    /// Hostname stamped into every event. Detected when empty.
    pub host: String,

    // Network.
    /// Upstream endpoints as `host:port`. One is chosen at random per
    /// connection attempt.
    pub servers: Vec<String>,
    /// Stream transport carrying the frames.
    pub transport: TransportKind,
    /// CA bundle used to verify the server. Required for [`TransportKind::Tls`].
    pub ssl_ca: Option<PathBuf>,
    /// Optional client certificate (PEM), presented when the server requests it.
    pub ssl_certificate: Option<PathBuf>,
    /// Private key for `ssl_certificate`.
    pub ssl_key: Option<PathBuf>,
    /// Per-payload acknowledgement deadline.
    pub timeout: Duration,
    /// Connect and handshake deadline.
    pub network_timeout: Duration,
    /// Sleep between failed connection attempts.
    pub reconnect: Duration,
    /// Maximum payloads awaiting acknowledgement at any time.
    pub max_pending_payloads: usize,
    /// How long shutdown waits for the last outstanding payload.
    pub shutdown_timeout: Duration,

    // Files.
    /// File groups to prospect.
    pub files: Vec<FileGroup>,
    /// Custom fields for events read from stdin.
    pub stdin_fields: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persist_dir: PathBuf::from("."),
            prospect_interval: Duration::from_secs(10),
            spool_size: 1024,
            spool_timeout: Duration::from_secs(5),
            dead_time: Duration::from_secs(24 * 3600),
            log_level: LogLevel::default(),
            host: String::new(),
            servers: Vec::new(),
            transport: TransportKind::default(),
            ssl_ca: None,
            ssl_certificate: None,
            ssl_key: None,
            timeout: Duration::from_secs(15),
            network_timeout: Duration::from_secs(15),
            reconnect: Duration::from_secs(1),
            max_pending_payloads: 4,
            shutdown_timeout: Duration::from_secs(30),
            files: Vec::new(),
            stdin_fields: Map::new(),
        }
    }
}

/// A source of configuration values merged into a [`Config`].
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

impl Config {
    /// Loads, merges and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        YamlSource::new(path).load(&mut config)?;
        EnvSource.load(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints after all sources were merged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "network.servers must list at least one host:port endpoint".into(),
            ));
        }
        for server in &self.servers {
            parse_server(server)?;
        }
        if self.transport == TransportKind::Tls && self.ssl_ca.is_none() {
            return Err(ConfigError::Invalid(
                "network.ssl_ca is required for the tls transport".into(),
            ));
        }
        if self.ssl_certificate.is_some() != self.ssl_key.is_some() {
            return Err(ConfigError::Invalid(
                "network.ssl_certificate and network.ssl_key must be set together".into(),
            ));
        }
        if self.max_pending_payloads == 0 {
            return Err(ConfigError::Invalid(
                "network.max_pending_payloads must be at least 1".into(),
            ));
        }
        if self.spool_size == 0 {
            return Err(ConfigError::Invalid(
                "general.spool_size must be at least 1".into(),
            ));
        }
        for group in &self.files {
            for pattern in &group.paths {
                glob::Pattern::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("invalid file pattern {pattern:?}: {e}"))
                })?;
            }
            if let Some(codec) = &group.codec {
                if !crate::harvester::codec::is_supported(codec) {
                    return Err(ConfigError::Invalid(format!(
                        "unsupported codec {codec:?}; supported: {}",
                        crate::harvester::codec::supported().join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Dead time for a file group, honoring the per-group override.
    #[must_use]
    pub fn dead_time_for(&self, group: &FileGroup) -> Duration {
        group
            .dead_time
            .map_or(self.dead_time, Duration::from_secs)
    }
}

/// Splits a `host:port` endpoint, accepting `[v6]:port` bracket syntax.
pub fn parse_server(server: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = server.rsplit_once(':').ok_or_else(|| {
        ConfigError::Invalid(format!("server {server:?} is not in host:port form"))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "server {server:?} has an empty host"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        ConfigError::Invalid(format!("server {server:?} has an invalid port"))
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            servers: vec!["127.0.0.1:5043".to_string()],
            transport: TransportKind::Tcp,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_pending_payloads, 4);
        assert_eq!(config.spool_size, 1024);
        assert_eq!(config.prospect_interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.transport, TransportKind::Tls);
    }

    #[test]
    fn test_validate_requires_servers() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tls_requires_ca() {
        let config = Config {
            servers: vec!["localhost:5043".to_string()],
            transport: TransportKind::Tls,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cert_and_key_together() {
        let mut config = create_test_config();
        config.ssl_certificate = Some(PathBuf::from("client.pem"));
        assert!(config.validate().is_err());
        config.ssl_key = Some(PathBuf::from("client.key"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = create_test_config();
        config.files.push(FileGroup {
            paths: vec!["/var/log/[".to_string()],
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_codec() {
        let mut config = create_test_config();
        config.files.push(FileGroup {
            paths: vec!["/var/log/*.log".to_string()],
            codec: Some("multiline".to_string()),
            ..Default::default()
        });
        assert!(config.validate().is_err());
        config.files[0].codec = Some("plain".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(
            parse_server("example.com:5043").unwrap(),
            ("example.com".to_string(), 5043)
        );
        assert_eq!(
            parse_server("[::1]:5043").unwrap(),
            ("::1".to_string(), 5043)
        );
        assert!(parse_server("no-port").is_err());
        assert!(parse_server(":5043").is_err());
        assert!(parse_server("host:notaport").is_err());
    }

    #[test]
    fn test_dead_time_override() {
        let config = create_test_config();
        let group = FileGroup {
            dead_time: Some(60),
            ..Default::default()
        };
        assert_eq!(config.dead_time_for(&group), Duration::from_secs(60));
        let plain = FileGroup::default();
        assert_eq!(config.dead_time_for(&plain), config.dead_time);
    }
}
