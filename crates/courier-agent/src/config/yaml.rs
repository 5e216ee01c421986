//! YAML file configuration source.
//!
//! The file mirrors the runtime [`Config`](super::Config) in three sections:
//!
//! ```yaml
//! general:
//!   persist_dir: /var/lib/log-courier
//!   prospect_interval: 10
//!   spool_size: 1024
//!   spool_timeout: 5
//!   dead_time: 86400
//!   log_level: info
//! network:
//!   servers: ["logs.example.com:5043"]
//!   transport: tls
//!   ssl_ca: /etc/log-courier/ca.pem
//!   timeout: 15
//!   reconnect: 1
//!   max_pending_payloads: 4
//! files:
//!   - paths: ["/var/log/*.log"]
//!     fields: { type: syslog }
//! ```
//!
//! Every key is optional; absent keys keep their defaults. Durations are
//! plain seconds. Unknown keys are ignored so older agents tolerate newer
//! files.

use std::path::{Path, PathBuf};

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use serde_json::Map;

use crate::config::log_level::LogLevel;
use crate::config::{Config, ConfigError, ConfigSource, FileGroup, TransportKind};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeneralSection {
    persist_dir: Option<PathBuf>,
    prospect_interval: Option<u64>,
    spool_size: Option<usize>,
    spool_timeout: Option<u64>,
    dead_time: Option<u64>,
    log_level: Option<LogLevel>,
    host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NetworkSection {
    servers: Option<Vec<String>>,
    transport: Option<TransportKind>,
    ssl_ca: Option<PathBuf>,
    ssl_certificate: Option<PathBuf>,
    ssl_key: Option<PathBuf>,
    timeout: Option<u64>,
    network_timeout: Option<u64>,
    reconnect: Option<u64>,
    max_pending_payloads: Option<usize>,
    shutdown_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StdinSection {
    fields: Map<String, serde_json::Value>,
}

/// The deserialized shape of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlConfig {
    general: GeneralSection,
    network: NetworkSection,
    files: Vec<FileGroup>,
    stdin: StdinSection,
}

/// Loads a YAML file and merges its values over the current configuration.
pub struct YamlSource {
    path: PathBuf,
}

impl YamlSource {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl ConfigSource for YamlSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        // Figment silently treats missing files as empty; a missing config
        // file should be a hard error instead.
        if let Err(source) = std::fs::metadata(&self.path) {
            return Err(ConfigError::Read {
                path: self.path.clone(),
                source,
            });
        }

        let yaml: YamlConfig = Figment::new()
            .merge(Yaml::file(&self.path))
            .extract()
            .map_err(|e| ConfigError::Parse {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        let general = yaml.general;
        if let Some(dir) = general.persist_dir {
            config.persist_dir = dir;
        }
        if let Some(secs) = general.prospect_interval {
            config.prospect_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(size) = general.spool_size {
            config.spool_size = size;
        }
        if let Some(secs) = general.spool_timeout {
            config.spool_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = general.dead_time {
            config.dead_time = std::time::Duration::from_secs(secs);
        }
        if let Some(level) = general.log_level {
            config.log_level = level;
        }
        if let Some(host) = general.host {
            config.host = host;
        }

        let network = yaml.network;
        if let Some(servers) = network.servers {
            config.servers = servers;
        }
        if let Some(transport) = network.transport {
            config.transport = transport;
        }
        if network.ssl_ca.is_some() {
            config.ssl_ca = network.ssl_ca;
        }
        if network.ssl_certificate.is_some() {
            config.ssl_certificate = network.ssl_certificate;
        }
        if network.ssl_key.is_some() {
            config.ssl_key = network.ssl_key;
        }
        if let Some(secs) = network.timeout {
            config.timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = network.network_timeout {
            config.network_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = network.reconnect {
            config.reconnect = std::time::Duration::from_secs(secs);
        }
        if let Some(max) = network.max_pending_payloads {
            config.max_pending_payloads = max;
        }
        if let Some(secs) = network.shutdown_timeout {
            config.shutdown_timeout = std::time::Duration::from_secs(secs);
        }

        if !yaml.files.is_empty() {
            config.files = yaml.files;
        }
        if !yaml.stdin.fields.is_empty() {
            config.stdin_fields = yaml.stdin.fields;
        }

        Ok(())
    }
}
