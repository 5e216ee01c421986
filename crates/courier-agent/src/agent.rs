//! Agent wiring: constructs the pipeline and manages its lifecycle.
//!
//! Construction order follows the data flow in reverse so every component
//! receives the handles of its downstream collaborator: registrar first,
//! then publisher and spooler, then the prospector (or a stdin harvester).
//! Handle ownership doubles as the shutdown cascade — when the prospector
//! and its harvesters exit, the spooler's submit channel closes; when the
//! spooler exits, the publisher's batch channel closes; when the publisher
//! and prospector exit, the registrar's event channel closes and it drains,
//! persists, and stops.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::harvester::codec::PlainCodec;
use crate::harvester::Harvester;
use crate::pipeline::Pipeline;
use crate::prospector::Prospector;
use crate::publisher::Publisher;
use crate::registrar::Registrar;
use crate::snapshot::{
    ProspectorMetrics, PublisherMetrics, RegistrarMetrics, Shared, Snapshot,
};
use crate::spooler::Spooler;
use crate::transport::{Transport, TransportError};

/// Fatal conditions at agent construction or startup.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to prepare persist directory: {0}")]
    PersistDir(std::io::Error),
}

/// CLI-level switches that are not part of the configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentOptions {
    /// Read from standard input instead of prospecting files.
    pub stdin: bool,
    /// Start newly discovered files at offset zero instead of end of file.
    pub from_beginning: bool,
}

/// The assembled shipping pipeline.
pub struct Agent {
    pipeline: Pipeline,
    publisher_metrics: Shared<PublisherMetrics>,
    prospector_metrics: Shared<ProspectorMetrics>,
    registrar_metrics: Shared<RegistrarMetrics>,
}

impl Agent {
    /// Builds every component. Must run inside a tokio runtime. Fails on
    /// misconfiguration (bad TLS material, unusable persist directory);
    /// those are startup errors the caller turns into a non-zero exit.
    pub fn new(config: Arc<Config>, options: AgentOptions) -> Result<Self, AgentError> {
        let host = detect_hostname(&config);
        let mut pipeline = Pipeline::new();
        let shutdown = pipeline.shutdown_token();

        let publisher_metrics: Shared<PublisherMetrics> =
            Arc::new(RwLock::new(PublisherMetrics::default()));
        let prospector_metrics: Shared<ProspectorMetrics> =
            Arc::new(RwLock::new(ProspectorMetrics::default()));
        let registrar_metrics: Shared<RegistrarMetrics> =
            Arc::new(RwLock::new(RegistrarMetrics::default()));

        // Registrar: stdin mode keeps offsets in memory only.
        let persist_dir = if options.stdin {
            None
        } else {
            std::fs::create_dir_all(&config.persist_dir).map_err(AgentError::PersistDir)?;
            Some(config.persist_dir.clone())
        };
        let previous = persist_dir
            .as_deref()
            .map(Registrar::load_previous)
            .unwrap_or_default();
        let (registrar, registrar_handle) =
            Registrar::new(persist_dir, Arc::clone(&registrar_metrics));

        // Spooler feeds the publisher through a capacity-one batch channel;
        // that single slot is what lets a full in-flight window backpressure
        // all the way to the harvesters.
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (spooler, spooler_handle) =
            Spooler::new(Arc::clone(&config), shutdown.clone(), batch_tx);

        let transport = Transport::new(Arc::clone(&config))?;
        let publisher = Publisher::new(
            Arc::clone(&config),
            transport,
            batch_rx,
            registrar_handle.clone(),
            shutdown.clone(),
            pipeline.subscribe_config(),
            Arc::clone(&publisher_metrics),
        );

        pipeline.register("registrar", registrar.run());
        pipeline.register("publisher", publisher.run());
        pipeline.register("spooler", spooler.run());

        if options.stdin {
            let mut handle = Harvester::start_stdin(
                host,
                config.stdin_fields.clone(),
                Box::new(PlainCodec::default()),
                spooler_handle,
            );
            let stdin_shutdown = shutdown.clone();
            pipeline.register("stdin", async move {
                let finished = tokio::select! {
                    _ = stdin_shutdown.cancelled() => None,
                    finished = handle.finished() => finished.ok(),
                };
                match finished {
                    Some(status) => info!(
                        "STDIN | finished reading at offset {}",
                        status.last_read_offset
                    ),
                    None => {
                        if let Some(status) = handle.wait().await {
                            info!(
                                "STDIN | stopped reading at offset {}",
                                status.last_read_offset
                            );
                        }
                    }
                }
            });
        } else {
            if config.files.is_empty() {
                warn!("AGENT | no file groups configured; nothing will be harvested");
            }
            let prospector = Prospector::new(
                Arc::clone(&config),
                previous,
                registrar_handle,
                spooler_handle,
                shutdown,
                pipeline.subscribe_config(),
                options.from_beginning,
                host,
                Arc::clone(&prospector_metrics),
            );
            pipeline.register("prospector", prospector.run());
        }

        Ok(Self {
            pipeline,
            publisher_metrics,
            prospector_metrics,
            registrar_metrics,
        })
    }

    /// Launches every component.
    pub fn start(&mut self) {
        self.pipeline.start();
        info!("AGENT | pipeline ready");
    }

    /// Distributes a reloaded configuration. The caller has already
    /// validated it; a failed load never reaches this point.
    pub fn reload(&self, config: Arc<Config>) {
        info!("AGENT | configuration reload successful");
        self.pipeline.send_config(config);
    }

    /// Requests a clean shutdown; [`Agent::wait`] observes completion.
    pub fn shutdown(&self) {
        info!("AGENT | initiating shutdown");
        self.pipeline.shutdown();
    }

    /// The shutdown signal, for signal handlers running in their own task.
    #[must_use]
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.pipeline.shutdown_token()
    }

    /// The reload channel, for signal handlers running in their own task.
    #[must_use]
    pub fn config_sender(&self) -> tokio::sync::broadcast::Sender<Arc<Config>> {
        self.pipeline.config_sender()
    }

    /// Waits until every component has exited.
    pub async fn wait(&mut self) {
        self.pipeline.wait().await;
        info!("AGENT | shutdown complete");
    }

    /// Point-in-time pipeline metrics, lock-free for the caller.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            publisher: crate::snapshot::read(&self.publisher_metrics),
            prospector: crate::snapshot::read(&self.prospector_metrics),
            registrar: crate::snapshot::read(&self.registrar_metrics),
        }
    }
}

/// Hostname stamped into events: the configured override, else the system
/// hostname, else a loud "unknown".
fn detect_hostname(config: &Config) -> String {
    if !config.host.is_empty() {
        return config.host.clone();
    }
    match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy();
            if !name.is_empty() {
                return name.into_owned();
            }
        }
        Err(e) => warn!("AGENT | failed to read system hostname: {e}"),
    }
    warn!("AGENT | could not determine hostname, using \"unknown\"");
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    #[test]
    fn test_detect_hostname_prefers_config() {
        let config = Config {
            host: "configured-host".to_string(),
            ..Default::default()
        };
        assert_eq!(detect_hostname(&config), "configured-host");
    }

    #[test]
    fn test_detect_hostname_falls_back_to_system() {
        let hostname = detect_hostname(&Config::default());
        assert!(!hostname.is_empty());
    }

    #[tokio::test]
    async fn test_new_fails_on_bad_tls_material() {
        let config = Arc::new(Config {
            servers: vec!["localhost:5043".to_string()],
            transport: TransportKind::Tls,
            ssl_ca: Some("/nonexistent/ca.pem".into()),
            persist_dir: tempfile::tempdir().unwrap().path().to_path_buf(),
            ..Default::default()
        });
        let result = Agent::new(config, AgentOptions::default());
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }
}
