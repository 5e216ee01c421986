//! Pipeline coordinator: component registration, lifecycle, and the
//! config-reload broadcast.
//!
//! Components are registered as futures, started together, and share one
//! cancellation token for shutdown. Configuration reloads are distributed
//! as `Arc<Config>` over a broadcast channel each component subscribes to
//! at construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;

type ComponentFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Owns the lifecycle of every pipeline component.
pub struct Pipeline {
    shutdown: CancellationToken,
    config_tx: broadcast::Sender<Arc<Config>>,
    pending: Vec<(&'static str, ComponentFuture)>,
    running: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        let (config_tx, _) = broadcast::channel(4);
        Self {
            shutdown: CancellationToken::new(),
            config_tx,
            pending: Vec::new(),
            running: Vec::new(),
        }
    }

    /// The shared shutdown signal handed to components at construction.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A fresh subscription to configuration reloads.
    #[must_use]
    pub fn subscribe_config(&self) -> broadcast::Receiver<Arc<Config>> {
        self.config_tx.subscribe()
    }

    /// The reload sender, for adapters that drive reloads externally.
    #[must_use]
    pub fn config_sender(&self) -> broadcast::Sender<Arc<Config>> {
        self.config_tx.clone()
    }

    /// Registers a component to be spawned by [`Pipeline::start`].
    pub fn register(
        &mut self,
        name: &'static str,
        component: impl Future<Output = ()> + Send + 'static,
    ) {
        self.pending.push((name, Box::pin(component)));
    }

    /// Spawns every registered component.
    pub fn start(&mut self) {
        for (name, component) in self.pending.drain(..) {
            debug!("PIPELINE | starting {name}");
            self.running.push((name, tokio::spawn(component)));
        }
        info!("PIPELINE | {} components running", self.running.len());
    }

    /// Broadcasts a reloaded configuration to all subscribers.
    pub fn send_config(&self, config: Arc<Config>) {
        let _ = self.config_tx.send(config);
    }

    /// Requests shutdown of every component.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for every component to finish.
    pub async fn wait(&mut self) {
        for (name, handle) in self.running.drain(..) {
            if handle.await.is_err() {
                tracing::error!("PIPELINE | {name} terminated abnormally");
            }
        }
    }
}
