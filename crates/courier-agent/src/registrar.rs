//! Durable custodian of per-file read offsets.
//!
//! The registrar is the single writer of the persisted state file. It
//! consumes ordered batches of [`RegistrarEvent`]s from the prospector
//! (file lifecycle) and the publisher (acknowledged offsets), applies them
//! to an in-memory map, and rewrites the state file after every batch:
//! serialize to `<persist_dir>/.log-courier.new`, then atomically rename
//! over `<persist_dir>/.log-courier`. Startup tries `.log-courier` first
//! and falls back to `.log-courier.new` to survive a crash mid-rename.
//!
//! The registrar never removes an entry on its own; only a `Deleted` event
//! does. A state file that cannot be written is logged loudly on every
//! occurrence and the agent keeps running in memory — delivery still works,
//! only crash recovery is compromised.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::FileId;
use crate::prospector::identity::FileIdentity;
use crate::snapshot::RegistrarMetrics;

/// Durable state file name under the persist directory.
pub const STATE_FILE: &str = ".log-courier";
/// Scratch name the state is written to before the atomic rename.
pub const STATE_FILE_NEW: &str = ".log-courier.new";

/// Capacity of the registrar's event channel.
const REGISTRAR_QUEUE: usize = 16;

/// Persisted state of one tracked file.
///
/// Unknown fields in the durable document are ignored on read, so newer
/// agents can extend the format without breaking older state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileState {
    /// Current path of the file.
    pub source: String,
    /// Highest acknowledged byte offset.
    pub offset: u64,
    #[serde(default)]
    pub device: u64,
    #[serde(default)]
    pub inode: u64,
}

impl FileState {
    #[must_use]
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            device: self.device,
            inode: self.inode,
        }
    }
}

/// One mutation of the registrar state. Processed strictly in arrival
/// order; each variant knows how to apply itself.
#[derive(Debug)]
pub enum RegistrarEvent {
    /// A file was discovered or resumed; save its starting offset.
    NewFile {
        file_id: FileId,
        source: String,
        offset: u64,
        identity: FileIdentity,
    },
    /// A tracked file changed paths without changing identity.
    Renamed { file_id: FileId, source: String },
    /// A tracked file is gone and fully acknowledged; forget it.
    Deleted { file_id: FileId },
    /// The upstream acknowledged events up to these offsets.
    OffsetsAcked { offsets: Vec<(FileId, u64)> },
}

impl RegistrarEvent {
    fn apply(self, state: &mut HashMap<FileId, FileState>) {
        match self {
            RegistrarEvent::NewFile {
                file_id,
                source,
                offset,
                identity,
            } => {
                debug!("REGISTRAR | new file event for {source}");
                state.insert(
                    file_id,
                    FileState {
                        source,
                        offset,
                        device: identity.device,
                        inode: identity.inode,
                    },
                );
            }
            RegistrarEvent::Renamed { file_id, source } => {
                match state.get_mut(&file_id) {
                    Some(entry) => {
                        debug!("REGISTRAR | rename event: {} -> {source}", entry.source);
                        entry.source = source;
                    }
                    // Stdin, or a file already deleted; nothing to rename.
                    None => debug!("REGISTRAR | rename event for untracked file {file_id}"),
                }
            }
            RegistrarEvent::Deleted { file_id } => {
                match state.remove(&file_id) {
                    Some(entry) => debug!("REGISTRAR | deletion event for {}", entry.source),
                    None => warn!("REGISTRAR | deletion event for untracked file {file_id}"),
                }
            }
            RegistrarEvent::OffsetsAcked { offsets } => {
                debug!("REGISTRAR | received offsets for {} files", offsets.len());
                for (file_id, offset) in offsets {
                    // Stdin events carry id 0 and have no entry to update.
                    if let Some(entry) = state.get_mut(&file_id) {
                        entry.offset = offset;
                    }
                }
            }
        }
    }
}

/// Cloneable sender side of the registrar. The service exits once every
/// handle has been dropped and the queue is drained.
#[derive(Clone)]
pub struct RegistrarHandle {
    tx: mpsc::Sender<Vec<RegistrarEvent>>,
}

impl RegistrarHandle {
    /// Queues one ordered batch of events. An error means the registrar is
    /// gone, which only happens during shutdown.
    pub async fn send(&self, events: Vec<RegistrarEvent>) {
        if !events.is_empty() && self.tx.send(events).await.is_err() {
            warn!("REGISTRAR | event batch dropped: registrar has shut down");
        }
    }
}

#[cfg(test)]
impl RegistrarHandle {
    /// Wraps a bare channel so unit tests can assert on the event stream.
    pub(crate) fn for_tests(tx: mpsc::Sender<Vec<RegistrarEvent>>) -> Self {
        Self { tx }
    }
}

/// The registrar service. Spawn [`Registrar::run`] as a task.
pub struct Registrar {
    rx: mpsc::Receiver<Vec<RegistrarEvent>>,
    state: HashMap<FileId, FileState>,
    /// `None` in stdin mode: state is tracked in memory but never persisted.
    persist_dir: Option<PathBuf>,
    metrics: Arc<RwLock<RegistrarMetrics>>,
}

impl Registrar {
    #[must_use]
    pub fn new(
        persist_dir: Option<PathBuf>,
        metrics: Arc<RwLock<RegistrarMetrics>>,
    ) -> (Self, RegistrarHandle) {
        let (tx, rx) = mpsc::channel(REGISTRAR_QUEUE);
        (
            Self {
                rx,
                state: HashMap::new(),
                persist_dir,
                metrics,
            },
            RegistrarHandle { tx },
        )
    }

    /// Loads the previous state, keyed by path. Tries the state file first,
    /// then the scratch file in case the process died between write and
    /// rename.
    #[must_use]
    pub fn load_previous(persist_dir: &Path) -> HashMap<String, FileState> {
        for name in [STATE_FILE, STATE_FILE_NEW] {
            let path = persist_dir.join(name);
            let Ok(contents) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<HashMap<String, FileState>>(&contents) {
                Ok(state) => {
                    info!(
                        "REGISTRAR | loaded state for {} files from {}",
                        state.len(),
                        path.display()
                    );
                    return state;
                }
                Err(e) => {
                    error!(
                        "REGISTRAR | failed to parse {}: {e}; starting fresh",
                        path.display()
                    );
                }
            }
        }
        HashMap::new()
    }

    /// Consumes event batches until all handles are dropped, persisting
    /// after each batch.
    pub async fn run(mut self) {
        while let Some(batch) = self.rx.recv().await {
            for event in batch {
                event.apply(&mut self.state);
            }
            self.persist().await;
            if let Ok(mut metrics) = self.metrics.write() {
                metrics.files_tracked = self.state.len();
            }
        }
        info!("REGISTRAR | shutdown complete");
    }

    async fn persist(&self) {
        let Some(dir) = &self.persist_dir else {
            return;
        };

        let by_path: HashMap<&str, &FileState> = self
            .state
            .values()
            .map(|entry| (entry.source.as_str(), entry))
            .collect();
        let contents = match serde_json::to_vec_pretty(&by_path) {
            Ok(contents) => contents,
            Err(e) => {
                error!("REGISTRAR | failed to serialize state: {e}");
                return;
            }
        };

        let scratch = dir.join(STATE_FILE_NEW);
        let target = dir.join(STATE_FILE);
        if let Err(e) = tokio::fs::write(&scratch, &contents).await {
            error!(
                "REGISTRAR | failed to write {}: {e}; continuing in memory",
                scratch.display()
            );
            return;
        }
        if let Err(e) = tokio::fs::rename(&scratch, &target).await {
            error!(
                "REGISTRAR | failed to move state into place at {}: {e}; continuing in memory",
                target.display()
            );
        }
    }
}
