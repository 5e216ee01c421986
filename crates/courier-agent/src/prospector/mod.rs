//! File discovery and identity tracking.
//!
//! The prospector scans the configured glob patterns on a fixed interval
//! and keeps exactly one harvester running per live file. Files are tracked
//! by identity (device+inode), not by path, so a rename neither loses the
//! read position nor produces duplicate events.
//!
//! Per scan:
//!
//! 1. Enumerate every path matching any pattern and stat it.
//! 2. New identity: create a [`ProspectorInfo`], resuming at the persisted
//!    offset if one exists, otherwise at end of file (or the beginning when
//!    `from_beginning` is set); start a harvester; tell the registrar.
//! 3. Known identity at a new path: tell the registrar about the rename and
//!    update the record.
//! 4. Known identity whose harvester has exited and whose file has more
//!    data: restart the harvester from the last emitted offset.
//! 5. Identities not observed this scan are marked orphaned. An orphan
//!    whose harvester has finished, whose dead time has passed, and whose
//!    events are all acknowledged is reported deleted and dropped — state
//!    is never released while acknowledgements are outstanding.

pub mod identity;
pub mod info;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info as log_info, warn};

use crate::config::Config;
use crate::event::AckCell;
use crate::harvester::{codec, FinishReason, Harvester, HarvesterConfig};
use crate::prospector::identity::FileIdentity;
use crate::prospector::info::{FileStatus, InfoArena, ProspectorInfo};
use crate::registrar::{FileState, RegistrarEvent, RegistrarHandle};
use crate::snapshot::{ProspectorMetrics, Shared};
use crate::spooler::SpoolerHandle;

/// The discovery service. Spawn [`Prospector::run`] as a task.
pub struct Prospector {
    config: Arc<Config>,
    arena: InfoArena,
    /// Persisted states not yet matched to a live file, keyed by identity.
    resume: std::collections::HashMap<FileIdentity, FileState>,
    registrar: RegistrarHandle,
    spooler: SpoolerHandle,
    shutdown: CancellationToken,
    config_rx: broadcast::Receiver<Arc<Config>>,
    /// The reload channel still has a live sender.
    config_open: bool,
    from_beginning: bool,
    host: String,
    metrics: Shared<ProspectorMetrics>,
}

impl Prospector {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        previous: std::collections::HashMap<String, FileState>,
        registrar: RegistrarHandle,
        spooler: SpoolerHandle,
        shutdown: CancellationToken,
        config_rx: broadcast::Receiver<Arc<Config>>,
        from_beginning: bool,
        host: String,
        metrics: Shared<ProspectorMetrics>,
    ) -> Self {
        let resume = previous
            .into_values()
            .map(|state| (state.identity(), state))
            .collect();
        Self {
            config,
            arena: InfoArena::new(),
            resume,
            registrar,
            spooler,
            shutdown,
            config_rx,
            config_open: true,
            from_beginning,
            host,
            metrics,
        }
    }

    pub async fn run(mut self) {
        log_info!(
            "PROSPECTOR | started with {} file groups",
            self.config.files.len()
        );
        loop {
            self.scan().await;
            self.reap_finished();
            self.sweep_orphans().await;
            self.update_metrics();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.prospect_interval) => {}
                received = self.config_rx.recv(), if self.config_open => match received {
                    Ok(config) => {
                        log_info!("PROSPECTOR | configuration reloaded");
                        self.config = config;
                    }
                    Err(broadcast::error::RecvError::Closed) => self.config_open = false,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }

        // Stop every harvester and wait for its final report so pending
        // events reach the spooler before our submit handles drop.
        for info in self.arena.drain().collect::<Vec<_>>() {
            if let Some(handle) = info.harvester {
                if let Some(status) = handle.wait().await {
                    debug!(
                        "PROSPECTOR | {} stopped at offset {}",
                        info.path.display(),
                        status.last_event_offset
                    );
                }
            }
        }
        log_info!("PROSPECTOR | shutdown complete");
    }

    /// One pass over every configured pattern.
    async fn scan(&mut self) {
        let mut seen: HashSet<FileIdentity> = HashSet::new();
        let config = Arc::clone(&self.config);

        for group in &config.files {
            for pattern in &group.paths {
                let paths = match glob::glob(pattern) {
                    Ok(paths) => paths,
                    Err(e) => {
                        // Patterns are validated at load; a reload slipping
                        // through is logged and skipped.
                        warn!("PROSPECTOR | skipping pattern {pattern:?}: {e}");
                        continue;
                    }
                };
                for entry in paths.flatten() {
                    self.examine(entry, group, &mut seen).await;
                }
            }
        }

        // Anything not observed this scan is orphaned until it reappears.
        let now = Instant::now();
        for id in self.arena.ids() {
            if let Some(info) = self.arena.get_mut(id) {
                if seen.contains(&info.identity) {
                    info.orphaned_since = None;
                    info.last_seen = now;
                } else if info.orphaned_since.is_none() {
                    debug!("PROSPECTOR | {} not seen this scan", info.path.display());
                    info.orphaned_since = Some(now);
                }
            }
        }
    }

    /// Applies scan results for one path.
    async fn examine(
        &mut self,
        path: PathBuf,
        group: &crate::config::FileGroup,
        seen: &mut HashSet<FileIdentity>,
    ) {
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("PROSPECTOR | failed to stat {}: {e}", path.display());
                return;
            }
        };
        if !meta.is_file() {
            return;
        }
        let identity = FileIdentity::of(&meta);
        if !seen.insert(identity) {
            // A second path with the same identity within one scan (a hard
            // link, or overlapping patterns); the first wins.
            return;
        }

        match self.arena.lookup(identity) {
            None => self.start_file(path, meta.len(), identity, group).await,
            Some(id) => {
                let (renamed, restart) = {
                    let Some(entry) = self.arena.get_mut(id) else {
                        return;
                    };
                    entry.last_size = meta.len();
                    let renamed = if entry.path != path {
                        log_info!(
                            "PROSPECTOR | {} was renamed to {}",
                            entry.path.display(),
                            path.display()
                        );
                        entry.path = path.clone();
                        true
                    } else {
                        false
                    };
                    // Restart a finished harvester when there is anything
                    // left to read: a rename or failure always warrants a
                    // retry, a dead file only once it has grown again.
                    let restart = entry.harvester.is_none()
                        && match entry.status {
                            FileStatus::Resumable => true,
                            FileStatus::Dead => entry.last_size > entry.last_event_offset,
                            _ => false,
                        };
                    (renamed, restart)
                };
                if renamed {
                    self.registrar
                        .send(vec![RegistrarEvent::Renamed {
                            file_id: id,
                            source: path.to_string_lossy().into_owned(),
                        }])
                        .await;
                }
                if restart {
                    self.restart_harvester(id);
                }
            }
        }
    }

    /// Creates tracking state for a newly observed identity and starts its
    /// harvester.
    async fn start_file(
        &mut self,
        path: PathBuf,
        size: u64,
        identity: FileIdentity,
        group: &crate::config::FileGroup,
    ) {
        let offset = match self.resume.remove(&identity) {
            Some(state) => {
                if state.offset > size {
                    warn!(
                        "PROSPECTOR | {} shrank below its saved offset ({} < {}), starting over",
                        path.display(),
                        size,
                        state.offset
                    );
                    0
                } else {
                    log_info!(
                        "PROSPECTOR | resuming {} at saved offset {}",
                        path.display(),
                        state.offset
                    );
                    state.offset
                }
            }
            None if self.from_beginning => 0,
            None => size,
        };

        let ack = AckCell::new();
        // Nothing before the starting offset is outstanding.
        ack.advance(offset);

        let dead_time = self.config.dead_time_for(group);
        let fields = group.fields.clone();
        let codec_name = group.codec.clone().unwrap_or_else(|| "plain".to_string());
        let id = self.arena.insert(|id| ProspectorInfo {
            id,
            identity,
            path: path.clone(),
            status: FileStatus::Running,
            harvester: None,
            ack: ack.clone(),
            last_event_offset: offset,
            last_seen: Instant::now(),
            orphaned_since: None,
            last_size: size,
            fields,
            dead_time,
            codec: codec_name,
        });

        self.registrar
            .send(vec![RegistrarEvent::NewFile {
                file_id: id,
                source: path.to_string_lossy().into_owned(),
                offset,
                identity,
            }])
            .await;

        self.restart_harvester(id);
    }

    /// Starts a harvester for an info that has none, resuming at the last
    /// emitted offset. The at-most-one-harvester-per-identity invariant
    /// holds because an info only ever owns one handle.
    fn restart_harvester(&mut self, id: crate::event::FileId) {
        let host = self.host.clone();
        let Some(entry) = self.arena.get_mut(id) else {
            return;
        };
        let Some(codec) = codec::by_name(&entry.codec) else {
            // Validation keeps unknown names out of the configuration, but
            // a reload race is not worth crashing over.
            error!("PROSPECTOR | codec {:?} unavailable", entry.codec);
            entry.status = FileStatus::Invalid;
            return;
        };
        let handle = Harvester::start(
            HarvesterConfig {
                file_id: entry.id,
                ack: entry.ack.clone(),
                path: entry.path.clone(),
                identity: entry.identity,
                offset: entry.last_event_offset,
                codec,
                fields: entry.fields.clone(),
                host,
                dead_time: entry.dead_time,
            },
            self.spooler.clone(),
        );
        entry.harvester = Some(handle);
        entry.status = FileStatus::Running;
    }

    /// Collects completion reports from harvesters that have exited.
    fn reap_finished(&mut self) {
        for id in self.arena.ids() {
            let Some(entry) = self.arena.get_mut(id) else {
                continue;
            };
            let Some(handle) = entry.harvester.as_mut() else {
                continue;
            };
            let Some(status) = handle.try_finished() else {
                continue;
            };
            entry.harvester = None;
            entry.last_event_offset = status.last_event_offset;
            entry.status = match status.reason {
                FinishReason::Stopped | FinishReason::EndOfStream => FileStatus::Done,
                FinishReason::Renamed => FileStatus::Resumable,
                FinishReason::Dead => FileStatus::Dead,
                FinishReason::Failed => {
                    if let Some(e) = &status.error {
                        error!("PROSPECTOR | harvester for {} failed: {e}", entry.path.display());
                    }
                    FileStatus::Resumable
                }
            };
        }
    }

    /// Releases orphans whose events are fully acknowledged. The registrar
    /// only ever deletes state on our say-so, and we only say so once the
    /// publisher's acknowledgements have caught up.
    async fn sweep_orphans(&mut self) {
        let mut deleted = Vec::new();
        for id in self.arena.ids() {
            let Some(entry) = self.arena.get_mut(id) else {
                continue;
            };
            let Some(orphaned_since) = entry.orphaned_since else {
                continue;
            };
            if entry.harvester.is_some() {
                continue;
            }
            if orphaned_since.elapsed() >= entry.dead_time && entry.fully_acked() {
                log_info!(
                    "PROSPECTOR | releasing state for deleted file {}",
                    entry.path.display()
                );
                deleted.push(id);
            }
        }
        for id in deleted {
            self.arena.remove(id);
            self.registrar
                .send(vec![RegistrarEvent::Deleted { file_id: id }])
                .await;
        }
    }

    fn update_metrics(&self) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.files_open = self.arena.open_count();
            metrics.files_tracked = self.arena.len();
        }
    }
}
