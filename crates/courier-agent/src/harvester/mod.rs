//! Per-file tailer.
//!
//! One harvester runs per live file. It opens the file at a starting
//! offset, reads chunks, hands bytes through its codec into discrete
//! events, and submits each event to the spooler. At end of file it sleeps
//! briefly and stats for two conditions: truncation (file shrank below the
//! read offset — seek back to zero) and identity change (the path no
//! longer resolves to the same device+inode — finish with `Renamed` so the
//! prospector can re-attach).
//!
//! A harvester ends in exactly one way: by reporting a [`FinishStatus`] on
//! its completion channel, which the prospector observes.

pub mod codec;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{AckCell, Event, FileId};
use crate::harvester::codec::{Codec, Line};
use crate::prospector::identity::FileIdentity;
use crate::spooler::SpoolerHandle;

/// Pause between read attempts at end of file.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Read chunk size.
const CHUNK_SIZE: usize = 16 * 1024;

/// Why the harvester stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Stop was requested; the codec was flushed first.
    Stopped,
    /// The stream source ended (stdin only).
    EndOfStream,
    /// The path stopped resolving to this file's identity.
    Renamed,
    /// Nothing was read for the configured dead time.
    Dead,
    /// A read failed; see the error field.
    Failed,
}

/// Final report of a harvester, delivered once on its completion channel.
#[derive(Debug)]
pub struct FinishStatus {
    pub reason: FinishReason,
    /// Bytes consumed from the file, including any unterminated tail.
    pub last_read_offset: u64,
    /// End offset of the last emitted event.
    pub last_event_offset: u64,
    pub error: Option<HarvestError>,
}

/// Errors a harvester can report.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Control handle held by the prospector.
pub struct HarvesterHandle {
    stop: CancellationToken,
    finish: oneshot::Receiver<FinishStatus>,
    task: JoinHandle<()>,
}

impl HarvesterHandle {
    /// Requests a stop; the harvester flushes its codec and reports.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Polls the completion channel without blocking.
    pub fn try_finished(&mut self) -> Option<FinishStatus> {
        self.finish.try_recv().ok()
    }

    /// The completion channel itself, for awaiting in a select.
    pub fn finished(&mut self) -> &mut oneshot::Receiver<FinishStatus> {
        &mut self.finish
    }

    /// Stops the harvester and waits for its final report.
    pub async fn wait(self) -> Option<FinishStatus> {
        self.stop.cancel();
        let status = self.finish.await.ok();
        let _ = self.task.await;
        status
    }
}

/// Everything a harvester needs to tail one file.
pub struct HarvesterConfig {
    pub file_id: FileId,
    pub ack: AckCell,
    pub path: PathBuf,
    pub identity: FileIdentity,
    /// Byte offset to begin reading at.
    pub offset: u64,
    pub codec: Box<dyn Codec>,
    /// User-defined fields stamped into every event.
    pub fields: Map<String, Value>,
    pub host: String,
    pub dead_time: Duration,
}

/// The tailer itself. Constructed through [`Harvester::start`] or
/// [`Harvester::start_stdin`]; never held directly.
pub struct Harvester {
    cfg: HarvesterConfig,
    spooler: SpoolerHandle,
    stop: CancellationToken,
    read_offset: u64,
    event_offset: u64,
    line: u64,
}

impl Harvester {
    /// Spawns a harvester over a file.
    #[must_use]
    pub fn start(cfg: HarvesterConfig, spooler: SpoolerHandle) -> HarvesterHandle {
        let stop = CancellationToken::new();
        let (finish_tx, finish) = oneshot::channel();
        let harvester = Self {
            read_offset: cfg.offset,
            event_offset: cfg.offset,
            line: 0,
            cfg,
            spooler,
            stop: stop.clone(),
        };
        let task = tokio::spawn(async move {
            let status = harvester.run_file().await;
            let _ = finish_tx.send(status);
        });
        HarvesterHandle { stop, finish, task }
    }

    /// Spawns a harvester over standard input. Offsets are byte counts from
    /// process start and nothing is persisted for them.
    #[must_use]
    pub fn start_stdin(
        host: String,
        fields: Map<String, Value>,
        codec: Box<dyn Codec>,
        spooler: SpoolerHandle,
    ) -> HarvesterHandle {
        let stop = CancellationToken::new();
        let (finish_tx, finish) = oneshot::channel();
        let harvester = Self {
            cfg: HarvesterConfig {
                file_id: 0,
                ack: AckCell::new(),
                path: PathBuf::from("-"),
                identity: FileIdentity::default(),
                offset: 0,
                codec,
                fields,
                host,
                dead_time: Duration::MAX,
            },
            spooler,
            stop: stop.clone(),
            read_offset: 0,
            event_offset: 0,
            line: 0,
        };
        let task = tokio::spawn(async move {
            let status = harvester.run_stream(tokio::io::stdin()).await;
            let _ = finish_tx.send(status);
        });
        HarvesterHandle { stop, finish, task }
    }

    async fn run_file(mut self) -> FinishStatus {
        let path = self.cfg.path.clone();
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(source) => {
                error!("HARVESTER | failed to open {}: {source}", path.display());
                return self.finish(FinishReason::Failed, Some(HarvestError::Io { path, source }));
            }
        };
        if self.cfg.offset > 0 {
            info!(
                "HARVESTER | resuming {} at offset {}",
                path.display(),
                self.cfg.offset
            );
            if let Err(source) = file.seek(SeekFrom::Start(self.cfg.offset)).await {
                return self.finish(FinishReason::Failed, Some(HarvestError::Io { path, source }));
            }
        } else {
            info!("HARVESTER | started harvesting {}", path.display());
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut lines: Vec<Line> = Vec::new();
        let mut last_activity = Instant::now();

        loop {
            if self.stop.is_cancelled() {
                return self.finish(FinishReason::Stopped, None);
            }

            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(source) => {
                    error!("HARVESTER | read error on {}: {source}", path.display());
                    return self
                        .finish(FinishReason::Failed, Some(HarvestError::Io { path, source }));
                }
            };

            if n > 0 {
                last_activity = Instant::now();
                self.read_offset += n as u64;
                self.cfg.codec.decode(&buf[..n], &mut lines);
                for line in lines.drain(..) {
                    if self.emit(line).await.is_err() {
                        return self.finish(FinishReason::Stopped, None);
                    }
                }
                continue;
            }

            // End of file. Check identity by path first: if the path moved
            // out from under us, a size comparison against whatever now
            // occupies it would be meaningless.
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    if FileIdentity::of(&meta) != self.cfg.identity {
                        info!("HARVESTER | {} no longer points at this file", path.display());
                        return self.finish(FinishReason::Renamed, None);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!("HARVESTER | {} has disappeared", path.display());
                    return self.finish(FinishReason::Renamed, None);
                }
                Err(e) => debug!("HARVESTER | stat failed on {}: {e}", path.display()),
            }

            // Truncation is judged against the open handle, not the path.
            match file.metadata().await {
                Ok(meta) if meta.len() < self.read_offset => {
                    warn!(
                        "HARVESTER | {} truncated ({} < {}), seeking to start",
                        path.display(),
                        meta.len(),
                        self.read_offset
                    );
                    if let Err(source) = file.seek(SeekFrom::Start(0)).await {
                        return self
                            .finish(FinishReason::Failed, Some(HarvestError::Io { path, source }));
                    }
                    self.cfg.codec.reset();
                    self.read_offset = 0;
                    self.event_offset = 0;
                    self.line = 0;
                    continue;
                }
                Ok(_) => {}
                Err(source) => {
                    return self
                        .finish(FinishReason::Failed, Some(HarvestError::Io { path, source }));
                }
            }

            if last_activity.elapsed() >= self.cfg.dead_time {
                info!(
                    "HARVESTER | {} idle past dead time, closing",
                    path.display()
                );
                return self.finish(FinishReason::Dead, None);
            }

            tokio::select! {
                _ = self.stop.cancelled() => return self.finish(FinishReason::Stopped, None),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Tail a non-seekable stream until it ends. The codec is flushed at
    /// end of stream so a final unterminated line is not lost.
    async fn run_stream<R: AsyncRead + Unpin>(mut self, mut rd: R) -> FinishStatus {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut lines: Vec<Line> = Vec::new();

        loop {
            let n = tokio::select! {
                _ = self.stop.cancelled() => {
                    // Flush the codec so a final unterminated line is not
                    // silently dropped; a stream cannot be re-read later.
                    if let Some(line) = self.cfg.codec.finish() {
                        let _ = self.emit(line).await;
                    }
                    return self.finish(FinishReason::Stopped, None);
                }
                read = rd.read(&mut buf) => match read {
                    Ok(n) => n,
                    Err(source) => {
                        return self.finish(
                            FinishReason::Failed,
                            Some(HarvestError::Io { path: self.cfg.path.clone(), source }),
                        );
                    }
                },
            };

            if n == 0 {
                if let Some(line) = self.cfg.codec.finish() {
                    let _ = self.emit(line).await;
                }
                return self.finish(FinishReason::EndOfStream, None);
            }

            self.read_offset += n as u64;
            self.cfg.codec.decode(&buf[..n], &mut lines);
            for line in lines.drain(..) {
                if self.emit(line).await.is_err() {
                    return self.finish(FinishReason::Stopped, None);
                }
            }
        }
    }

    async fn emit(&mut self, line: Line) -> Result<(), crate::spooler::PipelineClosed> {
        self.event_offset += line.consumed;
        self.line += 1;
        let event = Event::new(
            self.cfg.file_id,
            self.cfg.ack.clone(),
            &self.cfg.host,
            &self.cfg.path.to_string_lossy(),
            self.event_offset,
            self.line,
            line.text,
            &self.cfg.fields,
        );
        self.spooler.submit(event).await
    }

    fn finish(&mut self, reason: FinishReason, error: Option<HarvestError>) -> FinishStatus {
        debug!(
            "HARVESTER | {} finished: {reason:?} (read {}, events {})",
            self.cfg.path.display(),
            self.read_offset,
            self.event_offset
        );
        FinishStatus {
            reason,
            last_read_offset: self.read_offset,
            last_event_offset: self.event_offset,
            error,
        }
    }
}
