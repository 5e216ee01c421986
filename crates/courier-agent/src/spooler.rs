//! Event batching between harvesters and the publisher.
//!
//! The spooler amortizes network cost while bounding per-event latency: it
//! appends submitted events to an in-memory buffer and releases the buffer
//! to the publisher as one ordered batch when
//!
//! 1. the buffer reaches `spool_size` events,
//! 2. nothing has been appended for `spool_timeout`,
//! 3. an explicit flush is requested, or
//! 4. shutdown is initiated.
//!
//! Events are never dropped. Backpressure is structural: the submit channel
//! is bounded, so harvesters block once the publisher's in-flight window is
//! full and the buffer is awaiting handoff.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::event::Event;

/// Capacity of the submit channel shared by every harvester.
const SUBMIT_QUEUE: usize = 128;

/// Cloneable submission endpoint handed to harvesters.
#[derive(Clone)]
pub struct SpoolerHandle {
    tx: mpsc::Sender<Event>,
    flush_tx: mpsc::Sender<()>,
}

impl SpoolerHandle {
    /// Submits one event, blocking while the pipeline is backpressured.
    /// An error means the spooler is gone; the caller should wind down.
    pub async fn submit(&self, event: Event) -> Result<(), PipelineClosed> {
        self.tx.send(event).await.map_err(|_| PipelineClosed)
    }

    /// Requests an immediate flush of whatever is buffered.
    pub async fn flush(&self) {
        let _ = self.flush_tx.send(()).await;
    }
}

/// The downstream half of the pipeline has shut down.
#[derive(Debug, thiserror::Error)]
#[error("pipeline closed")]
pub struct PipelineClosed;

/// The spooler service. Spawn [`Spooler::run`] as a task.
pub struct Spooler {
    rx: mpsc::Receiver<Event>,
    flush_rx: mpsc::Receiver<()>,
    batch_tx: mpsc::Sender<Vec<Event>>,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl Spooler {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        shutdown: CancellationToken,
        batch_tx: mpsc::Sender<Vec<Event>>,
    ) -> (Self, SpoolerHandle) {
        let (tx, rx) = mpsc::channel(SUBMIT_QUEUE);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        (
            Self {
                rx,
                flush_rx,
                batch_tx,
                config,
                shutdown,
            },
            SpoolerHandle { tx, flush_tx },
        )
    }

    /// Buffers and flushes until every submission handle is dropped.
    ///
    /// Shutdown flushes the buffer immediately but the task keeps draining
    /// until the submit channel closes, so events flushed by stopping
    /// harvesters are never stranded.
    pub async fn run(mut self) {
        let spool_size = self.config.spool_size;
        let idle = self.config.spool_timeout;
        let mut buffer: Vec<Event> = Vec::with_capacity(spool_size);
        let mut shutdown_seen = false;

        loop {
            // The sleep restarts on every loop turn, which makes it an
            // idle-since-last-append timer: any appended event takes the
            // recv branch and re-enters the loop.
            let timer = tokio::time::sleep(idle);
            tokio::pin!(timer);

            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= spool_size {
                            self.dispatch(&mut buffer).await;
                        }
                    }
                    None => {
                        self.dispatch(&mut buffer).await;
                        break;
                    }
                },
                requested = self.flush_rx.recv() => {
                    if requested.is_some() {
                        debug!("SPOOLER | explicit flush requested");
                        self.dispatch(&mut buffer).await;
                    }
                }
                _ = &mut timer, if !buffer.is_empty() => {
                    debug!("SPOOLER | idle timeout, flushing {} events", buffer.len());
                    self.dispatch(&mut buffer).await;
                }
                _ = self.shutdown.cancelled(), if !shutdown_seen => {
                    shutdown_seen = true;
                    self.dispatch(&mut buffer).await;
                }
            }
        }
        info!("SPOOLER | shutdown complete");
    }

    /// Releases the buffer downstream as one ordered batch.
    async fn dispatch(&mut self, buffer: &mut Vec<Event>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(buffer, Vec::with_capacity(self.config.spool_size));
        if self.batch_tx.send(batch).await.is_err() {
            // The publisher is gone; nothing downstream can accept events.
            debug!("SPOOLER | publisher has shut down, discarding flush");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AckCell;
    use serde_json::Map;
    use std::time::Duration;
    use tokio::time::timeout;

    fn create_test_event(message: &str) -> Event {
        Event::new(
            1,
            AckCell::new(),
            "host",
            "/tmp/test.log",
            0,
            1,
            message.to_string(),
            &Map::new(),
        )
    }

    fn create_test_spooler(
        spool_size: usize,
        spool_timeout: Duration,
    ) -> (SpoolerHandle, mpsc::Receiver<Vec<Event>>, CancellationToken) {
        let config = Arc::new(Config {
            spool_size,
            spool_timeout,
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let (spooler, handle) = Spooler::new(config, shutdown.clone(), batch_tx);
        tokio::spawn(spooler.run());
        (handle, batch_rx, shutdown)
    }

    #[tokio::test]
    async fn test_flush_on_size_threshold() {
        let (handle, mut batch_rx, _shutdown) =
            create_test_spooler(3, Duration::from_secs(3600));

        for i in 0..3 {
            handle.submit(create_test_event(&format!("line {i}"))).await.unwrap();
        }

        let batch = timeout(Duration::from_secs(1), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].fields()["message"], "line 0");
        assert_eq!(batch[2].fields()["message"], "line 2");
    }

    #[tokio::test]
    async fn test_flush_on_idle_timeout() {
        let (handle, mut batch_rx, _shutdown) =
            create_test_spooler(1024, Duration::from_millis(50));

        handle.submit(create_test_event("only line")).await.unwrap();

        let batch = timeout(Duration::from_secs(1), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let (handle, mut batch_rx, _shutdown) =
            create_test_spooler(1024, Duration::from_secs(3600));

        handle.submit(create_test_event("flushed early")).await.unwrap();
        handle.flush().await;

        let batch = timeout(Duration::from_secs(1), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_on_shutdown() {
        let (handle, mut batch_rx, shutdown) =
            create_test_spooler(1024, Duration::from_secs(3600));

        handle.submit(create_test_event("pending")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let batch = timeout(Duration::from_secs(1), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_exits_when_handles_dropped() {
        let config = Arc::new(Config::default());
        let (batch_tx, mut batch_rx) = mpsc::channel(1);
        let (spooler, handle) = Spooler::new(config, CancellationToken::new(), batch_tx);
        let task = tokio::spawn(spooler.run());

        handle.submit(create_test_event("last")).await.unwrap();
        drop(handle);

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        // The buffered event was flushed on the way out.
        assert_eq!(batch_rx.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_preserves_submission_order_across_batches() {
        let (handle, mut batch_rx, _shutdown) = create_test_spooler(2, Duration::from_millis(50));

        for i in 0..5 {
            handle.submit(create_test_event(&format!("{i}"))).await.unwrap();
        }

        let mut messages = Vec::new();
        while messages.len() < 5 {
            let batch = timeout(Duration::from_secs(1), batch_rx.recv())
                .await
                .unwrap()
                .unwrap();
            for event in batch {
                messages.push(event.fields()["message"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(messages, ["0", "1", "2", "3", "4"]);
    }
}
