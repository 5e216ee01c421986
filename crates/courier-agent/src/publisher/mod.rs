//! At-least-once delivery of event batches.
//!
//! The publisher accepts ordered batches from the spooler, wraps each in a
//! nonce-keyed [`Payload`], serializes it to the transport, and matches
//! inbound acknowledgements back to in-flight payloads. Per connection it
//! moves through three states:
//!
//! - **disconnected** — trying to establish a connection; nothing is
//!   accepted from the spooler.
//! - **connected** — batches are accepted while the in-flight window has
//!   room and the transport has signalled writability.
//! - **failing** — on any transport, protocol, or ack-timeout error every
//!   unfinalized payload is queued for retransmission and the connection is
//!   torn down, returning to disconnected.
//!
//! Retransmission resends the complete payload with its original nonce and
//! in original nonce order, so a late acknowledgement from the previous
//! connection still matches; the already-acked prefix is duplicated, which
//! the at-least-once contract permits.
//!
//! A partial acknowledgement (`sequence < len`) advances the payload's
//! first-unacked index and immediately reports the prefix's offsets to the
//! registrar; the final acknowledgement retires the payload. Offsets only
//! ever reach the registrar through acknowledgements, which is the
//! at-least-once invariant: every persisted offset was acked.

pub mod payload;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::event::Event;
use crate::publisher::payload::Payload;
use crate::registrar::{RegistrarEvent, RegistrarHandle};
use crate::snapshot::{PublisherMetrics, Shared};
use crate::transport::frame::{self, Ack, NONCE_LEN, TAG_ACKN};
use crate::transport::{Transport, TransportError};

/// Cadence of the in-flight ack-deadline sweep.
const TIMEOUT_SWEEP: Duration = Duration::from_secs(1);

/// Conditions that force a reconnect. None of them are fatal to the agent.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected frame tag {0:?}")]
    UnknownTag(String),

    #[error("acknowledgement for unknown nonce")]
    UnknownNonce,

    #[error("payload unacknowledged past deadline")]
    PayloadTimeout,
}

/// The delivery service. Spawn [`Publisher::run`] as a task.
pub struct Publisher {
    config: Arc<Config>,
    transport: Transport,
    spool_rx: mpsc::Receiver<Vec<Event>>,
    registrar: RegistrarHandle,
    shutdown: CancellationToken,
    config_rx: broadcast::Receiver<Arc<Config>>,

    /// Unfinalized payloads in original send order.
    in_flight: VecDeque<Payload>,
    /// Nonces awaiting (re)transmission, with a resend marker.
    send_queue: VecDeque<([u8; NONCE_LEN], bool)>,
    /// The transport has signalled writability since our last write.
    ready: bool,
    connected: bool,
    spool_closed: bool,
    shutdown_seen: bool,
    /// The reload channel still has a live sender.
    config_open: bool,

    metrics: Shared<PublisherMetrics>,
}

impl Publisher {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        transport: Transport,
        spool_rx: mpsc::Receiver<Vec<Event>>,
        registrar: RegistrarHandle,
        shutdown: CancellationToken,
        config_rx: broadcast::Receiver<Arc<Config>>,
        metrics: Shared<PublisherMetrics>,
    ) -> Self {
        Self {
            config,
            transport,
            spool_rx,
            registrar,
            shutdown,
            config_rx,
            in_flight: VecDeque::new(),
            send_queue: VecDeque::new(),
            ready: false,
            connected: false,
            spool_closed: false,
            shutdown_seen: false,
            config_open: true,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let can_send = self.transport.can_send_handle();
        let can_recv = self.transport.can_recv_handle();
        let mut shutdown_deadline: Option<Instant> = None;

        loop {
            if self.spool_closed && self.in_flight.is_empty() {
                break;
            }
            if let Some(deadline) = shutdown_deadline {
                if Instant::now() >= deadline {
                    warn!(
                        "PUBLISHER | abandoning {} unacknowledged payloads at shutdown",
                        self.in_flight.len()
                    );
                    break;
                }
            }

            if !self.connected {
                tokio::select! {
                    _ = self.transport.connect() => {
                        self.connected = true;
                        self.ready = false;
                        self.requeue_unacked();
                    }
                    _ = self.shutdown.cancelled(), if !self.shutdown_seen => {
                        self.note_shutdown(&mut shutdown_deadline);
                    }
                    _ = sleep_until_opt(shutdown_deadline), if shutdown_deadline.is_some() => {}
                }
                continue;
            }

            let accepting = self.can_accept();
            tokio::select! {
                _ = can_recv.notified() => {
                    self.drain_inbound().await;
                }
                _ = can_send.notified() => {
                    self.ready = true;
                    self.pump_sends().await;
                }
                batch = self.spool_rx.recv(), if accepting => match batch {
                    Some(events) => self.accept_batch(events).await,
                    None => self.spool_closed = true,
                },
                _ = tokio::time::sleep(TIMEOUT_SWEEP) => {
                    self.check_timeouts().await;
                }
                _ = self.shutdown.cancelled(), if !self.shutdown_seen => {
                    self.note_shutdown(&mut shutdown_deadline);
                }
                received = self.config_rx.recv(), if self.config_open => match received {
                    Ok(config) => {
                        self.transport.reconfigure(Arc::clone(&config));
                        self.config = config;
                    }
                    Err(broadcast::error::RecvError::Closed) => self.config_open = false,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }

        self.transport.disconnect().await;
        info!("PUBLISHER | shutdown complete");
    }

    /// Whether a new batch may be pulled from the spooler: connected, the
    /// window has room, and the transport has signalled writability.
    fn can_accept(&self) -> bool {
        self.connected
            && !self.spool_closed
            && self.ready
            && self.in_flight.len() < self.config.max_pending_payloads
    }

    async fn accept_batch(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let payload = Payload::new(events);
        debug!(
            "PUBLISHER | queueing payload of {} events ({} in flight)",
            payload.len(),
            self.in_flight.len() + 1
        );
        self.send_queue.push_back((payload.nonce(), false));
        self.in_flight.push_back(payload);
        self.update_metrics(0);
        self.pump_sends().await;
    }

    /// Writes queued payloads while the transport is writable. Each write
    /// consumes the readiness edge; the next flush re-raises it.
    async fn pump_sends(&mut self) {
        while self.ready {
            let Some(&(nonce, resend)) = self.send_queue.front() else {
                return;
            };
            let Some(payload) = self.in_flight.iter_mut().find(|p| p.nonce() == nonce) else {
                // Finalized while waiting to be resent; nothing to transmit.
                self.send_queue.pop_front();
                continue;
            };
            let wire = payload.wire();
            match self.transport.write(wire).await {
                Ok(()) => {
                    payload.mark_sent(resend);
                    self.send_queue.pop_front();
                    self.ready = false;
                }
                Err(e) => {
                    self.fail(e.into()).await;
                    return;
                }
            }
        }
    }

    /// Consumes everything waiting on the receive side.
    async fn drain_inbound(&mut self) {
        while let Some(message) = self.transport.try_read() {
            let result = match message {
                Ok(frame) if frame.tag == TAG_ACKN => {
                    match frame::decode_ackn(&frame.payload) {
                        Ok(ack) => self.apply_ack(ack).await,
                        Err(e) => Err(PublishError::Transport(e.into())),
                    }
                }
                Ok(frame) => Err(PublishError::UnknownTag(
                    String::from_utf8_lossy(&frame.tag).into_owned(),
                )),
                Err(e) => Err(PublishError::Transport(e)),
            };
            if let Err(e) = result {
                self.fail(e).await;
                return;
            }
        }
    }

    /// Matches one acknowledgement to its payload, advances ack cells,
    /// reports offsets to the registrar, and retires finalized payloads.
    async fn apply_ack(&mut self, ack: Ack) -> Result<(), PublishError> {
        let Some(pos) = self
            .in_flight
            .iter()
            .position(|p| p.nonce() == ack.nonce)
        else {
            // An ack outside the in-flight window means the peer and we
            // disagree about what is outstanding.
            return Err(PublishError::UnknownNonce);
        };

        let payload = &mut self.in_flight[pos];
        let mut newly_acked = 0;
        if let Some(range) = payload.ack(ack.sequence) {
            newly_acked = range.len();
            for event in payload.events_in(range.clone()) {
                event.ack.advance(event.offset);
            }
            let offsets = payload.acked_offsets(range);
            self.registrar
                .send(vec![RegistrarEvent::OffsetsAcked { offsets }])
                .await;
        }

        if let Some(payload) = self.in_flight.get(pos).filter(|p| p.is_complete()) {
            let nonce = payload.nonce();
            let retries = payload.retries;
            self.in_flight.remove(pos);
            // A late final ack can arrive while the payload sits in the
            // resend queue; it must not be retransmitted.
            self.send_queue.retain(|(queued, _)| *queued != nonce);
            debug!(
                "PUBLISHER | payload finalized after {retries} retries ({} in flight)",
                self.in_flight.len()
            );
        }
        self.update_metrics(newly_acked as u64);
        Ok(())
    }

    /// Forces a reconnect when a transmitted payload has waited longer than
    /// the ack deadline. A stuck peer is indistinguishable from a dead one.
    async fn check_timeouts(&mut self) {
        let queued: HashSet<[u8; NONCE_LEN]> =
            self.send_queue.iter().map(|(nonce, _)| *nonce).collect();
        let timed_out = self.in_flight.iter().any(|p| {
            !queued.contains(&p.nonce()) && p.sent_at.elapsed() >= self.config.timeout
        });
        if timed_out {
            self.fail(PublishError::PayloadTimeout).await;
        }
    }

    /// Tears the connection down and queues every unfinalized payload for
    /// retransmission in original nonce order.
    async fn fail(&mut self, error: PublishError) {
        warn!("PUBLISHER | {error}; resetting connection");
        self.transport.disconnect().await;
        self.connected = false;
        self.ready = false;
        self.requeue_unacked();
    }

    fn requeue_unacked(&mut self) {
        self.send_queue = self
            .in_flight
            .iter()
            .map(|p| (p.nonce(), true))
            .collect();
        if !self.send_queue.is_empty() {
            info!(
                "PUBLISHER | {} payloads queued for retransmission",
                self.send_queue.len()
            );
        }
    }

    fn note_shutdown(&mut self, deadline: &mut Option<Instant>) {
        self.shutdown_seen = true;
        *deadline = Some(Instant::now() + self.config.shutdown_timeout);
        info!(
            "PUBLISHER | shutdown requested, waiting for {} outstanding payloads",
            self.in_flight.len()
        );
    }

    fn update_metrics(&self, newly_acked: u64) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.lines_published += newly_acked;
            metrics.payloads_pending = self.in_flight.len();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::event::AckCell;
    use crate::transport::frame::{decode_jdat, encode, encode_ackn, parse_header, HEADER_LEN};
    use serde_json::Map;
    use std::sync::RwLock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    fn create_test_events(file_id: u64, offsets: &[u64]) -> Vec<Event> {
        let ack = AckCell::new();
        offsets
            .iter()
            .map(|&offset| {
                Event::new(
                    file_id,
                    ack.clone(),
                    "host",
                    "/tmp/pub.log",
                    offset,
                    offset,
                    format!("line {offset}"),
                    &Map::new(),
                )
            })
            .collect()
    }

    struct Rig {
        batch_tx: mpsc::Sender<Vec<Event>>,
        registrar_rx: mpsc::Receiver<Vec<RegistrarEvent>>,
        shutdown: CancellationToken,
        metrics: Shared<PublisherMetrics>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start_publisher(port: u16, max_pending: usize, ack_timeout: Duration) -> Rig {
        let config = Arc::new(Config {
            servers: vec![format!("127.0.0.1:{port}")],
            transport: TransportKind::Tcp,
            max_pending_payloads: max_pending,
            timeout: ack_timeout,
            reconnect: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let transport = Transport::new(Arc::clone(&config)).unwrap();
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (registrar_tx, registrar_rx) = mpsc::channel(16);
        let registrar = RegistrarHandle::for_tests(registrar_tx);
        let shutdown = CancellationToken::new();
        let (_config_tx, config_rx) = broadcast::channel(4);
        let metrics = Arc::new(RwLock::new(PublisherMetrics::default()));

        let publisher = Publisher::new(
            config,
            transport,
            batch_rx,
            registrar,
            shutdown.clone(),
            config_rx,
            Arc::clone(&metrics),
        );
        let task = tokio::spawn(publisher.run());
        Rig {
            batch_tx,
            registrar_rx,
            shutdown,
            metrics,
            task,
        }
    }

    async fn read_jdat(socket: &mut TcpStream) -> ([u8; NONCE_LEN], usize) {
        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await.unwrap();
        let (tag, len) = parse_header(&header).unwrap();
        assert_eq!(tag, *b"JDAT");
        let mut payload = vec![0u8; len];
        socket.read_exact(&mut payload).await.unwrap();
        let (nonce, events) = decode_jdat(&payload).unwrap();
        (nonce, events.len())
    }

    async fn send_ack(socket: &mut TcpStream, nonce: [u8; NONCE_LEN], sequence: u32) {
        let ack = encode(TAG_ACKN, &encode_ackn(nonce, sequence));
        socket.write_all(&ack).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_and_full_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (nonce, count) = read_jdat(&mut socket).await;
            assert_eq!(count, 3);
            send_ack(&mut socket, nonce, 3).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut rig = start_publisher(port, 4, Duration::from_secs(15));
        let events = create_test_events(1, &[2, 4, 6]);
        let cells: Vec<AckCell> = events.iter().map(|e| e.ack.clone()).collect();
        rig.batch_tx.send(events).await.unwrap();

        let batch = timeout(Duration::from_secs(5), rig.registrar_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &batch[0] {
            RegistrarEvent::OffsetsAcked { offsets } => {
                assert_eq!(offsets, &vec![(1, 6)]);
            }
            other => panic!("expected OffsetsAcked, got {other:?}"),
        }
        assert_eq!(cells[0].get(), 6, "ack cell advanced to highest offset");

        // Natural exit: drop the spooler side, the window is empty.
        drop(rig.batch_tx);
        timeout(Duration::from_secs(5), rig.task).await.unwrap().unwrap();
        let metrics = crate::snapshot::read(&rig.metrics);
        assert_eq!(metrics.lines_published, 3);
        assert_eq!(metrics.payloads_pending, 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_acks_advance_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (nonce, count) = read_jdat(&mut socket).await;
            assert_eq!(count, 2);
            send_ack(&mut socket, nonce, 1).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            send_ack(&mut socket, nonce, 2).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut rig = start_publisher(port, 4, Duration::from_secs(15));
        rig.batch_tx
            .send(create_test_events(7, &[10, 20]))
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(5), rig.registrar_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &first[0] {
            RegistrarEvent::OffsetsAcked { offsets } => assert_eq!(offsets, &vec![(7, 10)]),
            other => panic!("unexpected {other:?}"),
        }

        let second = timeout(Duration::from_secs(5), rig.registrar_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &second[0] {
            RegistrarEvent::OffsetsAcked { offsets } => assert_eq!(offsets, &vec![(7, 20)]),
            other => panic!("unexpected {other:?}"),
        }

        drop(rig.batch_tx);
        timeout(Duration::from_secs(5), rig.task).await.unwrap().unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_window_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // A server that reads frames but never acks.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let mut header = [0u8; HEADER_LEN];
                if socket.read_exact(&mut header).await.is_err() {
                    return;
                }
                let (_, len) = parse_header(&header).unwrap();
                let mut payload = vec![0u8; len];
                if socket.read_exact(&mut payload).await.is_err() {
                    return;
                }
            }
        });

        let rig = start_publisher(port, 2, Duration::from_secs(3600));
        for i in 0..5u64 {
            // The capacity-1 batch channel plus the closed window
            // backpressure the sender exactly like a spooler.
            let _ = timeout(
                Duration::from_secs(1),
                rig.batch_tx.send(create_test_events(1, &[i * 10 + 1])),
            )
            .await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let metrics = crate::snapshot::read(&rig.metrics);
        assert!(
            metrics.payloads_pending <= 2,
            "window exceeded: {}",
            metrics.payloads_pending
        );
        assert_eq!(metrics.lines_published, 0);

        rig.shutdown.cancel();
        server.abort();
    }

    #[tokio::test]
    async fn test_reconnect_resends_original_nonce() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // First connection: read the payload, drop without acking.
            let (mut socket, _) = listener.accept().await.unwrap();
            let (first_nonce, _) = read_jdat(&mut socket).await;
            drop(socket);

            // Second connection: the same nonce arrives again; ack it.
            let (mut socket, _) = listener.accept().await.unwrap();
            let (second_nonce, count) = read_jdat(&mut socket).await;
            assert_eq!(first_nonce, second_nonce, "retransmission reuses the nonce");
            send_ack(&mut socket, second_nonce, count as u32).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut rig = start_publisher(port, 4, Duration::from_secs(15));
        rig.batch_tx
            .send(create_test_events(3, &[5, 9]))
            .await
            .unwrap();

        let batch = timeout(Duration::from_secs(10), rig.registrar_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &batch[0] {
            RegistrarEvent::OffsetsAcked { offsets } => assert_eq!(offsets, &vec![(3, 9)]),
            other => panic!("unexpected {other:?}"),
        }

        drop(rig.batch_tx);
        timeout(Duration::from_secs(5), rig.task).await.unwrap().unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_nonce_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (_nonce, _) = read_jdat(&mut socket).await;
            // Ack a nonce that was never sent.
            send_ack(&mut socket, [0xAA; NONCE_LEN], 1).await;
            // The publisher must abandon this connection and dial again.
            let (mut socket, _) = listener.accept().await.unwrap();
            let (nonce, count) = read_jdat(&mut socket).await;
            send_ack(&mut socket, nonce, count as u32).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut rig = start_publisher(port, 4, Duration::from_secs(15));
        rig.batch_tx
            .send(create_test_events(2, &[7]))
            .await
            .unwrap();

        let batch = timeout(Duration::from_secs(10), rig.registrar_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(&batch[0], RegistrarEvent::OffsetsAcked { .. }));

        drop(rig.batch_tx);
        timeout(Duration::from_secs(5), rig.task).await.unwrap().unwrap();
        server.await.unwrap();
    }
}
