//! Framed stream transport to the upstream receiver.
//!
//! The transport owns the connection lifecycle: it picks a random endpoint
//! from the configured list, resolves it, dials with a deadline, optionally
//! performs the TLS handshake, and then runs two independent tasks — a
//! sender and a receiver — over the split stream.
//!
//! # Deadlines
//!
//! Writes are guarded by a rolling five second deadline that is re-armed on
//! partial progress; a write that stalls completely is fatal to the
//! connection. Reads use the same interval but a bare read timeout only
//! means "still alive, keep waiting" — it re-checks the shutdown signal and
//! retries.
//!
//! # Signals
//!
//! `can_send` is raised after every successful flush and once right after a
//! connection is established; `can_recv` is raised whenever a message or a
//! terminal error is waiting. Both are coalesced single-slot notifications:
//! a pending signal is never duplicated, and a waiter re-examines state
//! after each wake.
//!
//! # Failure
//!
//! Any socket, TLS or framing error is delivered exactly once through the
//! receive side. Callers treat it as connection loss and call
//! [`Transport::connect`] again. Unlike some older shippers, an inbound
//! frame above the 1 MiB limit resets the connection instead of being
//! skipped over.

pub mod frame;
pub mod tls;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{parse_server, Config, TransportKind};
use crate::transport::frame::{Frame, FrameError, HEADER_LEN};

/// Interval of the rolling socket read/write deadlines.
const SOCKET_INTERVAL: Duration = Duration::from_secs(5);

/// Errors surfaced by the transport. All of them mean the connection is
/// gone; none of them are fatal to the agent.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    TlsSetup(String),

    #[error("invalid server endpoint: {0}")]
    InvalidServer(String),

    #[error("connection to {server} timed out")]
    ConnectTimeout { server: String },

    #[error("dns lookup for {host} returned no addresses")]
    Dns { host: String },

    #[error("write made no progress within the socket deadline")]
    WriteStalled,

    #[error("connection closed by peer")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Either side of the transport choice, unified for splitting.
enum Stream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// State of one established connection.
struct Link {
    cancel: CancellationToken,
    send_tx: mpsc::Sender<Bytes>,
    recv_rx: mpsc::Receiver<Result<Frame, TransportError>>,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// The framed connection to the upstream receiver.
pub struct Transport {
    config: Arc<Config>,
    tls: Option<Arc<rustls::ClientConfig>>,
    can_send: Arc<Notify>,
    can_recv: Arc<Notify>,
    link: Option<Link>,
}

impl Transport {
    /// Prepares the transport. For the tls transport this loads and checks
    /// the certificate material, so misconfiguration fails at startup rather
    /// than on the first connection attempt.
    pub fn new(config: Arc<Config>) -> Result<Self, TransportError> {
        let tls = match config.transport {
            TransportKind::Tls => Some(tls::client_config(&config)?),
            TransportKind::Tcp => None,
        };
        Ok(Self {
            config,
            tls,
            can_send: Arc::new(Notify::new()),
            can_recv: Arc::new(Notify::new()),
            link: None,
        })
    }

    /// Coalesced signal raised after every successful flush.
    #[must_use]
    pub fn can_send_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.can_send)
    }

    /// Coalesced signal raised when a message or terminal error is waiting.
    #[must_use]
    pub fn can_recv_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.can_recv)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Applies a configuration reload. Endpoint changes take effect on the
    /// next connection attempt.
    pub fn reconfigure(&mut self, config: Arc<Config>) {
        self.config = config;
    }

    /// Establishes a connection, retrying different endpoints until one
    /// succeeds. Never returns an error; the caller races this future
    /// against its shutdown signal. Internal state is only touched once a
    /// connection is fully established, so dropping the future mid-attempt
    /// leaves the transport disconnected and clean.
    pub async fn connect(&mut self) {
        loop {
            match self.attempt().await {
                Ok((stream, server)) => {
                    self.establish(stream);
                    info!("TRANSPORT | connected to {server}");
                    return;
                }
                Err(e) => {
                    warn!("TRANSPORT | connection attempt failed: {e}");
                    tokio::time::sleep(self.config.reconnect).await;
                }
            }
        }
    }

    /// One connection attempt against one randomly chosen endpoint.
    async fn attempt(&self) -> Result<(Stream, String), TransportError> {
        let server = {
            let mut rng = rand::thread_rng();
            self.config
                .servers
                .choose(&mut rng)
                .cloned()
                .ok_or(TransportError::NotConnected)?
        };
        let (host, port) = parse_server(&server)
            .map_err(|e| TransportError::InvalidServer(e.to_string()))?;

        let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .collect();
        let addr = {
            let mut rng = rand::thread_rng();
            *addrs
                .choose(&mut rng)
                .ok_or(TransportError::Dns { host: host.clone() })?
        };

        debug!("TRANSPORT | dialing {addr} ({host})");
        let deadline = self.config.network_timeout;
        let tcp = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                server: server.clone(),
            })??;

        let stream = match &self.tls {
            Some(tls_config) => {
                let name = ServerName::try_from(host.clone()).map_err(|e| {
                    TransportError::TlsSetup(format!("invalid server name {host:?}: {e}"))
                })?;
                let connector = TlsConnector::from(Arc::clone(tls_config));
                let tls = timeout(deadline, connector.connect(name, tcp))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout { server: server.clone() })??;
                Stream::Tls(Box::new(tls))
            }
            None => Stream::Tcp(tcp),
        };

        Ok((stream, server))
    }

    /// Splits the stream and launches the sender and receiver tasks.
    fn establish(&mut self, stream: Stream) {
        let (rd, wr) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        let (send_tx, send_rx) = mpsc::channel::<Bytes>(1);
        let (recv_tx, recv_rx) = mpsc::channel::<Result<Frame, TransportError>>(1);

        let sender = tokio::spawn(run_sender(
            wr,
            send_rx,
            cancel.clone(),
            Arc::clone(&self.can_send),
            recv_tx.clone(),
            Arc::clone(&self.can_recv),
        ));
        let receiver = tokio::spawn(run_receiver(
            rd,
            recv_tx,
            cancel.clone(),
            Arc::clone(&self.can_recv),
        ));

        self.link = Some(Link {
            cancel,
            send_tx,
            recv_rx,
            sender,
            receiver,
        });
        // A fresh connection is immediately writable.
        self.can_send.notify_one();
    }

    /// Queues one outbound blob for the sender task.
    pub async fn write(&mut self, blob: Bytes) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        link.send_tx
            .send(blob)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Pops the waiting message or terminal error, if any.
    pub fn try_read(&mut self) -> Option<Result<Frame, TransportError>> {
        self.link.as_mut()?.recv_rx.try_recv().ok()
    }

    /// Tears the connection down. Idempotent.
    pub async fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        link.cancel.cancel();
        let _ = link.sender.await;
        let _ = link.receiver.await;
        debug!("TRANSPORT | disconnected");
    }
}

/// Sender task: writes queued blobs under the rolling write deadline and
/// raises `can_send` after each flush. A fatal write error is handed to the
/// receive side so the owner observes exactly one terminal error.
async fn run_sender(
    mut wr: WriteHalf<Stream>,
    mut send_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    can_send: Arc<Notify>,
    recv_tx: mpsc::Sender<Result<Frame, TransportError>>,
    can_recv: Arc<Notify>,
) {
    loop {
        let blob = tokio::select! {
            _ = cancel.cancelled() => return,
            blob = send_rx.recv() => match blob {
                Some(blob) => blob,
                None => return,
            },
        };

        match write_all_deadline(&mut wr, &blob, &cancel).await {
            Ok(true) => can_send.notify_one(),
            Ok(false) => return,
            Err(e) => {
                deliver(&recv_tx, &can_recv, &cancel, Err(e)).await;
                return;
            }
        }
    }
}

/// Writes a whole buffer. Each `write` call that makes progress re-arms the
/// deadline; a full [`SOCKET_INTERVAL`] without progress is fatal unless
/// shutdown was requested. Returns `Ok(false)` on clean shutdown.
async fn write_all_deadline(
    wr: &mut WriteHalf<Stream>,
    buf: &[u8],
    cancel: &CancellationToken,
) -> Result<bool, TransportError> {
    let mut written = 0;
    while written < buf.len() {
        match timeout(SOCKET_INTERVAL, wr.write(&buf[written..])).await {
            Ok(Ok(0)) => return Err(TransportError::Closed),
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                if cancel.is_cancelled() {
                    return Ok(false);
                }
                return Err(TransportError::WriteStalled);
            }
        }
    }
    wr.flush().await?;
    Ok(true)
}

/// Receiver task: reads header + payload under the rolling read deadline,
/// validates the length, and delivers each frame (or one terminal error)
/// through the capacity-one receive slot.
async fn run_receiver(
    mut rd: ReadHalf<Stream>,
    recv_tx: mpsc::Sender<Result<Frame, TransportError>>,
    cancel: CancellationToken,
    can_recv: Arc<Notify>,
) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_exact_deadline(&mut rd, &mut header, &cancel).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                deliver(&recv_tx, &can_recv, &cancel, Err(e)).await;
                return;
            }
        }

        let (tag, len) = match frame::parse_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Oversized or malformed length: the connection is reset.
                deliver(&recv_tx, &can_recv, &cancel, Err(e.into())).await;
                return;
            }
        };

        let mut payload = vec![0u8; len];
        match read_exact_deadline(&mut rd, &mut payload, &cancel).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                deliver(&recv_tx, &can_recv, &cancel, Err(e)).await;
                return;
            }
        }

        let frame = Frame {
            tag,
            payload: payload.into(),
        };
        if !deliver(&recv_tx, &can_recv, &cancel, Ok(frame)).await {
            return;
        }
    }
}

/// Fills a whole buffer. A bare read timeout re-checks shutdown and keeps
/// waiting; only progress re-arms nothing because the peer may legitimately
/// be idle. Returns `Ok(false)` on clean shutdown.
async fn read_exact_deadline(
    rd: &mut ReadHalf<Stream>,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<bool, TransportError> {
    use tokio::io::AsyncReadExt;

    let mut read = 0;
    while read < buf.len() {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            result = timeout(SOCKET_INTERVAL, rd.read(&mut buf[read..])) => match result {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => read += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            },
        }
    }
    Ok(true)
}

/// Pushes one message into the receive slot and raises `can_recv`.
/// Returns false when the owner is gone or shutdown raced the delivery.
async fn deliver(
    recv_tx: &mpsc::Sender<Result<Frame, TransportError>>,
    can_recv: &Notify,
    cancel: &CancellationToken,
    message: Result<Frame, TransportError>,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = recv_tx.send(message) => {
            if sent.is_ok() {
                can_recv.notify_one();
                true
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{encode, encode_ackn, TAG_ACKN, TAG_JDAT};
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn create_test_config(port: u16) -> Arc<Config> {
        Arc::new(Config {
            servers: vec![format!("127.0.0.1:{port}")],
            transport: TransportKind::Tcp,
            reconnect: Duration::from_millis(10),
            ..Default::default()
        })
    }

    async fn bind() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_write_then_read_ack() {
        let (listener, port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let (tag, len) = frame::parse_header(&header).unwrap();
            assert_eq!(tag, TAG_JDAT);
            let mut payload = vec![0u8; len];
            socket.read_exact(&mut payload).await.unwrap();

            let ack = encode(TAG_ACKN, &encode_ackn([1u8; 16], 1));
            socket.write_all(&ack).await.unwrap();
        });

        let mut transport = Transport::new(create_test_config(port)).unwrap();
        transport.connect().await;
        assert!(transport.is_connected());

        let can_recv = transport.can_recv_handle();
        transport
            .write(encode(TAG_JDAT, b"test payload"))
            .await
            .unwrap();

        can_recv.notified().await;
        let frame = transport.try_read().unwrap().unwrap();
        assert_eq!(frame.tag, TAG_ACKN);

        transport.disconnect().await;
        transport.disconnect().await; // idempotent
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (listener, port) = bind().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = Vec::new();
            header.extend_from_slice(b"JDAT");
            header.extend_from_slice(&(2 * 1024 * 1024u32).to_be_bytes());
            socket.write_all(&header).await.unwrap();
            // Hold the socket open; the transport must reset regardless.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut transport = Transport::new(create_test_config(port)).unwrap();
        transport.connect().await;

        let can_recv = transport.can_recv_handle();
        can_recv.notified().await;
        let result = transport.try_read().unwrap();
        assert!(matches!(
            result,
            Err(TransportError::Frame(FrameError::TooLarge(_)))
        ));
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_once() {
        let (listener, port) = bind().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = Transport::new(create_test_config(port)).unwrap();
        transport.connect().await;

        let can_recv = transport.can_recv_handle();
        can_recv.notified().await;
        assert!(matches!(
            transport.try_read().unwrap(),
            Err(TransportError::Closed)
        ));
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_retries_until_listener_appears() {
        // Reserve a port, then close the listener so the first attempts fail.
        let (listener, port) = bind().await;
        drop(listener);

        let config = create_test_config(port);
        let mut transport = Transport::new(Arc::clone(&config)).unwrap();

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        timeout(Duration::from_secs(5), transport.connect())
            .await
            .expect("connect should eventually succeed");
        assert!(transport.is_connected());
        transport.disconnect().await;
        let _ = server.await;
    }
}
