//! Live node connections.
//!
//! Each [`Connection`] owns two tasks on the I/O runtime:
//!
//! - a **write loop** draining an unbounded queue into the framed sink, so
//!   sending never blocks the caller;
//! - a **read loop** decoding frames in receipt order and handing them to
//!   the [`Dispatcher`]. When the connection has been silent for the idle
//!   timeout it sends a heartbeat; a heartbeat that goes unanswered closes
//!   the connection.
//!
//! When the read loop ends, for whatever reason, it flushes the connection's
//! pending requests, unregisters the connection from the [`PeerRegistry`]
//! (only if it is still the registered one) and exits.
//!
//! A [`ConnectionHandle`] is a connection plus the protocol negotiated on
//! it. Handles only exist after negotiation succeeded.

use {
    crate::{
        correlator::{ResponseCallback, ResponseCorrelator},
        dispatch::Dispatcher,
        endpoint::PeerEndpoint,
        error::{HandshakeFailureKind, Result, SdkNetError},
        frame::{Frame, FrameCodec, MessageType},
        peer_registry::PeerRegistry,
        protocol::NegotiatedProtocol,
        stats::NetworkStats,
        tls,
    },
    futures::{SinkExt, StreamExt},
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{
        fmt,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, OnceLock, Weak,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
        sync::{mpsc, oneshot},
    },
    tokio_util::{
        codec::{FramedRead, FramedWrite},
        sync::CancellationToken,
    },
};

/// Payload of the idle heartbeat.
pub const HEARTBEAT_PAYLOAD: &[u8] = br#"{"heartBeat":"0"}"#;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Services every connection of one network shares.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub correlator: ResponseCorrelator,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<PeerRegistry>,
    pub stats: Arc<NetworkStats>,
    pub codec: FrameCodec,
    pub idle_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

pub struct Connection {
    id: ConnectionId,
    endpoint: PeerEndpoint,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<String>>,
    tls_failure: OnceLock<(HandshakeFailureKind, String)>,
    correlator: ResponseCorrelator,
    stats: Arc<NetworkStats>,
}

impl Connection {
    /// Start the read and write loops over an established stream.
    ///
    /// The connection closes when `parent` is cancelled.
    pub(crate) fn spawn<S>(
        endpoint: PeerEndpoint,
        stream: S,
        ctx: &ConnectionContext,
        parent: &CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            endpoint,
            outbound,
            shutdown: parent.child_token(),
            close_reason: Mutex::new(None),
            tls_failure: OnceLock::new(),
            correlator: ctx.correlator.clone(),
            stats: Arc::clone(&ctx.stats),
        });
        debug!("{} established to {}", connection.id, connection.endpoint);

        tokio::spawn(write_loop(
            Arc::clone(&connection),
            FramedWrite::new(writer, ctx.codec),
            queue,
        ));
        tokio::spawn(read_loop(
            Arc::clone(&connection),
            FramedRead::new(reader, ctx.codec),
            ctx.clone(),
        ));
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    pub fn is_active(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// TLS alert received after the handshake, if that is what closed the
    /// connection.
    pub fn tls_failure(&self) -> Option<&(HandshakeFailureKind, String)> {
        self.tls_failure.get()
    }

    /// Close the connection. The first reason given wins.
    pub fn close(&self, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.shutdown.cancel();
    }

    fn lost(&self) -> SdkNetError {
        SdkNetError::ConnectionLost {
            endpoint: self.endpoint.clone(),
            reason: self
                .close_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        }
    }

    /// Queue a frame for sending.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_active() {
            return Err(self.lost());
        }
        self.outbound.send(frame).map_err(|_| self.lost())
    }

    /// Send `frame` and complete `callback` with the response, a timeout, or
    /// the loss of this connection.
    pub fn request(&self, frame: Frame, timeout: Duration, callback: ResponseCallback) {
        if !self.is_active() {
            callback(Err(self.lost()));
            return;
        }
        let seq = frame.seq;
        if !self.correlator.register(seq, self.id, timeout, callback) {
            return;
        }
        self.stats.requests_sent.inc();
        let sent = self.send(frame);
        // A close racing the registration may already have flushed; a
        // second removal is a no-op.
        if let Err(e) = sent {
            self.correlator.fail(seq, e);
        } else if !self.is_active() {
            self.correlator.fail(seq, self.lost());
        }
    }

    /// [`request`](Self::request) awaiting the outcome.
    pub async fn request_async(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        self.request(
            frame,
            timeout,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or_else(|_| Err(self.lost()))
    }

    fn send_heartbeat(self: &Arc<Self>, timeout: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let heartbeat = Frame::new(MessageType::Heartbeat, HEARTBEAT_PAYLOAD);
        debug!("{} idle, sending heartbeat {}", self.endpoint, heartbeat.seq);
        self.request(
            heartbeat,
            timeout,
            Box::new(move |result| {
                if let (Err(SdkNetError::RequestTimedOut { .. }), Some(connection)) =
                    (result, weak.upgrade())
                {
                    warn!("heartbeat to {} timed out, closing", connection.endpoint);
                    connection.close("heartbeat timed out");
                }
            }),
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn write_loop<W>(
    connection: Arc<Connection>,
    mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut queue: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite,
{
    loop {
        tokio::select! {
            _ = connection.shutdown.cancelled() => break,
            next = queue.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = sink.send(frame).await {
                    connection.close(format!("write failed: {e}"));
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R>(
    connection: Arc<Connection>,
    mut frames: FramedRead<ReadHalf<R>, FrameCodec>,
    ctx: ConnectionContext,
) where
    R: AsyncRead,
{
    let reason = loop {
        let next = tokio::select! {
            _ = connection.shutdown.cancelled() => {
                break connection.close_reason().unwrap_or_else(|| "closed".to_string());
            }
            next = tokio::time::timeout(ctx.idle_timeout, frames.next()) => next,
        };
        match next {
            Err(_idle) => connection.send_heartbeat(ctx.heartbeat_timeout),
            Ok(Some(Ok(frame))) => ctx.dispatcher.dispatch(&connection.endpoint, frame),
            Ok(Some(Err(SdkNetError::Io(e)))) => {
                if let Some(kind) = tls::tls_alert_kind(&e) {
                    let _ = connection.tls_failure.set((kind, e.to_string()));
                }
                break format!("read failed: {e}");
            }
            Ok(Some(Err(e))) => break format!("protocol error: {e}"),
            Ok(None) => break "closed by peer".to_string(),
        }
    };

    connection.close(reason.clone());
    let reason = connection.close_reason().unwrap_or(reason);
    ctx.correlator
        .flush_connection(connection.id, &connection.endpoint, &reason);
    if ctx.registry.unregister(&connection.endpoint, connection.id) {
        ctx.stats.connections_lost.inc();
        info!("lost connection to {}: {}", connection.endpoint, reason);
    } else {
        debug!("{} to {} closed: {}", connection.id, connection.endpoint, reason);
    }
}

/// A negotiated, usable connection to one peer.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    protocol: Arc<NegotiatedProtocol>,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<Connection>, protocol: NegotiatedProtocol) -> Self {
        Self {
            connection,
            protocol: Arc::new(protocol),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.connection.endpoint
    }

    pub fn protocol(&self) -> &NegotiatedProtocol {
        &self.protocol
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        self.connection.send(frame)
    }

    pub fn request(&self, frame: Frame, timeout: Duration, callback: ResponseCallback) {
        self.connection.request(frame, timeout, callback)
    }

    pub async fn request_async(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        self.connection.request_async(frame, timeout).await
    }

    pub fn close(&self, reason: impl Into<String>) {
        self.connection.close(reason)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection", &self.connection)
            .field("protocol", &self.protocol.version())
            .finish()
    }
}

// ── Test support ────────────────────────────────────────────────────────────


// ── Tests ───────────────────────────────────────────────────────────────────
