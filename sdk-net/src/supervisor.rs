//! Bringing the configured peer set up, and keeping it up.
//!
//! A [`ConnectionSupervisor`] is built for exactly one crypto suite. For
//! every peer it runs the same pipeline:
//!
//! ```text
//!  TCP connect ──▶ TLS handshake ──▶ spawn connection ──▶ negotiate ──▶ register
//!  (connect       (handshake        (read/write        (capability    (peer
//!   timeout)       timeout)          loops)             probe, ...)    registry)
//! ```
//!
//! [`start_connect`](ConnectionSupervisor::start_connect) runs the pipeline
//! for all configured peers at once and succeeds if at least one peer gets
//! registered. A background pass then redials every configured peer without
//! a live handle on a fixed interval; peers that are alive are not touched.

use {
    crate::{
        config::SdkNetConfig,
        connection::{Connection, ConnectionContext, ConnectionHandle},
        endpoint::PeerEndpoint,
        error::{ConnectReport, NegotiationError, PeerFailure, Result, SdkNetError},
        frame::{Frame, MessageType},
        handshake::{HandshakeAction, HandshakeEvent, HandshakeNegotiator, Reply},
        protocol::{HandshakeCodec, NegotiatedProtocol},
        tls::{CryptoSuite, SecureContext},
    },
    bytes::Bytes,
    dashmap::DashSet,
    futures::future::join_all,
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    tokio::{net::TcpStream, task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
};

pub struct ConnectionSupervisor {
    config: Arc<SdkNetConfig>,
    secure: SecureContext,
    ctx: ConnectionContext,
    codec: Arc<dyn HandshakeCodec>,
    /// Peers a reconnect pass is currently dialing.
    in_flight: DashSet<PeerEndpoint>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: Arc<SdkNetConfig>,
        secure: SecureContext,
        ctx: ConnectionContext,
        codec: Arc<dyn HandshakeCodec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            secure,
            ctx,
            codec,
            in_flight: DashSet::new(),
            reconnect_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn suite(&self) -> CryptoSuite {
        self.secure.suite()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Connect every configured peer concurrently.
    ///
    /// Waits for each peer's outcome. Fails with
    /// [`SdkNetError::StartFailed`] only if no peer was registered; the
    /// report lists every peer's failure either way.
    pub async fn start_connect(&self) -> Result<ConnectReport> {
        let peers = self.ctx.registry.configured();
        info!(
            "connecting to {} peer(s) under the {} suite",
            peers.len(),
            self.suite()
        );
        let outcomes = join_all(peers.iter().map(|peer| self.connect_peer(peer.clone()))).await;

        let mut report = ConnectReport::new(self.suite());
        for (peer, outcome) in peers.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.connected.push(peer.clone()),
                Err(e) => {
                    warn!("failed to connect to {}: {}", peer, e);
                    report.failures.push(PeerFailure::from_error(peer.clone(), e));
                }
            }
        }

        if report.connected.is_empty() {
            Err(SdkNetError::StartFailed(report))
        } else {
            Ok(report)
        }
    }

    /// Run the full pipeline for one peer and register it.
    pub async fn connect_peer(&self, endpoint: PeerEndpoint) -> Result<()> {
        if self.is_stopped() {
            return Err(SdkNetError::Stopped);
        }
        let stats = &self.ctx.stats;
        stats.connect_attempts.inc();

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                stats.connect_failures.inc();
                return Err(SdkNetError::TransportConnectFailed {
                    endpoint,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                stats.connect_failures.inc();
                return Err(SdkNetError::TransportConnectFailed {
                    endpoint,
                    reason: format!("timed out after {}ms", self.config.connect_timeout_ms),
                });
            }
        };
        let _ = stream.set_nodelay(true);

        let tls = self
            .secure
            .handshake(&endpoint, stream)
            .await
            .inspect_err(|_| stats.secure_handshake_failures.inc())?;

        let connection = Connection::spawn(endpoint.clone(), tls, &self.ctx, &self.shutdown);
        let (mut negotiator, protocol) = match self.negotiate(&connection).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                match &e {
                    SdkNetError::SecureHandshakeFailed { .. } => {
                        stats.secure_handshake_failures.inc()
                    }
                    _ => stats.negotiation_failures.inc(),
                }
                connection.close(format!("handshake failed: {e}"));
                return Err(e);
            }
        };

        let version = protocol.version();
        self.publish(connection, protocol)?;
        info!(
            "connected to {} ({}), protocol {}",
            endpoint,
            self.suite(),
            version
        );
        negotiator
            .handle(HandshakeEvent::Registered)
            .map_err(|e| negotiation_failed(&endpoint, e))?;
        Ok(())
    }

    /// Register a negotiated connection, unless the network stopped, the
    /// peer was removed from the configured set, or the connection closed
    /// while negotiating.
    ///
    /// The checks run again after registering: a removal or a close that
    /// landed in between found no handle to evict, so the handle is taken
    /// back out here.
    pub(crate) fn publish(
        &self,
        connection: Arc<Connection>,
        protocol: NegotiatedProtocol,
    ) -> Result<()> {
        if let Err(e) = self.check_publishable(&connection) {
            connection.close(e.to_string());
            return Err(e);
        }
        let registry = &self.ctx.registry;
        let (endpoint, id) = (connection.endpoint().clone(), connection.id());
        registry.register(ConnectionHandle::new(Arc::clone(&connection), protocol));
        if let Err(e) = self.check_publishable(&connection) {
            connection.close(e.to_string());
            registry.unregister(&endpoint, id);
            return Err(e);
        }
        Ok(())
    }

    fn check_publishable(&self, connection: &Connection) -> Result<()> {
        let endpoint = connection.endpoint();
        if self.shutdown.is_cancelled() {
            return Err(SdkNetError::Stopped);
        }
        if !self.ctx.registry.is_configured(endpoint) {
            return Err(SdkNetError::ConnectionLost {
                endpoint: endpoint.clone(),
                reason: "removed from configured peers".to_string(),
            });
        }
        if !connection.is_active() {
            return Err(SdkNetError::ConnectionLost {
                endpoint: endpoint.clone(),
                reason: connection
                    .close_reason()
                    .unwrap_or_else(|| "closed during negotiation".to_string()),
            });
        }
        Ok(())
    }

    /// Drive the handshake state machine over a live connection.
    pub(crate) async fn negotiate(
        &self,
        connection: &Connection,
    ) -> Result<(HandshakeNegotiator, NegotiatedProtocol)> {
        let endpoint = connection.endpoint();
        let mut negotiator = HandshakeNegotiator::new(Arc::clone(&self.codec));
        let mut action = negotiator
            .handle(HandshakeEvent::Start)
            .map_err(|e| negotiation_failed(endpoint, e))?;
        loop {
            let event = match action {
                HandshakeAction::SendVersionProbe(payload) => HandshakeEvent::VersionResponse(
                    self.exchange(connection, MessageType::RpcRequest, payload)
                        .await?,
                ),
                HandshakeAction::SendProtocolHandshake(payload) => {
                    HandshakeEvent::ProtocolResponse(
                        self.exchange(connection, MessageType::ClientHandshake, payload)
                            .await?,
                    )
                }
                HandshakeAction::Register(protocol) => return Ok((negotiator, protocol)),
                HandshakeAction::Done => {
                    return Err(negotiation_failed(
                        endpoint,
                        NegotiationError::UnexpectedEvent {
                            state: negotiator.state().name(),
                            event: "Done",
                        },
                    ))
                }
            };
            action = negotiator
                .handle(event)
                .map_err(|e| negotiation_failed(endpoint, e))?;
        }
    }

    async fn exchange(
        &self,
        connection: &Connection,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<Reply> {
        let request = Frame::new(message_type, payload);
        match connection
            .request_async(request, self.config.handshake_timeout())
            .await
        {
            Ok(frame) => Ok(Reply::Frame(frame)),
            Err(SdkNetError::RequestTimedOut { .. }) => {
                warn!(
                    "{:?} to {} got no reply within {}ms",
                    message_type,
                    connection.endpoint(),
                    self.config.handshake_timeout_ms
                );
                Ok(Reply::TimedOut)
            }
            // With TLS 1.3 the node rejects our certificate after the
            // handshake has completed on our side.
            Err(e) => Err(match connection.tls_failure() {
                Some((kind, detail)) => SdkNetError::SecureHandshakeFailed {
                    endpoint: connection.endpoint().clone(),
                    kind: *kind,
                    detail: detail.clone(),
                },
                None => SdkNetError::ProtocolNegotiationFailed {
                    endpoint: connection.endpoint().clone(),
                    reason: e.to_string(),
                },
            }),
        }
    }

    /// Redial every configured peer without a live handle.
    ///
    /// Returns how many peers were brought back.
    pub async fn reconnect(&self) -> usize {
        if self.is_stopped() {
            return 0;
        }
        let registry = &self.ctx.registry;
        let dead: Vec<PeerEndpoint> = registry
            .configured()
            .iter()
            .filter(|peer| !registry.is_alive(peer))
            .filter(|peer| self.in_flight.insert((*peer).clone()))
            .cloned()
            .collect();
        if dead.is_empty() {
            return 0;
        }

        debug!("reconnect pass over {} dead peer(s)", dead.len());
        let outcomes = join_all(dead.iter().map(|peer| self.connect_peer(peer.clone()))).await;
        let mut reconnected = 0usize;
        for (peer, outcome) in dead.iter().zip(outcomes) {
            self.in_flight.remove(peer);
            match outcome {
                Ok(()) => {
                    self.ctx.stats.reconnects.inc();
                    reconnected = reconnected.saturating_add(1);
                }
                Err(e) => debug!("reconnect to {} failed: {}", peer, e),
            }
        }
        reconnected
    }

    /// Start the periodic reconnect pass.
    pub fn spawn_reconnect_task(self: &Arc<Self>) {
        let supervisor = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.reconnect_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                supervisor.reconnect().await;
            }
        });
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Cancel the reconnect pass, then close every connection. Idempotent.
    ///
    /// Requests pending on registered connections are completed with
    /// [`SdkNetError::ConnectionLost`] before this returns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        for handle in self.ctx.registry.drain() {
            handle.close("network stopped");
            self.ctx
                .correlator
                .flush_connection(handle.id(), handle.endpoint(), "network stopped");
        }
        self.shutdown.cancel();
        info!("{} supervisor stopped", self.suite());
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn negotiation_failed(endpoint: &PeerEndpoint, error: NegotiationError) -> SdkNetError {
    SdkNetError::ProtocolNegotiationFailed {
        endpoint: endpoint.clone(),
        reason: error.to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            connection::test_support::{answer, context},
            frame::{FrameCodec, FrameErrorCode},
            peer_registry::{PeerObserver, PeerRegistry},
            protocol::{JsonHandshakeCodec, ProtocolVersion},
        },
        assert_matches::assert_matches,
        futures::{SinkExt, StreamExt},
        std::{path::Path, time::Duration},
        tokio_util::codec::Framed,
    };

    const VERSION_REPLY: &str =
        r#"{"jsonrpc":"2.0","id":1,"result":{"Supported Version":"2.7.0"}}"#;

    fn supervisor(peers: Vec<PeerEndpoint>) -> Arc<ConnectionSupervisor> {
        let config = SdkNetConfig {
            cert_dir: Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ecdsa"),
            ..SdkNetConfig::dev_default()
        };
        let secure = SecureContext::build(
            &config.suite_material(CryptoSuite::Ecdsa),
            config.handshake_timeout(),
        )
        .unwrap();
        let ctx = ConnectionContext {
            registry: Arc::new(PeerRegistry::new(peers)),
            ..context(config.idle_timeout())
        };
        ConnectionSupervisor::new(
            Arc::new(config),
            secure,
            ctx,
            Arc::new(JsonHandshakeCodec::new("test")),
        )
    }

    fn pipe(
        supervisor: &ConnectionSupervisor,
    ) -> (Arc<Connection>, Framed<tokio::io::DuplexStream, FrameCodec>) {
        let (client, node) = tokio::io::duplex(64 * 1024);
        let connection = Connection::spawn(
            "127.0.0.1:20200".parse().unwrap(),
            client,
            &supervisor.ctx,
            &supervisor.shutdown,
        );
        (connection, Framed::new(node, supervisor.ctx.codec))
    }

    #[tokio::test]
    async fn test_negotiate_with_negotiating_node() {
        let supervisor = supervisor(Vec::new());
        let (connection, mut node) = pipe(&supervisor);

        let node_side = async {
            answer(&mut node, VERSION_REPLY).await;
            let handshake = node.next().await.unwrap().unwrap();
            assert_eq!(handshake.message_type, MessageType::ClientHandshake);
            node.send(handshake.response_to(
                FrameErrorCode::Success,
                &br#"{"protocol":2,"nodeID":"n1"}"#[..],
            ))
            .await
            .unwrap();
        };
        let (negotiated, ()) = tokio::join!(supervisor.negotiate(&connection), node_side);
        let (negotiator, protocol) = negotiated.unwrap();
        assert_eq!(protocol.version(), ProtocolVersion::Negotiated(2));
        assert_eq!(protocol.node_id(), Some("n1"));
        assert_eq!(negotiator.state().name(), "CapabilityNegotiated");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_probe_falls_back_to_v1() {
        let supervisor = supervisor(Vec::new());
        let (connection, mut node) = pipe(&supervisor);

        let node_side = async {
            let probe = node.next().await.unwrap().unwrap();
            assert_eq!(probe.message_type, MessageType::RpcRequest);
            node
        };
        let (negotiated, _node) = tokio::join!(supervisor.negotiate(&connection), node_side);
        let (_, protocol) = negotiated.unwrap();
        assert_eq!(protocol.version(), ProtocolVersion::V1);
        assert!(connection.is_active());
    }

    #[derive(Default)]
    struct Announced(Mutex<Vec<PeerEndpoint>>);

    impl PeerObserver for Announced {
        fn on_peer_available(&self, endpoint: &PeerEndpoint, _protocol: &NegotiatedProtocol) {
            self.0.lock().push(endpoint.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_removed_during_negotiation_is_not_registered() {
        let endpoint: PeerEndpoint = "127.0.0.1:20200".parse().unwrap();
        let supervisor = supervisor(vec![endpoint.clone()]);
        let (connection, mut node) = pipe(&supervisor);

        let node_side = async {
            node.next().await.unwrap().unwrap();
            assert!(supervisor.ctx.registry.remove_configured(&endpoint));
            node
        };
        let (negotiated, _node) = tokio::join!(supervisor.negotiate(&connection), node_side);
        let (_, protocol) = negotiated.unwrap();

        assert_matches!(
            supervisor.publish(Arc::clone(&connection), protocol),
            Err(SdkNetError::ConnectionLost { reason, .. }) if reason.contains("removed")
        );
        assert!(supervisor.ctx.registry.get(&endpoint).is_none());
        assert!(!connection.is_active());
    }

    #[tokio::test]
    async fn test_connection_closed_before_registration_is_not_published() {
        let endpoint: PeerEndpoint = "127.0.0.1:20200".parse().unwrap();
        let supervisor = supervisor(vec![endpoint.clone()]);
        let announced = Arc::new(Announced::default());
        supervisor.ctx.registry.add_observer(announced.clone());
        let (connection, node) = pipe(&supervisor);

        drop(node);
        for _ in 0..100 {
            if !connection.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!connection.is_active());

        assert_matches!(
            supervisor.publish(
                Arc::clone(&connection),
                NegotiatedProtocol::default_protocol("2.0.0")
            ),
            Err(SdkNetError::ConnectionLost { reason, .. }) if reason == "closed by peer"
        );
        assert!(supervisor.ctx.registry.get(&endpoint).is_none());
        assert!(announced.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_registers_live_configured_peer() {
        let endpoint: PeerEndpoint = "127.0.0.1:20200".parse().unwrap();
        let supervisor = supervisor(vec![endpoint.clone()]);
        let announced = Arc::new(Announced::default());
        supervisor.ctx.registry.add_observer(announced.clone());
        let (connection, _node) = pipe(&supervisor);

        supervisor
            .publish(
                Arc::clone(&connection),
                NegotiatedProtocol::default_protocol("2.0.0"),
            )
            .unwrap();
        assert_eq!(
            supervisor.ctx.registry.get(&endpoint).unwrap().id(),
            connection.id()
        );
        assert_eq!(announced.0.lock().as_slice(), &[endpoint]);
    }

    #[tokio::test]
    async fn test_rejected_probe_fails_negotiation() {
        let supervisor = supervisor(Vec::new());
        let (connection, mut node) = pipe(&supervisor);

        let node_side = async {
            let probe = node.next().await.unwrap().unwrap();
            node.send(probe.response_to(FrameErrorCode::RequestRejected, Bytes::new()))
                .await
                .unwrap();
        };
        let (negotiated, ()) = tokio::join!(supervisor.negotiate(&connection), node_side);
        assert_matches!(
            negotiated,
            Err(SdkNetError::ProtocolNegotiationFailed { reason, .. }) if reason.contains("rejected")
        );
    }

    #[tokio::test]
    async fn test_refused_port_is_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = PeerEndpoint::new("127.0.0.1", port);
        let supervisor = supervisor(vec![endpoint.clone()]);

        let err = supervisor.start_connect().await.unwrap_err();
        let SdkNetError::StartFailed(report) = &err else {
            panic!("expected StartFailed, got {err}");
        };
        assert!(report.connected.is_empty());
        assert_matches!(
            report.failure_for(&endpoint),
            Some(crate::error::PeerFailureReason::TransportConnect(_))
        );
        assert!(!report.has_secure_handshake_failure());
        let stats = supervisor.ctx.stats.snapshot();
        assert_eq!(stats.connect_attempts, 1);
        assert_eq!(stats.connect_failures, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_blocks_dialing() {
        let supervisor = supervisor(vec!["127.0.0.1:1".parse().unwrap()]);
        supervisor.spawn_reconnect_task();
        supervisor.stop();
        supervisor.stop();
        assert!(supervisor.is_stopped());
        assert_eq!(supervisor.reconnect().await, 0);
        assert_matches!(
            supervisor.connect_peer("127.0.0.1:1".parse().unwrap()).await,
            Err(SdkNetError::Stopped)
        );
    }
}
