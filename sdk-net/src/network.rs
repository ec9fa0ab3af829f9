//! The network façade handed to upstream RPC callers.
//!
//! A [`Network`] owns the I/O runtime and everything shared by its
//! connections (peer registry, response correlator, dispatcher, counters).
//! [`start`](Network::start) picks the crypto suite:
//!
//! 1. ECDSA first (unless a suite is pinned in the config).
//! 2. If the ECDSA files are missing, go straight to SM without dialing.
//! 3. If ECDSA dialing fails and at least one peer failed the TLS
//!    handshake, discard the ECDSA supervisor and retry once under SM.
//! 4. If every ECDSA failure is a plain connect or negotiation failure,
//!    report it as is; a different suite cannot fix an unreachable node.
//!
//! Blocking methods (`start`, `send_request_sync`, `reconnect_now`) must not
//! be called from inside an async context.

use {
    crate::{
        config::SdkNetConfig,
        connection::ConnectionContext,
        correlator::ResponseCorrelator,
        dispatch::{Dispatcher, MessageHandler},
        endpoint::PeerEndpoint,
        error::{ConnectReport, Result, SdkNetError, SuiteAttempt},
        frame::{Frame, FrameCodec, MessageType, SequenceId},
        peer_registry::{PeerObserver, PeerRegistry},
        protocol::{HandshakeCodec, JsonHandshakeCodec, NegotiatedProtocol},
        stats::{NetworkStats, StatsSnapshot},
        supervisor::ConnectionSupervisor,
        tls::{CryptoSuite, SecureContext},
    },
    log::{info, warn},
    parking_lot::Mutex,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::runtime::{Builder, Handle, Runtime},
};

/// Extra time a synchronous caller waits beyond the request timeout for the
/// timeout callback itself to arrive.
const SYNC_WAIT_GRACE: Duration = Duration::from_millis(500);

pub struct Network {
    config: Arc<SdkNetConfig>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    registry: Arc<PeerRegistry>,
    correlator: ResponseCorrelator,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<NetworkStats>,
    codec: Arc<dyn HandshakeCodec>,
    supervisor: Mutex<Option<Arc<ConnectionSupervisor>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").finish_non_exhaustive()
    }
}

impl Network {
    /// Validate `config` and set up the I/O runtime. Nothing is dialed yet.
    pub fn new(config: SdkNetConfig) -> Result<Self> {
        let codec = Arc::new(JsonHandshakeCodec::new(config.client_type.clone()));
        Self::with_codec(config, codec)
    }

    /// Like [`new`](Self::new), with a custom handshake payload codec.
    pub fn with_codec(config: SdkNetConfig, codec: Arc<dyn HandshakeCodec>) -> Result<Self> {
        config.validate()?;
        let peers = config.peer_endpoints()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("trv1SdkNetIo")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let stats = Arc::new(NetworkStats::new());
        let correlator = ResponseCorrelator::new(Arc::clone(&stats));
        Ok(Self {
            config: Arc::new(config),
            runtime: Mutex::new(Some(runtime)),
            handle,
            registry: Arc::new(PeerRegistry::new(peers)),
            dispatcher: Arc::new(Dispatcher::new(correlator.clone())),
            correlator,
            stats,
            codec,
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SdkNetConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SdkNetError::Stopped);
        }
        Ok(())
    }

    fn current_supervisor(&self) -> Option<Arc<ConnectionSupervisor>> {
        self.supervisor.lock().clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Connect the configured peers, falling back between crypto suites,
    /// and start the reconnect pass.
    ///
    /// Blocks until every peer has connected or failed under the chosen
    /// suite. Succeeds if at least one peer is registered.
    pub fn start(&self) -> Result<ConnectReport> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SdkNetError::AlreadyStarted);
        }
        match self.handle.block_on(self.start_with_fallback()) {
            Ok((supervisor, report)) => {
                {
                    let _guard = self.handle.enter();
                    supervisor.spawn_reconnect_task();
                }
                *self.supervisor.lock() = Some(supervisor);
                info!("network started: {}", report);
                Ok(report)
            }
            Err(e) => {
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn start_with_fallback(&self) -> Result<(Arc<ConnectionSupervisor>, ConnectReport)> {
        let pinned = self.config.crypto_suite.is_some();
        let mut next = Some(self.config.crypto_suite.unwrap_or(CryptoSuite::Ecdsa));
        let mut attempts: Vec<SuiteAttempt> = Vec::new();

        while let Some(suite) = next {
            let error = match self.start_suite(suite).await {
                Ok(started) => return Ok(started),
                Err(error) => error,
            };
            if pinned || !should_fall_back(&error) {
                if attempts.is_empty() {
                    return Err(error);
                }
                attempts.push(SuiteAttempt { suite, error });
                break;
            }
            next = suite.fallback();
            match next {
                Some(fallback) => warn!("{suite} suite unusable, trying {fallback}: {error}"),
                None => warn!("{suite} suite unusable: {error}"),
            }
            attempts.push(SuiteAttempt { suite, error });
        }
        Err(SdkNetError::AllSuitesFailed(attempts))
    }

    async fn start_suite(
        &self,
        suite: CryptoSuite,
    ) -> Result<(Arc<ConnectionSupervisor>, ConnectReport)> {
        let material = self.config.suite_material(suite);
        let secure = SecureContext::build(&material, self.config.handshake_timeout())?;
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&self.config),
            secure,
            self.connection_context(),
            Arc::clone(&self.codec),
        );
        match supervisor.start_connect().await {
            Ok(report) => Ok((supervisor, report)),
            Err(e) => {
                supervisor.stop();
                Err(e)
            }
        }
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            correlator: self.correlator.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            codec: FrameCodec::new(self.config.max_frame_size),
            idle_timeout: self.config.idle_timeout(),
            heartbeat_timeout: self.config.request_timeout(),
        }
    }

    /// Stop reconnecting, close every connection and release the I/O
    /// runtime. Idempotent; a stopped network cannot be started again.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.stop();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("network stopped");
    }

    /// Run one reconnect pass now. Returns how many peers came back.
    pub fn reconnect_now(&self) -> Result<usize> {
        self.ensure_running()?;
        let Some(supervisor) = self.current_supervisor() else {
            return Ok(0);
        };
        Ok(self.handle.block_on(supervisor.reconnect()))
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Send `frame` to every connected peer; one result per peer.
    pub fn broadcast(&self, frame: Frame) -> Result<Vec<(PeerEndpoint, Result<()>)>> {
        self.ensure_running()?;
        Ok(self.registry.broadcast(&frame))
    }

    /// Send `frame` to `endpoint` without awaiting a response.
    pub fn send_to_peer(&self, endpoint: &PeerEndpoint, frame: Frame) -> Result<()> {
        self.ensure_running()?;
        self.registry.send_to_peer(endpoint, frame)
    }

    /// Send a request and complete `callback` with the response, a timeout
    /// or a connection loss.
    ///
    /// Fails immediately with [`SdkNetError::PeerNotAvailable`] if
    /// `endpoint` has no live connection; `callback` is then not called.
    pub fn send_request<F>(
        &self,
        endpoint: &PeerEndpoint,
        frame: Frame,
        timeout: Duration,
        callback: F,
    ) -> Result<SequenceId>
    where
        F: FnOnce(Result<Frame>) + Send + 'static,
    {
        self.ensure_running()?;
        let handle = self
            .registry
            .get(endpoint)
            .filter(|handle| handle.is_active())
            .ok_or_else(|| SdkNetError::PeerNotAvailable(endpoint.clone()))?;
        let frame = with_sequence(frame);
        let seq = frame.seq;
        let _guard = self.handle.enter();
        handle.request(frame, timeout, Box::new(callback));
        Ok(seq)
    }

    /// Send a request and wait for its outcome.
    pub fn send_request_sync(
        &self,
        endpoint: &PeerEndpoint,
        frame: Frame,
        timeout: Duration,
    ) -> Result<Frame> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let seq = self.send_request(endpoint, frame, timeout, move |result| {
            let _ = sender.send(result);
        })?;
        receiver
            .recv_timeout(timeout.saturating_add(SYNC_WAIT_GRACE))
            .unwrap_or_else(|_| {
                Err(SdkNetError::RequestTimedOut {
                    seq,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            })
    }

    // ── Peer administration ─────────────────────────────────────────────

    /// Add a peer to the configured set. The next reconnect pass dials it.
    pub fn add_peer(&self, endpoint: PeerEndpoint) -> Result<bool> {
        self.ensure_running()?;
        Ok(self.registry.add_configured(endpoint))
    }

    /// Stop dialing `endpoint` and close its connection, if any.
    ///
    /// Returns whether the peer was configured.
    pub fn remove_connection(&self, endpoint: &PeerEndpoint) -> bool {
        let configured = self.registry.remove_configured(endpoint);
        if let Some(handle) = self.registry.remove(endpoint) {
            handle.close("removed from configured peers");
        }
        if configured {
            info!("removed peer {}", endpoint);
        }
        configured
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.registry.add_observer(observer);
    }

    /// Route unsolicited frames of `message_type` to `handler`.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.dispatcher.register_handler(message_type, handler);
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Peers with a live, negotiated connection.
    pub fn available_peers(&self) -> Vec<PeerEndpoint> {
        self.registry.available()
    }

    pub fn negotiated_protocol(&self, endpoint: &PeerEndpoint) -> Option<NegotiatedProtocol> {
        self.registry
            .get(endpoint)
            .map(|handle| handle.protocol().clone())
    }

    pub fn configured_peers(&self) -> Vec<PeerEndpoint> {
        self.registry.configured().to_vec()
    }

    /// Suite the running supervisor was built for.
    pub fn active_suite(&self) -> Option<CryptoSuite> {
        self.current_supervisor().map(|s| s.suite())
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_report(&self) -> String {
        self.stats.to_string()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether a failed suite attempt warrants trying the fallback suite.
pub(crate) fn should_fall_back(error: &SdkNetError) -> bool {
    match error {
        SdkNetError::MissingCertificates { .. } | SdkNetError::InvalidCertificate { .. } => true,
        SdkNetError::StartFailed(report) => report.has_secure_handshake_failure(),
        _ => false,
    }
}

fn with_sequence(frame: Frame) -> Frame {
    if frame.seq.is_zero() {
        Frame {
            seq: SequenceId::generate(),
            ..frame
        }
    } else {
        frame
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::error::{HandshakeFailureKind, PeerFailure, PeerFailureReason},
        assert_matches::assert_matches,
        std::path::PathBuf,
    };

    fn endpoint() -> PeerEndpoint {
        "10.0.0.1:20200".parse().unwrap()
    }

    fn report_with(reason: PeerFailureReason) -> ConnectReport {
        let mut report = ConnectReport::new(CryptoSuite::Ecdsa);
        report.failures.push(PeerFailure {
            endpoint: endpoint(),
            reason,
        });
        report
    }

    #[test]
    fn test_should_fall_back() {
        assert!(should_fall_back(&SdkNetError::MissingCertificates {
            suite: CryptoSuite::Ecdsa,
            files: vec![PathBuf::from("conf/ca.crt")],
        }));
        assert!(should_fall_back(&SdkNetError::StartFailed(report_with(
            PeerFailureReason::SecureHandshake {
                kind: HandshakeFailureKind::CertificateMismatch,
                detail: "unknown issuer".to_string(),
            }
        ))));
        assert!(!should_fall_back(&SdkNetError::StartFailed(report_with(
            PeerFailureReason::TransportConnect("connection refused".to_string())
        ))));
        assert!(!should_fall_back(&SdkNetError::StartFailed(report_with(
            PeerFailureReason::Negotiation("rejected".to_string())
        ))));
        assert!(!should_fall_back(&SdkNetError::InvalidConfig("x".to_string())));
    }

    #[test]
    fn test_with_sequence_keeps_caller_seq() {
        let unsolicited = Frame::unsolicited(MessageType::RpcRequest, &b"q"[..]);
        assert!(!with_sequence(unsolicited).seq.is_zero());

        let request = Frame::new(MessageType::RpcRequest, &b"q"[..]);
        assert_eq!(with_sequence(request.clone()).seq, request.seq);
    }

    #[test]
    fn test_missing_certificates_for_both_suites() {
        let dir = tempfile::tempdir().unwrap();
        let network = Network::new(SdkNetConfig {
            peers: vec!["127.0.0.1:20200".to_string()],
            cert_dir: dir.path().to_path_buf(),
            ..SdkNetConfig::dev_default()
        })
        .unwrap();

        let err = network.start().unwrap_err();
        let SdkNetError::AllSuitesFailed(attempts) = &err else {
            panic!("expected AllSuitesFailed, got {err}");
        };
        assert_eq!(attempts.len(), 2);
        assert_matches!(
            attempts[0].error,
            SdkNetError::MissingCertificates { suite: CryptoSuite::Ecdsa, .. }
        );
        assert_matches!(
            attempts[1].error,
            SdkNetError::MissingCertificates { suite: CryptoSuite::Sm, .. }
        );
        let text = err.to_string();
        assert!(text.contains("ca.crt") && text.contains("sm_sdk.key"));
        assert_eq!(network.stats().connect_attempts, 0);

        // A failed start can be retried.
        assert_matches!(network.start(), Err(SdkNetError::AllSuitesFailed(_)));
    }

    #[test]
    fn test_pinned_suite_does_not_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let network = Network::new(SdkNetConfig {
            peers: vec!["127.0.0.1:20200".to_string()],
            cert_dir: dir.path().to_path_buf(),
            crypto_suite: Some(CryptoSuite::Sm),
            ..SdkNetConfig::dev_default()
        })
        .unwrap();
        assert_matches!(
            network.start(),
            Err(SdkNetError::MissingCertificates { suite: CryptoSuite::Sm, .. })
        );
    }

    #[test]
    fn test_stopped_network_rejects_use() {
        let network = Network::new(SdkNetConfig {
            peers: vec!["127.0.0.1:20200".to_string()],
            ..SdkNetConfig::dev_default()
        })
        .unwrap();
        network.stop();
        network.stop();
        assert_matches!(network.start(), Err(SdkNetError::Stopped));
        assert_matches!(
            network.send_to_peer(&endpoint(), Frame::new(MessageType::RpcRequest, &b"q"[..])),
            Err(SdkNetError::Stopped)
        );
        assert_matches!(network.reconnect_now(), Err(SdkNetError::Stopped));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert_matches!(
            Network::new(SdkNetConfig::dev_default()),
            Err(SdkNetError::InvalidConfig(_))
        );
    }
}
