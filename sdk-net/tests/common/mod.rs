#![allow(dead_code)]

use {
    futures::{SinkExt, StreamExt},
    parking_lot::Mutex,
    rustls::{
        pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
        server::WebPkiClientVerifier,
        RootCertStore, ServerConfig,
    },
    std::{
        net::TcpListener as StdTcpListener,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
    tempfile::TempDir,
    tokio::{net::TcpListener, runtime::Runtime, sync::mpsc},
    tokio_rustls::TlsAcceptor,
    tokio_util::codec::Framed,
    trv1_sdk_net::{
        frame::FrameCodec, tls::crypto_provider, Frame, FrameErrorCode, MessageType,
        PeerEndpoint, SdkNetConfig,
    },
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Which certificate family a mock node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSuite {
    Ecdsa,
    Sm,
}

impl NodeSuite {
    fn files(self) -> (PathBuf, PathBuf, PathBuf) {
        let dir = fixtures();
        match self {
            Self::Ecdsa => (
                dir.join("ecdsa/ca.crt"),
                dir.join("ecdsa/node.crt"),
                dir.join("ecdsa/node.key"),
            ),
            Self::Sm => (
                dir.join("sm/sm_ca.crt"),
                dir.join("sm/sm_node.crt"),
                dir.join("sm/sm_node.key"),
            ),
        }
    }
}

/// Build an SDK certificate directory from `(fixture, name)` pairs.
pub fn cert_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (fixture, name) in files {
        std::fs::copy(fixtures().join(fixture), dir.path().join(name)).unwrap();
    }
    dir
}

pub const ECDSA_BUNDLE: [(&str, &str); 3] = [
    ("ecdsa/ca.crt", "ca.crt"),
    ("ecdsa/sdk.crt", "sdk.crt"),
    ("ecdsa/sdk.key", "sdk.key"),
];

pub const SM_BUNDLE: [(&str, &str); 3] = [
    ("sm/sm_ca.crt", "sm_ca.crt"),
    ("sm/sm_sdk.crt", "sm_sdk.crt"),
    ("sm/sm_sdk.key", "sm_sdk.key"),
];

/// Both bundles, as a normally provisioned SDK would have them.
pub fn both_bundles() -> TempDir {
    let files: Vec<(&str, &str)> = ECDSA_BUNDLE.iter().chain(SM_BUNDLE.iter()).copied().collect();
    cert_dir(&files)
}

pub fn sdk_config(dir: &TempDir, peers: &[&PeerEndpoint]) -> SdkNetConfig {
    SdkNetConfig {
        peers: peers.iter().map(|p| p.to_string()).collect(),
        cert_dir: dir.path().to_path_buf(),
        ..SdkNetConfig::dev_default()
    }
}

/// A port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn local(port: u16) -> PeerEndpoint {
    PeerEndpoint::new("127.0.0.1", port)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// How a mock node answers.
#[derive(Debug, Clone)]
pub struct NodeBehavior {
    pub suite: NodeSuite,
    /// `None`: never answer the capability probe.
    pub supported_version: Option<String>,
    /// Error code to reject the capability probe with.
    pub probe_error: Option<FrameErrorCode>,
    pub protocol: u32,
    pub node_id: String,
    /// Echo RPC requests back.
    pub answer_requests: bool,
}

impl NodeBehavior {
    pub fn negotiating(suite: NodeSuite) -> Self {
        Self {
            suite,
            supported_version: Some("2.7.0".to_string()),
            probe_error: None,
            protocol: 2,
            node_id: "node-0".to_string(),
            answer_requests: true,
        }
    }

    fn reply_to(&self, frame: &Frame) -> Option<Frame> {
        match frame.message_type {
            MessageType::RpcRequest if is_version_probe(frame) => {
                if let Some(code) = self.probe_error {
                    return Some(frame.response_to(code, Vec::new()));
                }
                let version = self.supported_version.as_ref()?;
                let body = format!(
                    r#"{{"jsonrpc":"2.0","id":1,"result":{{"Supported Version":"{version}"}}}}"#
                );
                Some(frame.response_to(FrameErrorCode::Success, body.into_bytes()))
            }
            MessageType::RpcRequest if self.answer_requests => {
                Some(frame.response_to(FrameErrorCode::Success, frame.payload.clone()))
            }
            MessageType::ClientHandshake => {
                let body = format!(r#"{{"protocol":{},"nodeID":"{}"}}"#, self.protocol, self.node_id);
                Some(frame.response_to(FrameErrorCode::Success, body.into_bytes()))
            }
            MessageType::Heartbeat => {
                Some(frame.response_to(FrameErrorCode::Success, frame.payload.clone()))
            }
            _ => None,
        }
    }
}

fn is_version_probe(frame: &Frame) -> bool {
    std::str::from_utf8(&frame.payload).is_ok_and(|text| text.contains("getClientVersion"))
}

#[derive(Default)]
struct NodeState {
    accepted: AtomicUsize,
    received: Mutex<Vec<Frame>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
}

/// A TLS node speaking the frame protocol, on its own runtime.
pub struct MockNode {
    pub endpoint: PeerEndpoint,
    runtime: Option<Runtime>,
    state: Arc<NodeState>,
}

impl MockNode {
    pub fn start(behavior: NodeBehavior) -> Self {
        Self::start_on(0, behavior)
    }

    /// Start on `port`; `0` picks a free one.
    pub fn start_on(port: u16, behavior: NodeBehavior) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime
            .block_on(TcpListener::bind(("127.0.0.1", port)))
            .unwrap();
        let endpoint = local(listener.local_addr().unwrap().port());
        let acceptor = acceptor(behavior.suite);
        let state = Arc::new(NodeState::default());
        runtime.spawn(serve(
            listener,
            acceptor,
            Arc::new(behavior),
            Arc::clone(&state),
        ));
        Self {
            endpoint,
            runtime: Some(runtime),
            state,
        }
    }

    /// Number of TLS sessions accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::Acquire)
    }

    pub fn received(&self) -> Vec<Frame> {
        self.state.received.lock().clone()
    }

    pub fn received_of(&self, message_type: MessageType) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|f| f.message_type == message_type)
            .collect()
    }

    /// Push `frame` to every connected client.
    pub fn push(&self, frame: Frame) {
        for client in self.state.clients.lock().iter() {
            let _ = client.send(frame.clone());
        }
    }

    /// Kill the node and every session it holds.
    pub fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acceptor(suite: NodeSuite) -> TlsAcceptor {
    let (ca, cert, key) = suite.files();
    let mut roots = RootCertStore::empty();
    for ca in CertificateDer::pem_file_iter(&ca).unwrap() {
        roots.add(ca.unwrap()).unwrap();
    }
    let provider = crypto_provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .unwrap();
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&cert)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    let key = PrivateKeyDer::from_pem_file(&key).unwrap();
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    behavior: Arc<NodeBehavior>,
    state: Arc<NodeState>,
) {
    while let Ok((tcp, _)) = listener.accept().await {
        tokio::spawn(serve_session(
            tcp,
            acceptor.clone(),
            Arc::clone(&behavior),
            Arc::clone(&state),
        ));
    }
}

async fn serve_session(
    tcp: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    behavior: Arc<NodeBehavior>,
    state: Arc<NodeState>,
) {
    let Ok(tls) = acceptor.accept(tcp).await else {
        return;
    };
    state.accepted.fetch_add(1, Ordering::AcqRel);
    let (mut sink, mut stream) = Framed::new(tls, FrameCodec::new(1 << 20)).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    state.clients.lock().push(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });
    while let Some(Ok(frame)) = stream.next().await {
        state.received.lock().push(frame.clone());
        if let Some(reply) = behavior.reply_to(&frame) {
            let _ = tx.send(reply);
        }
    }
    writer.abort();
}
