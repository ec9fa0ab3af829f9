//! Error types for the SDK connection layer.
//!
//! Per-peer failures are collected into a [`ConnectReport`] instead of
//! aborting a bulk connect; the caller only sees
//! [`SdkNetError::StartFailed`] when no peer at all could be brought up.

use {
    crate::{
        endpoint::PeerEndpoint,
        frame::{FrameErrorCode, SequenceId},
        tls::CryptoSuite,
    },
    std::{fmt, path::PathBuf},
    thiserror::Error,
};

/// Why a secure (TLS) handshake with a peer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailureKind {
    /// The peer's certificate did not chain to our trust anchor, or the
    /// peer rejected ours.
    CertificateMismatch,
    /// No common protocol version, cipher suite or signature scheme.
    AlgorithmUnsupported,
    /// The peer closed the connection during the handshake.
    PeerClosed,
    /// The handshake did not finish within the handshake timeout.
    TimedOut,
}

impl fmt::Display for HandshakeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CertificateMismatch => "certificate mismatch",
            Self::AlgorithmUnsupported => "algorithm unsupported",
            Self::PeerClosed => "peer closed",
            Self::TimedOut => "timed out",
        })
    }
}

/// Errors produced while encoding or decoding handshake payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON of the expected shape.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The node answered with a JSON-RPC error object.
    #[error("node returned rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the node.
        message: String,
    },

    /// A required field is absent from the response.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// The node picked a protocol outside the range we offered.
    #[error("protocol {protocol} outside supported range [{min}, {max}]")]
    OutOfRange {
        /// Protocol chosen by the node.
        protocol: u32,
        /// Lowest protocol we offered.
        min: u32,
        /// Highest protocol we offered.
        max: u32,
    },
}

/// Errors raised by the handshake state machine.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The node answered a handshake request with a non-zero error code.
    #[error("{stage} rejected with error code {code}")]
    Rejected {
        /// Which handshake request was rejected.
        stage: &'static str,
        /// Error code carried by the response frame.
        code: FrameErrorCode,
    },

    /// A handshake request other than the capability probe timed out.
    #[error("{stage} timed out")]
    TimedOut {
        /// Which handshake request timed out.
        stage: &'static str,
    },

    /// The handshake payload could not be decoded.
    #[error(transparent)]
    Codec(#[from] ProtocolError),

    /// An event arrived that the current state does not accept.
    #[error("unexpected {event} in state {state}")]
    UnexpectedEvent {
        /// State the negotiator was in.
        state: &'static str,
        /// Event that was fed to it.
        event: &'static str,
    },
}

/// Errors that can occur in the SDK connection layer.
#[derive(Error, Debug)]
pub enum SdkNetError {
    /// TCP connect to the peer failed or timed out.
    #[error("failed to connect to {endpoint}: {reason}")]
    TransportConnectFailed {
        /// Peer being dialed.
        endpoint: PeerEndpoint,
        /// Underlying cause.
        reason: String,
    },

    /// The TLS handshake with the peer failed.
    #[error("secure handshake with {endpoint} failed ({kind}): {detail}")]
    SecureHandshakeFailed {
        /// Peer being dialed.
        endpoint: PeerEndpoint,
        /// Failure category.
        kind: HandshakeFailureKind,
        /// Underlying cause.
        detail: String,
    },

    /// Capability probe or protocol handshake failed on a live connection.
    #[error("protocol negotiation with {endpoint} failed: {reason}")]
    ProtocolNegotiationFailed {
        /// Peer being negotiated with.
        endpoint: PeerEndpoint,
        /// Underlying cause.
        reason: String,
    },

    /// No live connection is registered for the peer.
    #[error("peer not available: {0}")]
    PeerNotAvailable(PeerEndpoint),

    /// No response arrived within the request timeout.
    #[error("request {seq} timed out after {timeout_ms}ms")]
    RequestTimedOut {
        /// Sequence identifier of the request.
        seq: SequenceId,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The connection carrying a request went away.
    #[error("connection to {endpoint} lost: {reason}")]
    ConnectionLost {
        /// Peer the connection belonged to.
        endpoint: PeerEndpoint,
        /// Why the connection closed.
        reason: String,
    },

    /// A request was registered under a sequence identifier already in use.
    #[error("sequence id {0} is already pending")]
    DuplicateSequence(SequenceId),

    /// Required certificate or key files of a crypto suite do not exist.
    #[error("missing {suite} certificate files: {}", display_paths(.files))]
    MissingCertificates {
        /// Suite whose material was looked up.
        suite: CryptoSuite,
        /// Every missing file.
        files: Vec<PathBuf>,
    },

    /// A certificate or key file exists but could not be used.
    #[error("invalid certificate material {}: {reason}", .path.display())]
    InvalidCertificate {
        /// Offending file.
        path: PathBuf,
        /// Parse or validation error.
        reason: String,
    },

    /// A peer address is not of the form `host:port`.
    #[error("invalid peer endpoint {0:?}")]
    InvalidEndpoint(String),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame header is inconsistent.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// No configured peer could be connected under one crypto suite.
    #[error("{0}")]
    StartFailed(ConnectReport),

    /// Every crypto suite was tried and none produced a usable peer.
    #[error("{}", display_attempts(.0))]
    AllSuitesFailed(Vec<SuiteAttempt>),

    /// `start` was called on a network that is already running.
    #[error("network already started")]
    AlreadyStarted,

    /// The network has been stopped and cannot be used any more.
    #[error("network stopped")]
    Stopped,

    /// Transport-level I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdkNetError {
    /// Whether this error is a TLS handshake failure.
    pub fn is_secure_handshake_failure(&self) -> bool {
        match self {
            Self::SecureHandshakeFailed { .. } => true,
            Self::StartFailed(report) => report.has_secure_handshake_failure(),
            _ => false,
        }
    }
}

/// Convenience result type for SDK connection operations.
pub type Result<T> = std::result::Result<T, SdkNetError>;

// ── Per-peer diagnostics ────────────────────────────────────────────────────

/// Failure category of a single peer during a connect pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFailureReason {
    /// TCP connect failed: the node is down or unreachable.
    TransportConnect(String),
    /// TLS failed: certificates or algorithms do not match the node's.
    SecureHandshake {
        /// Failure category.
        kind: HandshakeFailureKind,
        /// Underlying cause.
        detail: String,
    },
    /// The connection came up but capability/protocol negotiation failed.
    Negotiation(String),
}

impl PeerFailureReason {
    /// Operator-facing hint for the failure category.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::TransportConnect(_) => {
                "node unreachable: check that the node is running and that the address and port are correct"
            }
            Self::SecureHandshake { .. } => {
                "certificate/algorithm mismatch between SDK and node: check that the SDK uses the node's crypto suite and certificates"
            }
            Self::Negotiation(_) => {
                "node rejected the protocol handshake: check that the node version is supported by this SDK"
            }
        }
    }
}

impl fmt::Display for PeerFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportConnect(reason) => write!(f, "transport connect failed: {reason}"),
            Self::SecureHandshake { kind, detail } => {
                write!(f, "secure handshake failed ({kind}): {detail}")
            }
            Self::Negotiation(reason) => write!(f, "protocol negotiation failed: {reason}"),
        }
    }
}

/// One peer that could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    /// The peer.
    pub endpoint: PeerEndpoint,
    /// What went wrong.
    pub reason: PeerFailureReason,
}

impl PeerFailure {
    /// Classify a connect error for `endpoint`.
    pub fn from_error(endpoint: PeerEndpoint, error: SdkNetError) -> Self {
        let reason = match error {
            SdkNetError::TransportConnectFailed { reason, .. } => {
                PeerFailureReason::TransportConnect(reason)
            }
            SdkNetError::SecureHandshakeFailed { kind, detail, .. } => {
                PeerFailureReason::SecureHandshake { kind, detail }
            }
            SdkNetError::ProtocolNegotiationFailed { reason, .. } => {
                PeerFailureReason::Negotiation(reason)
            }
            other => PeerFailureReason::Negotiation(other.to_string()),
        };
        Self { endpoint, reason }
    }
}

/// Outcome of connecting the configured peer set under one crypto suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    /// Suite the connections were attempted under.
    pub suite: CryptoSuite,
    /// Peers that reached the registered state.
    pub connected: Vec<PeerEndpoint>,
    /// Peers that did not, with the reason.
    pub failures: Vec<PeerFailure>,
}

impl ConnectReport {
    /// Create an empty report for `suite`.
    pub fn new(suite: CryptoSuite) -> Self {
        Self {
            suite,
            connected: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Whether any peer failed during the TLS handshake.
    pub fn has_secure_handshake_failure(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.reason, PeerFailureReason::SecureHandshake { .. }))
    }

    /// The recorded failure for `endpoint`, if any.
    pub fn failure_for(&self, endpoint: &PeerEndpoint) -> Option<&PeerFailureReason> {
        self.failures
            .iter()
            .find(|f| &f.endpoint == endpoint)
            .map(|f| &f.reason)
    }
}

impl fmt::Display for ConnectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connected to {} of {} peer(s) under the {} suite",
            self.connected.len(),
            self.connected.len().saturating_add(self.failures.len()),
            self.suite,
        )?;
        for failure in &self.failures {
            write!(
                f,
                "\n  - {}: {} ({})",
                failure.endpoint,
                failure.reason,
                failure.reason.remediation()
            )?;
        }
        Ok(())
    }
}

/// The error one crypto suite ended with during suite fallback.
#[derive(Debug)]
pub struct SuiteAttempt {
    /// The suite that was tried.
    pub suite: CryptoSuite,
    /// Why it was abandoned.
    pub error: SdkNetError,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_attempts(attempts: &[SuiteAttempt]) -> String {
    let mut out = String::from("no crypto suite could reach any peer");
    for attempt in attempts {
        out.push_str(&format!("\n[{}] {}", attempt.suite, attempt.error));
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────
