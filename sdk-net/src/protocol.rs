//! Negotiated protocol state and the handshake payload codec.
//!
//! The connection layer does not interpret RPC payloads. The two handshake
//! requests it has to send are produced and parsed by a [`HandshakeCodec`],
//! with [`JsonHandshakeCodec`] speaking the node's JSON-RPC dialect.

use {
    crate::error::ProtocolError,
    bytes::Bytes,
    serde::Deserialize,
    serde_json::json,
    std::fmt,
};

/// Lowest protocol revision offered during negotiation.
pub const MIN_PROTOCOL: u32 = 1;

/// Highest protocol revision offered during negotiation.
pub const MAX_PROTOCOL: u32 = 3;

/// First node version that answers the protocol handshake request.
pub const NEGOTIATION_SINCE: (u32, u32, u32) = (2, 1, 0);

/// Wire-format revision agreed for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Default format spoken by nodes that predate negotiation.
    V1,
    /// Revision chosen by the node during the protocol handshake.
    Negotiated(u32),
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("v1 (default)"),
            Self::Negotiated(n) => write!(f, "v{n} (negotiated)"),
        }
    }
}

/// Protocol state attached to a connection handle for its whole lifetime.
///
/// Only the handshake negotiator constructs these; a different protocol
/// needs a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    version: ProtocolVersion,
    capability: String,
    node_id: Option<String>,
}

impl NegotiatedProtocol {
    pub(crate) fn default_protocol(capability: impl Into<String>) -> Self {
        Self {
            version: ProtocolVersion::V1,
            capability: capability.into(),
            node_id: None,
        }
    }

    pub(crate) fn negotiated(
        capability: impl Into<String>,
        descriptor: ProtocolDescriptor,
    ) -> Self {
        Self {
            version: ProtocolVersion::Negotiated(descriptor.protocol),
            capability: capability.into(),
            node_id: descriptor.node_id,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Raw capability string advertised by the node; empty when the probe
    /// timed out.
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Node identifier reported during negotiation, if any.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }
}

/// Protocol descriptor returned by the node's handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    pub protocol: u32,
    pub node_id: Option<String>,
}

/// Produces and parses the payloads of the two handshake requests.
pub trait HandshakeCodec: Send + Sync {
    /// Payload of the capability probe.
    fn version_probe(&self) -> Bytes;

    /// Extract the capability string from a probe response payload.
    fn parse_capability(&self, payload: &[u8]) -> Result<String, ProtocolError>;

    /// Whether the capability string announces protocol negotiation.
    fn supports_negotiation(&self, capability: &str) -> bool;

    /// Payload of the protocol handshake request.
    fn negotiation_request(&self) -> Bytes;

    /// Parse the protocol handshake response payload.
    fn parse_protocol(&self, payload: &[u8]) -> Result<ProtocolDescriptor, ProtocolError>;
}

/// JSON-RPC handshake payloads.
#[derive(Debug, Clone)]
pub struct JsonHandshakeCodec {
    client_type: String,
}

impl JsonHandshakeCodec {
    pub fn new(client_type: impl Into<String>) -> Self {
        Self {
            client_type: client_type.into(),
        }
    }
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<VersionResult>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct VersionResult {
    #[serde(rename = "Supported Version")]
    supported_version: Option<String>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    protocol: Option<u32>,
    #[serde(rename = "nodeID")]
    node_id: Option<String>,
}

impl HandshakeCodec for JsonHandshakeCodec {
    fn version_probe(&self) -> Bytes {
        Bytes::from(
            json!({
                "jsonrpc": "2.0",
                "method": "getClientVersion",
                "params": [],
                "id": 1,
            })
            .to_string(),
        )
    }

    fn parse_capability(&self, payload: &[u8]) -> Result<String, ProtocolError> {
        let envelope: RpcEnvelope = serde_json::from_slice(payload)?;
        if let Some(error) = envelope.error {
            return Err(ProtocolError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        envelope
            .result
            .and_then(|r| r.supported_version)
            .ok_or(ProtocolError::MissingField("Supported Version"))
    }

    fn supports_negotiation(&self, capability: &str) -> bool {
        parse_version(capability).is_some_and(|version| version >= NEGOTIATION_SINCE)
    }

    fn negotiation_request(&self) -> Bytes {
        Bytes::from(
            json!({
                "minimumSupport": MIN_PROTOCOL,
                "maximumSupport": MAX_PROTOCOL,
                "clientType": self.client_type,
            })
            .to_string(),
        )
    }

    fn parse_protocol(&self, payload: &[u8]) -> Result<ProtocolDescriptor, ProtocolError> {
        let response: HandshakeResponse = serde_json::from_slice(payload)?;
        let protocol = response
            .protocol
            .ok_or(ProtocolError::MissingField("protocol"))?;
        if !(MIN_PROTOCOL..=MAX_PROTOCOL).contains(&protocol) {
            return Err(ProtocolError::OutOfRange {
                protocol,
                min: MIN_PROTOCOL,
                max: MAX_PROTOCOL,
            });
        }
        Ok(ProtocolDescriptor {
            protocol,
            node_id: response.node_id,
        })
    }
}

/// Parse a dotted `major.minor.patch` version, tolerating a leading `v`
/// and trailing build suffixes (`2.7.0-rc1`).
fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let text = text.trim();
    let text = text.strip_prefix(['v', 'V']).unwrap_or(text);
    let mut parts = text.split('.').map(|part| {
        let digits = part
            .find(|c: char| !c.is_ascii_digit())
            .map_or(part, |end| &part[..end]);
        digits.parse::<u32>().ok()
    });
    let major = parts.next()??;
    let minor = parts.next().unwrap_or(Some(0))?;
    let patch = parts.next().unwrap_or(Some(0))?;
    Some((major, minor, patch))
}

// ── Tests ───────────────────────────────────────────────────────────────────
