//! Per-connection handshake state machine.
//!
//! ```text
//!  Connected ──Start──▶ VersionQueried ──probe timed out────────────▶ DefaultProtocol
//!                             │        ──no negotiation support────▶ DefaultProtocol
//!                             └─supports negotiation─▶ NegotiationRequested
//!                                                          └─protocol reply─▶ CapabilityNegotiated
//!  DefaultProtocol | CapabilityNegotiated ──Registered──▶ Registered
//! ```
//!
//! The machine performs no I/O. Each call to [`HandshakeNegotiator::handle`]
//! consumes one event and returns the side effect the caller must carry
//! out: send a request, or publish the connection. Any error leaves the
//! negotiator in `Failed` and the caller closes the connection.
//!
//! A capability probe that times out, either locally or with the node's own
//! [`FrameErrorCode::MessageTimeout`], is taken to mean the node predates
//! negotiation; the connection proceeds with
//! [`ProtocolVersion::V1`](crate::protocol::ProtocolVersion::V1).

use {
    crate::{
        error::NegotiationError,
        frame::{Frame, FrameErrorCode},
        protocol::{HandshakeCodec, NegotiatedProtocol},
    },
    bytes::Bytes,
    log::warn,
    std::sync::Arc,
};

const PROBE_STAGE: &str = "capability probe";
const PROTOCOL_STAGE: &str = "protocol handshake";

/// Outcome of one handshake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The node answered.
    Frame(Frame),
    /// No answer within the handshake timeout.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connected,
    VersionQueried,
    NegotiationRequested { capability: String },
    CapabilityNegotiated(NegotiatedProtocol),
    DefaultProtocol(NegotiatedProtocol),
    Registered(NegotiatedProtocol),
    Failed,
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::VersionQueried => "VersionQueried",
            Self::NegotiationRequested { .. } => "NegotiationRequested",
            Self::CapabilityNegotiated(_) => "CapabilityNegotiated",
            Self::DefaultProtocol(_) => "DefaultProtocol",
            Self::Registered(_) => "Registered",
            Self::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// The secure connection is up.
    Start,
    /// Reply to the capability probe.
    VersionResponse(Reply),
    /// Reply to the protocol handshake request.
    ProtocolResponse(Reply),
    /// The handle has been published to the peer registry.
    Registered,
}

impl HandshakeEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::VersionResponse(_) => "VersionResponse",
            Self::ProtocolResponse(_) => "ProtocolResponse",
            Self::Registered => "Registered",
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send the capability probe with this payload.
    SendVersionProbe(Bytes),
    /// Send the protocol handshake request with this payload.
    SendProtocolHandshake(Bytes),
    /// Attach this protocol to the handle and publish it.
    Register(NegotiatedProtocol),
    /// Nothing left to do.
    Done,
}

pub struct HandshakeNegotiator {
    state: HandshakeState,
    codec: Arc<dyn HandshakeCodec>,
}

impl std::fmt::Debug for HandshakeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeNegotiator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl HandshakeNegotiator {
    pub fn new(codec: Arc<dyn HandshakeCodec>) -> Self {
        Self {
            state: HandshakeState::Connected,
            codec,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// The agreed protocol, once one has been determined.
    pub fn protocol(&self) -> Option<&NegotiatedProtocol> {
        match &self.state {
            HandshakeState::CapabilityNegotiated(np)
            | HandshakeState::DefaultProtocol(np)
            | HandshakeState::Registered(np) => Some(np),
            _ => None,
        }
    }

    /// Feed one event into the machine.
    pub fn handle(&mut self, event: HandshakeEvent) -> Result<HandshakeAction, NegotiationError> {
        let state = std::mem::replace(&mut self.state, HandshakeState::Failed);
        let (next, action) = transition(state, event, self.codec.as_ref())?;
        self.state = next;
        Ok(action)
    }
}

fn transition(
    state: HandshakeState,
    event: HandshakeEvent,
    codec: &dyn HandshakeCodec,
) -> Result<(HandshakeState, HandshakeAction), NegotiationError> {
    match (state, event) {
        (HandshakeState::Connected, HandshakeEvent::Start) => Ok((
            HandshakeState::VersionQueried,
            HandshakeAction::SendVersionProbe(codec.version_probe()),
        )),

        (HandshakeState::VersionQueried, HandshakeEvent::VersionResponse(reply)) => {
            let frame = match reply {
                Reply::Frame(frame) if frame.error_code != FrameErrorCode::MessageTimeout => frame,
                Reply::Frame(_) | Reply::TimedOut => {
                    warn!("{PROBE_STAGE} timed out, assuming the node predates negotiation");
                    return Ok(default_protocol(String::new()));
                }
            };
            if !frame.error_code.is_success() {
                return Err(NegotiationError::Rejected {
                    stage: PROBE_STAGE,
                    code: frame.error_code,
                });
            }
            let capability = codec.parse_capability(&frame.payload)?;
            if codec.supports_negotiation(&capability) {
                Ok((
                    HandshakeState::NegotiationRequested { capability },
                    HandshakeAction::SendProtocolHandshake(codec.negotiation_request()),
                ))
            } else {
                Ok(default_protocol(capability))
            }
        }

        (
            HandshakeState::NegotiationRequested { capability },
            HandshakeEvent::ProtocolResponse(reply),
        ) => {
            let Reply::Frame(frame) = reply else {
                return Err(NegotiationError::TimedOut {
                    stage: PROTOCOL_STAGE,
                });
            };
            if !frame.error_code.is_success() {
                return Err(NegotiationError::Rejected {
                    stage: PROTOCOL_STAGE,
                    code: frame.error_code,
                });
            }
            let descriptor = codec.parse_protocol(&frame.payload)?;
            let np = NegotiatedProtocol::negotiated(capability, descriptor);
            Ok((
                HandshakeState::CapabilityNegotiated(np.clone()),
                HandshakeAction::Register(np),
            ))
        }

        (
            HandshakeState::CapabilityNegotiated(np) | HandshakeState::DefaultProtocol(np),
            HandshakeEvent::Registered,
        ) => Ok((HandshakeState::Registered(np), HandshakeAction::Done)),

        (state, event) => Err(NegotiationError::UnexpectedEvent {
            state: state.name(),
            event: event.name(),
        }),
    }
}

fn default_protocol(capability: String) -> (HandshakeState, HandshakeAction) {
    let np = NegotiatedProtocol::default_protocol(capability);
    (
        HandshakeState::DefaultProtocol(np.clone()),
        HandshakeAction::Register(np),
    )
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            frame::MessageType,
            protocol::{JsonHandshakeCodec, ProtocolVersion},
        },
        assert_matches::assert_matches,
    };

    fn negotiator() -> HandshakeNegotiator {
        HandshakeNegotiator::new(Arc::new(JsonHandshakeCodec::new("test")))
    }

    fn reply(code: FrameErrorCode, payload: &'static str) -> Reply {
        let request = Frame::new(MessageType::RpcRequest, Bytes::new());
        Reply::Frame(request.response_to(code, payload))
    }

    fn version_reply(version: &'static str) -> Reply {
        let payload = match version {
            "2.7.0" => r#"{"jsonrpc":"2.0","id":1,"result":{"Supported Version":"2.7.0"}}"#,
            "2.0.0" => r#"{"jsonrpc":"2.0","id":1,"result":{"Supported Version":"2.0.0"}}"#,
            other => panic!("no canned reply for {other}"),
        };
        reply(FrameErrorCode::Success, payload)
    }

    fn started() -> HandshakeNegotiator {
        let mut n = negotiator();
        assert_matches!(
            n.handle(HandshakeEvent::Start),
            Ok(HandshakeAction::SendVersionProbe(_))
        );
        assert_eq!(n.state(), &HandshakeState::VersionQueried);
        n
    }

    #[test]
    fn test_negotiating_node() {
        let mut n = started();
        assert_matches!(
            n.handle(HandshakeEvent::VersionResponse(version_reply("2.7.0"))),
            Ok(HandshakeAction::SendProtocolHandshake(_))
        );
        let action = n
            .handle(HandshakeEvent::ProtocolResponse(reply(
                FrameErrorCode::Success,
                r#"{"protocol":3,"nodeID":"n0"}"#,
            )))
            .unwrap();
        let HandshakeAction::Register(np) = action else {
            panic!("expected Register, got {action:?}");
        };
        assert_eq!(np.version(), ProtocolVersion::Negotiated(3));
        assert_eq!(np.capability(), "2.7.0");
        assert_eq!(n.state().name(), "CapabilityNegotiated");

        assert_eq!(
            n.handle(HandshakeEvent::Registered).unwrap(),
            HandshakeAction::Done
        );
        assert_eq!(n.state(), &HandshakeState::Registered(np.clone()));
        assert_eq!(n.protocol(), Some(&np));
    }

    #[test]
    fn test_legacy_node_uses_default_protocol() {
        let mut n = started();
        let action = n
            .handle(HandshakeEvent::VersionResponse(version_reply("2.0.0")))
            .unwrap();
        assert_matches!(action, HandshakeAction::Register(np) if np.version() == ProtocolVersion::V1 && np.capability() == "2.0.0");
        assert_eq!(n.state().name(), "DefaultProtocol");
    }

    #[test]
    fn test_probe_timeout_is_not_an_error() {
        let mut n = started();
        assert_matches!(
            n.handle(HandshakeEvent::VersionResponse(Reply::TimedOut)),
            Ok(HandshakeAction::Register(np)) if np.version() == ProtocolVersion::V1
        );

        let mut n = started();
        assert_matches!(
            n.handle(HandshakeEvent::VersionResponse(reply(
                FrameErrorCode::MessageTimeout,
                ""
            ))),
            Ok(HandshakeAction::Register(np)) if np.version() == ProtocolVersion::V1
        );
        assert_matches!(n.handle(HandshakeEvent::Registered), Ok(HandshakeAction::Done));
    }

    #[test]
    fn test_probe_error_code_is_fatal() {
        let mut n = started();
        assert_matches!(
            n.handle(HandshakeEvent::VersionResponse(reply(
                FrameErrorCode::RequestRejected,
                ""
            ))),
            Err(NegotiationError::Rejected {
                stage: "capability probe",
                code: FrameErrorCode::RequestRejected
            })
        );
        assert_eq!(n.state(), &HandshakeState::Failed);
        assert_matches!(
            n.handle(HandshakeEvent::Registered),
            Err(NegotiationError::UnexpectedEvent { state: "Failed", .. })
        );
    }

    #[test]
    fn test_protocol_stage_failures_are_fatal() {
        for bad in [
            Reply::TimedOut,
            reply(FrameErrorCode::MessageTimeout, ""),
            reply(FrameErrorCode::Success, r#"{"protocol":9}"#),
            reply(FrameErrorCode::Success, "not json"),
        ] {
            let mut n = started();
            n.handle(HandshakeEvent::VersionResponse(version_reply("2.7.0")))
                .unwrap();
            assert!(n.handle(HandshakeEvent::ProtocolResponse(bad)).is_err());
            assert_eq!(n.state(), &HandshakeState::Failed);
            assert!(n.protocol().is_none());
        }
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        let mut n = negotiator();
        assert_matches!(
            n.handle(HandshakeEvent::Registered),
            Err(NegotiationError::UnexpectedEvent {
                state: "Connected",
                event: "Registered"
            })
        );

        let mut n = started();
        assert_matches!(
            n.handle(HandshakeEvent::ProtocolResponse(Reply::TimedOut)),
            Err(NegotiationError::UnexpectedEvent {
                state: "VersionQueried",
                event: "ProtocolResponse"
            })
        );
    }
}
