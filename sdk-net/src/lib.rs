//! TRv1 Client SDK Connection Layer
//!
//! This crate keeps a client SDK connected to a set of TRv1 nodes.  It
//! handles:
//!
//! - **Secure transport**: mutually authenticated TLS under one of two
//!   certificate families (ECDSA or SM), with a one-shot fallback from
//!   ECDSA to SM when the nodes turn out to run the other family.
//! - **Framing**: length-prefixed binary frames carrying a message type,
//!   a 32-byte sequence id and an error code.
//! - **Protocol negotiation**: a version probe followed, on new enough
//!   nodes, by a protocol-range handshake.
//! - **Request correlation**: responses are matched to requests by
//!   sequence id, with per-request timeouts and flushing on connection loss.
//! - **Peer supervision**: bulk connect, a periodic reconnect pass and a
//!   live directory of negotiated peers.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  RPC layer (caller)                             │
//!  │  → send_request / broadcast / send_to_peer      │
//!  │  ← callbacks, MessageHandler, PeerObserver      │
//!  └──────────────┬──────────────────────────────────┘
//!                 │
//!  ┌──────────────▼──────────────────────────────────┐
//!  │  Network (network.rs)                           │
//!  │  • owns the I/O runtime                         │
//!  │  • crypto-suite fallback                        │
//!  └──────┬───────────────────────────┬──────────────┘
//!         │                           │
//!  ┌──────▼────────────┐      ┌───────▼────────────┐
//!  │ ConnectionSuper-  │      │ PeerRegistry       │
//!  │ visor (dial, TLS, │─────▶│ (endpoint → handle)│
//!  │ negotiate, retry) │      └────────────────────┘
//!  └──────┬────────────┘
//!         │
//!  ┌──────▼──────────────────────────────────────────┐
//!  │  Connection (read/write tasks, heartbeats)      │
//!  │  • FrameCodec: length-prefixed frames           │
//!  │  • Dispatcher → ResponseCorrelator or handlers  │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]        | `SdkNetConfig` defaults, TOML loading, dev overrides |
//! | [`endpoint`]      | `host:port` peer addresses |
//! | [`frame`]         | Wire frame, sequence ids, `FrameCodec` |
//! | [`tls`]           | Crypto suites and the TLS connector |
//! | [`protocol`]      | Handshake payloads and negotiated protocol |
//! | [`handshake`]     | Negotiation state machine |
//! | [`correlator`]    | Pending requests keyed by sequence id |
//! | [`dispatch`]      | Routing of inbound frames |
//! | [`connection`]    | Per-peer I/O tasks and handles |
//! | [`peer_registry`] | Live peer directory and observers |
//! | [`supervisor`]    | Bulk connect and reconnect pass |
//! | [`network`]       | Public façade |
//! | [`stats`]         | Connection counters |
//! | [`error`]         | Crate-wide error enum and connect reports |

pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod network;
pub mod peer_registry;
pub mod protocol;
pub mod stats;
pub mod supervisor;
pub mod tls;

pub use {
    config::SdkNetConfig,
    connection::ConnectionHandle,
    dispatch::MessageHandler,
    endpoint::PeerEndpoint,
    error::{ConnectReport, Result, SdkNetError},
    frame::{Frame, FrameErrorCode, MessageType, SequenceId},
    network::Network,
    peer_registry::PeerObserver,
    protocol::{NegotiatedProtocol, ProtocolVersion},
    tls::CryptoSuite,
};
