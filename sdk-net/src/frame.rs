//! Wire frames and the length-prefixed frame codec.
//!
//! ## Wire format
//!
//! Every frame on the wire is length-prefixed, all integers big-endian:
//!
//! ```text
//! [4 bytes: length of the rest (u32)]
//! [2 bytes: message type (u16)]
//! [32 bytes: sequence id, ASCII hex]
//! [4 bytes: error code (i32)]
//! [N bytes: opaque payload]
//! ```
//!
//! The decoder reads the 4-byte length, validates it against
//! `max_frame_size`, then waits for exactly that many bytes before
//! producing a [`Frame`].

use {
    crate::error::{Result, SdkNetError},
    bytes::{Buf, BufMut, Bytes, BytesMut},
    std::{
        fmt,
        hash::{Hash, Hasher},
    },
    tokio_util::codec::{Decoder, Encoder},
};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Width of the sequence identifier on the wire.
pub const SEQ_LEN: usize = 32;

/// Bytes covered by `length` that precede the payload (type + seq + error code).
pub const HEADER_LEN: usize = 2 + SEQ_LEN + 4;

/// Correlation token carried by every frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceId([u8; SEQ_LEN]);

impl SequenceId {
    /// Placeholder for frames that are not part of a request/response pair.
    pub const ZERO: Self = Self([b'0'; SEQ_LEN]);

    /// A fresh identifier: 16 random bytes, hex encoded.
    pub fn generate() -> Self {
        let raw: [u8; SEQ_LEN / 2] = rand::random();
        let mut id = [0u8; SEQ_LEN];
        // Encoding 16 bytes always yields exactly 32 hex digits.
        let _ = hex::encode_to_slice(raw, &mut id);
        Self(id)
    }

    /// Wrap raw wire bytes.
    pub fn from_bytes(bytes: [u8; SEQ_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEQ_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceId({self})")
    }
}

/// Message type code of a frame.
///
/// Compares and hashes by wire code: `Other(0x12)` is `RpcRequest`.
#[derive(Debug, Clone, Copy)]
pub enum MessageType {
    RpcRequest,
    Heartbeat,
    ClientHandshake,
    ClientRegisterEventLog,
    TransactionNotify,
    BlockNotify,
    EventLogPush,
    /// Any code this layer does not know; carried through untouched.
    Other(u16),
}

impl From<u16> for MessageType {
    fn from(code: u16) -> Self {
        match code {
            0x12 => Self::RpcRequest,
            0x13 => Self::Heartbeat,
            0x14 => Self::ClientHandshake,
            0x15 => Self::ClientRegisterEventLog,
            0x1000 => Self::TransactionNotify,
            0x1001 => Self::BlockNotify,
            0x1002 => Self::EventLogPush,
            other => Self::Other(other),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(ty: MessageType) -> u16 {
        match ty {
            MessageType::RpcRequest => 0x12,
            MessageType::Heartbeat => 0x13,
            MessageType::ClientHandshake => 0x14,
            MessageType::ClientRegisterEventLog => 0x15,
            MessageType::TransactionNotify => 0x1000,
            MessageType::BlockNotify => 0x1001,
            MessageType::EventLogPush => 0x1002,
            MessageType::Other(code) => code,
        }
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        u16::from(*self) == u16::from(*other)
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        u16::from(*self).hash(state);
    }
}

/// Error code carried in a response frame.
///
/// Compares and hashes by wire code, like [`MessageType`].
#[derive(Debug, Clone, Copy)]
pub enum FrameErrorCode {
    Success,
    NodeInaccessible,
    ConnectionInvalid,
    /// The node gave up waiting for the request to be processed.
    MessageTimeout,
    RequestRejected,
    Other(i32),
}

impl FrameErrorCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<i32> for FrameErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            100 => Self::NodeInaccessible,
            101 => Self::ConnectionInvalid,
            102 => Self::MessageTimeout,
            103 => Self::RequestRejected,
            other => Self::Other(other),
        }
    }
}

impl From<FrameErrorCode> for i32 {
    fn from(code: FrameErrorCode) -> i32 {
        match code {
            FrameErrorCode::Success => 0,
            FrameErrorCode::NodeInaccessible => 100,
            FrameErrorCode::ConnectionInvalid => 101,
            FrameErrorCode::MessageTimeout => 102,
            FrameErrorCode::RequestRejected => 103,
            FrameErrorCode::Other(code) => code,
        }
    }
}

impl PartialEq for FrameErrorCode {
    fn eq(&self, other: &Self) -> bool {
        i32::from(*self) == i32::from(*other)
    }
}

impl Eq for FrameErrorCode {}

impl Hash for FrameErrorCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        i32::from(*self).hash(state);
    }
}

impl fmt::Display for FrameErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({self:?})", i32::from(*self))
    }
}

/// One message exchanged with a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub seq: SequenceId,
    pub error_code: FrameErrorCode,
    pub payload: Bytes,
}

impl Frame {
    /// A request frame with a freshly generated sequence id.
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            seq: SequenceId::generate(),
            error_code: FrameErrorCode::Success,
            payload: payload.into(),
        }
    }

    /// A frame that is not correlated with any request.
    pub fn unsolicited(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            seq: SequenceId::ZERO,
            ..Self::new(message_type, payload)
        }
    }

    /// A response to this frame, echoing its type and sequence id.
    pub fn response_to(&self, error_code: FrameErrorCode, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: self.message_type,
            seq: self.seq,
            error_code,
            payload: payload.into(),
        }
    }

    /// Size of the frame on the wire, length prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN
            .saturating_add(HEADER_LEN)
            .saturating_add(self.payload.len())
    }
}

/// `tokio_util` codec for [`Frame`]s.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// A codec rejecting frames whose `length` field exceeds `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SdkNetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(prefix) = src.get(..LENGTH_PREFIX_LEN) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len < HEADER_LEN {
            return Err(SdkNetError::MalformedFrame(format!(
                "length {len} shorter than the {HEADER_LEN}-byte header"
            )));
        }
        if len > self.max_frame_size {
            return Err(SdkNetError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_LEN.saturating_add(len);
        if src.len() < total {
            src.reserve(total.saturating_sub(src.len()));
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let mut body = src.split_to(len);
        let message_type = MessageType::from(body.get_u16());
        let mut seq = [0u8; SEQ_LEN];
        body.copy_to_slice(&mut seq);
        let error_code = FrameErrorCode::from(body.get_i32());

        Ok(Some(Frame {
            message_type,
            seq: SequenceId::from_bytes(seq),
            error_code,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SdkNetError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = HEADER_LEN.saturating_add(frame.payload.len());
        if len > self.max_frame_size {
            return Err(SdkNetError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let wire_len = u32::try_from(len).map_err(|_| SdkNetError::FrameTooLarge {
            size: len,
            max: self.max_frame_size,
        })?;

        dst.reserve(LENGTH_PREFIX_LEN.saturating_add(len));
        dst.put_u32(wire_len);
        dst.put_u16(frame.message_type.into());
        dst.put_slice(frame.seq.as_bytes());
        dst.put_i32(frame.error_code.into());
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
