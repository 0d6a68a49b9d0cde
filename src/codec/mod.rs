//! Typed broker messages and the codec boundary.
//!
//! The handle never looks inside payloads: a [`Message`] carries opaque
//! bytes plus the routing fields the reactor needs (kind, topic, match-tag).
//! A [`Codec`] turns a message into a frame body and back; framing itself
//! (length prefix) is the connection's job.
//!
//! - [`BinaryCodec`] - the default fixed-header binary layout

mod binary;

pub use binary::BinaryCodec;

use bytes::Bytes;
use std::ops::BitOr;

/// Match-tag value meaning "no tag".
pub const MATCHTAG_NONE: u32 = 0;

/// Node id meaning "any broker rank".
pub const NODEID_ANY: u32 = u32::MAX;

/// Message flag bits.
pub mod flags {
    /// Sender expects no response.
    pub const NORESPONSE: u8 = 0x01;
    /// Request may be answered by several responses.
    pub const STREAMING: u8 = 0x02;
}

/// Kind of a broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Response,
    Event,
    Control,
}

impl MessageType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MessageType::Request => 1,
            MessageType::Response => 2,
            MessageType::Event => 4,
            MessageType::Control => 8,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            4 => Some(MessageType::Event),
            8 => Some(MessageType::Control),
            _ => None,
        }
    }
}

/// Set of message kinds, used by message watcher filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeMask(u8);

impl TypeMask {
    pub const REQUEST: TypeMask = TypeMask(1);
    pub const RESPONSE: TypeMask = TypeMask(2);
    pub const EVENT: TypeMask = TypeMask(4);
    pub const CONTROL: TypeMask = TypeMask(8);
    pub const ANY: TypeMask = TypeMask(0x0f);

    pub fn contains(self, kind: MessageType) -> bool {
        self.0 & kind.to_wire() != 0
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: Self) -> Self {
        TypeMask(self.0 | rhs.0)
    }
}

impl From<MessageType> for TypeMask {
    fn from(kind: MessageType) -> Self {
        TypeMask(kind.to_wire())
    }
}

/// A single broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    /// Topic string: service method for requests/responses, event topic for events.
    pub topic: String,
    /// Correlates a response with its request; [`MATCHTAG_NONE`] if unused.
    pub matchtag: u32,
    /// Target broker rank for requests.
    pub nodeid: u32,
    /// Non-zero on error responses.
    pub errnum: u32,
    pub flags: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            matchtag: MATCHTAG_NONE,
            nodeid: NODEID_ANY,
            errnum: 0,
            flags: 0,
            payload: payload.into(),
        }
    }

    pub fn request(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Request, topic, payload)
    }

    pub fn event(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Event, topic, payload)
    }

    /// Builds the successful response to `request`.
    pub fn response_to(request: &Message, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageType::Response,
            topic: request.topic.clone(),
            matchtag: request.matchtag,
            nodeid: request.nodeid,
            errnum: 0,
            flags: request.flags & flags::STREAMING,
            payload: payload.into(),
        }
    }

    /// Builds an error response to `request`; the payload carries the error text.
    pub fn error_response_to(request: &Message, errnum: u32, message: &str) -> Self {
        let mut response = Self::response_to(request, Bytes::copy_from_slice(message.as_bytes()));
        response.errnum = errnum;
        response
    }

    pub fn with_matchtag(mut self, matchtag: u32) -> Self {
        self.matchtag = matchtag;
        self
    }

    pub fn with_nodeid(mut self, nodeid: u32) -> Self {
        self.nodeid = nodeid;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_error(&self) -> bool {
        self.errnum != 0
    }

    /// Payload as UTF-8 text, lossy.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Error produced by a [`Codec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// Encodes messages into frame bodies and decodes them back.
pub trait Codec {
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError>;

    fn decode(&self, body: &[u8]) -> Result<Message, CodecError>;
}
