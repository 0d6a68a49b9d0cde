//! Fixed-header binary message layout.
//!
//! ```text
//! version u8 | kind u8 | flags u8 | reserved u8 | matchtag u32 | nodeid u32 |
//! errnum u32 | topic_len u16 | topic | payload
//! ```
//!
//! All integers are big-endian. The payload runs to the end of the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Codec, CodecError, Message, MessageType};

const VERSION: u8 = 1;
const HEADER_SIZE: usize = 18;

/// Default codec used by every handle unless the builder overrides it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        let topic = message.topic.as_bytes();
        let topic_len = u16::try_from(topic.len())
            .map_err(|_| CodecError(format!("topic of {} bytes is too long", topic.len())))?;

        let mut body = BytesMut::with_capacity(HEADER_SIZE + topic.len() + message.payload.len());
        body.put_u8(VERSION);
        body.put_u8(message.kind.to_wire());
        body.put_u8(message.flags);
        body.put_u8(0);
        body.put_u32(message.matchtag);
        body.put_u32(message.nodeid);
        body.put_u32(message.errnum);
        body.put_u16(topic_len);
        body.put_slice(topic);
        body.put_slice(&message.payload);

        Ok(body.freeze())
    }

    fn decode(&self, body: &[u8]) -> Result<Message, CodecError> {
        if body.len() < HEADER_SIZE {
            return Err(CodecError(format!(
                "message body of {} bytes is shorter than the {HEADER_SIZE} byte header",
                body.len()
            )));
        }

        let mut cursor = body;
        let version = cursor.get_u8();
        if version != VERSION {
            return Err(CodecError(format!("unsupported message version {version}")));
        }

        let kind_raw = cursor.get_u8();
        let kind = MessageType::from_wire(kind_raw)
            .ok_or_else(|| CodecError(format!("unknown message type {kind_raw}")))?;
        let flags = cursor.get_u8();
        let _reserved = cursor.get_u8();
        let matchtag = cursor.get_u32();
        let nodeid = cursor.get_u32();
        let errnum = cursor.get_u32();
        let topic_len = cursor.get_u16() as usize;

        if cursor.remaining() < topic_len {
            return Err(CodecError(format!(
                "topic length {topic_len} exceeds remaining {} bytes",
                cursor.remaining()
            )));
        }

        let topic = std::str::from_utf8(&cursor[..topic_len])
            .map_err(|e| CodecError(format!("topic is not valid UTF-8: {e}")))?
            .to_string();
        let payload = Bytes::copy_from_slice(&cursor[topic_len..]);

        Ok(Message {
            kind,
            topic,
            matchtag,
            nodeid,
            errnum,
            flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flags;

    #[test]
    fn test_encode_layout() {
        let message = Message::request("attr.get", &b"rank"[..])
            .with_matchtag(7)
            .with_nodeid(3)
            .with_flags(flags::STREAMING);

        let body = BinaryCodec.encode(&message).unwrap();

        assert_eq!(body[0], VERSION);
        assert_eq!(body[1], 1);
        assert_eq!(body[2], flags::STREAMING);
        assert_eq!(&body[4..8], &7u32.to_be_bytes());
        assert_eq!(&body[8..12], &3u32.to_be_bytes());
        assert_eq!(&body[16..18], &8u16.to_be_bytes());
        assert_eq!(&body[18..26], b"attr.get");
        assert_eq!(&body[26..], b"rank");

        assert_eq!(BinaryCodec.decode(&body).unwrap(), message);
    }

    #[test]
    fn test_decode_error_response_keeps_errnum() {
        let request = Message::request("service.add", &b"foo"[..]).with_matchtag(4);
        let response = Message::error_response_to(&request, 17, "exists");

        let decoded = BinaryCodec
            .decode(&BinaryCodec.encode(&response).unwrap())
            .unwrap();

        assert_eq!(decoded.kind, MessageType::Response);
        assert_eq!(decoded.errnum, 17);
        assert_eq!(decoded.payload_str(), "exists");
        assert!(decoded.is_error());
    }

    #[test]
    fn test_decode_rejects_short_body() {
        let err = BinaryCodec.decode(&[1, 2, 3]).unwrap_err();
        assert!(err.0.contains("shorter"));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut body = BinaryCodec
            .encode(&Message::event("foo", Bytes::new()))
            .unwrap()
            .to_vec();
        body[1] = 99;

        let err: Box<dyn std::error::Error> = Box::new(BinaryCodec.decode(&body).unwrap_err());
        assert_eq!(err.to_string(), "unknown message type 99");
    }

    #[test]
    fn test_decode_rejects_truncated_topic() {
        let mut body = BinaryCodec
            .encode(&Message::event("foo.bar", Bytes::new()))
            .unwrap()
            .to_vec();
        body.truncate(HEADER_SIZE + 3);

        assert!(BinaryCodec.decode(&body).is_err());
    }
}
