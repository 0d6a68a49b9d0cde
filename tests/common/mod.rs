#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use broker_handle::codec::CodecError;
use broker_handle::{BinaryCodec, Codec, Handle, HandleBuilder, Message};
use bytes::Bytes;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Broker end of a socket pair, speaking the default framing and codec.
pub struct FakeBroker {
    stream: UnixStream,
    codec: BinaryCodec,
}

impl FakeBroker {
    pub fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            codec: BinaryCodec,
        }
    }

    /// Next message from the handle, or `None` once it hung up.
    pub fn try_recv(&mut self) -> Option<Message> {
        let mut len = [0u8; 4];
        match self.stream.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return None,
            Err(e) => panic!("broker read failed: {e}"),
        }

        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut body).unwrap();
        Some(self.codec.decode(&body).unwrap())
    }

    pub fn recv(&mut self) -> Message {
        self.try_recv().expect("handle hung up")
    }

    pub fn send(&mut self, message: &Message) {
        let body = self.codec.encode(message).unwrap();
        self.stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .unwrap();
        self.stream.write_all(&body).unwrap();
    }

    pub fn respond(&mut self, request: &Message, payload: &[u8]) {
        self.send(&Message::response_to(request, payload.to_vec()));
    }

    pub fn respond_error(&mut self, request: &Message, errnum: i32, text: &str) {
        self.send(&Message::error_response_to(request, errnum as u32, text));
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) {
        self.send(&Message::event(topic, payload.to_vec()));
    }
}

/// Default codec that refuses to encode one topic.
pub struct RejectingCodec(pub &'static str);

impl Codec for RejectingCodec {
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        if message.topic == self.0 {
            return Err(CodecError(format!("refusing topic {}", self.0)));
        }
        BinaryCodec.encode(message)
    }

    fn decode(&self, body: &[u8]) -> Result<Message, CodecError> {
        BinaryCodec.decode(body)
    }
}

pub fn pair() -> (Handle, FakeBroker) {
    pair_with(HandleBuilder::new())
}

pub fn pair_with(builder: HandleBuilder) -> (Handle, FakeBroker) {
    init_tracing();
    let (client, broker) = UnixStream::pair().unwrap();
    (builder.from_stream(client), FakeBroker::new(broker))
}
