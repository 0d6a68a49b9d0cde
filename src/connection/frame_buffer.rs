//! Frame buffer for accumulating partial reads.
//!
//! Each frame is a big-endian `u32` body length followed by the body.
//! Bytes are accumulated in a `BytesMut` until whole bodies are available.

use bytes::{Buf, Bytes, BytesMut};

const LENGTH_PREFIX: usize = 4;

/// Default maximum frame body size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OversizedFrame {
    pub(crate) length: usize,
    pub(crate) max: usize,
}

pub(crate) struct FrameBuffer {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub(crate) fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Appends `data` and extracts every complete frame body.
    pub(crate) fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, OversizedFrame> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        while let Some(body) = self.try_extract_one()? {
            bodies.push(body);
        }

        Ok(bodies)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>, OversizedFrame> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = &self.buffer[..LENGTH_PREFIX];
        let length = prefix.get_u32() as usize;

        if length > self.max_frame_size {
            return Err(OversizedFrame {
                length,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX + length {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Prefixes `body` with its length.
pub(crate) fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}
