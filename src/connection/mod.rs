//! Logical channel to the broker.
//!
//! A [`Connection`] owns one stream socket, a [`Codec`] and a frame buffer.
//! Writes are blocking and whole-frame; reads happen only after the reactor
//! (or a blocking wait) has seen the socket readable, so a single `read`
//! never blocks.
//!
//! - [`uri`]: endpoint parsing (`local://`, `fd://`)
//! - [`frame_buffer`]: length-prefixed framing

pub(crate) mod frame_buffer;
pub mod uri;

pub use frame_buffer::DEFAULT_MAX_FRAME_SIZE;
pub use uri::Endpoint;

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::codec::{BinaryCodec, Codec, Message};
use crate::error::{ConnectError, Error, SendError};
use crate::reactor::event;
use frame_buffer::{FrameBuffer, encode_frame};

const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// The peer went away or sent garbage; the socket is kept until close.
    Failed,
    Closed,
}

pub struct Connection {
    stream: Option<UnixStream>,
    state: ConnectionState,
    codec: Box<dyn Codec>,
    frames: FrameBuffer,
}

impl Connection {
    /// Opens a connection to `uri` with the default codec and frame limit.
    pub fn open(uri: &str) -> Result<Self, ConnectError> {
        Ok(Self::from_stream(dial(uri, false)?))
    }

    /// Like [`Connection::open`], but a connect failure carries the OS diagnostic.
    pub fn open_ex(uri: &str) -> Result<Self, ConnectError> {
        Ok(Self::from_stream(dial(uri, true)?))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self::with_stream(stream, Box::new(BinaryCodec), DEFAULT_MAX_FRAME_SIZE)
    }

    pub(crate) fn with_stream(stream: UnixStream, codec: Box<dyn Codec>, max_frame_size: usize) -> Self {
        if let Err(e) = event::set_cloexec(stream.as_raw_fd()) {
            tracing::warn!(error = %e, "failed to set close-on-exec on broker connection");
        }

        Self {
            stream: Some(stream),
            state: ConnectionState::Open,
            codec,
            frames: FrameBuffer::new(max_frame_size),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Descriptor the reactor should poll, if the connection can still receive.
    pub(crate) fn pollable_fd(&self) -> Option<RawFd> {
        match (&self.stream, self.state) {
            (Some(stream), ConnectionState::Open) => Some(stream.as_raw_fd()),
            _ => None,
        }
    }

    /// Encodes and writes one message.
    ///
    /// A write failure moves the connection to `Failed`.
    pub fn send(&mut self, message: &Message) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::ConnectionClosed);
        }

        let body = self
            .codec
            .encode(message)
            .map_err(|e| SendError::EncodeFailure(e.to_string()))?;
        let frame = encode_frame(&body);

        let stream = self.stream.as_mut().ok_or(SendError::ConnectionClosed)?;
        if let Err(e) = stream.write_all(&frame) {
            tracing::warn!(error = %e, topic = %message.topic, "send failed, marking connection failed");
            self.state = ConnectionState::Failed;
            return Err(SendError::ConnectionClosed);
        }

        tracing::trace!(topic = %message.topic, matchtag = message.matchtag, "sent message");
        Ok(())
    }

    /// True if a read would not block.
    pub fn poll_readable(&self) -> bool {
        self.wait_readable(Some(Duration::ZERO)).unwrap_or(false)
    }

    pub(crate) fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match self.pollable_fd() {
            Some(fd) => event::wait_readable(fd, timeout),
            None => Ok(false),
        }
    }

    /// Reads what is available and decodes every complete message.
    ///
    /// End of stream, a read error, an oversized frame or an undecodable body
    /// moves the connection to `Failed` and is returned as an error.
    pub(crate) fn receive(&mut self) -> Result<Vec<Message>, Error> {
        let stream = match (&mut self.stream, self.state) {
            (Some(stream), ConnectionState::Open) => stream,
            _ => return Ok(Vec::new()),
        };

        let mut chunk = vec![0u8; READ_CHUNK];
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                tracing::debug!("broker closed the connection");
                self.state = ConnectionState::Failed;
                return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!(error = %e, "read failed, marking connection failed");
                self.state = ConnectionState::Failed;
                return Err(Error::Io(e));
            }
        };

        let bodies = self.frames.push(&chunk[..n]).map_err(|oversized| {
            self.state = ConnectionState::Failed;
            Error::Protocol(format!(
                "frame of {} bytes exceeds maximum {}",
                oversized.length, oversized.max
            ))
        })?;

        let mut messages = Vec::with_capacity(bodies.len());
        for body in bodies {
            match self.codec.decode(&body) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::error!(error = %e, "undecodable message from broker");
                    self.state = ConnectionState::Failed;
                    return Err(Error::Protocol(e.to_string()));
                }
            }
        }

        Ok(messages)
    }

    /// Closes the socket. A second close reports [`Error::DoubleClose`].
    pub fn close(&mut self) -> Result<(), Error> {
        if self.state == ConnectionState::Closed {
            return Err(Error::DoubleClose);
        }

        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = ConnectionState::Closed;
        tracing::debug!("connection closed");

        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("fd", &self.stream.as_ref().map(|s| s.as_raw_fd()))
            .field("buffered", &self.frames.pending_bytes())
            .finish()
    }
}

/// Resolves `uri` to a connected stream. With `detailed`, a failure carries
/// the OS diagnostic instead of a generic reason.
pub(crate) fn dial(uri: &str, detailed: bool) -> Result<UnixStream, ConnectError> {
    let unreachable = |reason: String| ConnectError::Unreachable {
        uri: uri.to_string(),
        reason,
    };

    let stream = match Endpoint::parse(uri)? {
        Endpoint::Local(path) => UnixStream::connect(&path).map_err(|e| {
            unreachable(if detailed {
                format!("connect {}: {e}", path.display())
            } else {
                "connect failed".to_string()
            })
        })?,
        Endpoint::Fd(fd) => adopt_fd(fd).map_err(|e| {
            unreachable(if detailed {
                format!("fd {fd}: {e}")
            } else {
                "invalid descriptor".to_string()
            })
        })?,
    };

    tracing::debug!(uri, "connected to broker");
    Ok(stream)
}

fn adopt_fd(fd: RawFd) -> io::Result<UnixStream> {
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}
