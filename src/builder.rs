//! Fluent builder for Handle construction.
//!
//! Provides a builder pattern interface for opening and configuring handles.

use std::os::unix::net::UnixStream;
use std::thread::{self, ThreadId};

use crate::codec::{BinaryCodec, Codec};
use crate::connection::{self, Connection, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{ConnectError, Result};
use crate::handle::Handle;

/// Default limit on reactor nesting.
pub const DEFAULT_MAX_REACTOR_DEPTH: usize = 32;

/// Which thread may install the interrupt handler during `run_reactor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalOwner {
    /// The thread named `main`.
    MainThread,
    Thread(ThreadId),
    Disabled,
}

impl SignalOwner {
    fn is_current(self) -> bool {
        match self {
            SignalOwner::MainThread => thread::current().name() == Some("main"),
            SignalOwner::Thread(id) => thread::current().id() == id,
            SignalOwner::Disabled => false,
        }
    }
}

/// Settings fixed when a handle is built.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) max_reactor_depth: usize,
    pub(crate) interrupt_signal: i32,
    signal_owner: SignalOwner,
}

impl Config {
    /// True if runs on the calling thread should watch the interrupt signal.
    pub(crate) fn owns_signals(&self) -> bool {
        self.signal_owner.is_current()
    }
}

/// Builder for constructing Handle instances with fluent API.
///
/// # Example
/// ```no_run
/// use broker_handle::HandleBuilder;
///
/// let handle = HandleBuilder::new()
///     .uri("local:///run/broker/local")
///     .max_reactor_depth(8)
///     .open()?;
/// # Ok::<(), broker_handle::Error>(())
/// ```
pub struct HandleBuilder {
    uri: Option<String>,
    codec: Box<dyn Codec>,
    max_frame_size: usize,
    max_reactor_depth: usize,
    interrupt_signal: i32,
    signal_owner: SignalOwner,
}

impl Default for HandleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleBuilder {
    pub fn new() -> Self {
        Self {
            uri: None,
            codec: Box::new(BinaryCodec),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_reactor_depth: DEFAULT_MAX_REACTOR_DEPTH,
            interrupt_signal: libc::SIGINT,
            signal_owner: SignalOwner::MainThread,
        }
    }

    /// Broker endpoint, `local:///path` or `fd://N`.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Largest frame accepted from the broker; bigger frames fail the connection.
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// How deeply `run_reactor` (and waits inside callbacks) may nest.
    pub fn max_reactor_depth(mut self, depth: usize) -> Self {
        self.max_reactor_depth = depth.max(1);
        self
    }

    /// Signal that interrupts a top-level `run_reactor`. Defaults to `SIGINT`.
    pub fn interrupt_signal(mut self, signum: i32) -> Self {
        self.interrupt_signal = signum;
        self
    }

    /// Lets the calling thread, rather than the main thread, install the
    /// interrupt handler.
    pub fn signals_on_current_thread(mut self) -> Self {
        self.signal_owner = SignalOwner::Thread(thread::current().id());
        self
    }

    /// Never installs the interrupt handler.
    pub fn without_signals(mut self) -> Self {
        self.signal_owner = SignalOwner::Disabled;
        self
    }

    /// Connects to the configured endpoint.
    ///
    /// A failed attempt is retried once to collect the OS diagnostic for the
    /// returned error.
    pub fn open(self) -> Result<Handle> {
        let uri = self
            .uri
            .clone()
            .ok_or_else(|| ConnectError::InvalidUri(String::new()))?;

        let stream = match connection::dial(&uri, false) {
            Ok(stream) => stream,
            Err(ConnectError::Unreachable { .. }) => connection::dial(&uri, true)?,
            Err(e) => return Err(e.into()),
        };

        Ok(self.from_stream(stream))
    }

    /// Builds a handle over an already connected stream.
    pub fn from_stream(self, stream: UnixStream) -> Handle {
        let connection = Connection::with_stream(stream, self.codec, self.max_frame_size);
        let config = Config {
            max_reactor_depth: self.max_reactor_depth,
            interrupt_signal: self.interrupt_signal,
            signal_owner: self.signal_owner,
        };

        Handle::new(connection, config)
    }
}
