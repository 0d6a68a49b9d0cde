//! Pending results of requests sent to the broker.
//!
//! A [`Future`] is identified on the wire by its match-tag. It can be waited
//! on synchronously, or given a continuation that fires from the reactor.
//! It includes:
//! - [`table`]: match-tag allocation and response bookkeeping

pub(crate) mod table;

use std::fmt;
use std::ops::BitOr;
use std::rc::Weak;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{FutureError, ReactorError, Result, SendError};
use crate::handle::{Handle, HandleInner};
use crate::reactor::core::{self, Progress};
use crate::reactor::guard::DepthGuard;

/// Observable state of a [`Future`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Fulfilled(Bytes),
    Failed(FutureError),
}

/// How long [`Future::wait`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Timeout::Forever, Timeout::After)
    }
}

/// Seconds; negative values, and values too large for a [`Duration`], wait
/// forever.
impl From<f64> for Timeout {
    fn from(seconds: f64) -> Self {
        if seconds < 0.0 {
            return Timeout::Forever;
        }
        Duration::try_from_secs_f64(seconds).map_or(Timeout::Forever, Timeout::After)
    }
}

/// Flags accepted by [`Handle::rpc_with`](crate::Handle::rpc_with).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RpcFlags(u8);

impl RpcFlags {
    pub const NONE: RpcFlags = RpcFlags(0);
    /// The broker may answer several times; the stream ends with `ENODATA`.
    pub const STREAMING: RpcFlags = RpcFlags(0x1);
    /// No response is expected; the returned future is already fulfilled.
    pub const NORESPONSE: RpcFlags = RpcFlags(0x2);

    pub fn contains(self, other: RpcFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RpcFlags {
    type Output = RpcFlags;

    fn bitor(self, rhs: RpcFlags) -> RpcFlags {
        RpcFlags(self.0 | rhs.0)
    }
}

type ContinuationFn = dyn FnOnce(&Handle, Future) -> Result<()>;

/// A continuation waiting for its future, or queued to run on the next
/// reactor iteration.
pub(crate) struct Continuation {
    callback: Box<ContinuationFn>,
    future: Future,
}

impl Continuation {
    pub(crate) fn fire(self, handle: &Handle) -> Result<()> {
        (self.callback)(handle, self.future)
    }
}

/// Result of an outstanding request.
///
/// Dropping a future releases its match-tag; a response arriving afterwards
/// is discarded.
pub struct Future {
    tag: u32,
    handle: Weak<HandleInner>,
}

impl Future {
    pub(crate) fn new(tag: u32, handle: Weak<HandleInner>) -> Self {
        Self { tag, handle }
    }

    /// Match-tag carried by the request and its responses.
    pub fn match_tag(&self) -> u32 {
        self.tag
    }

    pub fn state(&self) -> FutureState {
        match self.handle.upgrade() {
            Some(inner) => inner.futures.borrow().state(self.tag),
            None => FutureState::Failed(FutureError::ConnectionLost),
        }
    }

    /// True once a response (or failure) is available.
    pub fn is_ready(&self) -> bool {
        !matches!(self.state(), FutureState::Pending)
    }

    /// Returns the response if it is already available, without blocking.
    pub fn get(&self) -> Option<Result<Bytes>> {
        match self.state() {
            FutureState::Pending => None,
            FutureState::Fulfilled(payload) => Some(Ok(payload)),
            FutureState::Failed(error) => Some(Err(error.into())),
        }
    }

    /// Blocks until the response arrives or `timeout` passes.
    ///
    /// Inside a reactor callback this runs nested iterations, so other
    /// watchers keep being serviced. A timeout leaves the future pending and
    /// it can be waited on again.
    pub fn wait(&self, timeout: impl Into<Timeout>) -> Result<Bytes> {
        let inner = self.handle.upgrade().ok_or(FutureError::ConnectionLost)?;
        let handle = Handle::from_inner(inner);
        // A deadline past the representable range is no deadline.
        let deadline = match timeout.into() {
            Timeout::Forever => None,
            Timeout::After(duration) => Instant::now().checked_add(duration),
        };

        let nested = handle.reactor().depth() > 0;
        if nested {
            let depth = handle.reactor().depth();
            if depth >= handle.inner().config.max_reactor_depth {
                return Err(ReactorError::AlreadyRunning { depth }.into());
            }
        }

        let mut expired = false;
        loop {
            match self.state() {
                FutureState::Fulfilled(payload) => return Ok(payload),
                FutureState::Failed(error) => return Err(error.into()),
                FutureState::Pending => {}
            }
            if expired {
                return Err(FutureError::Timeout.into());
            }

            // Once the deadline has passed, one last poll without blocking
            // picks up anything already sitting on the connection.
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            expired = remaining == Some(Duration::ZERO);

            if nested {
                let _depth = DepthGuard::enter(handle.reactor());
                let block = !expired;
                if core::iterate(&handle, block, remaining)? == Progress::Stalled {
                    return Err(FutureError::ConnectionLost.into());
                }
            } else if !handle.inner().pump(remaining)? {
                return Err(FutureError::ConnectionLost.into());
            }
        }
    }

    /// Registers `callback` to run from the reactor once the response is
    /// available. The callback receives this future back.
    ///
    /// The continuation holds a reactor reference until it fires, so a
    /// running reactor does not exit while it is pending.
    pub fn then<F>(self, callback: F) -> Result<()>
    where
        F: FnOnce(&Handle, Future) -> Result<()> + 'static,
    {
        let inner = self.handle.upgrade().ok_or(SendError::ConnectionClosed)?;
        let tag = self.tag;
        let continuation = Continuation {
            callback: Box::new(callback),
            future: self,
        };

        inner.reactor.incref();
        let ready = inner.futures.borrow_mut().attach(tag, continuation);
        if let Some(continuation) = ready {
            inner.reactor.defer(continuation);
        }
        Ok(())
    }

    /// Moves a streaming future on to its next response. Returns `false` if
    /// there is no further response to move to.
    pub fn reset(&self) -> bool {
        self.handle
            .upgrade()
            .is_some_and(|inner| inner.futures.borrow_mut().reset(self.tag))
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("match_tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Future {
    fn drop(&mut self) {
        let Some(inner) = self.handle.upgrade() else {
            return;
        };

        // The released slot may own a continuation holding other futures;
        // drop it after the table borrow ends.
        let released = match inner.futures.try_borrow_mut() {
            Ok(mut futures) => futures.release(self.tag),
            Err(_) => {
                tracing::warn!(tag = self.tag, "future dropped while table was busy, tag leaked");
                None
            }
        };
        drop(released);
    }
}
