//! Watchers: units of interest registered with a handle's reactor.
//!
//! A watcher is a tagged variant over four kinds ([`WatcherKind`]) plus a
//! callback. The [`Handle`] that created it owns it; callers only get a
//! [`Watcher`] token (an id and a weak handle reference). Dropping the token
//! never deregisters an active watcher: only [`Watcher::stop`],
//! [`Watcher::destroy`] or closing the handle do.
//!
//! Lifecycle: `Created -> Started -> Stopped -> ... -> Destroyed`. Every
//! `start` adds one reference to the reactor's active count and every `stop`
//! removes it.

pub(crate) mod glob;
pub(crate) mod table;

pub use glob::TopicGlob;

use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::time::Duration;

use crate::codec::{Message, TypeMask};
use crate::error::{Result, WatcherError};
use crate::handle::{Handle, HandleInner};
use crate::reactor::event::Interest;

/// Identifier of a watcher within its handle; ids grow in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherId(pub(crate) u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filter deciding which messages a message watcher receives.
///
/// Checked in order: type mask, topic glob, match-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    pub type_mask: TypeMask,
    pub topic: TopicGlob,
    /// `None` accepts any match-tag.
    pub match_tag: Option<u32>,
}

impl MessageFilter {
    /// Accepts every message.
    pub fn any() -> Self {
        Self {
            type_mask: TypeMask::ANY,
            topic: TopicGlob::any(),
            match_tag: None,
        }
    }

    /// Accepts events whose topic matches `pattern`.
    pub fn events(pattern: &str) -> Result<Self> {
        Ok(Self {
            type_mask: TypeMask::EVENT,
            topic: TopicGlob::new(pattern)?,
            match_tag: None,
        })
    }

    pub fn type_mask(mut self, type_mask: TypeMask) -> Self {
        self.type_mask = type_mask;
        self
    }

    pub fn topic(mut self, pattern: &str) -> Result<Self> {
        self.topic = TopicGlob::new(pattern)?;
        Ok(self)
    }

    pub fn match_tag(mut self, match_tag: u32) -> Self {
        self.match_tag = Some(match_tag);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.type_mask.contains(message.kind)
            && self.topic.matches(&message.topic)
            && self.match_tag.is_none_or(|tag| tag == message.matchtag)
    }
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self::any()
    }
}

/// The four kinds of watcher, each with its own parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherKind {
    Message(MessageFilter),
    /// Fires `after` the watcher starts, then every `repeat` (zero: once).
    Timer { after: Duration, repeat: Duration },
    Signal(i32),
    Fd { fd: RawFd, interest: Interest },
}

impl WatcherKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            WatcherKind::Message(_) => "message",
            WatcherKind::Timer { .. } => "timer",
            WatcherKind::Signal(_) => "signal",
            WatcherKind::Fd { .. } => "fd",
        }
    }
}

/// What made a watcher ready; passed to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Message(Message),
    Timer,
    Signal(i32),
    /// Readiness reported for the descriptor.
    Fd(Interest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// Callback contract shared by every watcher kind.
///
/// Returning `Err` stops the running reactor and makes `run_reactor` return
/// that error.
pub type Callback = dyn FnMut(&Handle, &Watcher, WatcherEvent) -> Result<()>;

/// Non-owning token for a watcher owned by a [`Handle`].
#[derive(Clone)]
pub struct Watcher {
    id: WatcherId,
    handle: Weak<HandleInner>,
}

impl Watcher {
    pub(crate) fn new(id: WatcherId, handle: Weak<HandleInner>) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    fn inner(&self) -> Result<std::rc::Rc<HandleInner>> {
        self.handle
            .upgrade()
            .ok_or(WatcherError::Destroyed(self.id.0).into())
    }

    /// Registers the watcher with the reactor.
    ///
    /// Fails with [`WatcherError::DuplicateRegistration`] if already started.
    pub fn start(&self) -> Result<()> {
        self.inner()?.start_watcher(self.id)
    }

    /// Deregisters the watcher. Stopping a watcher that is not started is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.inner()?.stop_watcher(self.id)
    }

    /// Stops the watcher and releases it from the handle.
    pub fn destroy(&self) -> Result<()> {
        self.inner()?.destroy_watcher(self.id)
    }

    pub fn state(&self) -> WatcherState {
        match self.handle.upgrade() {
            Some(inner) => inner.watcher_state(self.id),
            None => WatcherState::Destroyed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == WatcherState::Started
    }

    /// Wraps the token in a guard that destroys the watcher when dropped.
    pub fn guard(self) -> WatcherGuard {
        WatcherGuard(self)
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Scoped watcher: stopped and destroyed on every exit path of its scope.
pub struct WatcherGuard(Watcher);

impl WatcherGuard {
    pub fn watcher(&self) -> &Watcher {
        &self.0
    }
}

impl std::ops::Deref for WatcherGuard {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.0
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.destroy() {
            tracing::trace!(watcher = %self.0.id, error = %e, "watcher already gone at end of scope");
        }
    }
}
