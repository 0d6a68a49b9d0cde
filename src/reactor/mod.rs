//! Single-threaded cooperative reactor.
//!
//! The reactor state lives in [`Reactor`] and is owned by a handle; the loop
//! itself ([`core::run`]) borrows the handle so callbacks can reenter it. It
//! includes:
//! - [`core`]: the run loop, one iteration and callback dispatch
//! - [`event`]: `poll(2)` wrapper and readiness masks
//! - [`guard`]: scoped nesting and interrupt guards
//! - [`signal`]: process-wide signal self-pipes

pub(crate) mod core;
pub(crate) mod event;
pub(crate) mod guard;
pub(crate) mod signal;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;

use crate::future::Continuation;
use signal::SignalPipe;

/// Flags accepted by [`Handle::run_reactor`](crate::Handle::run_reactor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunFlags(u8);

impl RunFlags {
    /// Run until stopped or no active watchers remain.
    pub const NONE: RunFlags = RunFlags(0);
    /// One iteration without blocking.
    pub const NOWAIT: RunFlags = RunFlags(0x1);
    /// One iteration, blocking until something is ready.
    pub const ONCE: RunFlags = RunFlags(0x2);
    /// Do not install the interrupt watcher, even on the signal-owning thread.
    pub const NO_INTERRUPT: RunFlags = RunFlags(0x4);

    pub fn contains(self, other: RunFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for RunFlags {
    type Output = RunFlags;

    fn bitor(self, rhs: Self) -> Self {
        RunFlags(self.0 | rhs.0)
    }
}

/// How a reactor run ended. `active` is the reference count left on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No active references remained, or the single iteration requested by
    /// `NOWAIT`/`ONCE` finished.
    Completed { active: usize },
    /// A callback called `reactor_stop`.
    Stopped { active: usize },
    /// A callback called `reactor_stop_error`.
    StoppedError { active: usize },
    /// The termination signal arrived.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    Normal,
    Error,
}

pub(crate) struct Reactor {
    active: Cell<usize>,
    depth: Cell<usize>,
    stop: Cell<Option<StopKind>>,
    interrupted: Cell<bool>,
    deferred: RefCell<VecDeque<Continuation>>,
    signals: RefCell<Option<SignalPipe>>,
}

impl Reactor {
    pub(crate) fn new() -> Self {
        Self {
            active: Cell::new(0),
            depth: Cell::new(0),
            stop: Cell::new(None),
            interrupted: Cell::new(false),
            deferred: RefCell::new(VecDeque::new()),
            signals: RefCell::new(None),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.get()
    }

    pub(crate) fn incref(&self) {
        self.active.set(self.active.get() + 1);
    }

    pub(crate) fn decref(&self) {
        match self.active.get().checked_sub(1) {
            Some(active) => self.active.set(active),
            None => tracing::warn!("reactor reference count underflow ignored"),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.get()
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        self.depth.set(depth);
    }

    pub(crate) fn stop(&self, kind: StopKind) {
        self.stop.set(Some(kind));
    }

    pub(crate) fn take_stop(&self) -> Option<StopKind> {
        self.stop.take()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.get().is_some()
    }

    /// Marks the run as interrupted; every nesting level unwinds.
    pub(crate) fn interrupt(&self) {
        self.interrupted.set(true);
        self.stop(StopKind::Normal);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.get()
    }

    pub(crate) fn clear_interrupted(&self) {
        self.interrupted.set(false);
    }

    pub(crate) fn defer(&self, continuation: Continuation) {
        self.deferred.borrow_mut().push_back(continuation);
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.borrow().is_empty()
    }

    /// Takes the continuations queued so far; later ones wait for the next iteration.
    pub(crate) fn take_deferred(&self) -> VecDeque<Continuation> {
        std::mem::take(&mut *self.deferred.borrow_mut())
    }

    /// Puts unfired continuations back ahead of anything queued since.
    pub(crate) fn requeue_deferred(&self, mut unfired: VecDeque<Continuation>) {
        let mut deferred = self.deferred.borrow_mut();
        unfired.extend(deferred.drain(..));
        *deferred = unfired;
    }

    pub(crate) fn subscribe_signal(&self, signum: i32) -> io::Result<()> {
        let mut signals = self.signals.borrow_mut();
        if signals.is_none() {
            *signals = Some(SignalPipe::open()?);
        }
        match signals.as_mut() {
            Some(pipe) => pipe.subscribe(signum),
            None => Ok(()),
        }
    }

    pub(crate) fn unsubscribe_signal(&self, signum: i32) {
        if let Some(pipe) = self.signals.borrow_mut().as_mut() {
            pipe.unsubscribe(signum);
        }
    }

    pub(crate) fn signal_fd(&self) -> Option<RawFd> {
        self.signals
            .borrow()
            .as_ref()
            .filter(|pipe| pipe.has_subscriptions())
            .map(|pipe| pipe.read_fd())
    }

    pub(crate) fn drain_signals(&self) -> Vec<i32> {
        self.signals
            .borrow()
            .as_ref()
            .map(|pipe| pipe.drain())
            .unwrap_or_default()
    }
}
