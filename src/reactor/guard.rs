//! Scoped guards that keep reactor bookkeeping balanced on every exit path.

use super::Reactor;
use crate::error::Result;
use crate::handle::Handle;
use crate::watcher::{Watcher, WatcherGuard};

/// Increments the nesting depth on entry and restores the prior depth on drop,
/// whether the scope returns normally, with an error, or by unwinding.
pub(crate) struct DepthGuard<'a> {
    reactor: &'a Reactor,
    prior: usize,
}

impl<'a> DepthGuard<'a> {
    pub(crate) fn enter(reactor: &'a Reactor) -> Self {
        let prior = reactor.depth();
        reactor.set_depth(prior + 1);
        Self { reactor, prior }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.reactor.set_depth(self.prior);
    }
}

/// Transient watcher for the termination signal during a top-level run.
///
/// The watcher is excluded from the active count while installed so it never
/// keeps the reactor alive by itself; it is counted again just before it is
/// destroyed so the count cannot underflow.
pub(crate) struct InterruptGuard {
    handle: Handle,
    watcher: Option<WatcherGuard>,
}

impl InterruptGuard {
    pub(crate) fn install(handle: &Handle, signum: i32) -> Result<Self> {
        let watcher = handle
            .signal_watcher_create(signum, |handle, _watcher, _event| {
                tracing::debug!("reactor interrupted");
                handle.reactor().interrupt();
                Ok(())
            })?
            .guard();

        watcher.start()?;
        handle.set_watcher_counted(&watcher, false);

        Ok(Self {
            handle: handle.clone(),
            watcher: Some(watcher),
        })
    }

    fn watcher(&self) -> Option<&Watcher> {
        self.watcher.as_ref().map(|guard| guard.watcher())
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher() {
            self.handle.set_watcher_counted(watcher, true);
        }
        // Dropping the inner guard stops and destroys the watcher.
        self.watcher.take();
    }
}
