use std::rc::Rc;
use std::time::{Duration, Instant};

use super::event::{Interest, PollSet, Source};
use super::{RunFlags, RunOutcome, StopKind};
use crate::error::Result;
use crate::handle::Handle;
use crate::watcher::Watcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Ran,
    /// Nothing is pollable and no timer is armed; blocking would never return.
    Stalled,
}

/// Runs the loop until the active count drops to zero, a callback stops it,
/// the termination signal arrives, or a callback fails.
///
/// The caller owns the depth and interrupt guards; this only loops.
pub(crate) fn run(handle: &Handle, flags: RunFlags) -> Result<RunOutcome> {
    let reactor = handle.reactor();
    let single = flags.contains(RunFlags::NOWAIT) || flags.contains(RunFlags::ONCE);
    let block = !flags.contains(RunFlags::NOWAIT);
    let mut iterated = false;

    loop {
        if reactor.is_interrupted() {
            reactor.take_stop();
            return Ok(RunOutcome::Interrupted);
        }

        match reactor.take_stop() {
            Some(StopKind::Normal) => {
                return Ok(RunOutcome::Stopped {
                    active: reactor.active(),
                });
            }
            Some(StopKind::Error) => {
                return Ok(RunOutcome::StoppedError {
                    active: reactor.active(),
                });
            }
            None => {}
        }

        if reactor.active() == 0 || (single && iterated) {
            return Ok(RunOutcome::Completed {
                active: reactor.active(),
            });
        }

        let progress = match iterate(handle, block, None) {
            Ok(progress) => progress,
            Err(e) => {
                // A failed callback's stop request belongs to this run only.
                reactor.take_stop();
                return Err(e);
            }
        };
        iterated = true;

        if progress == Progress::Stalled {
            tracing::warn!(
                active = reactor.active(),
                "reactor has active references but nothing to wait on"
            );
            return Ok(RunOutcome::Completed {
                active: reactor.active(),
            });
        }
    }
}

/// One loop iteration: poll, collect readiness, dispatch callbacks, then fire
/// continuations that were queued before this pass.
///
/// `max_wait` bounds the time spent blocked in `poll`.
pub(crate) fn iterate(handle: &Handle, block: bool, max_wait: Option<Duration>) -> Result<Progress> {
    let inner = handle.inner();
    let reactor = handle.reactor();

    let immediate = reactor.has_deferred()
        || inner.has_inbound()
        || inner.watchers.borrow().has_dispatchable();

    let mut timeout = if immediate || !block {
        Some(Duration::ZERO)
    } else {
        inner.watchers.borrow().next_deadline(Instant::now())
    };
    if let Some(max) = max_wait {
        timeout = Some(timeout.map_or(max, |t| t.min(max)));
    }

    let mut set = PollSet::new();
    if let Some(fd) = inner.connection.borrow().pollable_fd() {
        set.add(fd, Interest::READABLE, Source::Connection);
    }
    if let Some(fd) = reactor.signal_fd() {
        set.add(fd, Interest::READABLE, Source::Signals);
    }
    inner.watchers.borrow().fill_interest(&mut set);

    if set.is_empty() && timeout.is_none() {
        return Ok(Progress::Stalled);
    }

    set.wait(timeout)?;

    for (source, revents) in set.ready() {
        match source {
            Source::Connection => inner.receive_ready(),
            Source::Signals => {
                for signum in reactor.drain_signals() {
                    inner.watchers.borrow_mut().raise_signal(signum);
                }
            }
            Source::Watcher(id) => inner.watchers.borrow_mut().raise_fd(id, revents),
        }
    }

    inner.route_inbound();
    inner
        .watchers
        .borrow_mut()
        .fire_timers(Instant::now(), reactor);

    dispatch(handle)?;
    run_deferred(handle)?;

    Ok(Progress::Ran)
}

/// Invokes callbacks for queued watcher events in registration order, one
/// invocation per event. Stops early once a stop has been requested.
fn dispatch(handle: &Handle) -> Result<()> {
    let inner = handle.inner();
    let reactor = handle.reactor();
    let ids = inner.watchers.borrow().ready_ids();

    for id in ids {
        loop {
            if reactor.stop_requested() {
                return Ok(());
            }

            let next = inner.watchers.borrow_mut().pop_event(id);
            let Some((callback, event)) = next else {
                break;
            };

            // The callback is busy further up the stack (nested run); the
            // event waits until it returns.
            let Ok(mut callback) = callback.try_borrow_mut() else {
                inner.watchers.borrow_mut().requeue_front(id, event);
                break;
            };

            let watcher = Watcher::new(id, Rc::downgrade(inner));
            (&mut **callback)(handle, &watcher, event)?;
        }
    }

    Ok(())
}

fn run_deferred(handle: &Handle) -> Result<()> {
    let reactor = handle.reactor();
    let mut batch = reactor.take_deferred();

    while let Some(continuation) = batch.pop_front() {
        reactor.decref();

        if let Err(e) = continuation.fire(handle) {
            reactor.requeue_deferred(batch);
            return Err(e);
        }
        if reactor.stop_requested() {
            reactor.requeue_deferred(batch);
            return Ok(());
        }
    }

    Ok(())
}
