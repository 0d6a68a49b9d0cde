//! Handle-owned storage for watchers.
//!
//! Entries are kept in registration order (ids only grow), which is the
//! dispatch tie-break between watchers ready in the same iteration. Each
//! entry queues its own readiness events; the reactor pops them one at a
//! time and invokes the callback once per event.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::{Callback, WatcherEvent, WatcherId, WatcherKind, WatcherState};
use crate::codec::Message;
use crate::error::{Result, WatcherError};
use crate::reactor::Reactor;
use crate::reactor::event::{Interest, PollSet, Source};
use crate::timer::TimerState;

pub(crate) type SharedCallback = Rc<RefCell<Box<Callback>>>;

struct WatcherEntry {
    kind: WatcherKind,
    state: WatcherState,
    /// Whether a started entry holds a reference on the reactor.
    counted: bool,
    timer: Option<TimerState>,
    callback: SharedCallback,
    pending: VecDeque<WatcherEvent>,
}

impl WatcherEntry {
    fn is_started(&self) -> bool {
        self.state == WatcherState::Started
    }
}

pub(crate) struct WatcherTable {
    next_id: u64,
    entries: BTreeMap<WatcherId, WatcherEntry>,
}

impl WatcherTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, kind: WatcherKind, callback: Box<Callback>) -> WatcherId {
        let id = WatcherId(self.next_id);
        self.next_id += 1;

        let timer = match &kind {
            WatcherKind::Timer { after, repeat } => Some(TimerState::new(*after, *repeat)),
            _ => None,
        };

        tracing::trace!(watcher = %id, kind = kind.label(), "watcher created");
        self.entries.insert(
            id,
            WatcherEntry {
                kind,
                state: WatcherState::Created,
                counted: true,
                timer,
                callback: Rc::new(RefCell::new(callback)),
                pending: VecDeque::new(),
            },
        );

        id
    }

    pub(crate) fn state(&self, id: WatcherId) -> WatcherState {
        self.entries
            .get(&id)
            .map(|entry| entry.state)
            .unwrap_or(WatcherState::Destroyed)
    }

    fn entry_mut(&mut self, id: WatcherId) -> Result<&mut WatcherEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| WatcherError::Destroyed(id.0).into())
    }

    pub(crate) fn start(&mut self, id: WatcherId, reactor: &Reactor) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.is_started() {
            return Err(WatcherError::DuplicateRegistration(id.0).into());
        }

        if let WatcherKind::Signal(signum) = entry.kind {
            reactor.subscribe_signal(signum)?;
        }
        if let Some(timer) = entry.timer.as_mut() {
            timer.arm(Instant::now());
        }

        entry.state = WatcherState::Started;
        if entry.counted {
            reactor.incref();
        }

        tracing::trace!(watcher = %id, active = reactor.active(), "watcher started");
        Ok(())
    }

    pub(crate) fn stop(&mut self, id: WatcherId, reactor: &Reactor) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.pending.clear();
        if !entry.is_started() {
            return Ok(());
        }

        Self::deactivate(entry, reactor);
        tracing::trace!(watcher = %id, active = reactor.active(), "watcher stopped");
        Ok(())
    }

    fn deactivate(entry: &mut WatcherEntry, reactor: &Reactor) {
        entry.state = WatcherState::Stopped;
        if let Some(timer) = entry.timer.as_mut() {
            timer.disarm();
        }
        if let WatcherKind::Signal(signum) = entry.kind {
            reactor.unsubscribe_signal(signum);
        }
        if entry.counted {
            reactor.decref();
        }
    }

    pub(crate) fn remove(&mut self, id: WatcherId, reactor: &Reactor) -> Result<()> {
        self.stop(id, reactor)?;
        self.entries.remove(&id);
        tracing::trace!(watcher = %id, "watcher destroyed");
        Ok(())
    }

    /// Includes or excludes a watcher from the reactor's active count,
    /// adjusting the count if the watcher is currently started.
    pub(crate) fn set_counted(&mut self, id: WatcherId, counted: bool, reactor: &Reactor) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.counted == counted {
            return;
        }

        entry.counted = counted;
        if entry.is_started() {
            if counted {
                reactor.incref();
            } else {
                reactor.decref();
            }
        }
    }

    pub(crate) fn kind(&self, id: WatcherId) -> Option<&WatcherKind> {
        self.entries.get(&id).map(|entry| &entry.kind)
    }

    pub(crate) fn ids(&self) -> Vec<WatcherId> {
        self.entries.keys().copied().collect()
    }

    /// Queues `message` on the first started message watcher that accepts it.
    ///
    /// Gives the message back if no watcher matches.
    pub(crate) fn offer_message(&mut self, message: Message) -> std::result::Result<WatcherId, Message> {
        let target = self.entries.iter_mut().find(|(_, entry)| {
            entry.is_started()
                && matches!(&entry.kind, WatcherKind::Message(filter) if filter.matches(&message))
        });

        match target {
            Some((id, entry)) => {
                entry.pending.push_back(WatcherEvent::Message(message));
                Ok(*id)
            }
            None => Err(message),
        }
    }

    pub(crate) fn fill_interest(&self, set: &mut PollSet) {
        for (id, entry) in &self.entries {
            if let (true, WatcherKind::Fd { fd, interest }) = (entry.is_started(), &entry.kind) {
                set.add(*fd, *interest, Source::Watcher(*id));
            }
        }
    }

    pub(crate) fn raise_fd(&mut self, id: WatcherId, revents: Interest) {
        if let Some(entry) = self.entries.get_mut(&id)
            && entry.is_started()
        {
            entry.pending.push_back(WatcherEvent::Fd(revents));
        }
    }

    pub(crate) fn raise_signal(&mut self, signum: i32) {
        for entry in self.entries.values_mut() {
            if entry.is_started() && entry.kind == WatcherKind::Signal(signum) {
                entry.pending.push_back(WatcherEvent::Signal(signum));
            }
        }
    }

    /// Queues expired timers; one-shot timers stop themselves but still deliver.
    pub(crate) fn fire_timers(&mut self, now: Instant, reactor: &Reactor) {
        for (id, entry) in self.entries.iter_mut() {
            if !entry.is_started() {
                continue;
            }
            let Some(timer) = entry.timer.as_mut() else {
                continue;
            };
            if !timer.fire(now) {
                continue;
            }

            let repeating = timer.is_repeating();
            entry.pending.push_back(WatcherEvent::Timer);
            if !repeating {
                Self::deactivate(entry, reactor);
                tracing::trace!(watcher = %id, "one-shot timer expired");
            }
        }
    }

    /// Time until the earliest armed timer.
    pub(crate) fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .filter(|entry| entry.is_started())
            .filter_map(|entry| entry.timer.as_ref()?.remaining(now))
            .min()
    }

    /// True if some queued event can be delivered right now.
    ///
    /// Events for a watcher whose callback is already running further up the
    /// stack wait until that callback returns.
    pub(crate) fn has_dispatchable(&self) -> bool {
        self.entries
            .values()
            .any(|entry| !entry.pending.is_empty() && entry.callback.try_borrow_mut().is_ok())
    }

    pub(crate) fn ready_ids(&self) -> Vec<WatcherId> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.pending.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn pop_event(&mut self, id: WatcherId) -> Option<(SharedCallback, WatcherEvent)> {
        let entry = self.entries.get_mut(&id)?;
        let event = entry.pending.pop_front()?;
        Some((entry.callback.clone(), event))
    }

    pub(crate) fn requeue_front(&mut self, id: WatcherId, event: WatcherEvent) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pending.push_front(event);
        }
    }
}
