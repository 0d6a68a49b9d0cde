//! Outstanding requests, keyed by match-tag.
//!
//! Tags are slab indices plus one (tag 0 means "no tag"), so a tag is never
//! handed out twice while its future exists.

use std::collections::VecDeque;

use bytes::Bytes;

use super::{Continuation, FutureState};
use crate::error::FutureError;
use crate::service::ServiceHook;
use crate::utils::slab::Slab;

pub(crate) type Response = Result<Bytes, FutureError>;

pub(crate) struct FutureSlot {
    responses: VecDeque<Response>,
    streaming: bool,
    /// No further responses are accepted.
    finished: bool,
    /// The caller dropped its future; the slot only reserves the tag.
    abandoned: bool,
    continuation: Option<Continuation>,
    hook: Option<ServiceHook>,
}

impl FutureSlot {
    fn new(streaming: bool, hook: Option<ServiceHook>) -> Self {
        Self {
            responses: VecDeque::new(),
            streaming,
            finished: false,
            abandoned: false,
            continuation: None,
            hook,
        }
    }
}

/// What the handle must do after a future completes.
pub(crate) struct Completion {
    pub(crate) continuation: Option<Continuation>,
    pub(crate) hook: Option<(ServiceHook, bool)>,
}

pub(crate) struct FutureTable {
    slots: Slab<FutureSlot>,
}

fn tag_of(index: usize) -> u32 {
    index as u32 + 1
}

fn index_of(tag: u32) -> Option<usize> {
    (tag as usize).checked_sub(1)
}

impl FutureTable {
    pub(crate) fn new() -> Self {
        Self { slots: Slab::new() }
    }

    pub(crate) fn allocate(&mut self, streaming: bool, hook: Option<ServiceHook>) -> u32 {
        tag_of(self.slots.insert(FutureSlot::new(streaming, hook)))
    }

    /// Allocates a slot that is already fulfilled (requests sent without a response).
    pub(crate) fn allocate_fulfilled(&mut self, payload: Bytes) -> u32 {
        let mut slot = FutureSlot::new(false, None);
        slot.responses.push_back(Ok(payload));
        slot.finished = true;
        tag_of(self.slots.insert(slot))
    }

    fn slot_mut(&mut self, tag: u32) -> Option<&mut FutureSlot> {
        self.slots.get_mut(index_of(tag)?)
    }

    /// Number of live slots, including abandoned ones still awaiting an answer.
    pub(crate) fn outstanding(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn state(&self, tag: u32) -> FutureState {
        let slot = index_of(tag).and_then(|index| self.slots.get(index));
        match slot.and_then(|slot| slot.responses.front()) {
            None => FutureState::Pending,
            Some(Ok(payload)) => FutureState::Fulfilled(payload.clone()),
            Some(Err(error)) => FutureState::Failed(error.clone()),
        }
    }

    /// Releases the slot of a dropped future.
    ///
    /// A slot that may still receive responses (a pending request or an open
    /// stream) keeps its tag reserved until the broker finishes, so a late
    /// response cannot reach a newer future. Its service hook, if any, is
    /// still applied then.
    pub(crate) fn release(&mut self, tag: u32) -> Option<FutureSlot> {
        let index = index_of(tag)?;
        let slot = self.slots.get_mut(index)?;

        if !slot.finished {
            slot.abandoned = true;
            slot.responses.clear();
            return None;
        }

        self.slots.remove(index)
    }

    /// Frees a slot whose request never reached the broker.
    pub(crate) fn discard(&mut self, tag: u32) -> Option<FutureSlot> {
        self.slots.remove(index_of(tag)?)
    }

    /// Stores a continuation, or gives it back if a response is already there.
    pub(crate) fn attach(&mut self, tag: u32, continuation: Continuation) -> Option<Continuation> {
        match self.slot_mut(tag) {
            Some(slot) if slot.responses.is_empty() => {
                slot.continuation = Some(continuation);
                None
            }
            _ => Some(continuation),
        }
    }

    /// Records a response for `tag`.
    ///
    /// Returns `None` for unknown tags and for futures that already finished
    /// (duplicate responses).
    pub(crate) fn complete(&mut self, tag: u32, response: Response) -> Option<Completion> {
        let index = index_of(tag)?;
        let slot = self.slots.get_mut(index)?;
        if slot.finished {
            return None;
        }

        let ok = response.is_ok();
        if !slot.streaming || !ok {
            slot.finished = true;
        }

        let hook = slot.hook.take().map(|hook| (hook, ok));

        if slot.abandoned {
            tracing::debug!(tag, "dropping response for abandoned future");
            if slot.finished {
                self.slots.remove(index);
            }
            return Some(Completion {
                continuation: None,
                hook,
            });
        }

        slot.responses.push_back(response);
        Some(Completion {
            continuation: slot.continuation.take(),
            hook,
        })
    }

    /// Fails every pending future with `error`.
    pub(crate) fn fail_all(&mut self, error: FutureError) -> Vec<Completion> {
        let pending: Vec<u32> = self
            .slots
            .iter_mut()
            .filter(|(_, slot)| !slot.finished)
            .map(|(index, _)| tag_of(index))
            .collect();

        pending
            .into_iter()
            .filter_map(|tag| self.complete(tag, Err(error.clone())))
            .collect()
    }

    /// Drops the current response of a streaming future. Returns `false` if
    /// there was nothing to drop.
    pub(crate) fn reset(&mut self, tag: u32) -> bool {
        match self.slot_mut(tag) {
            Some(slot) if slot.responses.len() > 1 || (slot.streaming && !slot.finished) => {
                slot.responses.pop_front().is_some()
            }
            _ => false,
        }
    }
}
