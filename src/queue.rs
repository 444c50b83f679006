//! the pending queue: a FIFO of admitted requests, each either still awaiting
//! its handler or already holding a ready response, drained strictly in
//! arrival order.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::entry::{EntryState, PendingEntry};

pub(crate) struct PendingQueue<Req, Resp> {
    entries: VecDeque<PendingEntry<Req, Resp>>,
    next_seq: u64,
}

impl<Req, Resp> PendingQueue<Req, Resp> {
    pub(crate) fn new() -> Self {
        Self { entries: VecDeque::new(), next_seq: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// append a new `Awaiting` entry, returning its sequence number.
    pub(crate) fn push_awaiting(&mut self, request: Rc<Req>, created_at_ms: u64) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(PendingEntry {
            request,
            created_at_ms,
            seq,
            state: EntryState::Awaiting,
        });
        seq
    }

    /// append a new `Ready` entry directly: used for admission overflow and
    /// for handler completions (success, error, or panic) that are already
    /// known by the time the request is admitted.
    pub(crate) fn push_ready(
        &mut self,
        request: Rc<Req>,
        created_at_ms: u64,
        response: Resp,
        is_failure: bool,
        error_class: Option<&'static str>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(PendingEntry {
            request,
            created_at_ms,
            seq,
            state: EntryState::Ready { response, is_failure, error_class },
        });
    }

    /// transition the `Awaiting` entry identified by `seq` to `Ready`.
    /// returns `false` (no-op) if the entry is gone or already `Ready` --
    /// covers a completion racing a timeout, and a completion arriving after
    /// the connection (and its queue) has been discarded.
    pub(crate) fn complete(
        &mut self,
        seq: u64,
        response: Resp,
        is_failure: bool,
        error_class: Option<&'static str>,
    ) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.seq != seq {
                continue;
            }
            return match entry.state {
                EntryState::Awaiting => {
                    entry.state = EntryState::Ready { response, is_failure, error_class };
                    true
                }
                EntryState::Ready { .. } => false,
            };
        }
        false
    }

    /// whether `seq` still names a live `Awaiting` entry. used to short-circuit
    /// a late async completion before it converts a failure or touches
    /// metrics for an entry that no longer exists.
    pub(crate) fn contains_awaiting(&self, seq: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.seq == seq && matches!(e.state, EntryState::Awaiting))
    }

    pub(crate) fn head_is_ready(&self) -> bool {
        matches!(self.entries.front(), Some(e) if e.is_ready())
    }

    /// pop the head, which must be `Ready`. callers must check
    /// `head_is_ready` first.
    pub(crate) fn pop_ready_head(&mut self) -> (Rc<Req>, u64, Resp, bool, Option<&'static str>) {
        let entry = self.entries.pop_front().expect("pop_ready_head called on an empty queue");
        match entry.state {
            EntryState::Ready { response, is_failure, error_class } => {
                (entry.request, entry.created_at_ms, response, is_failure, error_class)
            }
            EntryState::Awaiting => unreachable!("pop_ready_head called with an Awaiting head"),
        }
    }

    /// `(seq, created_at_ms, request)` of the head entry, if it is still
    /// `Awaiting`. the idle sweep only ever needs to look at the head: arrival
    /// order is creation order, so no later entry can be older.
    pub(crate) fn head_awaiting(&self) -> Option<(u64, u64, Rc<Req>)> {
        match self.entries.front() {
            Some(e) if matches!(e.state, EntryState::Awaiting) => {
                Some((e.seq, e.created_at_ms, Rc::clone(&e.request)))
            }
            _ => None,
        }
    }

    /// drop every entry without draining them. returns how many were
    /// discarded, for `concurrent_requests` bookkeeping on close.
    pub(crate) fn discard_all(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}
