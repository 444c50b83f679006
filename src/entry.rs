//! a single slot in the pending queue.

use std::rc::Rc;

pub(crate) struct PendingEntry<Req, Resp> {
    pub(crate) request: Rc<Req>,
    pub(crate) created_at_ms: u64,
    /// monotonically increasing id, assigned at insertion. `VecDeque` has no
    /// stable handles, so completion callbacks close over this instead of an
    /// index or a reference -- it also doubles as the idempotency guard for
    /// late/duplicate completions.
    pub(crate) seq: u64,
    pub(crate) state: EntryState<Resp>,
}

pub(crate) enum EntryState<Resp> {
    Awaiting,
    Ready {
        response: Resp,
        is_failure: bool,
        error_class: Option<&'static str>,
    },
}

impl<Req, Resp> PendingEntry<Req, Resp> {
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, EntryState::Ready { .. })
    }
}
