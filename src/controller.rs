//! transport-facing capability the core writes responses through.

use std::future::Future;

/// outcome of a single push, once the transport has actually attempted to
/// write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// the response was written to the transport.
    Written,
    /// the transport could not write the response (connection reset,
    /// encoder error, etc). the core logs and counts this; it does not retry.
    WriteFailed,
}

/// everything the core needs from the transport side of a connection. framing,
/// the socket event loop, and the output buffer all live on the other side of
/// this trait -- the core only asks whether it may write
/// ([`Controller::can_push`]), hands over a response to write
/// ([`Controller::push`]), and asks for reads to stop or the connection to
/// close.
pub trait Controller<Resp> {
    type PushFuture: Future<Output = PushResult> + 'static;

    /// `false` means the transport's output buffer is saturated; the core
    /// stops draining until a previously issued push resolves.
    fn can_push(&self) -> bool;

    /// write `response` to the transport. never called when `can_push`
    /// returned `false` on the immediately preceding check.
    fn push(&self, response: Resp) -> Self::PushFuture;

    /// stop accepting new reads from the transport. part of the graceful
    /// shutdown handshake; see [`crate::connection::Connection::graceful_disconnect`].
    fn pause_reads(&self);

    /// the connection has fully drained and may be closed.
    fn close_gracefully(&self);
}
