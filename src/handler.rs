//! application-facing handler contract.

use std::any::Any;
use std::future::Future;
use std::rc::Rc;

/// the reasons the core can fail a request on a handler's behalf, without the
/// handler itself having returned an error through its own `Future`.
pub enum Failure<E> {
    /// the pending queue is already at `request_buffer_size`.
    BufferFull,
    /// the request sat at the head of the pending queue longer than the
    /// configured request timeout.
    Timeout,
    /// the handler's future resolved to `Err`.
    Handler(E),
    /// the call that constructs the handler's future panicked.
    Panic(Box<dyn Any>),
}

impl<E: std::fmt::Debug> std::fmt::Debug for Failure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferFull => f.write_str("Failure::BufferFull"),
            Self::Timeout => f.write_str("Failure::Timeout"),
            Self::Handler(e) => f.debug_tuple("Failure::Handler").field(e).finish(),
            Self::Panic(_) => f.write_str("Failure::Panic(..)"),
        }
    }
}

impl<E> Failure<E> {
    /// metrics/log tag for this failure. stable across releases; treat as part
    /// of the observability contract.
    pub fn class(&self) -> &'static str {
        match self {
            Self::BufferFull => "buffer_full",
            Self::Timeout => "timeout",
            Self::Handler(_) | Self::Panic(_) => "handler",
        }
    }
}

/// user-supplied request handler.
///
/// `process_request` may resolve synchronously (the returned future is
/// already `Poll::Ready` on first poll) or asynchronously; the core tells
/// these apart so a synchronous success arriving at an empty, writable queue
/// can skip the pending queue entirely. See [`crate::connection::Connection`]
/// for where that fast path lives.
pub trait RequestHandler<Req, Resp> {
    type Error;
    type Future: Future<Output = Result<Resp, Self::Error>> + 'static;

    fn process_request(&self, request: Rc<Req>) -> Self::Future;

    /// convert a failure into a protocol-visible response. must be total:
    /// a panic here is treated as a broken handler contract and is allowed to
    /// propagate out of the core rather than being masked.
    fn process_failure(&self, request: &Req, error: Failure<Self::Error>) -> Resp;
}
