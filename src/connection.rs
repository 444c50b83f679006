//! the per-connection pipelining state machine.
//!
//! a single `Rc<RefCell<_>>` holds all mutable state, completions are
//! delivered by spawning onto the current `LocalSet` with
//! [`tokio::task::spawn_local`], and the dispatcher itself never blocks on a
//! handler -- it either observes a synchronous result on the first poll or
//! hands the rest of the work to a spawned task and moves on. `Connection`
//! is cheap to clone (two `Rc`s) and every clone refers to the same
//! underlying connection.

use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::config::ServiceConfig;
use crate::controller::{Controller, PushResult};
use crate::error::CoreError;
use crate::handler::{Failure, RequestHandler};
use crate::queue::PendingQueue;

struct Shared<H, C, Req, Resp> {
    handler: H,
    controller: C,
    config: ServiceConfig<Req, Resp>,
    clock: Box<dyn Clock>,
    metrics: crate::metrics::Metrics,
}

struct Inner<Req, Resp> {
    queue: PendingQueue<Req, Resp>,
    /// set once by `graceful_disconnect`/`shutdown_request`; only ever read
    /// from `drain`/`maybe_close`, never checked synchronously inside
    /// `graceful_disconnect` itself -- doing so could close a connection out
    /// from under a request that was admitted moments earlier.
    disconnecting: bool,
    /// set when `controller.can_push()` stopped draining; cleared once a
    /// push resolves.
    drain_paused: bool,
    /// pushes issued via `push_checked` that have not yet resolved, whether
    /// from the fast path or from `drain_inner`'s loop. `maybe_close` must
    /// wait for this to hit zero too -- the fast path never occupies a
    /// pending-queue slot, so `queue.is_empty()` alone can't see a push still
    /// in flight.
    inflight_pushes: usize,
    closed: bool,
    num_requests: u64,
}

impl<Req, Resp> Inner<Req, Resp> {
    fn new() -> Self {
        Self {
            queue: PendingQueue::new(),
            disconnecting: false,
            drain_paused: false,
            inflight_pushes: 0,
            closed: false,
            num_requests: 0,
        }
    }
}

/// the pipelining core for one connection.
///
/// `H` is the [`RequestHandler`], `C` is the transport-facing
/// [`Controller`]. Clone is cheap: it shares the same underlying state.
pub struct Connection<H, C, Req, Resp>
where
    H: RequestHandler<Req, Resp>,
    C: Controller<Resp>,
{
    shared: Rc<Shared<H, C, Req, Resp>>,
    inner: Rc<RefCell<Inner<Req, Resp>>>,
}

impl<H, C, Req, Resp> Clone for Connection<H, C, Req, Resp>
where
    H: RequestHandler<Req, Resp>,
    C: Controller<Resp>,
{
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<H, C, Req, Resp> Connection<H, C, Req, Resp>
where
    H: RequestHandler<Req, Resp> + 'static,
    C: Controller<Resp> + 'static,
    Req: std::fmt::Debug + 'static,
    Resp: 'static,
{
    /// construct a connection with a real wall clock.
    pub fn new(handler: H, controller: C, config: ServiceConfig<Req, Resp>) -> Self {
        Self::with_clock(handler, controller, config, MonotonicClock::new())
    }

    /// construct a connection with an injected clock, for tests that need
    /// control over request age.
    pub fn with_clock(handler: H, controller: C, config: ServiceConfig<Req, Resp>, clock: impl Clock + 'static) -> Self {
        let metrics = crate::metrics::Metrics::new(config.name.clone());
        Self {
            shared: Rc::new(Shared {
                handler,
                controller,
                config,
                clock: Box::new(clock),
                metrics,
            }),
            inner: Rc::new(RefCell::new(Inner::new())),
        }
    }

    /// number of requests admitted but not yet drained.
    pub fn pending_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// admit one request. must be called in arrival order; this is the sole
    /// source of ordering for everything downstream.
    pub fn process_message(&self, request: Req) {
        let req = Rc::new(request);
        let now;
        {
            let mut state = self.inner.borrow_mut();
            if state.closed {
                return;
            }
            state.num_requests += 1;
            now = self.shared.clock.now_ms();

            if state.queue.len() >= self.shared.config.request_buffer_size.get() {
                drop(state);
                self.fail_immediately(req, now, Failure::BufferFull);
                return;
            }
        }

        let fast_path_eligible = {
            let state = self.inner.borrow();
            state.queue.is_empty()
        } && self.shared.controller.can_push();

        let call_result =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.shared.handler.process_request(Rc::clone(&req))));

        let mut fut = match call_result {
            Ok(fut) => Box::pin(fut),
            Err(payload) => {
                self.fail_immediately(req, now, Failure::Panic(payload));
                return;
            }
        };

        match poll_once(fut.as_mut()) {
            Some(Ok(resp)) if fast_path_eligible => self.push_fast(req, now, resp),
            Some(Ok(resp)) => self.enqueue_ready(req, now, resp, false, None),
            Some(Err(e)) => self.fail_immediately(req, now, Failure::Handler(e)),
            None => {
                let seq = {
                    let mut state = self.inner.borrow_mut();
                    state.queue.push_awaiting(Rc::clone(&req), now)
                };
                self.shared.metrics.concurrent_requests(1);

                let conn = self.clone();
                tokio::task::spawn_local(async move {
                    let result = fut.await;
                    conn.on_async_result(seq, req, result);
                });
            }
        }
    }

    /// true fast path: a synchronously successful response to a request that
    /// found an empty, writable queue is pushed directly, with no pending
    /// entry ever allocated and no `concurrent_requests` increment/decrement
    /// pair emitted.
    fn push_fast(&self, req: Rc<Req>, created_at_ms: u64, resp: Resp) {
        self.emit_request_metrics(&req, &resp, created_at_ms);
        let Some(fut) = self.push_checked(resp) else { return };
        let conn = self.clone();
        tokio::task::spawn_local(async move {
            let result = fut.await;
            conn.on_push_result(result);
            conn.drain();
        });
    }

    /// append a `Ready` entry (overflow, synchronous failure, or a
    /// synchronous success that missed the fast path) and drain.
    fn enqueue_ready(
        &self,
        req: Rc<Req>,
        created_at_ms: u64,
        resp: Resp,
        is_failure: bool,
        error_class: Option<&'static str>,
    ) {
        {
            let mut state = self.inner.borrow_mut();
            if state.closed {
                return;
            }
            state.queue.push_ready(req, created_at_ms, resp, is_failure, error_class);
        }
        self.shared.metrics.concurrent_requests(1);
        self.drain();
    }

    fn fail_immediately(&self, req: Rc<Req>, created_at_ms: u64, failure: Failure<H::Error>) {
        let class = failure.class();
        let resp = self.convert_failure(&req, failure);
        self.log_failure(&req, class);
        self.enqueue_ready(req, created_at_ms, resp, true, Some(class));
    }

    /// result of an asynchronously completed handler future.
    fn on_async_result(&self, seq: u64, req: Rc<Req>, result: Result<Resp, H::Error>) {
        let still_live = {
            let state = self.inner.borrow();
            !state.closed && state.queue.contains_awaiting(seq)
        };
        if !still_live {
            // connection closed, or this entry already completed/timed out:
            // no push, no metric mutation, per the late-completion contract.
            return;
        }

        let (resp, is_failure, error_class) = match result {
            Ok(resp) => (resp, false, None),
            Err(e) => {
                let class = "handler";
                let resp = self.convert_failure(&req, Failure::Handler(e));
                self.log_failure(&req, class);
                (resp, true, Some(class))
            }
        };

        let transitioned = {
            let mut state = self.inner.borrow_mut();
            if state.closed {
                false
            } else {
                state.queue.complete(seq, resp, is_failure, error_class)
            }
        };
        if transitioned {
            self.drain();
        }
    }

    /// periodic idle sweep: fail the head of the queue with
    /// [`Failure::Timeout`] while it is `Awaiting` and older than
    /// `request_timeout`. only the head is ever inspected -- arrival order is
    /// creation order, so no later entry can be older than the head.
    pub fn idle_check(&self, _period: Duration) {
        let Some(timeout) = self.shared.config.request_timeout else {
            return;
        };
        let timeout_ms = timeout.as_millis() as u64;
        loop {
            let now = self.shared.clock.now_ms();
            let head = {
                let state = self.inner.borrow();
                if state.closed {
                    return;
                }
                state.queue.head_awaiting()
            };
            let Some((seq, created_at_ms, req)) = head else {
                return;
            };
            if now.saturating_sub(created_at_ms) <= timeout_ms {
                return;
            }

            let resp = self.convert_failure(&req, Failure::Timeout);
            self.log_failure(&req, "timeout");

            let transitioned = {
                let mut state = self.inner.borrow_mut();
                if state.closed {
                    return;
                }
                state.queue.complete(seq, resp, true, Some("timeout"))
            };
            if !transitioned {
                return;
            }
            self.drain();
        }
    }

    /// begin graceful shutdown: stop accepting reads and let in-flight work
    /// drain naturally. idempotent.
    pub fn graceful_disconnect(&self) {
        {
            let mut state = self.inner.borrow_mut();
            if state.disconnecting {
                return;
            }
            state.disconnecting = true;
        }
        self.shared.controller.pause_reads();
        // deliberately does not check for an immediate close synchronously
        // here: the request that triggered this call, if any, may still be
        // mid admission. the check is deferred onto the local task set
        // instead of dropped -- an already-idle queue has no later drain or
        // completion callback to discover the close, so without this it
        // would never leave `Draining`.
        let conn = self.clone();
        tokio::task::spawn_local(async move {
            conn.maybe_close();
        });
    }

    /// alias for [`Connection::graceful_disconnect`], named for callers that
    /// model shutdown as an external request rather than an internal signal.
    pub fn shutdown_request(&self) {
        self.graceful_disconnect();
    }

    /// the transport reported the connection is gone. discards whatever is
    /// still pending; does not call `controller.close_gracefully` since the
    /// transport is the one telling us it's already closed.
    pub fn connection_closed<D: std::fmt::Debug>(&self, cause: D) {
        tracing::debug!(target: "pipeline_core", service = %self.shared.config.name, ?cause, "connection closed");
        let mut state = self.inner.borrow_mut();
        if state.closed {
            return;
        }
        self.finalize(&mut state);
    }

    /// alias for [`Connection::connection_closed`].
    pub fn connection_lost<D: std::fmt::Debug>(&self, cause: D) {
        self.connection_closed(cause);
    }

    fn drain(&self) {
        self.drain_inner();
        self.maybe_close();
    }

    fn drain_inner(&self) {
        loop {
            let popped = {
                let mut state = self.inner.borrow_mut();
                if state.closed {
                    return;
                }
                if !state.queue.head_is_ready() {
                    state.drain_paused = false;
                    return;
                }
                // `can_push` is re-checked on every call, not gated on the
                // stored flag: the flag is bookkeeping for observers, not a
                // latch. a drain triggered by a new enqueue or idle tick must
                // get a fresh answer even if the previous attempt paused.
                if !self.shared.controller.can_push() {
                    state.drain_paused = true;
                    return;
                }
                state.drain_paused = false;
                state.queue.pop_ready_head()
            };
            let (req, created_at_ms, resp, is_failure, error_class) = popped;
            self.shared.metrics.concurrent_requests(-1);
            if is_failure {
                self.shared.metrics.error(error_class.unwrap_or("unknown"));
            }
            self.emit_request_metrics(&req, &resp, created_at_ms);

            let Some(fut) = self.push_checked(resp) else { return };
            let conn = self.clone();
            tokio::task::spawn_local(async move {
                let result = fut.await;
                conn.on_push_result(result);
                conn.drain();
            });
        }
    }

    /// push `resp`, re-confirming immediately beforehand that the controller
    /// still accepts writes. every call site has already observed
    /// `can_push() == true` under the same borrow that led here, so this
    /// should never fail in a well-behaved controller; if it ever does, that
    /// is the `PushToFullBuffer` invariant violation, and the connection is
    /// torn down instead of handing it a response it said it could not take.
    fn push_checked(&self, resp: Resp) -> Option<C::PushFuture> {
        if !self.shared.controller.can_push() {
            self.fatal(CoreError::PushToFullBuffer);
            return None;
        }
        self.inner.borrow_mut().inflight_pushes += 1;
        Some(self.shared.controller.push(resp))
    }

    /// escalate a violated internal invariant: log it, count it under
    /// `errors`, and finalize the connection immediately. never reached by a
    /// well-behaved handler or controller.
    fn fatal(&self, error: CoreError) {
        let mut state = self.inner.borrow_mut();
        if state.closed {
            return;
        }
        self.shared.metrics.error(error.class());
        tracing::error!(
            target: "pipeline_core",
            service = %self.shared.config.name,
            error = %error,
            "fatal invariant violation; closing connection"
        );
        self.finalize(&mut state);
    }

    fn on_push_result(&self, result: PushResult) {
        if matches!(result, PushResult::WriteFailed) {
            self.shared.metrics.error("dropped_reply");
            tracing::error!(target: "pipeline_core", service = %self.shared.config.name, "response write failed; dropping reply");
        }
        let mut state = self.inner.borrow_mut();
        state.drain_paused = false;
        state.inflight_pushes -= 1;
    }

    /// close once draining, the pending queue is empty, and every push
    /// issued via `push_checked` -- fast-path or queued -- has resolved.
    /// `inflight_pushes` is what makes the fast path safe to close around:
    /// without it, a push still being written when the queue happens to be
    /// empty would let this fire before the write actually lands.
    fn maybe_close(&self) {
        let mut state = self.inner.borrow_mut();
        if state.closed {
            return;
        }
        if state.disconnecting && state.queue.is_empty() && state.inflight_pushes == 0 {
            self.finalize(&mut state);
            drop(state);
            self.shared.controller.close_gracefully();
        }
    }

    fn finalize(&self, state: &mut Inner<Req, Resp>) {
        state.closed = true;
        let remaining = state.queue.discard_all();
        if remaining > 0 {
            self.shared.metrics.concurrent_requests(-(remaining as i64));
        }
        self.shared.metrics.requests_per_connection(state.num_requests);
    }

    fn emit_request_metrics(&self, req: &Req, resp: &Resp, created_at_ms: u64) {
        if !self.shared.config.request_metrics {
            return;
        }
        let latency = self.shared.clock.now_ms().saturating_sub(created_at_ms);
        let tags = self.shared.config.tag_decorator.tags(req, resp);
        self.shared.metrics.request(latency, &tags);
    }

    fn convert_failure(&self, req: &Req, failure: Failure<H::Error>) -> Resp {
        self.shared.handler.process_failure(req, failure)
    }

    fn log_failure(&self, req: &Req, class: &'static str) {
        if !self.shared.config.log_errors {
            return;
        }
        let rendered = self.shared.config.format_request(req);
        tracing::error!(
            target: "pipeline_core",
            service = %self.shared.config.name,
            class,
            request = %rendered,
            "request failed"
        );
    }
}

/// poll a future exactly once with a no-op waker, returning `Some(output)`
/// only if it was already ready on this first poll. used to detect a
/// synchronously resolved handler future without spawning anything for it.
fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Option<F::Output> {
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    match fut.poll(&mut cx) {
        Poll::Ready(v) => Some(v),
        Poll::Pending => None,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::future::{self, Future};
    use std::pin::Pin;
    use std::rc::Rc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::task::LocalSet;

    use super::*;

    #[derive(Clone)]
    struct TestClock(Rc<Cell<u64>>);

    impl TestClock {
        fn new() -> Self {
            Self(Rc::new(Cell::new(0)))
        }
        fn set(&self, ms: u64) {
            self.0.set(ms);
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }

    /// handler whose responses are driven externally: `process_request`
    /// returns a future resolved by calling `resolve` with the matching key.
    struct ScriptedHandler {
        pending: RefCell<std::collections::HashMap<u32, oneshot::Sender<Result<u32, String>>>>,
        sync: RefCell<std::collections::HashMap<u32, Result<u32, String>>>,
    }

    impl ScriptedHandler {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                pending: RefCell::new(Default::default()),
                sync: RefCell::new(Default::default()),
            })
        }

        /// mark `key` (the request value) to resolve synchronously on first poll.
        fn answer_sync(&self, key: u32, result: Result<u32, String>) {
            self.sync.borrow_mut().insert(key, result);
        }

        /// resolve a previously-deferred request identified by `key`.
        fn resolve(&self, key: u32, result: Result<u32, String>) {
            if let Some(tx) = self.pending.borrow_mut().remove(&key) {
                let _ = tx.send(result);
            }
        }
    }

    impl RequestHandler<u32, u32> for Rc<ScriptedHandler> {
        type Error = String;
        type Future = Pin<Box<dyn Future<Output = Result<u32, String>>>>;

        fn process_request(&self, request: Rc<u32>) -> Self::Future {
            let key = *request;
            if let Some(result) = self.sync.borrow_mut().remove(&key) {
                return Box::pin(future::ready(result));
            }
            let (tx, rx) = oneshot::channel();
            self.pending.borrow_mut().insert(key, tx);
            Box::pin(async move { rx.await.unwrap_or_else(|_| Err("cancelled".to_string())) })
        }

        fn process_failure(&self, _request: &u32, error: Failure<String>) -> u32 {
            match error {
                Failure::BufferFull => u32::MAX,
                Failure::Timeout => u32::MAX - 1,
                Failure::Handler(_) => u32::MAX - 2,
                Failure::Panic(_) => u32::MAX - 3,
            }
        }
    }

    /// controller whose pushes are acknowledged externally and in a caller
    /// controlled order, and whose `can_push` is toggled externally too.
    #[derive(Default)]
    struct MockControllerState {
        can_push: bool,
        pushed: Vec<u32>,
        acks: VecDeque<oneshot::Sender<PushResult>>,
        paused_reads: bool,
        closed_gracefully: bool,
    }

    struct MockController(Rc<RefCell<MockControllerState>>);

    impl MockController {
        fn new(can_push: bool) -> (Self, Rc<RefCell<MockControllerState>>) {
            let state = Rc::new(RefCell::new(MockControllerState { can_push, ..Default::default() }));
            (Self(Rc::clone(&state)), state)
        }
    }

    impl Controller<u32> for MockController {
        type PushFuture = Pin<Box<dyn Future<Output = PushResult>>>;

        fn can_push(&self) -> bool {
            self.0.borrow().can_push
        }

        fn push(&self, response: u32) -> Self::PushFuture {
            let mut state = self.0.borrow_mut();
            state.pushed.push(response);
            let (tx, rx) = oneshot::channel();
            state.acks.push_back(tx);
            Box::pin(async move { rx.await.unwrap_or(PushResult::WriteFailed) })
        }

        fn pause_reads(&self) {
            self.0.borrow_mut().paused_reads = true;
        }

        fn close_gracefully(&self) {
            self.0.borrow_mut().closed_gracefully = true;
        }
    }

    fn ack_oldest(state: &Rc<RefCell<MockControllerState>>, result: PushResult) {
        let tx = state.borrow_mut().acks.pop_front().expect("no pending push to ack");
        let _ = tx.send(result);
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().build().unwrap()
    }

    #[test]
    fn out_of_order_completion_preserves_arrival_order() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            conn.process_message(1);
            conn.process_message(2);
            conn.process_message(3);
            tokio::task::yield_now().await;

            // complete 3 first, then 1, then 2 -- pushes must still happen 1, 2, 3.
            handler.resolve(3, Ok(300));
            tokio::task::yield_now().await;
            assert!(cstate.borrow().pushed.is_empty());

            handler.resolve(1, Ok(100));
            tokio::task::yield_now().await;
            assert_eq!(cstate.borrow().pushed, vec![100]);

            handler.resolve(2, Ok(200));
            tokio::task::yield_now().await;
            assert_eq!(cstate.borrow().pushed, vec![100, 200, 300]);
        });
    }

    #[test]
    fn backpressure_pauses_and_resumes_drain() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(false);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            handler.answer_sync(1, Ok(100));
            conn.process_message(1);
            tokio::task::yield_now().await;
            // can_push is false: nothing pushed yet, but the response sits ready.
            assert!(cstate.borrow().pushed.is_empty());
            assert_eq!(conn.pending_len(), 1);

            cstate.borrow_mut().can_push = true;
            // draining only resumes on the next drain trigger; a second
            // message arriving re-triggers it.
            handler.answer_sync(2, Ok(200));
            conn.process_message(2);
            tokio::task::yield_now().await;

            assert_eq!(cstate.borrow().pushed, vec![100, 200]);
        });
    }

    #[test]
    fn head_timeout_fails_request_once_it_exceeds_the_deadline() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let clock = TestClock::new();
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc").request_timeout(Duration::from_millis(100)),
                clock.clone(),
            );

            conn.process_message(1);
            tokio::task::yield_now().await;

            clock.set(200);
            conn.idle_check(Duration::from_millis(50));
            tokio::task::yield_now().await;

            assert_eq!(cstate.borrow().pushed, vec![u32::MAX - 1]);
        });
    }

    #[test]
    fn buffer_full_overflow_is_queued_behind_in_flight_work() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc").request_buffer_size(std::num::NonZeroUsize::new(1).unwrap()),
                TestClock::new(),
            );

            // R1 occupies the one buffer slot and does not resolve yet.
            conn.process_message(1);
            tokio::task::yield_now().await;

            // R2 arrives once the buffer is already full: synthesized as
            // BufferFull, but queued behind R1 rather than emitted out of turn.
            conn.process_message(2);
            tokio::task::yield_now().await;
            assert!(cstate.borrow().pushed.is_empty());

            handler.resolve(1, Ok(100));
            tokio::task::yield_now().await;

            assert_eq!(cstate.borrow().pushed, vec![100, u32::MAX]);
        });
    }

    #[test]
    fn graceful_shutdown_drains_then_closes() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            conn.process_message(1);
            tokio::task::yield_now().await;

            conn.graceful_disconnect();
            assert!(cstate.borrow().paused_reads);
            assert!(!cstate.borrow().closed_gracefully);

            handler.resolve(1, Ok(100));
            tokio::task::yield_now().await;
            ack_oldest(&cstate, PushResult::Written);
            tokio::task::yield_now().await;

            assert!(cstate.borrow().closed_gracefully);
        });
    }

    #[test]
    fn graceful_shutdown_on_an_already_idle_connection_still_closes() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            // nothing ever admitted: the queue is empty from the start, so
            // no later drain or completion callback would otherwise ever
            // trigger `maybe_close`.
            conn.graceful_disconnect();
            assert!(cstate.borrow().paused_reads);
            assert!(!cstate.borrow().closed_gracefully);

            tokio::task::yield_now().await;

            assert!(cstate.borrow().closed_gracefully);
        });
    }

    #[test]
    fn fast_path_push_resolving_resumes_a_paused_drain() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            // R1 takes the fast path; its push future is left unacknowledged
            // so it stays in flight.
            handler.answer_sync(1, Ok(100));
            conn.process_message(1);
            tokio::task::yield_now().await;
            assert_eq!(cstate.borrow().pushed, vec![100]);

            // R2 arrives once the controller can't accept writes: it misses
            // the fast path (queue was empty but can_push was false) and
            // sits ready in the queue with the drain loop paused.
            cstate.borrow_mut().can_push = false;
            handler.answer_sync(2, Ok(200));
            conn.process_message(2);
            tokio::task::yield_now().await;
            assert_eq!(cstate.borrow().pushed, vec![100]);

            // the controller can accept writes again, then R1's fast-path
            // push resolves. its continuation must re-trigger the drain loop
            // (not just check for a close), or R2 would wait forever.
            cstate.borrow_mut().can_push = true;
            ack_oldest(&cstate, PushResult::Written);
            tokio::task::yield_now().await;

            assert_eq!(cstate.borrow().pushed, vec![100, 200]);
        });
    }

    #[test]
    fn graceful_close_waits_for_an_in_flight_fast_path_push() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            // R1 takes the fast path and never touches the pending queue;
            // its push is left unacknowledged so it stays in flight.
            handler.answer_sync(1, Ok(100));
            conn.process_message(1);
            tokio::task::yield_now().await;
            assert_eq!(cstate.borrow().pushed, vec![100]);

            // shutdown sees an empty queue (the fast path never populated
            // it) but must not close around the still-in-flight write.
            conn.graceful_disconnect();
            tokio::task::yield_now().await;
            assert!(!cstate.borrow().closed_gracefully);

            ack_oldest(&cstate, PushResult::Written);
            tokio::task::yield_now().await;

            assert!(cstate.borrow().closed_gracefully);
        });
    }

    #[test]
    fn late_completion_after_close_is_a_noop() {
        let rt = runtime();
        let local = LocalSet::new();
        local.block_on(&rt, async {
            let handler = ScriptedHandler::new();
            let (controller, cstate) = MockController::new(true);
            let conn = Connection::with_clock(
                Rc::clone(&handler),
                controller,
                ServiceConfig::new("svc"),
                TestClock::new(),
            );

            conn.process_message(1);
            tokio::task::yield_now().await;

            conn.connection_closed("peer reset");
            handler.resolve(1, Ok(100));
            tokio::task::yield_now().await;

            assert!(cstate.borrow().pushed.is_empty());
        });
    }
}
