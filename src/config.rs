//! per-connection configuration.
//!
//! built once at connection establishment and never mutated afterward.
//! `request_buffer_size`/`request_timeout` are runtime fields rather than
//! compile-time constants, since neither one sizes a fixed-capacity stack
//! buffer -- they are plain per-deployment tunables instead.

use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crate::metrics::{NoTags, TagDecorator};

/// default pending-queue capacity when [`ServiceConfig::request_buffer_size`]
/// is never called.
pub const DEFAULT_REQUEST_BUFFER_SIZE: usize = 32;

pub struct ServiceConfig<Req, Resp> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) request_buffer_size: NonZeroUsize,
    pub(crate) log_errors: bool,
    pub(crate) request_log_format: Option<Box<dyn Fn(&Req) -> String>>,
    pub(crate) request_metrics: bool,
    pub(crate) tag_decorator: Box<dyn TagDecorator<Req, Resp>>,
}

impl<Req, Resp> ServiceConfig<Req, Resp> {
    /// `name` tags every metric series this connection emits.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            request_timeout: None,
            request_buffer_size: NonZeroUsize::new(DEFAULT_REQUEST_BUFFER_SIZE).unwrap(),
            log_errors: true,
            request_log_format: None,
            request_metrics: true,
            tag_decorator: Box::new(NoTags),
        }
    }

    /// fail requests with [`crate::Failure::Timeout`] once they have sat at
    /// the head of the pending queue longer than `timeout`. disabled (no
    /// timeout enforcement) by default.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// disable request timeout enforcement.
    pub fn no_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    /// bound on the number of requests admitted but not yet drained. requests
    /// arriving once the queue is at this depth are failed immediately with
    /// [`crate::Failure::BufferFull`] rather than rejected at the transport.
    pub fn request_buffer_size(mut self, size: NonZeroUsize) -> Self {
        self.request_buffer_size = size;
        self
    }

    /// whether a handler/timeout/overflow failure is logged via `tracing`.
    /// enabled by default.
    pub fn log_errors(mut self, enabled: bool) -> Self {
        self.log_errors = enabled;
        self
    }

    /// override how a request is rendered into the failure log line. defaults
    /// to `{request:?}`. the closure is caught with `catch_unwind`: a panic
    /// inside it degrades to a placeholder string rather than taking down the
    /// connection over a logging bug.
    pub fn request_log_format<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req) -> String + 'static,
    {
        self.request_log_format = Some(Box::new(f));
        self
    }

    /// whether `requests`/`latency`/`errors`/`concurrent_requests`/
    /// `requests_per_connection` are emitted at all. enabled by default.
    pub fn request_metrics(mut self, enabled: bool) -> Self {
        self.request_metrics = enabled;
        self
    }

    /// attach extra labels to the `requests`/`latency` series.
    pub fn tag_decorator<D>(mut self, decorator: D) -> Self
    where
        D: TagDecorator<Req, Resp> + 'static,
    {
        self.tag_decorator = Box::new(decorator);
        self
    }

    pub(crate) fn format_request(&self, req: &Req) -> String
    where
        Req: fmt::Debug,
    {
        match &self.request_log_format {
            Some(f) => match std::panic::catch_unwind(AssertUnwindSafe(|| f(req))) {
                Ok(s) => s,
                Err(_) => "<request_log_format panicked>".to_string(),
            },
            None => format!("{req:?}"),
        }
    }
}
