//! instrumentation facade over the `metrics` crate.
//!
//! wraps the handful of series this crate emits (`requests`, `latency`,
//! `errors`, `concurrent_requests`, `requests_per_connection`) behind a small
//! struct so call sites never repeat label plumbing.

use std::borrow::Cow;

use metrics::{counter, gauge, histogram, Label};

/// per-request labels attached to the `requests`/`latency` series.
///
/// tests and callers that don't need labels can use [`NoTags`].
pub trait TagDecorator<Req, Resp> {
    fn tags(&self, request: &Req, response: &Resp) -> Vec<(&'static str, String)>;
}

/// decorator that adds no labels beyond the service name.
pub struct NoTags;

impl<Req, Resp> TagDecorator<Req, Resp> for NoTags {
    fn tags(&self, _request: &Req, _response: &Resp) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

pub(crate) struct Metrics {
    name: Cow<'static, str>,
}

impl Metrics {
    pub(crate) fn new(name: Cow<'static, str>) -> Self {
        Self { name }
    }

    fn service_label(&self) -> Label {
        Label::new("service", self.name.clone().into_owned())
    }

    /// emitted once per response, just before it is handed to the controller.
    pub(crate) fn request(&self, latency_ms: u64, tags: &[(&'static str, String)]) {
        let mut labels = Vec::with_capacity(tags.len() + 1);
        labels.push(self.service_label());
        labels.extend(tags.iter().map(|(k, v)| Label::new(*k, v.clone())));

        counter!("requests", labels.clone()).increment(1);
        histogram!("latency", labels).record(latency_ms as f64);
    }

    /// emitted once per handler/timeout/overflow/dropped-reply failure.
    pub(crate) fn error(&self, class: &'static str) {
        counter!("errors", "service" => self.name.clone(), "class" => class).increment(1);
    }

    /// `delta` is `+1` on enqueue, `-1` on dequeue, `-n` when `n` entries are
    /// discarded on close. never touched for the true fast path, which never
    /// allocates a pending entry at all.
    pub(crate) fn concurrent_requests(&self, delta: i64) {
        let g = gauge!("concurrent_requests", "service" => self.name.clone());
        if delta >= 0 {
            g.increment(delta as f64);
        } else {
            g.decrement((-delta) as f64);
        }
    }

    /// emitted once, when the connection closes.
    pub(crate) fn requests_per_connection(&self, count: u64) {
        histogram!("requests_per_connection", "service" => self.name.clone()).record(count as f64);
    }
}
