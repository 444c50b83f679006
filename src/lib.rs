//! Pipelined request-response service core for a single protocol connection.
//!
//! This crate implements the part of a protocol server that sits between the
//! transport (sockets, framing, codecs) and application request handlers: it
//! accepts messages in arrival order, dispatches each to a [`RequestHandler`],
//! and guarantees responses are written back through a [`Controller`] in the
//! same order the requests arrived, regardless of the order handlers actually
//! finish in. It owns none of the I/O itself.
//!
//! The state machine is single-threaded and cooperative: all mutable state
//! lives behind `Rc<RefCell<_>>` and is driven from a [`tokio::task::LocalSet`].
//! Deferred work (awaiting a handler future, awaiting a push acknowledgement)
//! is spawned with [`tokio::task::spawn_local`] so neither `Req`, `Resp`, nor
//! handler/controller implementations need to be `Send`.

#![forbid(unsafe_code)]

mod entry;
mod queue;

pub mod clock;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod handler;
pub mod metrics;

pub use clock::{Clock, MonotonicClock};
pub use config::ServiceConfig;
pub use connection::Connection;
pub use controller::{Controller, PushResult};
pub use error::CoreError;
pub use handler::{Failure, RequestHandler};
pub use metrics::{NoTags, TagDecorator};
