//! fatal, connection-terminating errors.
//!
//! these represent a violated internal invariant -- never something a
//! well-behaved [`crate::RequestHandler`] or [`crate::Controller`] can
//! trigger by returning an error or a slow future. surfacing one tears the
//! connection down immediately rather than continuing atop a state machine
//! that is no longer trustworthy.

use std::fmt;

/// an assertion about the core's contract with its controller that did not
/// hold.
pub enum CoreError {
    /// `Controller::push` was about to be issued immediately after
    /// `Controller::can_push` reported `false` for that same check.
    PushToFullBuffer,
}

impl CoreError {
    /// metrics/log tag for this error. stable across releases.
    pub fn class(&self) -> &'static str {
        match self {
            Self::PushToFullBuffer => "fatal_push_to_full_buffer",
        }
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PushToFullBuffer => "CoreError::PushToFullBuffer",
        })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PushToFullBuffer => {
                "controller reported can_push() == false immediately before a push was issued"
            }
        })
    }
}

impl std::error::Error for CoreError {}
