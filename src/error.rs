//! Definition of error and status.

use std::fmt;

/// Status of `HazardEpoch` and of the integrity checks of the lock-free containers.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Status {
    /// Success
    Success,
    /// Current thread has already assigned a version handle
    Busy,
    /// Thread number overflow
    ThreadNumOverflow,
    /// Invalid parameter
    InvalidParam,
    /// A quiescent walk found a cycle, a dangling link or a count mismatch
    Corrupted,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Status {}
