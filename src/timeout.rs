//! Deadline policy for create and terminate requests.

use std::time::Duration;

use crate::request_id::RequestKind;

/// Default creation deadline.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default termination deadline.
pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Kind-specific deadlines applied to outstanding requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeoutPolicy {
    /// Maximum time a create request may spend in transitional states.
    pub creation: Duration,
    /// Maximum time a terminate request may spend in transitional states.
    pub termination: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            creation: DEFAULT_CREATION_TIMEOUT,
            termination: DEFAULT_TERMINATION_TIMEOUT,
        }
    }
}

impl TimeoutPolicy {
    /// Returns the deadline that applies to `kind`.
    #[must_use]
    pub const fn threshold(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Create => self.creation,
            RequestKind::Terminate => self.termination,
        }
    }

    /// Reports whether a request first seen at `first_seen_millis` has
    /// reached its deadline at `now_millis`.
    ///
    /// A clock that moved backwards counts as zero elapsed time.
    #[must_use]
    pub fn is_timed_out(&self, first_seen_millis: u64, now_millis: u64, kind: RequestKind) -> bool {
        let elapsed = Duration::from_millis(now_millis.saturating_sub(first_seen_millis));
        elapsed >= self.threshold(kind)
    }
}
