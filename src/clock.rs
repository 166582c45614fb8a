//! Time source abstraction.
//!
//! A `no_std` driver core has no monotonic clock of its own; the
//! embedding kernel supplies one. Every blocking operation in this
//! crate (ring space, fence waits, job waits, reset polling) budgets
//! against a `Clock` and a bounded spin loop rather than looping
//! forever on an unconditional retry.

/// Monotonic millisecond clock supplied by the embedding kernel.
pub trait Clock: Send + Sync {
    /// Current monotonic time in milliseconds. Must never go backwards.
    fn now_ms(&self) -> u64;

    /// Hint that the caller is about to poll again shortly; a real
    /// implementation may yield the CPU or execute a pause instruction.
    fn spin_hint(&self) {
        core::hint::spin_loop();
    }
}

/// Tracks a deadline relative to a `Clock`, used by every suspension
/// point in this crate.
#[derive(Clone, Copy)]
pub struct Deadline {
    /// `None` means "indefinite" (only valid for `fence.wait`).
    expires_at_ms: Option<u64>,
}

impl Deadline {
    /// Build a deadline `timeout_ms` milliseconds from now. A value of
    /// zero is an immediate, single poll (no sleep) for every
    /// operation except `fence.wait`, where the caller must use
    /// [`Deadline::indefinite`] instead to get "wait forever" behavior.
    pub fn from_timeout(clock: &dyn Clock, timeout_ms: u64) -> Self {
        Self {
            expires_at_ms: Some(clock.now_ms().saturating_add(timeout_ms)),
        }
    }

    /// A deadline that never expires.
    pub fn indefinite() -> Self {
        Self { expires_at_ms: None }
    }

    /// Whether `now` has passed the deadline.
    pub fn expired(&self, clock: &dyn Clock) -> bool {
        match self.expires_at_ms {
            Some(t) => clock.now_ms() >= t,
            None => false,
        }
    }
}
