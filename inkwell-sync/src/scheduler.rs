//! Debounce / max-debounce flush bookkeeping.
//!
//! ```text
//! edit   edit      edit                    (quiet ≥ debounce)
//!  │      │         │                               │
//!  ▼      ▼         ▼                               ▼
//!  ├──────┼─────────┼──────── debounce ────────────►│ flush
//!  ├──────────────────────────── max_debounce ──────┼──► forced flush
//!  ^ first unflushed edit arms the max deadline
//! ```
//!
//! The schedule is a pure state machine over `tokio::time::Instant`; the
//! session's timer task reads [`FlushSchedule::next_deadline`] and calls
//! [`FlushSchedule::due`] when it wakes.

use std::time::Duration;

use tokio::time::Instant;

/// Flush timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub debounce: Duration,
    pub max_debounce: Duration,
}

impl FlushPolicy {
    pub fn new(debounce: Duration, max_debounce: Duration) -> Self {
        Self {
            debounce,
            max_debounce,
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000), Duration::from_millis(30_000))
    }
}

/// Why a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Quiet period elapsed
    Debounce,
    /// Edits kept coming; the upper bound forced it
    MaxDebounce,
    /// Last connection left
    Eviction,
    /// Service stopping
    Shutdown,
}

/// Whether there are unflushed mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Clean,
    Dirty,
}

/// Per-session flush deadlines.
#[derive(Debug, Clone, Default)]
pub struct FlushSchedule {
    dirty: bool,
    debounce_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
}

impl FlushSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation at `now`.
    ///
    /// The debounce deadline moves on every call; the max deadline is
    /// armed by the first mutation after a flush and then left alone.
    pub fn on_mutation(&mut self, now: Instant, policy: &FlushPolicy) {
        self.dirty = true;
        self.debounce_deadline = Some(now + policy.debounce);
        if self.max_deadline.is_none() {
            self.max_deadline = Some(now + policy.max_debounce);
        }
    }

    /// Reason to flush at `now`, if any. The max bound wins a tie.
    pub fn due(&self, now: Instant) -> Option<FlushReason> {
        if !self.dirty {
            return None;
        }
        if self.max_deadline.is_some_and(|d| now >= d) {
            return Some(FlushReason::MaxDebounce);
        }
        if self.debounce_deadline.is_some_and(|d| now >= d) {
            return Some(FlushReason::Debounce);
        }
        None
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        match (self.debounce_deadline, self.max_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Clear after a successful save.
    pub fn mark_flushed(&mut self) {
        self.dirty = false;
        self.debounce_deadline = None;
        self.max_deadline = None;
    }

    /// Re-arm after a failed save so the retry happens one debounce from
    /// now, bounded by a fresh max window.
    pub fn on_failure(&mut self, now: Instant, policy: &FlushPolicy) {
        self.dirty = true;
        self.debounce_deadline = Some(now + policy.debounce);
        self.max_deadline = Some(now + policy.max_debounce);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn state(&self) -> ScheduleState {
        if self.dirty {
            ScheduleState::Dirty
        } else {
            ScheduleState::Clean
        }
    }
}
