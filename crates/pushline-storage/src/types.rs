//! Auxiliary types returned by storage operations.

use pushline_core::Plan;

/// Outcome of the atomic quota check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The push was admitted; `used` is the counter value after increment.
    Admitted { used: i64 },
    /// The monthly ceiling was reached. Nothing was incremented.
    Exceeded { plan: Plan, used: i64, limit: i64 },
}

/// State of a rate-limit window after an increment.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitWindow {
    /// Number of hits in the current window, including this one.
    pub count: i64,
    /// Milliseconds until the window resets.
    pub reset_in_ms: i64,
}

/// Per-message delivery attempt counts, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptCounts {
    pub pending: u32,
    pub delivered: u32,
    pub failed: u32,
}
