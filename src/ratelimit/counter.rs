//! Fixed-window counter.

use std::time::{Duration, Instant};

use super::store::LimiterState;
use crate::config::FixedWindowConfig;

/// Quota and window length shared by every counter of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowParams {
    /// Requests allowed per window
    pub quota: u64,
    /// Length of a window
    pub window: Duration,
}

impl From<&FixedWindowConfig> for FixedWindowParams {
    fn from(config: &FixedWindowConfig) -> Self {
        Self {
            quota: config.quota,
            window: config.window(),
        }
    }
}

/// A decrementing counter that refills to its quota when its window expires.
///
/// Two adjacent windows can together admit up to twice the quota around the
/// boundary.
#[derive(Debug, Clone)]
pub struct FixedWindowCounter {
    params: FixedWindowParams,
    /// Requests left in the current window
    remaining: u64,
    /// When the current window ends
    expires_at: Instant,
}

impl FixedWindowCounter {
    pub fn new(params: FixedWindowParams, now: Instant) -> Self {
        Self {
            params,
            remaining: params.quota,
            expires_at: now + params.window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Reset the window if it has expired.
    fn maybe_reset_window(&mut self, now: Instant) {
        if self.is_expired(now) {
            self.remaining = self.params.quota;
            self.expires_at = now + self.params.window;
        }
    }
}

impl LimiterState for FixedWindowCounter {
    type Config = FixedWindowParams;

    fn new(config: &Self::Config, now: Instant) -> Self {
        FixedWindowCounter::new(*config, now)
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.maybe_reset_window(now);

        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn remaining(&self, now: Instant) -> u64 {
        if self.is_expired(now) {
            self.params.quota
        } else {
            self.remaining
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.is_expired(now)
    }
}
