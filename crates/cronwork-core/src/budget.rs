// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wall-clock budget for one process invocation.
//!
//! Every loop in the runtime (table driver, log-file scan, queue listen)
//! asks the budget before starting a unit of work. A unit that has already
//! started always runs to completion; there is no preemption.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic start time plus the maximum runtime granted to the process.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    max_runtime: Duration,
}

impl TimeBudget {
    /// Start a budget now.
    pub fn new(max_runtime: Duration) -> Self {
        Self::starting_at(Instant::now(), max_runtime)
    }

    /// Budget whose clock started at `started`.
    pub fn starting_at(started: Instant, max_runtime: Duration) -> Self {
        Self {
            started,
            max_runtime,
        }
    }

    /// Configured maximum runtime.
    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    /// Time spent since the budget started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.max_runtime.saturating_sub(self.elapsed())
    }

    /// Time left in seconds; negative once the budget is overrun.
    pub fn remaining_secs(&self) -> f64 {
        self.max_runtime.as_secs_f64() - self.elapsed().as_secs_f64()
    }

    /// Whether no time is left.
    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Whether more than `duration` is left.
    pub fn has_time_for(&self, duration: Duration) -> bool {
        self.remaining() > duration
    }

    /// How long an external "listen for N seconds" call may block.
    ///
    /// `min(cap, remaining - margin)`, or `None` when that is not positive,
    /// so the caller still has `margin` left for its own bookkeeping.
    pub fn listen_window(&self, cap: Duration, margin: Duration) -> Option<Duration> {
        let window = self.remaining().checked_sub(margin)?.min(cap);
        (!window.is_zero()).then_some(window)
    }
}
