// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cmp;
use std::time::Duration;

/// Adaptive interval between polls of one table.
///
/// The interval doubles after every empty poll up to `max`, resets to
/// `initial` as soon as a poll yields changes, and stays put on errors:
/// transient failures (bus timeout, locking) must not push an active table
/// towards its idle cadence. Invariant: `initial <= current <= max`.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("poll intervals must satisfy 0 < initial <= max (initial {initial:?}, max {max:?})")]
pub struct InvalidBackoff {
    initial: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Result<Self, InvalidBackoff> {
        if initial.is_zero() || initial > max {
            return Err(InvalidBackoff { initial, max });
        }
        Ok(PollBackoff {
            initial,
            max,
            current: initial,
        })
    }

    /// The interval to sleep before the next poll attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_empty(&mut self) {
        self.current = cmp::min(self.current.saturating_mul(2), self.max);
    }

    pub fn on_nonempty(&mut self) {
        self.current = self.initial;
    }

    /// Errors leave the interval unchanged; the caller sleeps `current()`
    /// and retries.
    pub fn on_error(&mut self) {}
}
