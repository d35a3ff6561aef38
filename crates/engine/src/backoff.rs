// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Delay before retry `attempt` (1-based): uniform over
/// `[0, min(cap, base * 2^(attempt-1))]`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ceiling = base.saturating_mul(1u32 << exp).min(cap);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(ms)
}
