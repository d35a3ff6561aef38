// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! replug-bus: per-job progress fan-out.
//!
//! The store sequences and retains events; the bus delivers them to live
//! subscribers. Each subscription owns a bounded buffer: when it overflows,
//! the oldest undelivered non-terminal event is dropped and a gap marker
//! takes its place. Terminal events are never dropped; a subscriber that
//! fails to drain one within the publish timeout is closed as a slow
//! consumer instead. Producers never block on subscribers.

mod bus;

pub use bus::{BusConfig, BusError, Closed, EventBus, Subscription, SubscriptionId};
