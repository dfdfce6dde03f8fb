// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Time access for the checker. Every "now" and every timer goes through the
//! [`Clock`] port so tests can run on a controlled clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::contracts::{NewRoundLog, RoundState};

/// The clock port.
pub trait Clock: Send + Sync {
    /// Current unix time, in seconds.
    fn now(&self) -> i64;

    /// A one-shot timer completing after `duration`.
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Wall-clock time and tokio timers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// How long to wait before the next idle deadline, given the round's start
/// time and the local clock.
///
/// Errs toward the shorter wait: an absent, overflowing or future
/// `started_at` yields the full threshold, and a round older than the
/// threshold yields zero (fire immediately). The node should never sit idle
/// longer than asked for just because its clock and the chain disagree.
pub fn idle_timer_duration(
    started_at: Option<&BigInt>,
    idle_threshold: Duration,
    now: i64,
) -> Duration {
    let Some(started_at) = started_at.and_then(ToPrimitive::to_i64) else {
        return idle_threshold;
    };
    if started_at > now {
        return idle_threshold;
    }
    let elapsed = Duration::from_secs((now - started_at) as u64);
    idle_threshold.saturating_sub(elapsed)
}

/// Arms a one-shot idle timer for the round announced by `log`.
pub fn make_idle_timer(
    log: &NewRoundLog,
    idle_threshold: Duration,
    clock: &dyn Clock,
) -> BoxFuture<'static, ()> {
    clock.after(idle_timer_duration(
        log.started_at.as_ref(),
        idle_threshold,
        clock.now(),
    ))
}

/// How long until the round described by `state` times out on-chain, or
/// `None` when the round carries no timeout.
pub fn round_deadline(state: &RoundState, now: i64) -> Option<Duration> {
    if state.timeout == 0 {
        return None;
    }
    let deadline = state.started_at.saturating_add(state.timeout);
    let now = now.max(0) as u64;
    Some(Duration::from_secs(deadline.saturating_sub(now)))
}
