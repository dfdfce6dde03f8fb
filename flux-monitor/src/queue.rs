// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A bounded backlog of pending log broadcasts, highest round id first.
//!
//! While the checker is busy handling one broadcast, up to two more may
//! wait; anything beyond that evicts the stalest waiting round. Earlier
//! rounds are already obsolete by the time the checker would get to them.

use std::sync::Arc;

use num_bigint::BigInt;
use tracing::trace;

use crate::contracts::{AggregatorLog, LogBroadcast};

/// Upper bound on broadcasts held at once, counting the one being processed.
pub const BACKLOG_CAPACITY: usize = 3;

/// A decoded log together with its delivery envelope.
pub struct PendingLog {
    pub log: AggregatorLog,
    pub broadcast: Arc<dyn LogBroadcast>,
}

impl PendingLog {
    fn round_id(&self) -> &BigInt {
        self.log.round_id()
    }
}

/// Priority backlog of capacity [`BACKLOG_CAPACITY`].
///
/// An entry handed out by [`pop`](Self::pop) keeps its slot until
/// [`finish`](Self::finish) and is never the eviction victim.
#[derive(Default)]
pub struct LogBacklog {
    waiting: Vec<PendingLog>,
    in_flight: bool,
}

impl LogBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a broadcast. At capacity, the smallest waiting round is
    /// evicted if the incoming round is larger; otherwise the incoming
    /// broadcast is dropped.
    pub fn push(&mut self, entry: PendingLog) {
        if self.len() >= BACKLOG_CAPACITY {
            let min_index = self
                .waiting
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.round_id().cmp(b.round_id()))
                .map(|(index, _)| index)
                .expect("a full backlog has waiting entries");
            if entry.round_id() > self.waiting[min_index].round_id() {
                let evicted = std::mem::replace(&mut self.waiting[min_index], entry);
                trace!(round = %evicted.round_id(), "evicting stale round from log backlog");
            } else {
                trace!(round = %entry.round_id(), "dropping incoming log, backlog full");
            }
            return;
        }
        self.waiting.push(entry);
    }

    /// Removes and returns the highest waiting round, keeping its capacity
    /// slot occupied until [`finish`](Self::finish).
    pub fn pop(&mut self) -> Option<PendingLog> {
        let max_index = self
            .waiting
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.round_id().cmp(b.round_id()))
            .map(|(index, _)| index)?;
        self.in_flight = true;
        Some(self.waiting.swap_remove(max_index))
    }

    /// Releases the slot of the last popped entry.
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
