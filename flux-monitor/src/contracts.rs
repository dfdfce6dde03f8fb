// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The aggregator-contract surface the checker consumes: on-demand round
//! state, method selectors, and the log subscription with its deduplicating
//! broadcast envelopes. Concrete RPC wiring lives outside this crate.

use std::sync::Arc;

use alloy::primitives::{keccak256, Address};
use async_trait::async_trait;
use num_bigint::BigInt;

use crate::error::FluxMonitorError;

/// Canonical signature of the aggregator's submission method.
pub const SUBMIT_SIGNATURE: &str = "submit(uint256,int256)";

/// The first 4 bytes of the keccak-256 hash of a canonical method signature.
pub fn method_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// The authoritative per-oracle view of the current round, fetched on demand.
#[derive(Clone, Debug, Default)]
pub struct RoundState {
    /// The round this oracle would submit to now.
    pub reportable_round_id: u32,
    pub eligible_to_submit: bool,
    /// Latest reported answer, already scaled to `10^precision`.
    pub latest_answer: BigInt,
    pub available_funds: BigInt,
    pub payment_amount: BigInt,
    pub oracle_count: u32,
    /// Unix seconds; 0 means the round has not started.
    pub started_at: u64,
    /// Round deadline offset from `started_at`, in seconds; 0 disables.
    pub timeout: u64,
}

/// A decoded aggregator event. Unrecognized log shapes never reach this type;
/// they are dropped at the broadcast boundary.
#[derive(Clone, Debug)]
pub enum AggregatorLog {
    NewRound(NewRoundLog),
    AnswerUpdated(AnswerUpdatedLog),
}

impl AggregatorLog {
    pub fn round_id(&self) -> &BigInt {
        match self {
            AggregatorLog::NewRound(log) => &log.round_id,
            AggregatorLog::AnswerUpdated(log) => &log.round_id,
        }
    }
}

/// A new aggregation round was opened.
#[derive(Clone, Debug)]
pub struct NewRoundLog {
    pub round_id: BigInt,
    /// The oracle whose submission opened the round.
    pub started_by: Address,
    /// Unix seconds; absent when the event did not carry it.
    pub started_at: Option<BigInt>,
}

/// The aggregator reported a new answer. Acknowledged, never acted on.
#[derive(Clone, Debug)]
pub struct AnswerUpdatedLog {
    pub round_id: BigInt,
    pub current: BigInt,
}

/// Invoked exactly once to tear down a log subscription.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Outcome of subscribing to an aggregator's log stream.
pub struct LogSubscription {
    /// Whether the bus is connected right now; a `true` here connects the
    /// checker before any explicit connect event arrives.
    pub connected: bool,
    pub unsubscribe: Unsubscribe,
}

/// The aggregator contract port.
#[async_trait]
pub trait FluxAggregator: Send + Sync {
    /// Fetches the round state as seen for `oracle`.
    async fn round_state(&self, oracle: Address) -> Result<RoundState, FluxMonitorError>;

    /// Resolves a method name to its 4-byte selector.
    fn method_id(&self, name: &str) -> Result<[u8; 4], FluxMonitorError>;

    /// Subscribes `listener` to this aggregator's log stream.
    async fn subscribe_to_logs(
        &self,
        listener: Arc<dyn LogListener>,
    ) -> Result<LogSubscription, FluxMonitorError>;
}

/// An event delivery envelope with at-least-once deduplication.
#[async_trait]
pub trait LogBroadcast: Send + Sync {
    /// The decoded event, or `None` for nil/unrecognized payloads.
    fn log(&self) -> Option<AggregatorLog>;

    async fn was_already_consumed(&self) -> Result<bool, FluxMonitorError>;

    /// Idempotent.
    async fn mark_consumed(&self) -> Result<(), FluxMonitorError>;
}

/// Receives connectivity events and log broadcasts from the bus.
#[async_trait]
pub trait LogListener: Send + Sync {
    fn on_connect(&self);

    fn on_disconnect(&self);

    async fn handle_log(&self, broadcast: Arc<dyn LogBroadcast>);
}
