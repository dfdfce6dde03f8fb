// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Job descriptions as handed to the supervisor. Only the flux-monitor
//! initiator carries parameters the core cares about; other initiator kinds
//! are listed so jobs can be routed past us without error.

use std::time::Duration;

use alloy::primitives::Address;
use serde_json::Value;

/// Identifies a job across the process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job specification, reduced to what the supervisor routes on.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub id: JobId,
    pub initiators: Vec<Initiator>,
}

/// What kind of stimulus starts runs for a job.
#[derive(Clone, Debug)]
pub enum Initiator {
    /// Runs are started by this crate's deviation checkers.
    FluxMonitor(FluxMonitorInitiator),
    /// Runs are started by on-chain request logs; handled elsewhere.
    RunLog,
    /// Runs are started over HTTP; handled elsewhere.
    Web,
}

/// Parameters of a flux-monitor initiator, immutable per checker.
#[derive(Clone, Debug)]
pub struct FluxMonitorInitiator {
    /// The aggregator contract the job reports to.
    pub address: Address,
    /// Fetched decimals are scaled to integer answers as `answer * 10^precision`.
    pub precision: u32,
    /// Relative deviation threshold, in percent.
    pub threshold: f64,
    /// Absolute deviation threshold, in scaled integer units.
    pub absolute_threshold: f64,
    pub poll_timer: PollTimerConfig,
    pub idle_timer: IdleTimerConfig,
    /// JSON array of feed URLs and `{"bridge": name}` references; consumed
    /// by fetcher construction, opaque to the checker itself.
    pub feeds: Value,
}

#[derive(Clone, Debug)]
pub struct PollTimerConfig {
    pub disabled: bool,
    pub period: Duration,
}

#[derive(Clone, Debug)]
pub struct IdleTimerConfig {
    pub disabled: bool,
    pub duration: Duration,
}

impl JobSpec {
    /// Returns the flux-monitor initiators of this job, if any.
    pub fn flux_monitor_initiators(&self) -> impl Iterator<Item = &FluxMonitorInitiator> {
        self.initiators.iter().filter_map(|initiator| match initiator {
            Initiator::FluxMonitor(params) => Some(params),
            _ => None,
        })
    }
}
