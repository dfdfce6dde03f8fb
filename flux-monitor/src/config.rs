// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use num_bigint::BigInt;

/// Process-wide configuration consumed by the flux monitor.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// When set, on-chain integration is off: the log bus is never started
    /// and no checker receives logs.
    pub eth_disabled: bool,
    /// The smallest per-round payment a job is willing to work for.
    pub minimum_contract_payment: BigInt,
    /// Timeout shared by the aggregator RPC and the feed fetcher.
    pub default_http_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            eth_disabled: false,
            minimum_contract_payment: BigInt::from(100),
            default_http_timeout: Duration::from_secs(15),
        }
    }
}
