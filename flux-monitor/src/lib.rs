// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! This module provides the flux monitor: per-job deviation checkers that
//! decide when to fetch an off-chain value and when to submit it as a new
//! round of an on-chain aggregator contract, and the supervisor that owns
//! them. The aggregator RPC, the feed fetcher, the run manager and the log
//! bus are consumed through ports defined here and wired up elsewhere.

pub mod checker;
pub mod config;
pub mod contracts;
pub mod deviation;
pub mod error;
pub mod feeds;
pub mod funding;
pub mod job;
pub mod monitor;
pub mod queue;
pub mod rounds;
pub mod runs;
pub mod timers;

/// Helper types for tests and similar purposes.
pub mod test_utils;
