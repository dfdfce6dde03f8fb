// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error type for flux monitor operations.
#[derive(Debug, Error)]
pub enum FluxMonitorError {
    /// The aggregator contract could not be queried.
    #[error("aggregator call failed: {0}")]
    Aggregator(String),

    /// Fetching the off-chain value failed.
    #[error("fetching answer failed: {0}")]
    Fetch(String),

    /// The run manager refused the run request.
    #[error("run manager rejected run: {0}")]
    RunManager(String),

    /// A log broadcast could not be inspected or acknowledged.
    #[error("log broadcast failed: {0}")]
    Broadcast(String),

    /// The aggregator refused the log subscription.
    #[error("aggregator refused log subscription")]
    SubscriptionRefused,

    /// `start` was called twice on the same checker.
    #[error("deviation checker already started")]
    AlreadyStarted,

    /// The log bus could not be started.
    #[error("log broadcaster failed to start: {0}")]
    BroadcasterStart(String),

    /// The feeds definition is not a JSON array of URLs and bridge names.
    #[error("malformed feeds definition: {0}")]
    MalformedFeeds(String),

    /// A feed referenced a bridge that is not configured.
    #[error("no bridge named {0:?}")]
    UnknownBridge(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
}
