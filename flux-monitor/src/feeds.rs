// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Feed plumbing: the fetcher port the checker polls for an off-chain value,
//! and the helper that turns a job's feeds definition into concrete URLs.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::Value;
use url::Url;

use crate::error::FluxMonitorError;

/// Produces the current off-chain value, typically a median over feeds.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<BigDecimal, FluxMonitorError>;
}

/// Resolves bridge names to their endpoints.
pub trait BridgeLookup: Send + Sync {
    fn bridge_url(&self, name: &str) -> Result<Url, FluxMonitorError>;
}

/// Extracts the feed URLs from a job's feeds definition, in input order.
///
/// `feeds` is a JSON array whose elements are either a URL string or an
/// object `{"bridge": name}` resolved through `bridges`.
pub fn extract_feed_urls(
    feeds: &Value,
    bridges: &dyn BridgeLookup,
) -> Result<Vec<Url>, FluxMonitorError> {
    let entries = feeds
        .as_array()
        .ok_or_else(|| FluxMonitorError::MalformedFeeds(format!("expected an array, got {feeds}")))?;
    entries
        .iter()
        .map(|entry| match entry {
            Value::String(url) => Ok(Url::parse(url)?),
            Value::Object(fields) => {
                let name = fields.get("bridge").and_then(Value::as_str).ok_or_else(|| {
                    FluxMonitorError::MalformedFeeds(format!("expected a bridge name in {entry}"))
                })?;
                bridges.bridge_url(name)
            }
            other => Err(FluxMonitorError::MalformedFeeds(format!(
                "expected a URL or bridge, got {other}"
            ))),
        })
        .collect()
}
