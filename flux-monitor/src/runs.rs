// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Run requests handed to the run manager when a submission is due.

use alloy::primitives::{hex, Address};
use async_trait::async_trait;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::FluxMonitorError,
    job::{FluxMonitorInitiator, JobId},
};

/// A request to start a job run. `request_params` is a parsed JSON object.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RunRequest {
    pub request_params: Value,
}

/// Receipt for an enqueued run.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct JobRun {
    pub id: u64,
}

/// The run manager port: turns run requests into job executions.
#[async_trait]
pub trait RunManager: Send + Sync {
    async fn create(
        &self,
        job_id: JobId,
        initiator: &FluxMonitorInitiator,
        creation_height: Option<u64>,
        request: RunRequest,
    ) -> Result<JobRun, FluxMonitorError>;
}

/// Builds the submission parameters for `round_id`.
///
/// `result` carries the scaled answer as a decimal string; `data_prefix` is
/// the round id as a 32-byte big-endian EVM word.
pub fn run_request_params(
    result: &BigInt,
    aggregator: &Address,
    submit_selector: [u8; 4],
    round_id: u32,
) -> Value {
    json!({
        "result": result.to_string(),
        "address": format!("{aggregator:#x}"),
        "functionSelector": format!("0x{}", hex::encode(submit_selector)),
        "dataPrefix": format!("0x{round_id:064x}"),
    })
}
