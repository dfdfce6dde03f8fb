// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The flux monitor supervisor: owns one deviation checker per flux-monitor
//! job and attaches/detaches them as jobs come and go.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{error, info, trace};

use crate::{
    config::MonitorConfig,
    error::FluxMonitorError,
    job::{FluxMonitorInitiator, JobId, JobSpec},
    runs::RunManager,
};

#[cfg(test)]
#[path = "unit_tests/monitor_tests.rs"]
mod monitor_tests;

/// A running per-job checker, as the supervisor sees it.
#[async_trait]
pub trait DeviationChecker: Send + Sync {
    async fn start(&mut self) -> Result<(), FluxMonitorError>;

    async fn stop(&mut self);
}

/// Builds checkers for flux-monitor initiators. Injected so tests can
/// substitute their own.
pub trait DeviationCheckerFactory: Send + Sync {
    fn new_checker(
        &self,
        job_id: JobId,
        initiator: &FluxMonitorInitiator,
        run_manager: Arc<dyn RunManager>,
        timeout: Duration,
    ) -> Result<Box<dyn DeviationChecker>, FluxMonitorError>;
}

/// The log bus lifecycle, as far as the supervisor drives it.
pub trait LogBroadcaster: Send + Sync {
    fn start(&self) -> Result<(), FluxMonitorError>;

    fn stop(&self);
}

/// Per-process registry of deviation checkers.
pub struct FluxMonitor {
    config: MonitorConfig,
    run_manager: Arc<dyn RunManager>,
    log_broadcaster: Arc<dyn LogBroadcaster>,
    factory: Box<dyn DeviationCheckerFactory>,
    checkers: DashMap<JobId, Vec<Box<dyn DeviationChecker>>>,
}

impl FluxMonitor {
    pub fn new(
        config: MonitorConfig,
        run_manager: Arc<dyn RunManager>,
        log_broadcaster: Arc<dyn LogBroadcaster>,
        factory: Box<dyn DeviationCheckerFactory>,
    ) -> Self {
        FluxMonitor {
            config,
            run_manager,
            log_broadcaster,
            factory,
            checkers: DashMap::new(),
        }
    }

    /// Starts the log bus, unless on-chain integration is disabled. In that
    /// case no subscriptions exist and no checker will receive logs, but
    /// starting the supervisor still succeeds.
    pub fn start(&self) -> Result<(), FluxMonitorError> {
        if self.config.eth_disabled {
            info!("on-chain integration is disabled, not starting the log broadcaster");
            return Ok(());
        }
        self.log_broadcaster.start()
    }

    /// Builds and starts a checker for every flux-monitor initiator of
    /// `job`. Jobs without one are ignored.
    ///
    /// On failure, checkers already started for this job are stopped again
    /// before the error surfaces; a partially added job holds no live
    /// checkers.
    pub async fn add_job(&self, job: &JobSpec) -> Result<(), FluxMonitorError> {
        let mut checkers = Vec::new();
        for initiator in job.flux_monitor_initiators() {
            let mut checker = match self.factory.new_checker(
                job.id,
                initiator,
                self.run_manager.clone(),
                self.config.default_http_timeout,
            ) {
                Ok(checker) => checker,
                Err(err) => {
                    error!(job = %job.id, error = %err, "could not build a deviation checker");
                    Self::stop_checkers(checkers).await;
                    return Err(err);
                }
            };
            if let Err(err) = checker.start().await {
                error!(job = %job.id, error = %err, "could not start a deviation checker");
                Self::stop_checkers(checkers).await;
                return Err(err);
            }
            checkers.push(checker);
        }
        if !checkers.is_empty() {
            self.checkers.insert(job.id, checkers);
        }
        Ok(())
    }

    /// Stops and drops the checkers of `job_id`. Idempotent.
    pub async fn remove_job(&self, job_id: JobId) {
        let Some((_, checkers)) = self.checkers.remove(&job_id) else {
            trace!(job = %job_id, "no deviation checkers to remove");
            return;
        };
        Self::stop_checkers(checkers).await;
    }

    async fn stop_checkers(checkers: Vec<Box<dyn DeviationChecker>>) {
        for mut checker in checkers {
            checker.stop().await;
        }
    }

    /// Stops all checkers and the log bus.
    pub async fn stop(&self) {
        let job_ids: Vec<JobId> = self.checkers.iter().map(|entry| *entry.key()).collect();
        for job_id in job_ids {
            self.remove_job(job_id).await;
        }
        if !self.config.eth_disabled {
            self.log_broadcaster.stop();
        }
    }
}
