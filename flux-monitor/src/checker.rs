// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The polling deviation checker: a per-job actor that decides when to fetch
//! the off-chain value and when to submit it as a new aggregator round.
//!
//! Each checker is a single cooperative loop selecting over its stop signal,
//! buffered log broadcasts, the poll timer, the one-shot idle timer and the
//! one-shot round deadline. Exactly one decision runs at a time; the only
//! suspension points inside a decision are the aggregator RPC, the fetcher
//! and the run manager.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy::primitives::Address;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use futures::{
    channel::oneshot,
    future::{BoxFuture, Fuse, FutureExt},
    stream::StreamExt,
};
use num_bigint::BigInt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};

use crate::{
    contracts::{
        AggregatorLog, FluxAggregator, LogBroadcast, LogListener, NewRoundLog, RoundState,
        Unsubscribe,
    },
    deviation::{outside_deviation, scale_answer, DeviationThresholds},
    error::FluxMonitorError,
    feeds::Fetcher,
    funding::{sufficient_funds, sufficient_payment},
    job::{FluxMonitorInitiator, JobId},
    monitor::DeviationChecker,
    queue::{LogBacklog, PendingLog},
    rounds::RoundTracker,
    runs::{run_request_params, RunManager, RunRequest},
    timers::{make_idle_timer, round_deadline, Clock},
};

#[cfg(test)]
#[path = "unit_tests/checker_tests.rs"]
mod checker_tests;

/// State reachable from outside the checker loop: the log bus flips the
/// connectivity flag and fills the backlog while a decision may be in
/// flight.
struct CheckerShared {
    connected: AtomicBool,
    backlog: Mutex<LogBacklog>,
    wakeup: mpsc::Sender<()>,
}

/// The checker's face toward the log bus.
struct LogSink {
    job_id: JobId,
    shared: Arc<CheckerShared>,
}

#[async_trait]
impl LogListener for LogSink {
    fn on_connect(&self) {
        trace!(job = %self.job_id, "connected to the log bus");
        self.shared.connected.store(true, Ordering::SeqCst);
    }

    fn on_disconnect(&self) {
        trace!(job = %self.job_id, "disconnected from the log bus");
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    async fn handle_log(&self, broadcast: Arc<dyn LogBroadcast>) {
        let Some(log) = broadcast.log() else {
            trace!(job = %self.job_id, "ignoring broadcast without a recognized log");
            return;
        };
        match broadcast.was_already_consumed().await {
            Ok(false) => {}
            Ok(true) => {
                trace!(job = %self.job_id, round = %log.round_id(), "dropping consumed broadcast");
                return;
            }
            Err(error) => {
                warn!(job = %self.job_id, %error, "could not check whether broadcast was consumed");
                return;
            }
        }
        self.shared
            .backlog
            .lock()
            .expect("log backlog poisoned")
            .push(PendingLog { log, broadcast });
        // A pending wakeup already covers this log.
        let _ = self.shared.wakeup.try_send(());
    }
}

/// Timers to (re-)arm after handling buffered logs.
#[derive(Default)]
struct LogOutcome {
    idle_rearm: Option<BoxFuture<'static, ()>>,
    round_deadline: Option<Duration>,
}

/// The decision state of one checker. Owned by the run loop; nothing here is
/// shared.
pub(crate) struct CheckerCore {
    job_id: JobId,
    initiator: FluxMonitorInitiator,
    oracle_address: Address,
    thresholds: DeviationThresholds,
    minimum_contract_payment: BigInt,
    aggregator: Arc<dyn FluxAggregator>,
    fetcher: Arc<dyn Fetcher>,
    run_manager: Arc<dyn RunManager>,
    clock: Arc<dyn Clock>,
    rounds: RoundTracker,
    shared: Arc<CheckerShared>,
}

impl CheckerCore {
    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// One polling decision: fetch the round state, check eligibility,
    /// funding, payment and deviation, and enqueue a run if all pass.
    ///
    /// Returns the duration until the submitted round times out on-chain,
    /// when a run was enqueued for a round that carries a timeout.
    pub(crate) async fn poll_if_eligible(
        &mut self,
        thresholds: DeviationThresholds,
    ) -> Option<Duration> {
        if !self.connected() {
            trace!(job = %self.job_id, "not polling while disconnected");
            return None;
        }
        let state = match self.aggregator.round_state(self.oracle_address).await {
            Ok(state) => state,
            Err(error) => {
                warn!(job = %self.job_id, %error, "could not fetch round state");
                return None;
            }
        };
        if !state.eligible_to_submit {
            trace!(job = %self.job_id, round = state.reportable_round_id, "not eligible to submit");
            return None;
        }
        if !sufficient_funds(&state) {
            warn!(job = %self.job_id, "aggregator is underfunded, not submitting");
            return None;
        }
        if !sufficient_payment(&self.minimum_contract_payment, &state.payment_amount) {
            warn!(
                job = %self.job_id,
                payment = %state.payment_amount,
                "round pays less than the configured minimum, not submitting",
            );
            return None;
        }
        let reportable = BigInt::from(state.reportable_round_id);
        if self.rounds.already_submitted(&reportable) {
            trace!(job = %self.job_id, round = %reportable, "already submitted for this round");
            return None;
        }

        let answer = self.fetch_scaled().await?;
        let latest = BigDecimal::from(state.latest_answer.clone());
        if !outside_deviation(&latest, &BigDecimal::from(answer.clone()), thresholds) {
            debug!(job = %self.job_id, "answer inside deviation thresholds, not submitting");
            return None;
        }
        self.submit_round(&state, &answer).await?
    }

    /// Reacts to another oracle opening a round.
    ///
    /// The round already exists because someone else saw a deviation, so no
    /// deviation check here: submit whenever eligible, funded, paid enough,
    /// the log is not behind the chain, and the round is still unsubmitted.
    pub(crate) async fn respond_to_new_round_log(&mut self, log: &NewRoundLog) -> Option<Duration> {
        if log.started_by == self.oracle_address {
            trace!(job = %self.job_id, round = %log.round_id, "round started by us, nothing to do");
            return None;
        }
        if !self.connected() {
            trace!(job = %self.job_id, "ignoring new round while disconnected");
            return None;
        }
        let state = match self.aggregator.round_state(self.oracle_address).await {
            Ok(state) => state,
            Err(error) => {
                warn!(job = %self.job_id, %error, "could not fetch round state");
                return None;
            }
        };
        if !state.eligible_to_submit {
            trace!(job = %self.job_id, round = state.reportable_round_id, "not eligible to submit");
            return None;
        }
        if !sufficient_funds(&state) {
            warn!(job = %self.job_id, "aggregator is underfunded, not submitting");
            return None;
        }
        if !sufficient_payment(&self.minimum_contract_payment, &state.payment_amount) {
            warn!(job = %self.job_id, "round pays less than the configured minimum, not submitting");
            return None;
        }
        let reportable = BigInt::from(state.reportable_round_id);
        if log.round_id < reportable {
            debug!(
                job = %self.job_id,
                log_round = %log.round_id,
                reportable = %reportable,
                "chain has moved past the log's round",
            );
            return None;
        }
        let effective = log.round_id.clone().max(reportable.clone());
        if self.rounds.already_submitted(&effective) {
            trace!(job = %self.job_id, round = %effective, "already submitted for this round");
            return None;
        }

        let answer = self.fetch_scaled().await?;
        let deadline = self.submit_round(&state, &answer).await?;
        if log.round_id > reportable {
            // A replayed log for the same round must not pass the
            // already-submitted check again.
            self.rounds.mark_submitted(log.round_id.clone());
        }
        deadline
    }

    async fn fetch_scaled(&self) -> Option<BigInt> {
        match self.fetcher.fetch().await {
            Ok(polled) => Some(scale_answer(&polled, self.initiator.precision)),
            Err(error) => {
                warn!(job = %self.job_id, %error, "fetching the off-chain value failed");
                None
            }
        }
    }

    /// Hands a run request for `state.reportable_round_id` to the run
    /// manager and records the round as submitted.
    ///
    /// Returns `None` when no run was enqueued, so the round stays
    /// retryable. On success, the inner value is the duration until the
    /// round times out on-chain, when it carries a timeout.
    async fn submit_round(
        &mut self,
        state: &RoundState,
        answer: &BigInt,
    ) -> Option<Option<Duration>> {
        let selector = match self.aggregator.method_id("submit") {
            Ok(selector) => selector,
            Err(error) => {
                warn!(job = %self.job_id, %error, "could not resolve the submit selector");
                return None;
            }
        };
        let request = RunRequest {
            request_params: run_request_params(
                answer,
                &self.initiator.address,
                selector,
                state.reportable_round_id,
            ),
        };
        match self
            .run_manager
            .create(self.job_id, &self.initiator, None, request)
            .await
        {
            Ok(run) => info!(
                job = %self.job_id,
                run = run.id,
                round = state.reportable_round_id,
                answer = %answer,
                "run enqueued",
            ),
            Err(error) => {
                warn!(job = %self.job_id, %error, "run manager rejected the submission");
                return None;
            }
        }
        self.rounds.mark_submitted(BigInt::from(state.reportable_round_id));
        Some(round_deadline(state, self.clock.now()))
    }

    /// Handles every buffered broadcast, highest round first. Broadcasts are
    /// acknowledged whether or not they led to a submission.
    async fn drain_backlog(&mut self) -> LogOutcome {
        let mut outcome = LogOutcome::default();
        loop {
            let pending = self.shared.backlog.lock().expect("log backlog poisoned").pop();
            let Some(pending) = pending else { break };
            match &pending.log {
                AggregatorLog::NewRound(log) => {
                    if !self.initiator.idle_timer.disabled {
                        outcome.idle_rearm = Some(make_idle_timer(
                            log,
                            self.initiator.idle_timer.duration,
                            self.clock.as_ref(),
                        ));
                    }
                    if let Some(deadline) = self.respond_to_new_round_log(log).await {
                        outcome.round_deadline = Some(deadline);
                    }
                }
                AggregatorLog::AnswerUpdated(log) => {
                    trace!(job = %self.job_id, round = %log.round_id, "answer updated, acknowledging");
                }
            }
            if let Err(error) = pending.broadcast.mark_consumed().await {
                warn!(job = %self.job_id, %error, "could not mark broadcast consumed");
            }
            self.shared.backlog.lock().expect("log backlog poisoned").finish();
        }
        outcome
    }

    #[cfg(test)]
    pub(crate) fn rounds_mut(&mut self) -> &mut RoundTracker {
        &mut self.rounds
    }

    #[cfg(test)]
    pub(crate) fn thresholds(&self) -> DeviationThresholds {
        self.thresholds
    }
}

/// The checker loop. Runs until the stop signal fires, then tears down the
/// log subscription.
async fn run(
    mut core: CheckerCore,
    wakeups: mpsc::Receiver<()>,
    mut stop: oneshot::Receiver<()>,
    unsubscribe: Unsubscribe,
) {
    let clock = core.clock.clone();
    let thresholds = core.thresholds;
    let poll_config = core.initiator.poll_timer.clone();
    let idle_config = core.initiator.idle_timer.clone();

    let mut wakeups = ReceiverStream::new(wakeups).fuse();
    let mut poll_timer: Fuse<BoxFuture<'static, ()>> = if poll_config.disabled {
        Fuse::terminated()
    } else {
        clock.after(poll_config.period).fuse()
    };
    let mut idle_timer: Fuse<BoxFuture<'static, ()>> = if idle_config.disabled {
        Fuse::terminated()
    } else {
        clock.after(idle_config.duration).fuse()
    };
    let mut deadline_timer: Fuse<BoxFuture<'static, ()>> = Fuse::terminated();

    trace!(job = %core.job_id, "deviation checker started");
    loop {
        futures::select! {
            _ = stop => break,
            wakeup = wakeups.next() => {
                if wakeup.is_none() {
                    break;
                }
                let outcome = core.drain_backlog().await;
                if let Some(rearm) = outcome.idle_rearm {
                    idle_timer = rearm.fuse();
                }
                if let Some(duration) = outcome.round_deadline {
                    deadline_timer = clock.after(duration).fuse();
                }
            }
            _ = poll_timer => {
                poll_timer = clock.after(poll_config.period).fuse();
                if let Some(duration) = core.poll_if_eligible(thresholds).await {
                    deadline_timer = clock.after(duration).fuse();
                }
            }
            _ = idle_timer => {
                if let Some(duration) = core.poll_if_eligible(thresholds).await {
                    deadline_timer = clock.after(duration).fuse();
                }
            }
            _ = deadline_timer => {
                if let Some(duration) = core.poll_if_eligible(thresholds).await {
                    deadline_timer = clock.after(duration).fuse();
                }
            }
        }
    }
    unsubscribe();
    trace!(job = %core.job_id, "deviation checker stopped");
}

/// A per-job deviation checker.
///
/// Created by the supervisor through its factory; [`start`](Self::start)
/// subscribes to the aggregator's log stream and spawns the checker loop,
/// [`stop`](Self::stop) tears both down.
pub struct PollingDeviationChecker {
    sink: Arc<LogSink>,
    core: Option<CheckerCore>,
    wakeups: Option<mpsc::Receiver<()>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PollingDeviationChecker {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        initiator: FluxMonitorInitiator,
        oracle_address: Address,
        minimum_contract_payment: BigInt,
        aggregator: Arc<dyn FluxAggregator>,
        fetcher: Arc<dyn Fetcher>,
        run_manager: Arc<dyn RunManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (wakeup, wakeups) = mpsc::channel(1);
        let shared = Arc::new(CheckerShared {
            connected: AtomicBool::new(false),
            backlog: Mutex::new(LogBacklog::new()),
            wakeup,
        });
        let thresholds = DeviationThresholds {
            rel: initiator.threshold,
            abs: initiator.absolute_threshold,
        };
        let core = CheckerCore {
            job_id,
            initiator,
            oracle_address,
            thresholds,
            minimum_contract_payment,
            aggregator,
            fetcher,
            run_manager,
            clock,
            rounds: RoundTracker::new(),
            shared: shared.clone(),
        };
        PollingDeviationChecker {
            sink: Arc::new(LogSink { job_id, shared }),
            core: Some(core),
            wakeups: Some(wakeups),
            stop: None,
            task: None,
        }
    }

    pub fn on_connect(&self) {
        self.sink.on_connect();
    }

    pub fn on_disconnect(&self) {
        self.sink.on_disconnect();
    }

    /// Buffers a log broadcast for the checker loop. Nil and unrecognized
    /// payloads are dropped, as are broadcasts already consumed.
    pub async fn handle_log(&self, broadcast: Arc<dyn LogBroadcast>) {
        self.sink.handle_log(broadcast).await;
    }

    /// Subscribes to the aggregator's logs and spawns the checker loop.
    pub async fn start(&mut self) -> Result<(), FluxMonitorError> {
        let core = self.core.take().ok_or(FluxMonitorError::AlreadyStarted)?;
        let subscription = core.aggregator.subscribe_to_logs(self.sink.clone()).await?;
        if subscription.connected {
            self.sink.on_connect();
        }
        let wakeups = self
            .wakeups
            .take()
            .expect("wakeup receiver is present until the checker starts");
        let (stop, stopped) = oneshot::channel();
        self.stop = Some(stop);
        self.task = Some(tokio::spawn(run(core, wakeups, stopped, subscription.unsubscribe)));
        Ok(())
    }

    /// Signals the loop to exit at its next selection point and waits for it.
    /// Idempotent; a checker that never started is a no-op.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "deviation checker task failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn core_mut(&mut self) -> &mut CheckerCore {
        self.core.as_mut().expect("checker already started")
    }
}

#[async_trait]
impl DeviationChecker for PollingDeviationChecker {
    async fn start(&mut self) -> Result<(), FluxMonitorError> {
        PollingDeviationChecker::start(self).await
    }

    async fn stop(&mut self) {
        PollingDeviationChecker::stop(self).await;
    }
}
