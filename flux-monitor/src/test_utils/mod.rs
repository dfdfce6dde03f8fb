// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ready-made collaborator doubles for tests and similar purposes.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy::primitives::Address;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use futures::future::BoxFuture;
use num_bigint::BigInt;
use serde_json::Value;
use tokio::sync::Notify;
use url::Url;

use crate::{
    contracts::{
        method_selector, AggregatorLog, AnswerUpdatedLog, FluxAggregator, LogBroadcast,
        LogListener, LogSubscription, NewRoundLog, RoundState, SUBMIT_SIGNATURE,
    },
    error::FluxMonitorError,
    feeds::{BridgeLookup, Fetcher},
    job::{FluxMonitorInitiator, JobId},
    monitor::LogBroadcaster,
    runs::{JobRun, RunManager, RunRequest},
    timers::Clock,
};

/// An aggregator whose round states are scripted in call order.
///
/// `block_next_round_state` turns the next `round_state` call into a
/// rendezvous: the call signals `entered_round_state` and then waits for the
/// returned sender, which lets tests fill the log backlog while the checker
/// is mid-decision.
#[derive(Default)]
pub struct MockAggregator {
    states: Mutex<VecDeque<RoundState>>,
    round_state_calls: AtomicUsize,
    gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    entered: Notify,
    initially_connected: AtomicBool,
    unsubscribes: Arc<AtomicUsize>,
}

impl MockAggregator {
    pub fn new() -> Self {
        let aggregator = Self::default();
        aggregator.initially_connected.store(true, Ordering::SeqCst);
        aggregator
    }

    pub fn enqueue_round_state(&self, state: RoundState) {
        self.states.lock().unwrap().push_back(state);
    }

    /// Makes the next `round_state` call block until the returned sender
    /// fires (or is dropped).
    pub fn block_next_round_state(&self) -> tokio::sync::oneshot::Sender<()> {
        let (unblock, blocked) = tokio::sync::oneshot::channel();
        *self.gate.lock().unwrap() = Some(blocked);
        unblock
    }

    /// Waits until a `round_state` call has been entered.
    pub async fn entered_round_state(&self) {
        self.entered.notified().await;
    }

    pub fn round_state_calls(&self) -> usize {
        self.round_state_calls.load(Ordering::SeqCst)
    }

    pub fn set_initially_connected(&self, connected: bool) {
        self.initially_connected.store(connected, Ordering::SeqCst);
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FluxAggregator for MockAggregator {
    async fn round_state(&self, _oracle: Address) -> Result<RoundState, FluxMonitorError> {
        self.round_state_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.states
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| FluxMonitorError::Aggregator("no scripted round state".into()))
    }

    fn method_id(&self, name: &str) -> Result<[u8; 4], FluxMonitorError> {
        match name {
            "submit" => Ok(method_selector(SUBMIT_SIGNATURE)),
            other => Err(FluxMonitorError::Aggregator(format!("unknown method {other:?}"))),
        }
    }

    async fn subscribe_to_logs(
        &self,
        _listener: Arc<dyn LogListener>,
    ) -> Result<LogSubscription, FluxMonitorError> {
        let unsubscribes = self.unsubscribes.clone();
        Ok(LogSubscription {
            connected: self.initially_connected.load(Ordering::SeqCst),
            unsubscribe: Box::new(move || {
                unsubscribes.fetch_add(1, Ordering::SeqCst);
            }),
        })
    }
}

/// A fetcher returning a fixed answer, or an error when none is set.
#[derive(Default)]
pub struct MockFetcher {
    answer: Mutex<Option<BigDecimal>>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn returning(answer: i64) -> Self {
        let fetcher = Self::default();
        *fetcher.answer.lock().unwrap() = Some(BigDecimal::from(answer));
        fetcher
    }

    pub fn erroring() -> Self {
        Self::default()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self) -> Result<BigDecimal, FluxMonitorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FluxMonitorError::Fetch("no scripted answer".into()))
    }
}

/// A run handed to [`MockRunManager`].
#[derive(Clone, Debug)]
pub struct RecordedRun {
    pub job_id: JobId,
    pub request_params: Value,
}

/// Records every run request instead of executing it.
#[derive(Default)]
pub struct MockRunManager {
    runs: Mutex<Vec<RecordedRun>>,
    notify: Notify,
    failures_remaining: AtomicUsize,
}

impl MockRunManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` create calls fail without recording a run.
    pub fn fail_next_creates(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    /// Waits until at least `count` runs have been recorded.
    pub async fn wait_for_runs(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.run_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RunManager for MockRunManager {
    async fn create(
        &self,
        job_id: JobId,
        _initiator: &FluxMonitorInitiator,
        _creation_height: Option<u64>,
        request: RunRequest,
    ) -> Result<JobRun, FluxMonitorError> {
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if failed {
            return Err(FluxMonitorError::RunManager("scripted rejection".into()));
        }
        let mut runs = self.runs.lock().unwrap();
        runs.push(RecordedRun {
            job_id,
            request_params: request.request_params,
        });
        let id = runs.len() as u64;
        drop(runs);
        self.notify.notify_waiters();
        Ok(JobRun { id })
    }
}

/// A scripted log broadcast envelope.
pub struct MockLogBroadcast {
    log: Option<AggregatorLog>,
    already_consumed: bool,
    consumed: AtomicBool,
}

impl MockLogBroadcast {
    pub fn from_log(log: AggregatorLog) -> Self {
        MockLogBroadcast {
            log: Some(log),
            already_consumed: false,
            consumed: AtomicBool::new(false),
        }
    }

    /// A `NewRound` broadcast started by the zero address, with no start
    /// time.
    pub fn new_round(round: i64) -> Self {
        Self::from_log(AggregatorLog::NewRound(NewRoundLog {
            round_id: BigInt::from(round),
            started_by: Address::ZERO,
            started_at: None,
        }))
    }

    pub fn answer_updated(round: i64) -> Self {
        Self::from_log(AggregatorLog::AnswerUpdated(AnswerUpdatedLog {
            round_id: BigInt::from(round),
            current: BigInt::from(0),
        }))
    }

    /// A broadcast whose payload failed decoding.
    pub fn unrecognized() -> Self {
        MockLogBroadcast {
            log: None,
            already_consumed: false,
            consumed: AtomicBool::new(false),
        }
    }

    /// A broadcast that reports itself as previously consumed.
    pub fn consumed_new_round(round: i64) -> Self {
        let mut broadcast = Self::new_round(round);
        broadcast.already_consumed = true;
        broadcast
    }

    pub fn was_marked_consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogBroadcast for MockLogBroadcast {
    fn log(&self) -> Option<AggregatorLog> {
        self.log.clone()
    }

    async fn was_already_consumed(&self) -> Result<bool, FluxMonitorError> {
        Ok(self.already_consumed)
    }

    async fn mark_consumed(&self) -> Result<(), FluxMonitorError> {
        self.consumed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A bridge registry backed by a map.
#[derive(Default)]
pub struct MockBridges {
    bridges: HashMap<String, Url>,
}

impl MockBridges {
    pub fn with_bridge(name: &str, url: &str) -> Self {
        let mut bridges = Self::default();
        bridges.insert(name, url);
        bridges
    }

    pub fn insert(&mut self, name: &str, url: &str) {
        self.bridges
            .insert(name.to_string(), Url::parse(url).expect("valid bridge URL"));
    }
}

impl BridgeLookup for MockBridges {
    fn bridge_url(&self, name: &str) -> Result<Url, FluxMonitorError> {
        self.bridges
            .get(name)
            .cloned()
            .ok_or_else(|| FluxMonitorError::UnknownBridge(name.to_string()))
    }
}

/// A clock with a settable wall time; timers still run on the tokio clock,
/// so tests pause and auto-advance it.
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    pub fn at(now: i64) -> Self {
        TestClock {
            now: AtomicI64::new(now),
        }
    }

    pub fn set_now(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A log bus that only remembers whether it was started.
#[derive(Default)]
pub struct MockLogBroadcaster {
    started: AtomicBool,
}

impl MockLogBroadcaster {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl LogBroadcaster for MockLogBroadcaster {
    fn start(&self) -> Result<(), FluxMonitorError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }
}
