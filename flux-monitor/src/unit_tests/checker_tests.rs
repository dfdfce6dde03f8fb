// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use num_bigint::BigInt;
use serde_json::{json, Value};
use test_case::test_case;

use super::*;
use crate::{
    job::{IdleTimerConfig, PollTimerConfig},
    test_utils::{MockAggregator, MockFetcher, MockLogBroadcast, MockRunManager, TestClock},
};

const ORACLE: Address = Address::new([0x11; 20]);
const OTHER_ORACLE: Address = Address::new([0x22; 20]);
const AGGREGATOR_ADDRESS: Address = Address::new([0xab; 20]);
const MIN_PAYMENT: i64 = 100;
const ORACLE_COUNT: u32 = 17;

fn test_initiator() -> FluxMonitorInitiator {
    FluxMonitorInitiator {
        address: AGGREGATOR_ADDRESS,
        precision: 0,
        threshold: 0.1,
        absolute_threshold: 10.0,
        poll_timer: PollTimerConfig {
            disabled: true,
            period: Duration::from_secs(1),
        },
        idle_timer: IdleTimerConfig {
            disabled: true,
            duration: Duration::from_secs(2),
        },
        feeds: json!(["https://example.com/price"]),
    }
}

struct Harness {
    aggregator: Arc<MockAggregator>,
    fetcher: Arc<MockFetcher>,
    runs: Arc<MockRunManager>,
    clock: Arc<TestClock>,
    checker: PollingDeviationChecker,
}

fn harness_with(initiator: FluxMonitorInitiator, fetched_answer: i64) -> Harness {
    let aggregator = Arc::new(MockAggregator::new());
    let fetcher = Arc::new(MockFetcher::returning(fetched_answer));
    let runs = Arc::new(MockRunManager::new());
    let clock = Arc::new(TestClock::at(0));
    let checker = PollingDeviationChecker::new(
        JobId(1),
        initiator,
        ORACLE,
        BigInt::from(MIN_PAYMENT),
        aggregator.clone(),
        fetcher.clone(),
        runs.clone(),
        clock.clone(),
    );
    Harness {
        aggregator,
        fetcher,
        runs,
        clock,
        checker,
    }
}

fn harness() -> Harness {
    harness_with(test_initiator(), 100)
}

fn round_state(reportable: u32, eligible: bool, funded: bool) -> RoundState {
    let payment_amount = BigInt::from(MIN_PAYMENT);
    let available_funds = if funded {
        &payment_amount * 10_000u32
    } else {
        BigInt::from(1)
    };
    RoundState {
        reportable_round_id: reportable,
        eligible_to_submit: eligible,
        latest_answer: BigInt::from(100),
        available_funds,
        payment_amount,
        oracle_count: ORACLE_COUNT,
        started_at: 0,
        timeout: 0,
    }
}

fn expected_params(result: &str, round: u32) -> Value {
    json!({
        "result": result,
        "address": format!("{AGGREGATOR_ADDRESS:#x}"),
        "functionSelector": "0x202ee0ed",
        "dataPrefix": format!("0x{round:064x}"),
    })
}

// ---------------------------------------------------------------------------
// poll_if_eligible

#[test_case(true, true, true, 1, 100, true, true; "eligible connected funded deviating")]
#[test_case(true, true, true, 100, 100, true, false; "eligible connected funded steady")]
#[test_case(true, false, true, 1, 100, false, false; "eligible disconnected funded deviating")]
#[test_case(true, false, true, 100, 100, false, false; "eligible disconnected funded steady")]
#[test_case(false, true, true, 1, 100, false, false; "ineligible connected funded deviating")]
#[test_case(false, true, true, 100, 100, false, false; "ineligible connected funded steady")]
#[test_case(false, false, true, 1, 100, false, false; "ineligible disconnected funded deviating")]
#[test_case(false, false, true, 100, 100, false, false; "ineligible disconnected funded steady")]
#[test_case(true, true, false, 1, 100, false, false; "eligible connected underfunded deviating")]
#[test_case(true, true, false, 100, 100, false, false; "eligible connected underfunded steady")]
#[test_case(true, false, false, 1, 100, false, false; "eligible disconnected underfunded deviating")]
#[test_case(true, false, false, 100, 100, false, false; "eligible disconnected underfunded steady")]
#[test_case(false, true, false, 1, 100, false, false; "ineligible connected underfunded deviating")]
#[test_case(false, true, false, 100, 100, false, false; "ineligible connected underfunded steady")]
#[test_case(false, false, false, 1, 100, false, false; "ineligible disconnected underfunded deviating")]
#[test_case(false, false, false, 100, 100, false, false; "ineligible disconnected underfunded steady")]
#[tokio::test]
async fn test_poll_if_eligible(
    eligible: bool,
    connected: bool,
    funded: bool,
    latest_answer: i64,
    polled_answer: i64,
    expected_to_poll: bool,
    expected_to_submit: bool,
) {
    let mut harness = harness_with(test_initiator(), polled_answer);
    let mut state = round_state(2, eligible, funded);
    state.latest_answer = BigInt::from(latest_answer);
    harness.aggregator.enqueue_round_state(state);
    if connected {
        harness.checker.on_connect();
    }

    let thresholds = harness.checker.core_mut().thresholds();
    harness.checker.core_mut().poll_if_eligible(thresholds).await;

    if !connected {
        assert_eq!(harness.aggregator.round_state_calls(), 0);
    }
    assert_eq!(harness.fetcher.fetch_count(), usize::from(expected_to_poll));
    let runs = harness.runs.runs();
    if expected_to_submit {
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, JobId(1));
        assert_eq!(
            runs[0].request_params,
            expected_params(&polled_answer.to_string(), 2),
        );
    } else {
        assert!(runs.is_empty());
    }
}

#[tokio::test]
async fn test_poll_scales_answer_by_precision() {
    let mut initiator = test_initiator();
    initiator.precision = 2;
    let mut harness = harness_with(initiator, 100);
    // latest_answer is in scaled units; 100 on-chain is 1.00 off-chain.
    harness.aggregator.enqueue_round_state(round_state(7, true, true));
    harness.checker.on_connect();

    let thresholds = harness.checker.core_mut().thresholds();
    harness.checker.core_mut().poll_if_eligible(thresholds).await;

    let runs = harness.runs.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].request_params, expected_params("10000", 7));
}

#[tokio::test]
async fn test_poll_skips_rounds_already_submitted() {
    let mut harness = harness();
    let mut state = round_state(2, true, true);
    state.latest_answer = BigInt::from(1);
    harness.aggregator.enqueue_round_state(state.clone());
    harness.aggregator.enqueue_round_state(state);
    harness.checker.on_connect();

    let thresholds = harness.checker.core_mut().thresholds();
    harness.checker.core_mut().poll_if_eligible(thresholds).await;
    harness.checker.core_mut().poll_if_eligible(thresholds).await;

    // The second poll stops at the round bookkeeping, before fetching.
    assert_eq!(harness.aggregator.round_state_calls(), 2);
    assert_eq!(harness.fetcher.fetch_count(), 1);
    assert_eq!(harness.runs.run_count(), 1);
}

#[tokio::test]
async fn test_fetch_failure_aborts_without_marking_the_round() {
    let aggregator = Arc::new(MockAggregator::new());
    let fetcher = Arc::new(MockFetcher::erroring());
    let runs = Arc::new(MockRunManager::new());
    let clock = Arc::new(TestClock::at(0));
    let mut checker = PollingDeviationChecker::new(
        JobId(1),
        test_initiator(),
        ORACLE,
        BigInt::from(MIN_PAYMENT),
        aggregator.clone(),
        fetcher.clone(),
        runs.clone(),
        clock,
    );
    let mut state = round_state(2, true, true);
    state.latest_answer = BigInt::from(1);
    aggregator.enqueue_round_state(state.clone());
    aggregator.enqueue_round_state(state);
    checker.on_connect();

    let thresholds = checker.core_mut().thresholds();
    checker.core_mut().poll_if_eligible(thresholds).await;
    assert_eq!(runs.run_count(), 0);

    // The round was not marked submitted, so the next tick retries the fetch.
    checker.core_mut().poll_if_eligible(thresholds).await;
    assert_eq!(fetcher.fetch_count(), 2);
    assert_eq!(runs.run_count(), 0);
}

// ---------------------------------------------------------------------------
// respond_to_new_round_log

async fn respond_case(
    stored: i64,
    fetched: u32,
    log_round: i64,
    eligible: bool,
    funded: bool,
    self_started: bool,
) {
    let mut harness = harness();
    let expected_to_submit =
        !self_started && eligible && funded && log_round >= i64::from(fetched);
    if !self_started {
        harness.aggregator.enqueue_round_state(round_state(fetched, eligible, funded));
    }
    harness.checker.on_connect();
    let core = harness.checker.core_mut();
    core.rounds_mut().set_reportable_round_id(BigInt::from(stored));

    let log = NewRoundLog {
        round_id: BigInt::from(log_round),
        started_by: if self_started { ORACLE } else { OTHER_ORACLE },
        started_at: None,
    };
    core.respond_to_new_round_log(&log).await;

    let context = format!(
        "stored={stored} fetched={fetched} log={log_round} \
         eligible={eligible} funded={funded} self_started={self_started}",
    );
    if self_started {
        assert_eq!(harness.aggregator.round_state_calls(), 0, "{context}");
    }
    assert_eq!(
        harness.fetcher.fetch_count(),
        usize::from(expected_to_submit),
        "{context}",
    );
    let runs = harness.runs.runs();
    assert_eq!(runs.len(), usize::from(expected_to_submit), "{context}");
    if expected_to_submit {
        // The run targets the chain's reportable round, not the log's.
        assert_eq!(runs[0].request_params, expected_params("100", fetched), "{context}");
    }
}

/// Every ordering of (stored, fetched, log) round ids, against every
/// combination of eligibility, funding and who started the round. A
/// submission happens exactly when the round was started by someone else,
/// we are eligible and funded, and the log is not behind the chain; the
/// stored round id never suppresses on its own, and deviation is not
/// consulted (the fetched answer equals the latest one throughout).
#[tokio::test]
async fn test_respond_to_new_round_id_orderings() {
    let round_id_cases: [(i64, u32, i64); 12] = [
        (5, 10, 15),  // stored < fetched < log
        (5, 15, 10),  // stored < log < fetched
        (10, 5, 15),  // fetched < stored < log
        (15, 5, 10),  // fetched < log < stored
        (15, 10, 5),  // log < fetched < stored
        (10, 15, 5),  // log < stored < fetched
        (5, 10, 10),  // stored < fetched = log
        (5, 5, 10),   // stored = fetched < log
        (5, 10, 5),   // stored = log < fetched
        (10, 5, 10),  // fetched < stored = log
        (10, 5, 5),   // fetched = log < stored
        (10, 10, 5),  // log < fetched = stored
    ];
    for (stored, fetched, log_round) in round_id_cases {
        for eligible in [true, false] {
            for funded in [true, false] {
                for self_started in [true, false] {
                    respond_case(stored, fetched, log_round, eligible, funded, self_started)
                        .await;
                }
            }
        }
    }
}

#[tokio::test]
async fn test_replayed_log_does_not_resubmit() {
    let mut harness = harness();
    harness.aggregator.enqueue_round_state(round_state(3, true, true));
    harness.aggregator.enqueue_round_state(round_state(3, true, true));
    harness.checker.on_connect();

    let log = NewRoundLog {
        round_id: BigInt::from(5),
        started_by: OTHER_ORACLE,
        started_at: None,
    };
    let core = harness.checker.core_mut();
    core.respond_to_new_round_log(&log).await;
    core.respond_to_new_round_log(&log).await;

    assert_eq!(harness.runs.run_count(), 1);
}

#[tokio::test]
async fn test_rejected_submission_leaves_the_round_retryable() {
    let mut harness = harness();
    harness.runs.fail_next_creates(1);
    harness.aggregator.enqueue_round_state(round_state(3, true, true));
    harness.aggregator.enqueue_round_state(round_state(3, true, true));
    harness.checker.on_connect();

    let log = NewRoundLog {
        round_id: BigInt::from(5),
        started_by: OTHER_ORACLE,
        started_at: None,
    };
    harness.checker.core_mut().respond_to_new_round_log(&log).await;
    assert_eq!(harness.runs.run_count(), 0);

    // Neither the reportable nor the log round was marked submitted, so the
    // replayed log goes through the whole pipeline again and succeeds.
    harness.checker.core_mut().respond_to_new_round_log(&log).await;
    let runs = harness.runs.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].request_params, expected_params("100", 3));
}

#[tokio::test]
async fn test_respond_ignores_rounds_while_disconnected() {
    let mut harness = harness();
    let log = NewRoundLog {
        round_id: BigInt::from(3),
        started_by: OTHER_ORACLE,
        started_at: None,
    };
    harness.checker.core_mut().respond_to_new_round_log(&log).await;

    assert_eq!(harness.aggregator.round_state_calls(), 0);
    assert_eq!(harness.fetcher.fetch_count(), 0);
    assert_eq!(harness.runs.run_count(), 0);
}

// ---------------------------------------------------------------------------
// Log ingestion and the running checker

#[tokio::test]
async fn test_buffers_logs_and_evicts_the_stalest() {
    let mut harness = harness();
    // Round states are scripted in call order: the blocked handling of the
    // round-1 log, then whatever the checker processes after unblocking.
    harness.aggregator.enqueue_round_state(round_state(1, true, true));
    harness.aggregator.enqueue_round_state(round_state(3, true, true));
    harness.aggregator.enqueue_round_state(round_state(4, true, true));
    let unblock = harness.aggregator.block_next_round_state();

    harness.checker.on_connect();
    harness.checker.start().await.unwrap();

    let broadcasts: Vec<Arc<MockLogBroadcast>> = (1..=4)
        .map(|round| Arc::new(MockLogBroadcast::new_round(round)))
        .collect();

    // Freeze the checker inside the round-1 decision, then flood it.
    harness.checker.handle_log(broadcasts[0].clone()).await;
    harness.aggregator.entered_round_state().await;
    for broadcast in &broadcasts[1..] {
        harness.checker.handle_log(broadcast.clone()).await;
    }
    unblock.send(()).unwrap();

    harness.runs.wait_for_runs(2).await;
    harness.checker.stop().await;

    // Round 2 was evicted from the backlog; 1, 4 and 3 were handled, in
    // that order. The log for round 4 submitted against the chain's round 3;
    // by the time the round-3 log came up the chain had moved to round 4, so
    // it was acknowledged without a submission.
    assert_eq!(harness.aggregator.round_state_calls(), 3);
    let runs = harness.runs.runs();
    assert_eq!(runs[0].request_params, expected_params("100", 1));
    assert_eq!(runs[1].request_params, expected_params("100", 3));
    assert!(broadcasts[0].was_marked_consumed());
    assert!(!broadcasts[1].was_marked_consumed());
    assert!(broadcasts[2].was_marked_consumed());
    assert!(broadcasts[3].was_marked_consumed());
}

#[tokio::test]
async fn test_handles_nil_and_foreign_broadcasts() {
    let mut harness = harness();
    harness.checker.on_connect();

    harness
        .checker
        .handle_log(Arc::new(MockLogBroadcast::unrecognized()))
        .await;
    let consumed = Arc::new(MockLogBroadcast::consumed_new_round(1));
    harness.checker.handle_log(consumed.clone()).await;

    // Nothing reached the backlog, so draining does no work.
    harness.checker.core_mut().drain_backlog().await;
    assert_eq!(harness.aggregator.round_state_calls(), 0);
    assert_eq!(harness.runs.run_count(), 0);
    assert!(!consumed.was_marked_consumed());
}

#[tokio::test]
async fn test_answer_updated_is_acknowledged_only() {
    let mut harness = harness();
    harness.checker.on_connect();

    let broadcast = Arc::new(MockLogBroadcast::answer_updated(9));
    harness.checker.handle_log(broadcast.clone()).await;
    harness.checker.core_mut().drain_backlog().await;

    assert!(broadcast.was_marked_consumed());
    assert_eq!(harness.aggregator.round_state_calls(), 0);
    assert_eq!(harness.runs.run_count(), 0);
}

// ---------------------------------------------------------------------------
// Timers

#[tokio::test(start_paused = true)]
async fn test_idle_timer_triggers_polls() {
    let mut initiator = test_initiator();
    initiator.idle_timer = IdleTimerConfig {
        disabled: false,
        duration: Duration::from_secs(2),
    };
    let mut harness = harness_with(initiator, 100);
    for round in [2, 3, 4] {
        harness.aggregator.enqueue_round_state(round_state(round, false, true));
    }

    harness.checker.start().await.unwrap();

    // First idle expiry.
    harness.aggregator.entered_round_state().await;
    assert_eq!(harness.aggregator.round_state_calls(), 1);

    // A new round re-arms the idle timer...
    harness
        .checker
        .handle_log(Arc::new(MockLogBroadcast::new_round(1)))
        .await;
    harness.aggregator.entered_round_state().await;
    assert_eq!(harness.aggregator.round_state_calls(), 2);

    // ...which expires again after the full duration.
    harness.aggregator.entered_round_state().await;
    assert_eq!(harness.aggregator.round_state_calls(), 3);

    harness.checker.stop().await;
    // Never eligible: plenty of checks, no fetches, no runs.
    assert_eq!(harness.fetcher.fetch_count(), 0);
    assert_eq!(harness.runs.run_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_idle_timer_never_fires() {
    let mut harness = harness();
    harness.checker.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    harness.checker.stop().await;

    assert_eq!(harness.aggregator.round_state_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_timer_fires_periodically() {
    let mut initiator = test_initiator();
    initiator.poll_timer = PollTimerConfig {
        disabled: false,
        period: Duration::from_secs(5),
    };
    let mut harness = harness_with(initiator, 100);
    for round in [2, 3] {
        harness.aggregator.enqueue_round_state(round_state(round, false, true));
    }

    harness.checker.start().await.unwrap();
    harness.aggregator.entered_round_state().await;
    harness.aggregator.entered_round_state().await;
    harness.checker.stop().await;

    assert!(harness.aggregator.round_state_calls() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_round_timeout_nudges_a_poll_after_submission() {
    let mut harness = harness();
    harness.clock.set_now(1_000);
    let mut submitted = round_state(1, true, true);
    submitted.latest_answer = BigInt::from(1);
    submitted.started_at = 1_000;
    submitted.timeout = 3;
    harness.aggregator.enqueue_round_state(submitted);
    // What the nudged poll sees: still round 1, already submitted.
    harness.aggregator.enqueue_round_state(round_state(1, true, true));

    harness.checker.start().await.unwrap();
    harness
        .checker
        .handle_log(Arc::new(MockLogBroadcast::new_round(1)))
        .await;
    harness.aggregator.entered_round_state().await;
    harness.runs.wait_for_runs(1).await;

    // The armed deadline fires and retries the decision, which stops at the
    // already-submitted round.
    harness.aggregator.entered_round_state().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    harness.checker.stop().await;

    assert_eq!(harness.aggregator.round_state_calls(), 2);
    assert_eq!(harness.runs.run_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_round_timeout_means_no_nudge() {
    let mut harness = harness();
    let mut submitted = round_state(1, true, true);
    submitted.latest_answer = BigInt::from(1);
    harness.aggregator.enqueue_round_state(submitted);

    harness.checker.start().await.unwrap();
    harness
        .checker
        .handle_log(Arc::new(MockLogBroadcast::new_round(1)))
        .await;
    harness.runs.wait_for_runs(1).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    harness.checker.stop().await;

    assert_eq!(harness.aggregator.round_state_calls(), 1);
}

// ---------------------------------------------------------------------------
// Lifecycle

#[tokio::test]
async fn test_stop_unsubscribes_exactly_once() {
    let mut harness = harness();
    harness.checker.start().await.unwrap();
    harness.checker.stop().await;
    assert_eq!(harness.aggregator.unsubscribe_count(), 1);

    // Stopping again is a no-op.
    harness.checker.stop().await;
    assert_eq!(harness.aggregator.unsubscribe_count(), 1);
}

#[tokio::test]
async fn test_subscription_reports_initial_connectivity() {
    let mut harness = harness();
    harness.aggregator.set_initially_connected(false);
    harness.aggregator.enqueue_round_state(round_state(1, true, true));
    harness.checker.start().await.unwrap();

    // Not connected yet: a buffered round is ignored at the decision.
    harness
        .checker
        .handle_log(Arc::new(MockLogBroadcast::new_round(1)))
        .await;
    tokio::task::yield_now().await;
    assert_eq!(harness.runs.run_count(), 0);
    harness.checker.stop().await;
}
