//! # Load-Test Orchestrator
//!
//! Spawns one task per simulated client and collects their outcomes in a single
//! loop; that loop is the only place run counters are touched.
//!
//! ## Run Shape:
//! - Client `i` sleeps for its ramp-up offset, then waits for a concurrency
//!   permit, then runs its script
//! - Cancellation stops clients that have not started yet and asks running
//!   clients to close in order
//! - At the run deadline every remaining task is aborted and counted as a
//!   timeout, so a run always ends

use crate::error::ErrorCode;
use crate::loadtest::client::{run_client, ClientScript};
use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::connector::Connector;
use crate::loadtest::stats::{Aggregator, ClientOutcome, LoadTestReport, Progress};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a run needs besides the per-run config.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub connector: Connector,
    pub response_timeout: Duration,
    pub deadline_slack: Duration,
    pub progress_interval: Duration,
}

/// Execute one load-test run to completion.
///
/// `progress` receives periodic snapshots; a slow or missing reader never
/// stalls the run.
pub async fn run_load_test(
    config: LoadTestConfig,
    options: RunOptions,
    cancel: CancellationToken,
    progress: Option<mpsc::Sender<Progress>>,
) -> LoadTestReport {
    let total = config.total_sessions();
    let run_started = Instant::now();
    let deadline = run_started + config.deadline(options.deadline_slack);
    let script = Arc::new(ClientScript::from_config(&config, options.response_timeout));
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let started = Arc::new(AtomicUsize::new(0));

    info!(
        endpoint = %options.connector.describe(),
        sessions = total,
        concurrency = config.concurrency,
        frame_count = config.frame_count,
        frame_size = config.frame_size,
        "Load test starting"
    );

    let mut clients = JoinSet::new();
    for index in 0..total {
        let offset = config.start_offset(index);
        let connector = options.connector.clone();
        let script = script.clone();
        let permits = permits.clone();
        let cancel = cancel.clone();
        let started = started.clone();

        clients.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ClientOutcome::Skipped,
                _ = sleep(offset) => {}
            }
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ClientOutcome::Skipped,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return ClientOutcome::Skipped,
                },
            };
            started.fetch_add(1, Ordering::Relaxed);
            run_client(&connector, &script, &cancel).await
        });
    }

    let mut aggregator = Aggregator::new(total);
    let mut deadline_hit = false;
    let mut ticker = interval(options.progress_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            joined = clients.join_next() => match joined {
                Some(Ok(outcome)) => aggregator.record(outcome),
                Some(Err(err)) if err.is_cancelled() => aggregator.record_failure(ErrorCode::Timeout),
                Some(Err(err)) => {
                    warn!(error = %err, "Simulated client panicked");
                    aggregator.record_failure(ErrorCode::TransportFailure);
                }
                None => break,
            },
            _ = sleep_until(deadline), if !deadline_hit => {
                deadline_hit = true;
                warn!(remaining = clients.len(), "Load test deadline reached, aborting remaining clients");
                clients.abort_all();
            }
            _ = ticker.tick() => {
                if let Some(tx) = &progress {
                    let snapshot = aggregator.progress(started.load(Ordering::Relaxed), run_started.elapsed());
                    // Drop the snapshot rather than wait on a slow reader
                    let _ = tx.try_send(snapshot);
                }
            }
        }
    }

    let report = aggregator.report(deadline_hit, run_started.elapsed());
    info!(
        completed = report.completed,
        failed = report.failed,
        cancelled = report.cancelled,
        skipped = report.skipped,
        deadline_hit = report.deadline_hit,
        elapsed_ms = report.elapsed_ms,
        open_p95_ms = report.open_latency.p95_ms,
        "Load test finished"
    );
    report
}
