//! Aggregation of simulated client outcomes into a run report.

use crate::error::ErrorCode;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Distribution summary in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        ms.sort_by(|a, b| a.total_cmp(b));

        Self {
            count: ms.len(),
            min_ms: ms[0],
            max_ms: ms[ms.len() - 1],
            mean_ms: ms.iter().sum::<f64>() / ms.len() as f64,
            p50_ms: percentile(&ms, 50.0),
            p95_ms: percentile(&ms, 95.0),
            p99_ms: percentile(&ms, 99.0),
        }
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Per-client measurements, whatever the outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    pub open_latency: Option<Duration>,
    pub duration: Duration,
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

/// Terminal outcome of one simulated client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutcome {
    Completed(ClientStats),
    Failed {
        code: ErrorCode,
        message: String,
        stats: ClientStats,
    },
    /// Stopped early by a run cancellation after an orderly close
    Cancelled(ClientStats),
    /// Never started because the run was cancelled first
    Skipped,
}

/// Live counters streamed while a run is in progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestReport {
    pub sessions: usize,
    pub completed: usize,
    pub failed: usize,
    pub failures: HashMap<ErrorCode, usize>,
    pub cancelled: usize,
    pub skipped: usize,
    pub deadline_hit: bool,
    pub elapsed_ms: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub open_latency: LatencyStats,
    pub session_duration: LatencyStats,
}

/// Single owner of all run counters; fed by the collecting loop only.
#[derive(Debug, Default)]
pub struct Aggregator {
    total: usize,
    completed: usize,
    cancelled: usize,
    skipped: usize,
    failures: HashMap<ErrorCode, usize>,
    open_latencies: Vec<Duration>,
    durations: Vec<Duration>,
    frames_sent: u64,
    bytes_sent: u64,
}

impl Aggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            failures: ErrorCode::ALL.iter().map(|code| (*code, 0)).collect(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: ClientOutcome) {
        match outcome {
            ClientOutcome::Completed(stats) => {
                self.completed += 1;
                self.durations.push(stats.duration);
                self.absorb(stats);
            }
            ClientOutcome::Failed { code, stats, .. } => {
                *self.failures.entry(code).or_insert(0) += 1;
                self.absorb(stats);
            }
            ClientOutcome::Cancelled(stats) => {
                self.cancelled += 1;
                self.absorb(stats);
            }
            ClientOutcome::Skipped => self.skipped += 1,
        }
    }

    /// A client whose task ended without reporting (aborted at the deadline).
    pub fn record_failure(&mut self, code: ErrorCode) {
        *self.failures.entry(code).or_insert(0) += 1;
    }

    fn absorb(&mut self, stats: ClientStats) {
        if let Some(latency) = stats.open_latency {
            self.open_latencies.push(latency);
        }
        self.frames_sent += stats.frames_sent;
        self.bytes_sent += stats.bytes_sent;
    }

    pub fn failed(&self) -> usize {
        self.failures.values().sum()
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed() + self.cancelled + self.skipped
    }

    pub fn progress(&self, started: usize, elapsed: Duration) -> Progress {
        Progress {
            total: self.total,
            started,
            completed: self.completed,
            failed: self.failed(),
            in_flight: started.saturating_sub(self.finished() - self.skipped),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn report(self, deadline_hit: bool, elapsed: Duration) -> LoadTestReport {
        LoadTestReport {
            sessions: self.total,
            completed: self.completed,
            failed: self.failed(),
            cancelled: self.cancelled,
            skipped: self.skipped,
            deadline_hit,
            elapsed_ms: elapsed.as_millis() as u64,
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            open_latency: LatencyStats::from_samples(&self.open_latencies),
            session_duration: LatencyStats::from_samples(&self.durations),
            failures: self.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_latency_percentiles() {
        let samples: Vec<Duration> = (1..=100).map(ms).collect();
        let stats = LatencyStats::from_samples(&samples);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 100.0);
        assert_eq!(stats.p50_ms, 50.0);
        assert_eq!(stats.p95_ms, 95.0);
        assert_eq!(stats.p99_ms, 99.0);
        assert!((stats.mean_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_samples() {
        assert_eq!(LatencyStats::from_samples(&[]), LatencyStats::default());
    }

    #[test]
    fn test_aggregator_categorizes_outcomes() {
        let mut agg = Aggregator::new(5);
        let stats = ClientStats { open_latency: Some(ms(3)), duration: ms(30), frames_sent: 2, bytes_sent: 20 };
        agg.record(ClientOutcome::Completed(stats.clone()));
        agg.record(ClientOutcome::Failed {
            code: ErrorCode::SequenceError,
            message: "gap".into(),
            stats: stats.clone(),
        });
        agg.record(ClientOutcome::Cancelled(stats));
        agg.record(ClientOutcome::Skipped);
        agg.record_failure(ErrorCode::Timeout);

        let progress = agg.progress(4, ms(10));
        assert_eq!(progress.in_flight, 0);

        let report = agg.report(true, ms(100));
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures[&ErrorCode::SequenceError], 1);
        assert_eq!(report.failures[&ErrorCode::Timeout], 1);
        assert_eq!(report.failures[&ErrorCode::MalformedFrame], 0);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.open_latency.count, 3);
        assert_eq!(report.session_duration.count, 1);
        assert_eq!(report.frames_sent, 6);
    }
}
