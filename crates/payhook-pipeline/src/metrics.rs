//! Passive counters and latency window fed by the dispatcher.
//!
//! Reads take a snapshot and never reset anything; exporting the numbers
//! (logs, a metrics endpoint) is left to whoever polls
//! [`PipelineMetrics::snapshot`].

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::ErrorCategory;

/// Number of latency samples kept by default.
pub const DEFAULT_LATENCY_WINDOW: usize = 1024;

/// Counters of one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounters {
    /// Handler invocations.
    pub attempted: u64,
    /// Jobs that reached SUCCEEDED after running the handler.
    pub succeeded: u64,
    /// Failed attempts, whether retried or not.
    pub failed: u64,
    /// Jobs moved to the dead-letter store.
    pub dead_lettered: u64,
    /// Redelivered events acknowledged without running the handler.
    pub duplicates: u64,
}

impl TypeCounters {
    /// Share of finished jobs that succeeded, `None` before any finished.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.succeeded + self.dead_lettered;
        if finished == 0 {
            return None;
        }
        Some(self.succeeded as f64 / finished as f64)
    }

    fn accumulate(&mut self, other: &Self) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.duplicates += other.duplicates;
    }
}

/// Summary of the rolling latency window, from `received_at` to the job's
/// terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Samples in the window.
    pub samples: usize,
    /// Fastest job.
    pub min_ms: u64,
    /// Slowest job.
    pub max_ms: u64,
    /// Arithmetic mean.
    pub mean_ms: f64,
    /// Median (nearest rank).
    pub p50_ms: u64,
    /// 95th percentile (nearest rank).
    pub p95_ms: u64,
}

impl LatencySummary {
    fn from_window(window: &VecDeque<u64>) -> Self {
        if window.is_empty() {
            return Self::default();
        }
        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();

        let samples = sorted.len();
        let total: u64 = sorted.iter().sum();
        let rank = |percent: usize| sorted[(samples * percent).div_ceil(100).saturating_sub(1)];

        Self {
            samples,
            min_ms: sorted[0],
            max_ms: sorted[samples - 1],
            mean_ms: total as f64 / samples as f64,
            p50_ms: rank(50),
            p95_ms: rank(95),
        }
    }
}

/// Read-only view of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Counters per event type.
    pub per_type: BTreeMap<String, TypeCounters>,
    /// Sum over all event types.
    pub totals: TypeCounters,
    /// Failed attempts per error category.
    pub failures_by_category: BTreeMap<String, u64>,
    /// Latency of finished jobs.
    pub latency: LatencySummary,
    /// Handlers currently running.
    pub in_flight: u64,
    /// Workers currently running.
    pub active_workers: usize,
}

impl MetricsSnapshot {
    /// Counters of `event_type`, zero if never seen.
    pub fn for_type(&self, event_type: &str) -> TypeCounters {
        self.per_type.get(event_type).copied().unwrap_or_default()
    }

    /// Success rate of `event_type`.
    pub fn success_rate(&self, event_type: &str) -> Option<f64> {
        self.for_type(event_type).success_rate()
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    per_type: HashMap<String, TypeCounters>,
    failures_by_category: HashMap<ErrorCategory, u64>,
    latencies_ms: VecDeque<u64>,
    in_flight: u64,
    active_workers: usize,
}

impl MetricsState {
    fn counters(&mut self, event_type: &str) -> &mut TypeCounters {
        self.per_type.entry(event_type.to_string()).or_default()
    }

    fn push_latency(&mut self, latency: Duration, window: usize) {
        if self.latencies_ms.len() == window {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }
}

/// Pipeline metrics shared by all workers.
#[derive(Debug)]
pub struct PipelineMetrics {
    state: RwLock<MetricsState>,
    latency_window: usize,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl PipelineMetrics {
    /// Creates metrics keeping the last `latency_window` latency samples.
    pub fn new(latency_window: usize) -> Self {
        Self { state: RwLock::new(MetricsState::default()), latency_window: latency_window.max(1) }
    }

    /// A handler invocation started.
    pub async fn record_attempt_started(&self, event_type: &str) {
        let mut state = self.state.write().await;
        state.counters(event_type).attempted += 1;
        state.in_flight += 1;
    }

    /// A handler invocation ended, however it ended.
    pub async fn record_attempt_finished(&self) {
        let mut state = self.state.write().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// An attempt failed.
    pub async fn record_failure(&self, event_type: &str, category: ErrorCategory) {
        let mut state = self.state.write().await;
        state.counters(event_type).failed += 1;
        *state.failures_by_category.entry(category).or_default() += 1;
    }

    /// A job reached SUCCEEDED after running its handler.
    pub async fn record_success(&self, event_type: &str, latency: Duration) {
        let mut state = self.state.write().await;
        state.counters(event_type).succeeded += 1;
        state.push_latency(latency, self.latency_window);
    }

    /// A job was dead-lettered.
    pub async fn record_dead_letter(&self, event_type: &str, latency: Duration) {
        let mut state = self.state.write().await;
        state.counters(event_type).dead_lettered += 1;
        state.push_latency(latency, self.latency_window);
    }

    /// A redelivered event was acknowledged without running its handler.
    pub async fn record_duplicate(&self, event_type: &str) {
        self.state.write().await.counters(event_type).duplicates += 1;
    }

    /// Updates the running worker count.
    pub async fn set_active_workers(&self, count: usize) {
        self.state.write().await.active_workers = count;
    }

    /// Takes a snapshot.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;

        let per_type: BTreeMap<String, TypeCounters> =
            state.per_type.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let mut totals = TypeCounters::default();
        for counters in per_type.values() {
            totals.accumulate(counters);
        }

        MetricsSnapshot {
            per_type,
            totals,
            failures_by_category: state
                .failures_by_category
                .iter()
                .map(|(category, count)| (category.to_string(), *count))
                .collect(),
            latency: LatencySummary::from_window(&state.latencies_ms),
            in_flight: state.in_flight,
            active_workers: state.active_workers,
        }
    }
}
