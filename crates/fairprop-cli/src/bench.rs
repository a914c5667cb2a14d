//! Latency benchmark over a fixed set of representative listings.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fairprop_ai::SAMPLE_LISTINGS;
use fairprop_engine::{Engine, HealthState, InferenceRequest, SchedulerStats};
use serde::Serialize;
use tracing::info;

pub const BATCH_SIZES: &[usize] = &[1, 5, 10, 20];

/// Distribution of per-request latencies, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(f64::total_cmp);
        let n = samples.len();
        let median = if n % 2 == 0 {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        } else {
            samples[n / 2]
        };
        let quantile = |q: f64| samples[((q * n as f64) as usize).min(n - 1)];
        Some(Self {
            samples: n,
            mean_ms: samples.iter().sum::<f64>() / n as f64,
            median_ms: median,
            min_ms: samples[0],
            max_ms: samples[n - 1],
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRun {
    pub batch_size: usize,
    pub total_ms: f64,
    pub avg_latency_ms: f64,
    /// Listings per second.
    pub throughput: f64,
}

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub generated_at: DateTime<Utc>,
    pub runs: usize,
    pub single: LatencySummary,
    pub batches: Vec<BatchRun>,
    pub budget_ms: u64,
    /// p95 single-request latency is under the budget.
    pub passed: bool,
    pub health: HealthState,
    pub stats: SchedulerStats,
}

pub async fn run(
    engine: &Engine,
    runs: usize,
    warmup: usize,
    timeout: Duration,
) -> anyhow::Result<BenchReport> {
    anyhow::ensure!(runs > 0, "at least one timed run is required");
    let request = |i: usize| {
        InferenceRequest::new(SAMPLE_LISTINGS[i % SAMPLE_LISTINGS.len()]).with_deadline(timeout)
    };

    eprintln!("Warming up ({warmup} runs)...");
    for i in 0..warmup {
        engine.classify_with(request(i)).await?;
    }

    eprintln!("Running {runs} timed requests...");
    let mut samples = Vec::with_capacity(runs);
    for i in 0..runs {
        let start = Instant::now();
        engine.classify_with(request(i)).await?;
        samples.push(start.elapsed().as_secs_f64() * 1000.0);
    }
    let single = LatencySummary::from_samples(samples)
        .ok_or_else(|| anyhow::anyhow!("no latency samples recorded"))?;

    let mut batches = Vec::with_capacity(BATCH_SIZES.len());
    for &size in BATCH_SIZES {
        let requests = (0..size).map(request).collect();
        let start = Instant::now();
        let results = engine.classify_all(requests).await;
        let elapsed = start.elapsed();
        results.into_iter().collect::<Result<Vec<_>, _>>()?;

        let total_ms = elapsed.as_secs_f64() * 1000.0;
        info!(batch_size = size, total_ms, "batch run complete");
        batches.push(BatchRun {
            batch_size: size,
            total_ms,
            avg_latency_ms: total_ms / size as f64,
            throughput: if total_ms > 0.0 {
                size as f64 * 1000.0 / total_ms
            } else {
                0.0
            },
        });
    }

    let budget_ms = engine.config().monitor.latency_budget_ms;
    Ok(BenchReport {
        generated_at: Utc::now(),
        runs,
        passed: single.p95_ms < budget_ms as f64,
        single,
        batches,
        budget_ms,
        health: engine.health(),
        stats: engine.stats(),
    })
}
