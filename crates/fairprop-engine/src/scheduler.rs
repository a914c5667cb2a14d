//! Batch scheduler: groups concurrently submitted requests into forward passes.
//!
//! A single task drains the bounded request queue. The first request of a
//! batch opens a micro-window; requests arriving inside it join the batch
//! until the window closes or the batch is full. Forward passes run on the
//! blocking pool, at most `max_concurrent_batches` at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fairprop_ai::Classifier;
use fairprop_core::{EncodedInput, Prediction, RuntimeError, assemble};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::monitor::{Admission, LatencyMonitor};

pub(crate) type Reply = oneshot::Sender<Result<Prediction, EngineError>>;

/// One encoded request waiting for a forward pass.
pub(crate) struct Job {
    pub encoded: EncodedInput,
    pub request_id: Option<String>,
    pub admission: Admission,
    pub enqueued: Instant,
    pub deadline: Instant,
    pub reply: Reply,
    /// Shared with the ticket; whoever sets it first counts the timeout.
    pub timeout_counted: Arc<AtomicBool>,
}

impl Job {
    fn budget(&self) -> Duration {
        self.deadline.saturating_duration_since(self.enqueued)
    }
}

/// Scheduler counters and SLO attainment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub batches: u64,
    pub largest_batch: u64,
    pub mean_batch_size: f64,
    /// Requests dispatched alone because waiting would miss their deadline.
    pub urgent_dispatches: u64,
    pub queue_depth: usize,
    /// Completed requests that finished within their deadline.
    pub within_slo: u64,
    pub slo_attainment: f64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
    pub timed_out: AtomicU64,
    pub cancelled: AtomicU64,
    batches: AtomicU64,
    batched_requests: AtomicU64,
    largest_batch: AtomicU64,
    urgent: AtomicU64,
    within_slo: AtomicU64,
    /// Smoothed forward-pass duration in microseconds.
    execution_estimate_us: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn snapshot(&self, queue_depth: usize) -> SchedulerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let completed = load(&self.completed);
        let batches = load(&self.batches);
        let within_slo = load(&self.within_slo);
        SchedulerStats {
            submitted: load(&self.submitted),
            completed,
            failed: load(&self.failed),
            rejected: load(&self.rejected),
            timed_out: load(&self.timed_out),
            cancelled: load(&self.cancelled),
            batches,
            largest_batch: load(&self.largest_batch),
            mean_batch_size: if batches == 0 {
                0.0
            } else {
                load(&self.batched_requests) as f64 / batches as f64
            },
            urgent_dispatches: load(&self.urgent),
            queue_depth,
            within_slo,
            slo_attainment: if completed == 0 {
                1.0
            } else {
                within_slo as f64 / completed as f64
            },
        }
    }

    fn execution_estimate(&self) -> Duration {
        Duration::from_micros(self.execution_estimate_us.load(Ordering::Relaxed))
    }

    /// Exponentially weighted, 1/8 weight on the newest pass.
    fn observe_execution(&self, elapsed: Duration) {
        let sample = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let _ = self.execution_estimate_us.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |old| Some(if old == 0 { sample } else { (old * 7 + sample) / 8 }),
        );
    }

    fn record_batch(&self, size: usize) {
        bump(&self.batches);
        self.batched_requests.fetch_add(size as u64, Ordering::Relaxed);
        self.largest_batch.fetch_max(size as u64, Ordering::Relaxed);
    }
}

/// State shared between the engine handle, tickets, and the scheduler task.
pub(crate) struct Shared {
    pub counters: Counters,
    pub monitor: Arc<LatencyMonitor>,
}

pub(crate) struct Scheduler {
    rx: mpsc::Receiver<Job>,
    classifier: Classifier,
    config: EngineConfig,
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        rx: mpsc::Receiver<Job>,
        classifier: Classifier,
        config: EngineConfig,
        shared: Arc<Shared>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            rx,
            classifier,
            config,
            shared,
            permits,
        }
    }

    /// Drain the queue until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            if !self.should_hold(&first) {
                self.dispatch(vec![first]).await;
                continue;
            }

            let close = tokio::time::Instant::from_std(first.enqueued + self.config.micro_window());
            let mut batch = vec![first];
            while batch.len() < self.config.max_batch_size {
                match tokio::time::timeout_at(close, self.rx.recv()).await {
                    Ok(Some(job)) if self.should_hold(&job) => batch.push(job),
                    Ok(Some(job)) => self.dispatch(vec![job]).await,
                    Ok(None) | Err(_) => break,
                }
            }
            self.dispatch(batch).await;
        }
        debug!("request queue closed, scheduler stopping");
    }

    /// Whether a request may wait in the micro-window.
    fn should_hold(&self, job: &Job) -> bool {
        if !(self.config.batching_enabled && job.admission.batching) {
            return false;
        }
        let remaining = job.deadline.saturating_duration_since(Instant::now());
        let needed = self.config.micro_window() + self.shared.counters.execution_estimate();
        if remaining < needed {
            bump(&self.shared.counters.urgent);
            return false;
        }
        true
    }

    async fn dispatch(&self, jobs: Vec<Job>) {
        let jobs = self.discard_stale(jobs);
        if jobs.is_empty() {
            return;
        }
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        // Deadlines may pass and callers may cancel while waiting for a permit.
        let live = self.discard_stale(jobs);
        if live.is_empty() {
            return;
        }

        let counters = &self.shared.counters;
        counters.record_batch(live.len());
        debug!(batch_size = live.len(), "dispatching batch");

        let classifier = self.classifier.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            execute(classifier, &shared, live).await;
            drop(permit);
        });
    }

    /// Drop cancelled and expired jobs. Expired jobs are answered with a
    /// timeout and fed to the monitor as over-budget calls.
    fn discard_stale(&self, jobs: Vec<Job>) -> Vec<Job> {
        let shared = &self.shared;
        let now = Instant::now();
        jobs.into_iter()
            .filter_map(|job| {
                let waited = now.saturating_duration_since(job.enqueued);
                if job.reply.is_closed() {
                    if job.timeout_counted.load(Ordering::Acquire) {
                        shared.monitor.record(waited);
                    } else {
                        bump(&shared.counters.cancelled);
                    }
                    return None;
                }
                if now < job.deadline {
                    return Some(job);
                }
                if !job.timeout_counted.swap(true, Ordering::AcqRel) {
                    bump(&shared.counters.timed_out);
                }
                shared.monitor.record(waited);
                let budget = job.budget();
                let _ = job.reply.send(Err(EngineError::Timeout { budget }));
                None
            })
            .collect()
    }
}

/// Per-request delivery details kept while the forward pass runs.
type Slot = (Option<String>, Admission, Instant, Duration, Reply);

/// Run one forward pass and deliver every slot's result.
async fn execute(classifier: Classifier, shared: &Shared, jobs: Vec<Job>) {
    let (inputs, slots): (Vec<EncodedInput>, Vec<Slot>) = jobs
        .into_iter()
        .map(|job| {
            let budget = job.budget();
            (
                job.encoded,
                (job.request_id, job.admission, job.enqueued, budget, job.reply),
            )
        })
        .unzip();

    let started = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || {
        let refs: Vec<&EncodedInput> = inputs.iter().collect();
        let verdicts = classifier.infer_calibrated(&refs);
        (inputs, verdicts)
    })
    .await;
    shared.counters.observe_execution(started.elapsed());

    let (inputs, verdicts) = match outcome {
        Ok((inputs, Ok(verdicts))) => (inputs, verdicts),
        Ok((_, Err(e))) => return fail(shared, slots, e),
        Err(e) => {
            return fail(
                shared,
                slots,
                RuntimeError::Backend(format!("forward pass aborted: {e}")),
            );
        }
    };

    for ((slot, input), verdict) in slots.into_iter().zip(&inputs).zip(verdicts) {
        let (request_id, admission, enqueued, budget, reply) = slot;
        let prediction = assemble(
            verdict.label,
            verdict.confidence,
            enqueued,
            admission.degraded,
            input.is_truncated(),
        )
        .with_request_id(request_id);

        shared.monitor.record(prediction.latency);
        bump(&shared.counters.completed);
        if prediction.latency <= budget {
            bump(&shared.counters.within_slo);
        }
        // The caller may have cancelled or timed out; the result is then dropped.
        let _ = reply.send(Ok(prediction));
    }
}

fn fail(shared: &Shared, slots: Vec<Slot>, error: RuntimeError) {
    warn!(error = %error, batch_size = slots.len(), "forward pass failed");
    for (_, _, enqueued, _, reply) in slots {
        shared.monitor.record(enqueued.elapsed());
        bump(&shared.counters.failed);
        let _ = reply.send(Err(EngineError::Runtime(error.clone())));
    }
}
