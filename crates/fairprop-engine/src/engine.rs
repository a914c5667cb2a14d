//! Engine facade: owns the loaded model, the scheduler task, and the monitor.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fairprop_ai::Classifier;
use fairprop_core::{EncodedInput, Prediction};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::monitor::{HealthState, LatencyMonitor, MonitorSnapshot};
use crate::scheduler::{Counters, Job, Scheduler, SchedulerStats, Shared, bump};

/// A classification request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceRequest {
    pub text: String,
    pub request_id: Option<String>,
    /// Overrides the engine's implicit deadline, measured from enqueue.
    pub deadline: Option<Duration>,
}

impl InferenceRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Handle to a queued request.
///
/// Dropping or cancelling a ticket before dispatch removes the request from
/// its batch. Once dispatched, the batch runs to completion and the result is
/// discarded.
pub struct Ticket {
    rx: oneshot::Receiver<Result<Prediction, EngineError>>,
    deadline: Instant,
    budget: Duration,
    timeout_counted: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl Ticket {
    /// Wait for the result, or [`EngineError::Timeout`] once the deadline passes.
    pub async fn wait(mut self) -> Result<Prediction, EngineError> {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ShutDown),
            Err(_) => {
                // Flag before the receiver drops so the scheduler never takes
                // this for a cancellation.
                if !self.timeout_counted.swap(true, Ordering::AcqRel) {
                    bump(&self.shared.counters.timed_out);
                }
                Err(EngineError::Timeout {
                    budget: self.budget,
                })
            }
        }
    }

    pub fn cancel(mut self) {
        self.rx.close();
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// The serving core. Cheap to share by reference across tasks.
pub struct Engine {
    classifier: Classifier,
    config: EngineConfig,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Job>,
    scheduler: JoinHandle<()>,
    permits: Arc<Semaphore>,
}

impl Engine {
    /// Load the artifact at `dir` and start serving.
    ///
    /// Must be called from within a Tokio runtime. Any artifact defect fails
    /// here; a partially loaded model never serves.
    pub fn load(dir: &Path, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let classifier = Classifier::load(dir)?;
        Self::from_classifier(classifier, config)
    }

    /// Serve an already-loaded classifier.
    pub fn from_classifier(classifier: Classifier, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ConfigError::Invalid("the engine must be started inside a Tokio runtime".into())
        })?;

        let classifier = classifier.with_truncation(config.truncation);
        let shared = Arc::new(Shared {
            counters: Counters::default(),
            monitor: Arc::new(LatencyMonitor::new(config.monitor.clone())),
        });
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_batches));
        let scheduler = Scheduler::new(
            rx,
            classifier.clone(),
            config.clone(),
            Arc::clone(&shared),
            Arc::clone(&permits),
        );
        let scheduler = runtime.spawn(scheduler.run());

        let artifact = classifier.runtime().artifact();
        info!(
            version = artifact.version(),
            backend = classifier.runtime().backend_name(),
            max_batch_size = config.max_batch_size,
            micro_window_ms = config.micro_window_ms,
            queue_capacity = config.queue_capacity,
            batching = config.batching_enabled,
            "engine ready"
        );

        Ok(Self {
            classifier,
            config,
            shared,
            tx,
            scheduler,
            permits,
        })
    }

    pub async fn classify(&self, text: &str) -> Result<Prediction, EngineError> {
        self.classify_with(InferenceRequest::new(text)).await
    }

    pub async fn classify_with(&self, request: InferenceRequest) -> Result<Prediction, EngineError> {
        self.submit(request)?.wait().await
    }

    /// Queue a request without waiting. Fails fast with
    /// [`EngineError::Backpressure`] when the queue is full.
    pub fn submit(&self, request: InferenceRequest) -> Result<Ticket, EngineError> {
        let (job, ticket) = self.prepare(request)?;
        match self.tx.try_send(job) {
            Ok(()) => Ok(ticket),
            Err(TrySendError::Full(_)) => {
                bump(&self.shared.counters.rejected);
                warn!(capacity = self.config.queue_capacity, "request queue full, shedding load");
                Err(EngineError::Backpressure {
                    capacity: self.config.queue_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::ShutDown),
        }
    }

    /// Classify many texts; results keep input order, one per text.
    ///
    /// Unlike [`submit`](Self::submit), waits for queue space instead of
    /// rejecting, so a batch larger than the queue still completes.
    pub async fn classify_batch(&self, texts: &[&str]) -> Vec<Result<Prediction, EngineError>> {
        let requests = texts.iter().map(|t| InferenceRequest::new(*t)).collect();
        self.classify_all(requests).await
    }

    /// [`classify_batch`](Self::classify_batch) for fully specified requests.
    pub async fn classify_all(
        &self,
        requests: Vec<InferenceRequest>,
    ) -> Vec<Result<Prediction, EngineError>> {
        let mut pending = Vec::with_capacity(requests.len());
        for request in requests {
            let ticket = match self.prepare(request) {
                Ok((job, ticket)) => match self.tx.send(job).await {
                    Ok(()) => Ok(ticket),
                    Err(_) => Err(EngineError::ShutDown),
                },
                Err(e) => Err(e),
            };
            pending.push(ticket);
        }

        let waits = pending.into_iter().map(|ticket| async move {
            match ticket {
                Ok(ticket) => ticket.wait().await,
                Err(e) => Err(e),
            }
        });
        futures::future::join_all(waits).await
    }

    /// Encode on the caller's task under the monitor's current admission.
    fn prepare(&self, request: InferenceRequest) -> Result<(Job, Ticket), EngineError> {
        let enqueued = Instant::now();
        bump(&self.shared.counters.submitted);

        let admission = self.shared.monitor.admit();
        let encoded: EncodedInput = self.classifier.encode(&request.text, admission.cap)?;

        let budget = request.deadline.unwrap_or_else(|| self.config.request_budget());
        let deadline = enqueued + budget;
        let (reply, rx) = oneshot::channel();
        let timeout_counted = Arc::new(AtomicBool::new(false));
        let job = Job {
            encoded,
            request_id: request.request_id,
            admission,
            enqueued,
            deadline,
            reply,
            timeout_counted: Arc::clone(&timeout_counted),
        };
        let ticket = Ticket {
            rx,
            deadline,
            budget,
            timeout_counted,
            shared: Arc::clone(&self.shared),
        };
        Ok((job, ticket))
    }

    pub fn health(&self) -> HealthState {
        self.shared.monitor.state()
    }

    pub fn monitor(&self) -> &LatencyMonitor {
        &self.shared.monitor
    }

    pub fn monitor_snapshot(&self) -> MonitorSnapshot {
        self.shared.monitor.snapshot()
    }

    pub fn stats(&self) -> SchedulerStats {
        let depth = self.tx.max_capacity() - self.tx.capacity();
        self.shared.counters.snapshot(depth)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The synchronous pipeline the scheduler executes.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Stop accepting requests, then wait until every queued request has been
    /// answered and every in-flight forward pass has finished.
    pub async fn shutdown(self) {
        let Self {
            tx,
            scheduler,
            permits,
            config,
            ..
        } = self;
        drop(tx);
        if let Err(e) = scheduler.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        let all = u32::try_from(config.max_concurrent_batches).unwrap_or(u32::MAX);
        if permits.acquire_many(all).await.is_err() {
            warn!("batch permits closed before shutdown");
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use fairprop_ai::{Backend, PooledBackend, Runtime, fixtures};
    use fairprop_core::{Label, RuntimeError};

    /// Pooled backend that sleeps before every forward pass.
    struct SlowBackend {
        inner: PooledBackend,
        delay: Duration,
    }

    impl Backend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn forward(
            &self,
            batch: &[&fairprop_core::EncodedInput],
        ) -> Result<Vec<[f32; 2]>, RuntimeError> {
            std::thread::sleep(self.delay);
            self.inner.forward(batch)
        }
    }

    struct FailingBackend;

    impl Backend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn forward(
            &self,
            _batch: &[&fairprop_core::EncodedInput],
        ) -> Result<Vec<[f32; 2]>, RuntimeError> {
            Err(RuntimeError::Backend("out of memory".into()))
        }
    }

    /// Pooled backend that fails any pass containing one token id.
    struct PoisonBackend {
        inner: PooledBackend,
        poison: u32,
    }

    impl Backend for PoisonBackend {
        fn name(&self) -> &'static str {
            "poison"
        }

        fn forward(
            &self,
            batch: &[&fairprop_core::EncodedInput],
        ) -> Result<Vec<[f32; 2]>, RuntimeError> {
            if batch.iter().any(|e| e.ids().contains(&self.poison)) {
                return Err(RuntimeError::Backend("poisoned input".into()));
            }
            self.inner.forward(batch)
        }
    }

    fn reference(window: usize) -> Classifier {
        let artifact = Arc::new(fixtures::reference_artifact(window));
        Classifier::new(Arc::new(Runtime::new(artifact).unwrap()))
    }

    fn with_backend(backend: impl Backend + 'static) -> Classifier {
        let artifact = Arc::new(fixtures::reference_artifact(512));
        Classifier::new(Arc::new(Runtime::with_backend(artifact, Box::new(backend))))
    }

    fn slow(delay_ms: u64) -> Classifier {
        let weights = Arc::new(fixtures::reference_weights());
        with_backend(SlowBackend {
            inner: PooledBackend::new(weights),
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn failing_on(word: &str) -> Classifier {
        let poison = reference(512).encode(word, None).unwrap().ids()[1];
        with_backend(PoisonBackend {
            inner: PooledBackend::new(Arc::new(fixtures::reference_weights())),
            poison,
        })
    }

    async fn eventually(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    /// Generous deadlines and budget so slow CI machines never trip the monitor.
    fn relaxed() -> EngineConfig {
        let mut config = EngineConfig {
            micro_window_ms: 20,
            execution_timeout_ms: 5_000,
            ..Default::default()
        };
        config.monitor.latency_budget_ms = 5_000;
        config
    }

    #[tokio::test]
    async fn classifies_reference_scenarios() {
        let engine = Engine::from_classifier(reference(512), relaxed()).unwrap();

        let p = engine.classify("No kids under 12 allowed").await.unwrap();
        assert_eq!(p.label, Label::NonCompliant);
        assert!(p.confidence >= 0.95);
        assert!(!p.degraded);

        let p = engine.classify("Great school district nearby").await.unwrap();
        assert_eq!(p.label, Label::Compliant);
        assert!(p.confidence >= 0.90);

        let p = engine.classify("").await.unwrap();
        assert!((0.5..=1.0).contains(&p.confidence));
        assert!(!p.truncated);
    }

    #[tokio::test]
    async fn long_input_is_truncated() {
        let engine = Engine::from_classifier(reference(8192), relaxed()).unwrap();
        let text = "no kids ".repeat(6250);
        let p = engine.classify(&text).await.unwrap();
        assert!(p.truncated);
        assert!((0.5..=1.0).contains(&p.confidence));
    }

    #[tokio::test]
    async fn concurrent_requests_match_single_results() {
        let classifier = reference(512);
        let engine = Engine::from_classifier(classifier.clone(), relaxed()).unwrap();

        let texts: Vec<&str> = fixtures::SAMPLE_LISTINGS
            .iter()
            .chain(&fixtures::SAMPLE_LISTINGS[..6])
            .copied()
            .collect();
        assert_eq!(texts.len(), 16);

        let results =
            futures::future::join_all(texts.iter().map(|t| engine.classify(t))).await;
        for (text, result) in texts.iter().zip(results) {
            let served = result.unwrap();
            let alone = classifier.classify(text).unwrap();
            assert_eq!(served.label, alone.label, "{text}");
            assert_eq!(served.confidence, alone.confidence, "{text}");
        }

        let stats = engine.stats();
        assert_eq!(stats.completed, 16);
        assert!(stats.largest_batch > 1, "{stats:?}");
        assert!(stats.batches < 16);
    }

    #[tokio::test]
    async fn request_ids_are_echoed() {
        let engine = Engine::from_classifier(reference(512), relaxed()).unwrap();
        let p = engine
            .classify_with(InferenceRequest::new("No section 8").with_id("prop-007"))
            .await
            .unwrap();
        assert_eq!(p.request_id.as_deref(), Some("prop-007"));
    }

    #[tokio::test]
    async fn classify_batch_keeps_order() {
        let config = EngineConfig {
            queue_capacity: 2,
            ..relaxed()
        };
        let engine = Engine::from_classifier(reference(512), config).unwrap();
        let results = engine.classify_batch(fixtures::SAMPLE_LISTINGS).await;
        assert_eq!(results.len(), fixtures::SAMPLE_LISTINGS.len());
        assert_eq!(results[0].as_ref().unwrap().label, Label::NonCompliant);
        assert_eq!(results[1].as_ref().unwrap().label, Label::Compliant);
    }

    #[tokio::test]
    async fn sustained_overrun_degrades_service() {
        let mut config = relaxed();
        config.micro_window_ms = 1;
        config.monitor.latency_budget_ms = 5;
        config.monitor.window_size = 8;
        config.monitor.min_samples = 4;
        config.monitor.cooldown_ms = 60_000;
        let engine = Engine::from_classifier(slow(15), config).unwrap();

        for _ in 0..4 {
            let p = engine.classify("Great school district nearby").await.unwrap();
            assert!(!p.degraded);
        }
        assert_eq!(engine.health(), HealthState::Degraded);

        let batches_before = engine.stats().batches;
        let results = futures::future::join_all(
            ["No kids under 12 allowed", "Great school district nearby"]
                .iter()
                .map(|t| engine.classify(t)),
        )
        .await;
        let p = results[0].as_ref().unwrap();
        assert!(p.degraded);
        assert_eq!(p.label, Label::NonCompliant);
        let p = results[1].as_ref().unwrap();
        assert!(p.degraded);
        assert_eq!(p.label, Label::Compliant);

        let stats = engine.stats();
        assert_eq!(stats.batches - batches_before, 2, "batching must be off");
    }

    #[tokio::test]
    async fn forced_degradation_caps_sequence_length() {
        let mut config = relaxed();
        config.monitor.degraded_max_sequence_length = 8;
        let engine = Engine::from_classifier(reference(512), config).unwrap();
        engine.monitor().force_degraded();

        let p = engine
            .classify("great school district nearby walking distance to shops")
            .await
            .unwrap();
        assert!(p.degraded);
        assert!(p.truncated);
    }

    #[tokio::test]
    async fn full_queue_is_backpressure() {
        let config = EngineConfig {
            queue_capacity: 2,
            ..relaxed()
        };
        let engine = Engine::from_classifier(reference(512), config).unwrap();

        // No await between submissions: the scheduler task cannot drain the queue.
        let a = engine.submit(InferenceRequest::new("one")).unwrap();
        let b = engine.submit(InferenceRequest::new("two")).unwrap();
        let err = engine.submit(InferenceRequest::new("three")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Backpressure);
        assert_eq!(engine.stats().rejected, 1);

        a.wait().await.unwrap();
        b.wait().await.unwrap();
    }

    #[tokio::test]
    async fn missed_deadline_is_timeout() {
        let engine = Engine::from_classifier(slow(100), relaxed()).unwrap();
        let err = engine
            .classify_with(
                InferenceRequest::new("Pet-friendly building")
                    .with_deadline(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(engine.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn backend_failure_reaches_the_caller() {
        let engine = Engine::from_classifier(with_backend(FailingBackend), relaxed()).unwrap();
        let err = engine.classify("Quiet home").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Runtime(RuntimeError::Backend(_))
        ));
        assert_eq!(engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn failure_stays_within_its_batch() {
        let config = EngineConfig {
            batching_enabled: false,
            ..relaxed()
        };
        let engine = Engine::from_classifier(failing_on("christian"), config).unwrap();
        let results = futures::future::join_all(
            ["Christian community preferred", "Great school district nearby"]
                .iter()
                .map(|t| engine.classify(t)),
        )
        .await;
        assert!(matches!(
            results[0],
            Err(EngineError::Runtime(RuntimeError::Backend(_)))
        ));
        assert_eq!(results[1].as_ref().unwrap().label, Label::Compliant);

        let stats = engine.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn queued_timeouts_trip_the_monitor() {
        let mut config = relaxed();
        config.max_concurrent_batches = 1;
        config.monitor.latency_budget_ms = 5;
        config.monitor.window_size = 8;
        config.monitor.min_samples = 4;
        config.monitor.cooldown_ms = 60_000;
        let engine = Engine::from_classifier(slow(150), config).unwrap();

        let results = futures::future::join_all((0..10).map(|_| {
            engine.classify_with(
                InferenceRequest::new("Quiet home").with_deadline(Duration::from_millis(11)),
            )
        }))
        .await;
        for result in &results {
            assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::Timeout);
        }

        assert!(eventually(|| engine.health() == HealthState::Degraded).await);
        let stats = engine.stats();
        assert_eq!(stats.timed_out, 10);
        assert_eq!(stats.cancelled, 0);
    }

    #[tokio::test]
    async fn cancelling_in_flight_discards_the_result() {
        let config = EngineConfig {
            batching_enabled: false,
            ..relaxed()
        };
        let engine = Engine::from_classifier(slow(50), config).unwrap();
        let ticket = engine.submit(InferenceRequest::new("Ideal for active adults")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ticket.cancel();

        let p = engine.classify("Close to public transportation").await.unwrap();
        assert_eq!(p.label, Label::Compliant);
        assert!(eventually(|| engine.stats().completed == 2).await);
        assert_eq!(engine.stats().cancelled, 0);
    }

    #[tokio::test]
    async fn cancelled_then_expired_counts_as_cancelled() {
        let config = EngineConfig {
            batching_enabled: false,
            max_concurrent_batches: 1,
            ..relaxed()
        };
        let engine = Engine::from_classifier(slow(100), config).unwrap();
        let running = engine.submit(InferenceRequest::new("Quiet home")).unwrap();
        let queued = engine
            .submit(
                InferenceRequest::new("Ideal for active adults")
                    .with_deadline(Duration::from_millis(40)),
            )
            .unwrap();
        // The second request now waits for the only permit.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queued.cancel();

        running.wait().await.unwrap();
        engine.classify("Close to public transportation").await.unwrap();

        let stats = engine.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(stats.completed, 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_batches() {
        let engine = Engine::from_classifier(slow(50), relaxed()).unwrap();
        let mut ticket = engine.submit(InferenceRequest::new("Quiet home")).unwrap();
        engine.shutdown().await;
        assert!(matches!(ticket.rx.try_recv(), Ok(Ok(_))));
    }

    #[tokio::test]
    async fn cancelled_requests_are_skipped() {
        let engine = Engine::from_classifier(reference(512), relaxed()).unwrap();
        let ticket = engine.submit(InferenceRequest::new("Ideal for active adults")).unwrap();
        ticket.cancel();
        engine.classify("Close to public transportation").await.unwrap();

        let stats = engine.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn unbatched_config_dispatches_singly() {
        let config = EngineConfig {
            batching_enabled: false,
            ..relaxed()
        };
        let engine = Engine::from_classifier(reference(512), config).unwrap();
        let results = engine.classify_batch(&fixtures::SAMPLE_LISTINGS[..4]).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(engine.stats().largest_batch, 1);
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_reference_artifact(dir.path(), 512).unwrap();
        let engine = Engine::load(dir.path(), relaxed()).unwrap();
        assert_eq!(engine.health(), HealthState::Healthy);
        let p = engine.classify("Christian community preferred").await.unwrap();
        assert_eq!(p.label, Label::NonCompliant);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn missing_artifact_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = Engine::load(&dir.path().join("missing"), relaxed()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ArtifactLoad);
    }

    #[test]
    fn needs_a_runtime() {
        let err = Engine::from_classifier(reference(512), relaxed()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
