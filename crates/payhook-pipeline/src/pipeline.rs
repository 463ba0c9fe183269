//! Pipeline façade.
//!
//! [`WebhookPipeline`] owns the queue, the stores, the registry and the
//! worker pool. Route handlers call [`WebhookPipeline::ingest`] with an
//! already verified event; everything after that happens on the workers.

use std::{sync::Arc, time::Duration};

use payhook_core::{
    Clock, DeadLetter, EventHandler, EventId, EventRecord, Job, JobId, NoOpEventHandler,
    RealClock, WebhookEvent,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{IngestError, PipelineError, Result},
    metrics::{MetricsSnapshot, PipelineMetrics, DEFAULT_LATENCY_WINDOW},
    queue::{JobSnapshot, PriorityQueue},
    registry::ProcessorRegistry,
    retry::{BackoffScheduler, RetryPolicy},
    store::{DeadLetterStore, EventStore, InMemoryDeadLetterStore, InMemoryEventStore},
    worker::Dispatcher,
    worker_pool::WorkerPool,
};

/// Configuration of the pipeline engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,

    /// Handler timeout for processors that do not set their own.
    pub default_timeout: Duration,

    /// Retry policy for processors that do not set their own attempt limit.
    pub retry: RetryPolicy,

    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,

    /// Pause after an unexpected dispatch or dead-letter store error.
    pub error_backoff: Duration,

    /// Number of latency samples kept by the metrics reporter.
    pub latency_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            default_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

impl PipelineConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero workers, a zero handler
    /// timeout, or an invalid retry policy.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(PipelineError::configuration("worker_count must be at least 1"));
        }
        if self.default_timeout.is_zero() {
            return Err(PipelineError::configuration("default_timeout must be positive"));
        }
        self.retry.validate()
    }
}

/// Answer of [`WebhookPipeline::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The pipeline took responsibility for the event. Always true on `Ok`.
    pub accepted: bool,
    /// The event id was seen before and nothing was enqueued.
    pub duplicate: bool,
    /// Job created for a first sighting.
    pub job_id: Option<JobId>,
}

/// Builder wiring a pipeline to its collaborators.
pub struct PipelineBuilder {
    registry: ProcessorRegistry,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    event_store: Arc<dyn EventStore>,
    dead_letter_store: Arc<dyn DeadLetterStore>,
    event_handler: Arc<dyn EventHandler>,
}

impl PipelineBuilder {
    /// Starts from in-memory stores, the real clock and no subscribers.
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self {
            registry,
            config: PipelineConfig::default(),
            clock: Arc::new(RealClock::new()),
            event_store: Arc::new(InMemoryEventStore::new()),
            dead_letter_store: Arc::new(InMemoryDeadLetterStore::new()),
            event_handler: Arc::new(NoOpEventHandler::new()),
        }
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Injects the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Injects the event store.
    #[must_use]
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = store;
        self
    }

    /// Injects the dead-letter store.
    #[must_use]
    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = store;
        self
    }

    /// Injects the lifecycle notification subscriber.
    #[must_use]
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Builds the pipeline. Workers are not started.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn build(self) -> Result<WebhookPipeline> {
        self.config.validate()?;

        let dispatcher = Dispatcher {
            queue: Arc::new(PriorityQueue::new()),
            registry: Arc::new(self.registry),
            events: self.event_store,
            dead_letters: self.dead_letter_store,
            metrics: Arc::new(PipelineMetrics::new(self.config.latency_window)),
            backoff: BackoffScheduler::new(self.config.retry.clone()),
            config: self.config,
            clock: self.clock,
            event_handler: self.event_handler,
            cancellation_token: CancellationToken::new(),
        };

        Ok(WebhookPipeline { dispatcher: Arc::new(dispatcher), worker_pool: None })
    }
}

/// Priority-ordered, retrying webhook processing pipeline.
pub struct WebhookPipeline {
    dispatcher: Arc<Dispatcher>,
    worker_pool: Option<WorkerPool>,
}

impl WebhookPipeline {
    /// Creates a pipeline with in-memory stores and the real clock.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(registry: ProcessorRegistry, config: PipelineConfig) -> Result<Self> {
        PipelineBuilder::new(registry).config(config).build()
    }

    /// Starts building a pipeline.
    pub fn builder(registry: ProcessorRegistry) -> PipelineBuilder {
        PipelineBuilder::new(registry)
    }

    /// Accepts a verified event.
    ///
    /// The pipeline stamps `received_at` with its own clock. A first
    /// sighting is enqueued with the priority and attempt limit of its
    /// processor; a redelivery is acknowledged without side effects.
    ///
    /// # Errors
    ///
    /// Fails if the event store cannot run the dedupe check, so the caller
    /// can reject the delivery and let the provider retry, or if the
    /// pipeline was shut down.
    pub async fn ingest(
        &self,
        mut event: WebhookEvent,
    ) -> std::result::Result<IngestOutcome, IngestError> {
        let d = &self.dispatcher;
        if d.cancellation_token.is_cancelled() {
            return Err(IngestError::ShutDown);
        }

        let now = d.clock.now();
        event.received_at = now;

        let is_new = d.events.record_if_new(&event, now).await.map_err(|error| {
            error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %error,
                "event store rejected ingest"
            );
            IngestError::from(error)
        })?;

        if !is_new {
            d.metrics.record_duplicate(&event.event_type).await;
            debug!(event_id = %event.id, "duplicate delivery acknowledged");
            return Ok(IngestOutcome { accepted: true, duplicate: true, job_id: None });
        }

        let descriptor = d.registry.resolve(&event.event_type).await;
        let max_attempts = descriptor.max_attempts.unwrap_or(d.config.retry.max_attempts);
        let job = Job::new(event, descriptor.priority, max_attempts, now);
        let job_id = job.id;

        info!(
            job_id = %job_id,
            event_id = %job.event.id,
            event_type = %job.event.event_type,
            priority = %job.priority,
            max_attempts,
            "event accepted"
        );

        d.queue.enqueue(job).await;
        Ok(IngestOutcome { accepted: true, duplicate: false, job_id: Some(job_id) })
    }

    /// Spawns the worker pool. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline was already shut down.
    pub async fn start(&mut self) -> Result<()> {
        if self.dispatcher.cancellation_token.is_cancelled() {
            return Err(PipelineError::configuration("pipeline was shut down and cannot restart"));
        }
        if self.worker_pool.is_some() {
            warn!("pipeline already started");
            return Ok(());
        }

        info!(
            worker_count = self.dispatcher.config.worker_count,
            default_timeout_ms = self.dispatcher.config.default_timeout.as_millis(),
            max_attempts = self.dispatcher.config.retry.max_attempts,
            "starting webhook pipeline"
        );

        let worker_count = self.dispatcher.config.worker_count;
        let mut pool = WorkerPool::new(self.dispatcher.clone(), worker_count);
        pool.spawn_workers().await?;
        self.worker_pool = Some(pool);

        info!("webhook pipeline started");
        Ok(())
    }

    /// Stops accepting events, cancels the workers and waits for in-flight
    /// jobs up to the shutdown timeout.
    ///
    /// Jobs still queued stay queued; their events remain `Received` in the
    /// event store.
    ///
    /// # Errors
    ///
    /// Returns error if the workers do not stop in time.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down webhook pipeline");
        self.dispatcher.cancellation_token.cancel();

        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown_graceful(self.dispatcher.config.shutdown_timeout).await?;
        } else {
            info!("pipeline was not started, shutdown completed immediately");
        }

        let remaining = self.dispatcher.queue.size().await;
        if remaining > 0 {
            warn!(queue_depth = remaining, "pipeline stopped with queued jobs");
        }
        Ok(())
    }

    /// Returns true while workers are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Dispatches one ready job on the caller's task.
    ///
    /// Returns `false` if no job was ready.
    ///
    /// # Errors
    ///
    /// Returns error if the job was driven through an illegal status change.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(job) = self.dispatcher.queue.dequeue_ready(self.dispatcher.clock.now()).await
        else {
            return Ok(false);
        };
        self.dispatcher.dispatch(0, job).await?;
        Ok(true)
    }

    /// Drains the queue on the caller's task, sleeping the injected clock
    /// until each backing-off job is due. Returns the number of dispatches.
    ///
    /// Intended for deterministic tests with a test clock; must not run
    /// concurrently with started workers.
    ///
    /// # Errors
    ///
    /// Returns error if a job was driven through an illegal status change.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            if self.process_next().await? {
                dispatched += 1;
                continue;
            }
            match self.dispatcher.queue.next_ready_at().await {
                Some(ready_at) => self.dispatcher.clock.sleep_until(ready_at).await,
                None => return Ok(dispatched),
            }
        }
    }

    /// Registry the pipeline resolves processors from.
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.dispatcher.registry
    }

    /// Event store record of an event.
    ///
    /// # Errors
    ///
    /// Returns error if the event store is unavailable.
    pub async fn event_record(&self, event_id: &EventId) -> Result<Option<EventRecord>> {
        self.dispatcher.events.find(event_id).await
    }

    /// All dead letters.
    ///
    /// # Errors
    ///
    /// Returns error if the dead-letter store is unavailable.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.dispatcher.dead_letters.list().await
    }

    /// Number of queued jobs.
    pub async fn queue_depth(&self) -> usize {
        self.dispatcher.queue.size().await
    }

    /// Queued jobs of one event type, in dispatch order.
    pub async fn peek_by_type(&self, event_type: &str) -> Vec<JobSnapshot> {
        self.dispatcher.queue.peek_by_type(event_type).await
    }

    /// Metrics snapshot.
    pub async fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics.snapshot().await
    }

    /// Engine configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.dispatcher.config
    }
}
