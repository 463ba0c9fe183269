//! Dispatcher and worker loop.
//!
//! A dispatch runs one job through one attempt:
//!
//! 1. claim the event in the event store (or short-circuit a duplicate);
//! 2. invoke the processor on its own task with a hard timeout;
//! 3. record the result, or keep it on the job if the store is down;
//! 4. ask the state machine what happens next and apply it.
//!
//! Handler failures never escape as errors. Only lifecycle violations,
//! which would mean a bug in the dispatcher itself, are returned.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use payhook_core::{
    Clock, DeadLetter, DuplicateSkippedEvent, EventHandler, EventId, Job, JobDeadLetteredEvent,
    JobStatus, JobSucceededEvent, PipelineEvent, ProcessResult, RetryScheduledEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    metrics::PipelineMetrics,
    pipeline::PipelineConfig,
    queue::PriorityQueue,
    registry::{ProcessorDescriptor, ProcessorRegistry},
    retry::{schedule_after, BackoffScheduler},
    store::{ClaimOutcome, DeadLetterStore, EventStore, StoreFuture},
    transition::{next_transition, AttemptOutcome, Transition},
};

/// State shared by every worker of a pipeline.
pub(crate) struct Dispatcher {
    pub(crate) queue: Arc<PriorityQueue>,
    pub(crate) registry: Arc<ProcessorRegistry>,
    pub(crate) events: Arc<dyn EventStore>,
    pub(crate) dead_letters: Arc<dyn DeadLetterStore>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    pub(crate) backoff: BackoffScheduler,
    pub(crate) config: PipelineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) event_handler: Arc<dyn EventHandler>,
    pub(crate) cancellation_token: CancellationToken,
}

impl Dispatcher {
    /// Runs one attempt of `job` and applies the resulting transition.
    ///
    /// # Errors
    ///
    /// Returns error if the job was driven through an illegal status change.
    pub(crate) async fn dispatch(&self, worker_id: usize, mut job: Job) -> Result<()> {
        debug!(
            worker_id,
            job_id = %job.id,
            event_id = %job.event.id,
            event_type = %job.event.event_type,
            attempt = job.attempt + 1,
            max_attempts = job.max_attempts,
            "dispatching job"
        );

        let outcome = match job.pending_result.take() {
            Some(result) => self.finalize(worker_id, &mut job, result).await,
            None => self.attempt(worker_id, &mut job).await?,
        };

        self.apply(worker_id, job, outcome).await
    }

    async fn attempt(&self, worker_id: usize, job: &mut Job) -> Result<AttemptOutcome> {
        match self.events.try_claim(&job.event, job.id, self.clock.now()).await {
            Ok(ClaimOutcome::Claimed { attempts }) => {
                debug!(worker_id, event_id = %job.event.id, claims = attempts, "event claimed");
            },
            Ok(claim @ (ClaimOutcome::AlreadyProcessed | ClaimOutcome::InFlight)) => {
                debug!(worker_id, event_id = %job.event.id, ?claim, "event not claimable");
                return Ok(AttemptOutcome::Duplicate);
            },
            Err(error) => {
                warn!(
                    worker_id,
                    event_id = %job.event.id,
                    error = %error,
                    "event store unavailable while claiming job"
                );
                return Ok(AttemptOutcome::StoreFailed { message: error.to_string() });
            },
        }

        job.transition(JobStatus::InProgress)?;
        let descriptor = self.registry.resolve(&job.event.event_type).await;

        self.metrics.record_attempt_started(&job.event.event_type).await;
        let outcome = self.invoke(job, &descriptor).await;
        self.metrics.record_attempt_finished().await;

        Ok(match outcome {
            AttemptOutcome::Completed(result) if result.success => {
                let result = result.with_metadata("attempts", job.attempt + 1);
                self.finalize(worker_id, job, result).await
            },
            other => other,
        })
    }

    /// Runs the processor on its own task, bounded by the descriptor timeout.
    async fn invoke(&self, job: &Job, descriptor: &ProcessorDescriptor) -> AttemptOutcome {
        let timeout = descriptor.timeout.unwrap_or(self.config.default_timeout);
        let cancellation = CancellationToken::new();
        let ctx = job.context(schedule_after(self.clock.now(), timeout), cancellation.clone());
        let processor = descriptor.processor();
        let event = job.event.clone();

        let mut handle = tokio::spawn(async move { processor.process(&event, &ctx).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => AttemptOutcome::Completed(result),
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "handler task was cancelled".to_string()
                };
                error!(
                    job_id = %job.id,
                    event_id = %job.event.id,
                    panic = %message,
                    "processor panicked"
                );
                AttemptOutcome::Panicked { message }
            },
            Err(_elapsed) => {
                cancellation.cancel();
                handle.abort();
                warn!(
                    job_id = %job.id,
                    event_id = %job.event.id,
                    timeout_ms = timeout.as_millis(),
                    "processor timed out"
                );
                AttemptOutcome::TimedOut { timeout }
            },
        }
    }

    /// Records a successful result. On store failure the result stays on
    /// the job so the next attempt only retries the write.
    async fn finalize(
        &self,
        worker_id: usize,
        job: &mut Job,
        result: ProcessResult,
    ) -> AttemptOutcome {
        match self.events.mark_processed(&job.event, result.clone(), self.clock.now()).await {
            Ok(()) => AttemptOutcome::Completed(result),
            Err(error) => {
                warn!(
                    worker_id,
                    event_id = %job.event.id,
                    error = %error,
                    "handler succeeded but the result could not be recorded"
                );
                job.pending_result = Some(result);
                AttemptOutcome::StoreFailed { message: error.to_string() }
            },
        }
    }

    async fn apply(&self, worker_id: usize, mut job: Job, outcome: AttemptOutcome) -> Result<()> {
        if let Some(category) = outcome.category() {
            self.metrics.record_failure(&job.event.event_type, category).await;
        }

        let now = self.clock.now();
        let transition = self
            .backoff
            .with_rng(|policy, rng| next_transition(&job, &outcome, policy, now, rng))
            .await;

        match transition {
            Transition::Succeed => {
                job.transition(JobStatus::Succeeded)?;
                self.complete(worker_id, job, &outcome, now).await;
            },
            Transition::Retry { attempt, next_run_at, error } => {
                job.transition(JobStatus::FailedRetryable)?;
                job.error_history.push(error.clone());
                job.attempt = attempt;
                job.next_run_at = next_run_at;
                job.transition(JobStatus::Pending)?;
                self.reschedule(worker_id, job, error).await;
            },
            Transition::DeadLetter { reason, error } => {
                job.transition(JobStatus::FailedTerminal)?;
                job.error_history.push(error.clone());
                self.dead_letter(worker_id, job, outcome, reason, error, now).await;
            },
        }

        Ok(())
    }

    async fn complete(
        &self,
        worker_id: usize,
        job: Job,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) {
        let event_type = job.event.event_type.clone();

        if matches!(outcome, AttemptOutcome::Duplicate) {
            self.metrics.record_duplicate(&event_type).await;
            info!(
                worker_id,
                job_id = %job.id,
                event_id = %job.event.id,
                "duplicate delivery skipped without invoking processor"
            );
            self.event_handler
                .handle_event(PipelineEvent::DuplicateSkipped(DuplicateSkippedEvent {
                    job_id: job.id,
                    event_id: job.event.id,
                    event_type,
                }))
                .await;
            return;
        }

        let latency = elapsed_since(job.event.received_at, now);
        self.metrics.record_success(&event_type, latency).await;
        info!(
            worker_id,
            job_id = %job.id,
            event_id = %job.event.id,
            event_type = %event_type,
            attempts = job.attempt + 1,
            latency_ms = latency.as_millis(),
            "job succeeded"
        );
        self.event_handler
            .handle_event(PipelineEvent::JobSucceeded(JobSucceededEvent {
                job_id: job.id,
                event_id: job.event.id,
                event_type,
                attempts: job.attempt + 1,
                latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                completed_at: now,
            }))
            .await;
    }

    async fn reschedule(&self, worker_id: usize, job: Job, error: String) {
        // A job holding an unrecorded result keeps its claim.
        if job.pending_result.is_none() {
            if let Err(release_error) =
                self.events.release(&job.event.id, job.id, self.clock.now()).await
            {
                warn!(
                    worker_id,
                    event_id = %job.event.id,
                    error = %release_error,
                    "failed to release claim, retry will re-claim it"
                );
            }
        }

        warn!(
            worker_id,
            job_id = %job.id,
            event_id = %job.event.id,
            event_type = %job.event.event_type,
            next_attempt = job.attempt + 1,
            max_attempts = job.max_attempts,
            next_run_at = %job.next_run_at,
            error = %error,
            "attempt failed, retry scheduled"
        );

        let notification = PipelineEvent::RetryScheduled(RetryScheduledEvent {
            job_id: job.id,
            event_id: job.event.id.clone(),
            event_type: job.event.event_type.clone(),
            next_attempt: job.attempt,
            next_run_at: job.next_run_at,
            error,
        });

        self.queue.enqueue(job).await;
        self.event_handler.handle_event(notification).await;
    }

    async fn dead_letter(
        &self,
        worker_id: usize,
        job: Job,
        outcome: AttemptOutcome,
        reason: String,
        error: String,
        now: DateTime<Utc>,
    ) {
        let result = match outcome {
            AttemptOutcome::Completed(result) => Some(result),
            _ => job.pending_result.clone(),
        };
        let metadata = result.as_ref().map(|r| r.metadata.clone()).unwrap_or_default();

        let recorded = self
            .retry_store_write(worker_id, &job.event.id, "mark_failed", || {
                self.events.mark_failed(&job.event, result.clone(), now)
            })
            .await;
        if !recorded {
            error!(
                worker_id,
                event_id = %job.event.id,
                "shutting down before the event record was marked failed"
            );
        }

        let latency = elapsed_since(job.event.received_at, now);
        let notification = PipelineEvent::JobDeadLettered(JobDeadLetteredEvent {
            job_id: job.id,
            event_id: job.event.id.clone(),
            event_type: job.event.event_type.clone(),
            priority: job.priority,
            attempts: job.attempt + 1,
            reason: reason.clone(),
            error: error.clone(),
            dead_lettered_at: now,
        });

        error!(
            worker_id,
            job_id = %job.id,
            event_id = %job.event.id,
            event_type = %job.event.event_type,
            attempts = job.attempt + 1,
            reason = %reason,
            error = %error,
            "job moved to dead-letter store"
        );

        let event_type = job.event.event_type.clone();
        self.persist_dead_letter(worker_id, DeadLetter::from_job(job, reason, metadata, now)).await;
        self.metrics.record_dead_letter(&event_type, latency).await;
        self.event_handler.handle_event(notification).await;
    }

    /// Writes a dead letter, retrying every `error_backoff` until the store
    /// accepts it or the pipeline shuts down.
    async fn persist_dead_letter(&self, worker_id: usize, dead_letter: DeadLetter) {
        let stored = self
            .retry_store_write(worker_id, &dead_letter.event.id, "dead_letter_put", || {
                self.dead_letters.put(&dead_letter)
            })
            .await;

        if !stored {
            let payload = serde_json::to_string(&dead_letter)
                .unwrap_or_else(|e| format!("<unserializable dead letter: {e}>"));
            error!(
                worker_id,
                event_id = %dead_letter.event.id,
                dead_letter = %payload,
                "shutting down with unpersisted dead letter"
            );
        }
    }

    /// Runs a terminal store write until it succeeds, sleeping
    /// `error_backoff` between tries. Returns `false` if the pipeline shut
    /// down first.
    async fn retry_store_write<'a>(
        &self,
        worker_id: usize,
        event_id: &EventId,
        operation: &'static str,
        mut write: impl FnMut() -> StoreFuture<'a, ()>,
    ) -> bool {
        loop {
            let Err(error) = write().await else {
                return true;
            };

            warn!(
                worker_id,
                event_id = %event_id,
                operation,
                error = %error,
                "store rejected terminal write, retrying"
            );

            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => return false,
                () = self.clock.sleep(self.config.error_backoff) => {},
            }
        }
    }
}

fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Long-running worker pulling jobs from the shared queue.
pub(crate) struct PipelineWorker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    cancellation_token: CancellationToken,
}

impl PipelineWorker {
    pub(crate) fn new(
        id: usize,
        dispatcher: Arc<Dispatcher>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, dispatcher, cancellation_token }
    }

    /// Main worker loop. Pulls and dispatches jobs until cancelled.
    ///
    /// A job already pulled is always dispatched to the end, so shutdown
    /// lets in-flight handlers finish.
    ///
    /// # Errors
    ///
    /// Never returns error at present; dispatch errors are logged and the
    /// worker backs off before pulling the next job.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "pipeline worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "pipeline worker received shutdown signal");
                break;
            }

            let clock = self.dispatcher.clock.as_ref();
            let Some(job) = self.dispatcher.queue.wait_ready(clock, &self.cancellation_token).await
            else {
                break;
            };

            if let Err(error) = self.dispatcher.dispatch(self.id, job).await {
                error!(worker_id = self.id, error = %error, "job dispatch failed");
                tokio::select! {
                    () = self.dispatcher.clock.sleep(self.dispatcher.config.error_backoff) => {
                        // Avoid tight error loops
                    }
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!(worker_id = self.id, "pipeline worker stopped");
        Ok(())
    }
}
