//! Event store and dead-letter store.
//!
//! Both stores are external persistence collaborators. The traits describe
//! what the pipeline needs from them; the in-memory implementations back
//! the default pipeline and the tests, and can inject failures to exercise
//! the store-unavailable paths.
//!
//! The event store separates two questions that a single "record if new"
//! call would conflate:
//!
//! - `record_if_new` answers "has this event id ever been seen?" and gates
//!   ingestion.
//! - `try_claim` answers "may this job run the handler now?" and gives one
//!   job at a time processing ownership of an event id. A retry of the same
//!   job re-claims its event; any other job finds it processed or in flight.

use std::{collections::HashMap, fmt, future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use payhook_core::{
    DeadLetter, EventId, EventRecord, JobId, ProcessResult, RecordStatus, WebhookEvent,
};
use tokio::sync::{Mutex, RwLock};

use crate::error::{PipelineError, Result};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Result of a processing claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The job owns the event and may run the handler.
    Claimed {
        /// Claims of this event so far, including this one
        attempts: u32,
    },
    /// The event already reached a final record status.
    AlreadyProcessed,
    /// Another job holds the claim.
    InFlight,
}

/// Durable record of every received event, used for dedupe and audit.
pub trait EventStore: Send + Sync + 'static {
    /// Inserts a `Received` record if the id is absent.
    ///
    /// Returns `true` for the first sighting. Exactly one of any number of
    /// concurrent callers with the same id observes `true`.
    fn record_if_new<'a>(
        &'a self,
        event: &'a WebhookEvent,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Atomically moves the record to `InProgress` on behalf of `job_id`.
    ///
    /// Inserts the record if it is missing.
    fn try_claim<'a>(
        &'a self,
        event: &'a WebhookEvent,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ClaimOutcome>;

    /// Returns a record claimed by `job_id` to `Received` ahead of a retry.
    fn release<'a>(
        &'a self,
        event_id: &'a EventId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()>;

    /// Marks the event processed with the handler's result.
    ///
    /// Idempotent: overwrites any prior status and result.
    fn mark_processed<'a>(
        &'a self,
        event: &'a WebhookEvent,
        result: ProcessResult,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()>;

    /// Marks the event failed after its job was dead-lettered.
    ///
    /// A processed record stays processed.
    fn mark_failed<'a>(
        &'a self,
        event: &'a WebhookEvent,
        result: Option<ProcessResult>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()>;

    /// Looks up the record of an event.
    fn find<'a>(&'a self, event_id: &'a EventId) -> StoreFuture<'a, Option<EventRecord>>;
}

/// Terminal storage for jobs the pipeline gave up on.
///
/// Dead letters are kept for manual inspection only; nothing replays them.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Persists a dead letter.
    fn put<'a>(&'a self, dead_letter: &'a DeadLetter) -> StoreFuture<'a, ()>;

    /// All dead letters, oldest first.
    fn list(&self) -> StoreFuture<'_, Vec<DeadLetter>>;

    /// Dead letter of an event, if any.
    fn find_by_event<'a>(&'a self, event_id: &'a EventId)
        -> StoreFuture<'a, Option<DeadLetter>>;

    /// Number of dead letters.
    fn count(&self) -> StoreFuture<'_, usize>;
}

/// Store operation targeted by failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// [`EventStore::record_if_new`]
    RecordIfNew,
    /// [`EventStore::try_claim`]
    TryClaim,
    /// [`EventStore::release`]
    Release,
    /// [`EventStore::mark_processed`]
    MarkProcessed,
    /// [`EventStore::mark_failed`]
    MarkFailed,
    /// [`EventStore::find`]
    Find,
    /// [`DeadLetterStore::put`]
    PutDeadLetter,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordIfNew => write!(f, "record_if_new"),
            Self::TryClaim => write!(f, "try_claim"),
            Self::Release => write!(f, "release"),
            Self::MarkProcessed => write!(f, "mark_processed"),
            Self::MarkFailed => write!(f, "mark_failed"),
            Self::Find => write!(f, "find"),
            Self::PutDeadLetter => write!(f, "put_dead_letter"),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    scheduled: HashMap<StoreOperation, u32>,
}

impl Faults {
    fn trip(&mut self, operation: StoreOperation) -> Result<()> {
        if self.unavailable {
            return Err(PipelineError::store_unavailable(format!("{operation}: store offline")));
        }
        if let Some(remaining) = self.scheduled.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PipelineError::store_unavailable(format!(
                    "{operation}: injected failure"
                )));
            }
        }
        Ok(())
    }
}

/// In-memory event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    records: RwLock<HashMap<EventId, EventRecord>>,
    faults: Mutex<Faults>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` calls of `operation` fail.
    pub async fn fail_next(&self, operation: StoreOperation, times: u32) {
        self.faults.lock().await.scheduled.insert(operation, times);
    }

    /// Makes every call fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().await.unavailable = unavailable;
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if no event was recorded.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn trip(&self, operation: StoreOperation) -> Result<()> {
        self.faults.lock().await.trip(operation)
    }
}

impl EventStore for InMemoryEventStore {
    fn record_if_new<'a>(
        &'a self,
        event: &'a WebhookEvent,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.trip(StoreOperation::RecordIfNew).await?;
            let mut records = self.records.write().await;
            if records.contains_key(&event.id) {
                return Ok(false);
            }
            records.insert(event.id.clone(), EventRecord::received(event, now));
            Ok(true)
        })
    }

    fn try_claim<'a>(
        &'a self,
        event: &'a WebhookEvent,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ClaimOutcome> {
        Box::pin(async move {
            self.trip(StoreOperation::TryClaim).await?;
            let mut records = self.records.write().await;
            let record = records
                .entry(event.id.clone())
                .or_insert_with(|| EventRecord::received(event, now));

            match record.status {
                RecordStatus::Processed | RecordStatus::Failed => {
                    return Ok(ClaimOutcome::AlreadyProcessed)
                },
                RecordStatus::InProgress if record.claimed_by != Some(job_id) => {
                    return Ok(ClaimOutcome::InFlight)
                },
                RecordStatus::InProgress | RecordStatus::Received => {},
            }

            record.status = RecordStatus::InProgress;
            record.claimed_by = Some(job_id);
            record.attempts = record.attempts.saturating_add(1);
            record.updated_at = now;
            Ok(ClaimOutcome::Claimed { attempts: record.attempts })
        })
    }

    fn release<'a>(
        &'a self,
        event_id: &'a EventId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.trip(StoreOperation::Release).await?;
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(event_id) {
                if record.status == RecordStatus::InProgress && record.claimed_by == Some(job_id) {
                    record.status = RecordStatus::Received;
                    record.claimed_by = None;
                    record.updated_at = now;
                }
            }
            Ok(())
        })
    }

    fn mark_processed<'a>(
        &'a self,
        event: &'a WebhookEvent,
        result: ProcessResult,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.trip(StoreOperation::MarkProcessed).await?;
            let mut records = self.records.write().await;
            let record = records
                .entry(event.id.clone())
                .or_insert_with(|| EventRecord::received(event, now));
            record.status = RecordStatus::Processed;
            record.claimed_by = None;
            record.result = Some(result);
            record.updated_at = now;
            Ok(())
        })
    }

    fn mark_failed<'a>(
        &'a self,
        event: &'a WebhookEvent,
        result: Option<ProcessResult>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.trip(StoreOperation::MarkFailed).await?;
            let mut records = self.records.write().await;
            let record = records
                .entry(event.id.clone())
                .or_insert_with(|| EventRecord::received(event, now));
            if record.status != RecordStatus::Processed {
                record.status = RecordStatus::Failed;
                record.claimed_by = None;
                if result.is_some() {
                    record.result = result;
                }
                record.updated_at = now;
            }
            Ok(())
        })
    }

    fn find<'a>(&'a self, event_id: &'a EventId) -> StoreFuture<'a, Option<EventRecord>> {
        Box::pin(async move {
            self.trip(StoreOperation::Find).await?;
            Ok(self.records.read().await.get(event_id).cloned())
        })
    }
}

/// In-memory dead-letter store.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    dead_letters: RwLock<Vec<DeadLetter>>,
    faults: Mutex<Faults>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` writes fail.
    pub async fn fail_next_puts(&self, times: u32) {
        self.faults.lock().await.scheduled.insert(StoreOperation::PutDeadLetter, times);
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn put<'a>(&'a self, dead_letter: &'a DeadLetter) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.faults.lock().await.trip(StoreOperation::PutDeadLetter)?;
            let mut dead_letters = self.dead_letters.write().await;
            // Rewrites after a failed-but-applied put must not duplicate.
            dead_letters.retain(|existing| existing.job_id != dead_letter.job_id);
            dead_letters.push(dead_letter.clone());
            Ok(())
        })
    }

    fn list(&self) -> StoreFuture<'_, Vec<DeadLetter>> {
        Box::pin(async move { Ok(self.dead_letters.read().await.clone()) })
    }

    fn find_by_event<'a>(
        &'a self,
        event_id: &'a EventId,
    ) -> StoreFuture<'a, Option<DeadLetter>> {
        Box::pin(async move {
            Ok(self.dead_letters.read().await.iter().find(|d| &d.event.id == event_id).cloned())
        })
    }

    fn count(&self) -> StoreFuture<'_, usize> {
        Box::pin(async move { Ok(self.dead_letters.read().await.len()) })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use payhook_core::{Job, Priority};
    use serde_json::json;

    use super::*;

    fn event(id: &str) -> WebhookEvent {
        WebhookEvent::new(EventId::new(id).unwrap(), "payment.created", json!({}), Utc::now())
    }

    #[tokio::test]
    async fn record_if_new_reports_first_sighting_once() {
        let store = InMemoryEventStore::new();
        let event = event("evt_1");

        assert!(store.record_if_new(&event, Utc::now()).await.unwrap());
        assert!(!store.record_if_new(&event, Utc::now()).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_record_if_new_has_one_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let event = event("evt_race");

        let calls = (0..16).map(|_| {
            let store = store.clone();
            let event = event.clone();
            tokio::spawn(async move { store.record_if_new(&event, Utc::now()).await.unwrap() })
        });
        let results = futures::future::join_all(calls).await;

        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_job() {
        let store = InMemoryEventStore::new();
        let event = event("evt_claim");
        let owner = JobId::new();
        let other = JobId::new();
        store.record_if_new(&event, Utc::now()).await.unwrap();

        assert_eq!(
            store.try_claim(&event, owner, Utc::now()).await.unwrap(),
            ClaimOutcome::Claimed { attempts: 1 }
        );
        assert_eq!(
            store.try_claim(&event, other, Utc::now()).await.unwrap(),
            ClaimOutcome::InFlight
        );

        // The owner may re-claim, for instance after a failed release.
        assert_eq!(
            store.try_claim(&event, owner, Utc::now()).await.unwrap(),
            ClaimOutcome::Claimed { attempts: 2 }
        );

        store.release(&event.id, owner, Utc::now()).await.unwrap();
        let record = store.find(&event.id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Received);
        assert_eq!(record.claimed_by, None);

        store.mark_processed(&event, ProcessResult::success(), Utc::now()).await.unwrap();
        assert_eq!(
            store.try_claim(&event, other, Utc::now()).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let store = InMemoryEventStore::new();
        let event = event("evt_done");
        store.record_if_new(&event, Utc::now()).await.unwrap();

        let result = ProcessResult::success().with_metadata("order_id", "ord_1");
        store.mark_processed(&event, result.clone(), Utc::now()).await.unwrap();
        store.mark_processed(&event, result.clone(), Utc::now()).await.unwrap();

        let record = store.find(&event.id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Processed);
        assert_eq!(record.result, Some(result));

        store.mark_failed(&event, None, Utc::now()).await.unwrap();
        let record = store.find(&event.id).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Processed);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_unavailable() {
        let store = InMemoryEventStore::new();
        let event = event("evt_fault");

        store.fail_next(StoreOperation::RecordIfNew, 2).await;
        for _ in 0..2 {
            let err = store.record_if_new(&event, Utc::now()).await.unwrap_err();
            assert!(matches!(err, PipelineError::StoreUnavailable { .. }));
            assert!(err.is_retryable());
        }
        assert!(store.record_if_new(&event, Utc::now()).await.unwrap());

        store.set_unavailable(true).await;
        assert!(store.find(&event.id).await.is_err());
        store.set_unavailable(false).await;
        assert!(store.find(&event.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_letter_store_keeps_one_entry_per_job() {
        let store = InMemoryDeadLetterStore::new();
        let job = Job::new(event("evt_dead"), Priority::High, 1, Utc::now());
        let dead = DeadLetter::from_job(job, "non-retryable failure", HashMap::new(), Utc::now());

        store.fail_next_puts(1).await;
        assert!(store.put(&dead).await.is_err());
        store.put(&dead).await.unwrap();
        store.put(&dead).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let found = store.find_by_event(&dead.event.id).await.unwrap().unwrap();
        assert_eq!(found.reason, "non-retryable failure");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
