//! Priority queue of pending jobs.
//!
//! Jobs are kept in one min-heap per priority tier, ordered by
//! `(next_run_at, sequence)`. A dequeue scans the tiers from CRITICAL down
//! and takes the first tier head that is ready, so:
//!
//! - a ready CRITICAL job always wins over anything in a lower tier, no
//!   matter how long the lower-tier job has been waiting;
//! - a CRITICAL job that is backing off does not block ready jobs in lower
//!   tiers;
//! - inside a tier, equal `next_run_at` values fall back to the enqueue
//!   sequence number, never to the event id.
//!
//! Idle workers park in [`PriorityQueue::wait_ready`] until the earliest
//! `next_run_at` or until a new job is enqueued.

use std::{cmp::Ordering, collections::BinaryHeap};

use chrono::{DateTime, Utc};
use payhook_core::{Clock, EventId, Job, JobId, JobStatus, Priority};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct QueuedJob {
    next_run_at: DateTime<Utc>,
    sequence: u64,
    job: Job,
}

impl QueuedJob {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.next_run_at, self.sequence)
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Reversed: BinaryHeap is a max-heap and the earliest key must surface.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
struct Tiers {
    heaps: [BinaryHeap<QueuedJob>; 4],
    next_sequence: u64,
}

impl Tiers {
    fn len(&self) -> usize {
        self.heaps.iter().map(BinaryHeap::len).sum()
    }
}

/// Read-only view of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    /// Job id.
    pub job_id: JobId,
    /// Event the job wraps.
    pub event_id: EventId,
    /// Event type tag.
    pub event_type: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Zero-based index of the next attempt.
    pub attempt: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Earliest dispatch time.
    pub next_run_at: DateTime<Utc>,
    /// Position in enqueue order.
    pub sequence: u64,
}

impl From<&QueuedJob> for JobSnapshot {
    fn from(queued: &QueuedJob) -> Self {
        Self {
            job_id: queued.job.id,
            event_id: queued.job.event.id.clone(),
            event_type: queued.job.event.event_type.clone(),
            priority: queued.job.priority,
            attempt: queued.job.attempt,
            max_attempts: queued.job.max_attempts,
            status: queued.job.status,
            next_run_at: queued.next_run_at,
            sequence: queued.sequence,
        }
    }
}

/// Thread-safe priority queue shared by all workers.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    tiers: Mutex<Tiers>,
    notify: Notify,
}

impl PriorityQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a job and wakes idle workers.
    pub async fn enqueue(&self, job: Job) {
        {
            let mut tiers = self.tiers.lock().await;
            let sequence = tiers.next_sequence;
            tiers.next_sequence += 1;
            tiers.heaps[job.priority.index()].push(QueuedJob {
                next_run_at: job.next_run_at,
                sequence,
                job,
            });
        }
        self.notify.notify_waiters();
    }

    /// Removes and returns the highest-priority job whose `next_run_at` is
    /// not after `now`.
    pub async fn dequeue_ready(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut tiers = self.tiers.lock().await;
        let heap = tiers
            .heaps
            .iter_mut()
            .find(|heap| heap.peek().is_some_and(|head| head.next_run_at <= now))?;
        heap.pop().map(|queued| queued.job)
    }

    /// Earliest `next_run_at` across all tiers.
    pub async fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        let tiers = self.tiers.lock().await;
        tiers.heaps.iter().filter_map(|heap| heap.peek().map(|head| head.next_run_at)).min()
    }

    /// Waits for a ready job.
    ///
    /// Sleeps on `clock` until the earliest `next_run_at`, or until a new
    /// job is enqueued. Returns `None` once `cancellation` fires.
    pub async fn wait_ready(
        &self,
        clock: &dyn Clock,
        cancellation: &CancellationToken,
    ) -> Option<Job> {
        loop {
            // Registered before checking so an enqueue in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancellation.is_cancelled() {
                return None;
            }

            if let Some(job) = self.dequeue_ready(clock.now()).await {
                return Some(job);
            }

            match self.next_ready_at().await {
                Some(ready_at) => tokio::select! {
                    biased;
                    () = cancellation.cancelled() => return None,
                    () = notified.as_mut() => {},
                    () = clock.sleep_until(ready_at) => {},
                },
                None => tokio::select! {
                    biased;
                    () = cancellation.cancelled() => return None,
                    () = notified.as_mut() => {},
                },
            }
        }
    }

    /// Number of queued jobs.
    pub async fn size(&self) -> usize {
        self.tiers.lock().await.len()
    }

    /// Returns true if no job is queued.
    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Snapshots of the queued jobs of one event type, in priority order:
    /// tier, then `next_run_at`, then arrival. A backing-off job may sort
    /// ahead of ready jobs that dispatch before it.
    pub async fn peek_by_type(&self, event_type: &str) -> Vec<JobSnapshot> {
        let tiers = self.tiers.lock().await;
        let mut snapshots: Vec<JobSnapshot> = tiers
            .heaps
            .iter()
            .flat_map(BinaryHeap::iter)
            .filter(|queued| queued.job.event.event_type == event_type)
            .map(JobSnapshot::from)
            .collect();
        snapshots.sort_by_key(|s| (s.priority, s.next_run_at, s.sequence));
        snapshots
    }
}
