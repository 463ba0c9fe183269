//! Lifecycle notification capture.
//!
//! [`RecordingEventHandler`] stores every [`PipelineEvent`] it receives and
//! lets tests block until a number of notifications arrived. Waits are
//! bounded so a stuck pipeline fails the test instead of hanging CI.

use std::time::Duration;

use payhook_core::{EventHandler, EventId, PipelineEvent};
use tokio::sync::{Mutex, Notify};

/// Default timeout for waiting on notifications.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriber that keeps every notification in arrival order.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<PipelineEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications received so far.
    pub async fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().await.clone()
    }

    /// Number of notifications received.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Returns true if nothing was received.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Notifications about one event.
    pub async fn events_for(&self, event_id: &EventId) -> Vec<PipelineEvent> {
        self.events.lock().await.iter().filter(|e| e.event_id() == event_id).cloned().collect()
    }

    /// Number of `JobSucceeded` notifications.
    pub async fn succeeded_count(&self) -> usize {
        self.count(|e| matches!(e, PipelineEvent::JobSucceeded(_))).await
    }

    /// Number of `RetryScheduled` notifications.
    pub async fn retry_count(&self) -> usize {
        self.count(|e| matches!(e, PipelineEvent::RetryScheduled(_))).await
    }

    /// Number of `JobDeadLettered` notifications.
    pub async fn dead_lettered_count(&self) -> usize {
        self.count(|e| matches!(e, PipelineEvent::JobDeadLettered(_))).await
    }

    /// Number of `DuplicateSkipped` notifications.
    pub async fn duplicate_count(&self) -> usize {
        self.count(|e| matches!(e, PipelineEvent::DuplicateSkipped(_))).await
    }

    async fn count(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| predicate(e)).count()
    }

    /// Waits until at least `count` notifications arrived.
    ///
    /// # Panics
    ///
    /// Panics after [`DEFAULT_EVENT_TIMEOUT`].
    pub async fn wait_for(&self, count: usize) {
        self.wait_for_with_timeout(count, DEFAULT_EVENT_TIMEOUT).await;
    }

    /// Waits until at least `count` notifications arrived.
    ///
    /// # Panics
    ///
    /// Panics after `timeout`.
    pub async fn wait_for_with_timeout(&self, count: usize, timeout: Duration) {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.len().await >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "pipeline notifications did not arrive in time. Expected: {}, Actual: {}, \
                 Timeout: {:?}",
                count,
                self.len().await,
                timeout
            );
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: PipelineEvent) {
        self.events.lock().await.push(event);
        self.notify.notify_waiters();
    }
}
