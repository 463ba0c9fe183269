//! Processors with scripted behaviour.
//!
//! A [`ScriptedProcessor`] counts its invocations and the attempt index of
//! each one, so tests can assert exactly how often the pipeline ran a
//! handler. Clones share their counters.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use payhook_core::{EventId, JobContext, ProcessResult, WebhookEvent};
use payhook_pipeline::Processor;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    FailTimes(u32),
    AlwaysFail,
    Fatal,
    Hang,
    Panic,
}

/// Processor that follows a fixed script.
#[derive(Debug, Clone)]
pub struct ScriptedProcessor {
    behavior: Behavior,
    delay: Option<Duration>,
    invocations: Arc<AtomicU32>,
    attempts: Arc<Mutex<Vec<u32>>>,
    events: Arc<Mutex<Vec<EventId>>>,
}

impl ScriptedProcessor {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: None,
            invocations: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always succeeds.
    pub fn succeed() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    /// Fails retryably on the first `n` invocations, then succeeds.
    pub fn fail_times(n: u32) -> Self {
        Self::with_behavior(Behavior::FailTimes(n))
    }

    /// Always fails retryably.
    pub fn always_fail() -> Self {
        Self::with_behavior(Behavior::AlwaysFail)
    }

    /// Fails with a non-retryable error.
    pub fn fatal() -> Self {
        Self::with_behavior(Behavior::Fatal)
    }

    /// Never completes.
    pub fn hang() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    /// Panics on every invocation.
    pub fn panic() -> Self {
        Self::with_behavior(Behavior::Panic)
    }

    /// Sleeps on the tokio timer before following the script.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times the processor was invoked.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Zero-based attempt index seen by each invocation, in call order.
    pub async fn attempts_seen(&self) -> Vec<u32> {
        self.attempts.lock().await.clone()
    }

    /// Event ids in invocation order.
    pub async fn events_seen(&self) -> Vec<EventId> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, event: &WebhookEvent, ctx: &JobContext) -> ProcessResult {
        let call = self.invocations.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().await.push(ctx.attempt);
        self.events.lock().await.push(event.id.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.behavior {
            Behavior::Succeed => ProcessResult::success(),
            Behavior::FailTimes(n) if call < n => {
                ProcessResult::retryable(format!("scripted failure {}", call + 1))
            },
            Behavior::FailTimes(_) => ProcessResult::success(),
            Behavior::AlwaysFail => ProcessResult::retryable("downstream unavailable"),
            Behavior::Fatal => ProcessResult::fatal("malformed payload"),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                ProcessResult::retryable("unreachable")
            },
            Behavior::Panic => panic!("scripted processor panic"),
        }
    }
}
