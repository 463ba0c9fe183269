//! Processor registry.
//!
//! Maps an event type tag to the [`Processor`] that handles it and to the
//! per-type policy (priority, attempt ceiling, timeout). Unknown types fall
//! back to a generic log-only descriptor, so an event the application has
//! no handler for is acknowledged instead of dropped.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use payhook_core::{EventKind, JobContext, Priority, ProcessResult, WebhookEvent};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Event type tag of the fallback descriptor.
pub const FALLBACK_EVENT_TYPE: &str = "*";

/// Business logic for one event type.
///
/// Implementations may call external collaborators (database writes, API
/// calls). They must be safe to re-run: a retry invokes the full handler
/// again, and side effects of a timed-out attempt are not rolled back.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Processes one event.
    async fn process(&self, event: &WebhookEvent, ctx: &JobContext) -> ProcessResult;
}

/// Processor backed by an async closure. Built with [`processor_fn`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

/// Adapts an async closure into a [`Processor`].
///
/// # Example
///
/// ```
/// use payhook_core::ProcessResult;
/// use payhook_pipeline::registry::processor_fn;
///
/// let processor = processor_fn(|event, _ctx| async move {
///     ProcessResult::success().with_metadata("event_type", event.event_type)
/// });
/// # let _ = processor;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(WebhookEvent, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    FnProcessor { f }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(WebhookEvent, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    async fn process(&self, event: &WebhookEvent, ctx: &JobContext) -> ProcessResult {
        (self.f)(event.clone(), ctx.clone()).await
    }
}

/// Acknowledges events nobody registered a processor for.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyProcessor;

#[async_trait]
impl Processor for LogOnlyProcessor {
    async fn process(&self, event: &WebhookEvent, ctx: &JobContext) -> ProcessResult {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            job_id = %ctx.job_id,
            "no processor registered, acknowledging event"
        );
        ProcessResult::success().with_metadata("handler", "log_only")
    }
}

/// Static registration of one event type.
#[derive(Clone)]
pub struct ProcessorDescriptor {
    /// Event type tag this descriptor handles.
    pub event_type: String,
    /// Priority of jobs for this type.
    pub priority: Priority,
    /// Attempt ceiling; `None` uses the pipeline's retry policy.
    pub max_attempts: Option<u32>,
    /// Handler timeout; `None` uses the pipeline default.
    pub timeout: Option<Duration>,
    processor: Arc<dyn Processor>,
}

impl fmt::Debug for ProcessorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorDescriptor")
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProcessorDescriptor {
    /// Registers `processor` for `event_type` with the type's default
    /// priority.
    pub fn new(event_type: impl Into<String>, processor: impl Processor + 'static) -> Self {
        let event_type = event_type.into();
        let priority = EventKind::parse(&event_type).default_priority();
        Self {
            event_type,
            priority,
            max_attempts: None,
            timeout: None,
            processor: Arc::new(processor),
        }
    }

    /// Registers `processor` for a known provider event kind.
    pub fn for_kind(kind: EventKind, processor: impl Processor + 'static) -> Self {
        Self::new(kind.as_str(), processor)
    }

    /// Generic low-priority, single-attempt, log-only descriptor.
    pub fn fallback() -> Self {
        Self::new(FALLBACK_EVENT_TYPE, LogOnlyProcessor)
            .with_priority(Priority::Low)
            .with_max_attempts(1)
    }

    /// Overrides the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the attempt ceiling. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Overrides the handler timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shared handle to the processor.
    pub fn processor(&self) -> Arc<dyn Processor> {
        self.processor.clone()
    }

    /// Returns true for the generic descriptor.
    pub fn is_fallback(&self) -> bool {
        self.event_type == FALLBACK_EVENT_TYPE
    }
}

/// Event type to descriptor map. Last registration wins.
#[derive(Debug)]
pub struct ProcessorRegistry {
    descriptors: RwLock<HashMap<String, ProcessorDescriptor>>,
    fallback: ProcessorDescriptor,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { descriptors: RwLock::new(HashMap::new()), fallback: ProcessorDescriptor::fallback() }
    }

    /// Adds a descriptor while the registry is still owned.
    #[must_use]
    pub fn with_processor(mut self, descriptor: ProcessorDescriptor) -> Self {
        self.descriptors.get_mut().insert(descriptor.event_type.clone(), descriptor);
        self
    }

    /// Registers a descriptor, returning the one it replaced.
    pub async fn register(&self, descriptor: ProcessorDescriptor) -> Option<ProcessorDescriptor> {
        let event_type = descriptor.event_type.clone();
        let replaced = self.descriptors.write().await.insert(event_type.clone(), descriptor);
        if replaced.is_some() {
            debug!(event_type = %event_type, "processor registration replaced");
        }
        replaced
    }

    /// Descriptor for `event_type`, or the generic fallback.
    pub async fn resolve(&self, event_type: &str) -> ProcessorDescriptor {
        if let Some(descriptor) = self.descriptors.read().await.get(event_type) {
            return descriptor.clone();
        }
        debug!(event_type, "unknown event type, using fallback processor");
        self.fallback.clone()
    }

    /// Returns true if `event_type` has its own descriptor.
    pub async fn contains(&self, event_type: &str) -> bool {
        self.descriptors.read().await.contains_key(event_type)
    }

    /// Registered event types, sorted.
    pub async fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.descriptors.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}
