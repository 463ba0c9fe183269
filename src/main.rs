//! Payhook webhook ingestion service.
//!
//! Reads verified provider events as newline-delimited JSON from stdin,
//! feeds them through the pipeline and shuts down gracefully on Ctrl-C or
//! SIGTERM.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use payhook_core::{
    EventHandler, EventKind, MulticastEventHandler, PipelineEvent, Priority, WebhookEvent,
};
use payhook_pipeline::{
    processor_fn, EventId, ProcessResult, ProcessorDescriptor, ProcessorRegistry,
    WebhookPipeline,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        worker_pool_size = config.worker_pool_size,
        handler_timeout_seconds = config.handler_timeout_seconds,
        max_attempts = config.max_attempts,
        "starting payhook webhook pipeline"
    );

    let mut subscribers = MulticastEventHandler::new();
    subscribers.add_subscriber(Arc::new(DeadLetterAlert));
    subscribers.add_subscriber(Arc::new(AuditLog));

    let mut pipeline = WebhookPipeline::builder(build_registry())
        .config(config.to_pipeline_config())
        .event_handler(Arc::new(subscribers))
        .build()
        .context("failed to build pipeline")?;

    pipeline.start().await.context("failed to start pipeline workers")?;
    info!("payhook is ready to receive events on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut report = tokio::time::interval(config.metrics_interval());
    report.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received, starting graceful shutdown");
                break;
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => ingest_line(&pipeline, &line).await,
                Ok(None) => {
                    info!("stdin closed, continuing to process queued events");
                    stdin_open = false;
                },
                Err(e) => {
                    warn!(error = %e, "failed to read stdin, no further events will be read");
                    stdin_open = false;
                },
            },
            _ = report.tick() => log_metrics(&pipeline).await,
        }
    }

    pipeline.shutdown().await.context("pipeline shutdown failed")?;
    log_metrics(&pipeline).await;

    info!("payhook shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).context("invalid log filter directives")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

/// One inbound event as emitted by the upstream verifier.
#[derive(Debug, Deserialize)]
struct InboundEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

impl InboundEvent {
    fn into_event(self) -> Result<WebhookEvent> {
        let id = EventId::new(self.id).context("event id is empty")?;
        Ok(WebhookEvent::new(id, self.event_type, self.data, Utc::now()))
    }
}

async fn ingest_line(pipeline: &WebhookPipeline, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let event = match serde_json::from_str::<InboundEvent>(line)
        .context("malformed event")
        .and_then(InboundEvent::into_event)
    {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "rejecting inbound line");
            return;
        },
    };

    let event_id = event.id.clone();
    match pipeline.ingest(event).await {
        Ok(outcome) if outcome.duplicate => {
            debug!(event_id = %event_id, "duplicate event acknowledged");
        },
        Ok(outcome) => {
            debug!(event_id = %event_id, job_id = ?outcome.job_id, "event accepted");
        },
        Err(e) => {
            error!(event_id = %event_id, error = %e, "event rejected, provider should redeliver");
        },
    }
}

/// Registers a processor for every provider event kind the service handles.
fn build_registry() -> ProcessorRegistry {
    let kinds = [
        EventKind::PaymentCreated,
        EventKind::PaymentUpdated,
        EventKind::RefundCreated,
        EventKind::RefundUpdated,
        EventKind::DisputeCreated,
        EventKind::DisputeStateUpdated,
        EventKind::OrderCreated,
        EventKind::OrderUpdated,
        EventKind::InvoicePaymentMade,
    ];

    kinds.into_iter().fold(ProcessorRegistry::new(), |registry, kind| {
        let tag = kind.as_str().to_string();
        registry.with_processor(ProcessorDescriptor::for_kind(
            kind,
            processor_fn(move |event, ctx| {
                let tag = tag.clone();
                async move {
                    info!(
                        event_id = %event.id,
                        event_type = %tag,
                        attempt = ctx.attempt_number(),
                        "processing event"
                    );
                    ProcessResult::success().with_metadata("handler", tag)
                }
            }),
        ))
    })
}

/// Raises an error log for every dead-lettered job.
#[derive(Debug)]
struct DeadLetterAlert;

#[async_trait::async_trait]
impl EventHandler for DeadLetterAlert {
    async fn handle_event(&self, event: PipelineEvent) {
        if let PipelineEvent::JobDeadLettered(dead) = event {
            let urgent = dead.priority == Priority::Critical;
            error!(
                event_id = %dead.event_id,
                event_type = %dead.event_type,
                attempts = dead.attempts,
                reason = %dead.reason,
                urgent,
                "event needs manual attention"
            );
        }
    }
}

/// Debug-level trail of every lifecycle notification.
#[derive(Debug)]
struct AuditLog;

#[async_trait::async_trait]
impl EventHandler for AuditLog {
    async fn handle_event(&self, event: PipelineEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => debug!(event_id = %event.event_id(), notification = %json, "audit"),
            Err(e) => warn!(error = %e, "failed to serialize lifecycle notification"),
        }
    }
}

async fn log_metrics(pipeline: &WebhookPipeline) {
    let snapshot = pipeline.metrics().await;
    let totals = snapshot.totals;
    info!(
        attempted = totals.attempted,
        succeeded = totals.succeeded,
        failed = totals.failed,
        dead_lettered = totals.dead_lettered,
        duplicates = totals.duplicates,
        success_rate = ?totals.success_rate(),
        p95_ms = snapshot.latency.p95_ms,
        queue_depth = pipeline.queue_depth().await,
        active_workers = snapshot.active_workers,
        "pipeline metrics"
    );
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
