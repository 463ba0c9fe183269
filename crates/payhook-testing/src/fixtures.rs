//! Event builders with sensible defaults.

use chrono::{DateTime, Utc};
use payhook_core::{EventId, EventKind, WebhookEvent};
use serde_json::{json, Value};
use uuid::Uuid;

/// Builder for test webhook events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: String,
    event_type: String,
    payload: Value,
    received_at: DateTime<Utc>,
}

impl EventBuilder {
    /// Creates a `payment.created` event with a random id.
    pub fn with_defaults() -> Self {
        let id = format!("evt_{}", Uuid::new_v4().simple());
        Self {
            payload: json!({ "id": id, "amount": 1000, "currency": "USD" }),
            id,
            event_type: EventKind::PaymentCreated.as_str().to_string(),
            received_at: Utc::now(),
        }
    }

    /// Sets the provider event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the type tag.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the type tag from a known kind.
    #[must_use]
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.event_type = kind.as_str().to_string();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the ingestion timestamp. The pipeline overwrites it on ingest.
    #[must_use]
    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Builds the event.
    ///
    /// # Panics
    ///
    /// Panics if the id was set to an empty string.
    #[allow(clippy::expect_used)]
    pub fn build(self) -> WebhookEvent {
        let id = EventId::new(self.id).expect("test event id must not be empty");
        WebhookEvent::new(id, self.event_type, self.payload, self.received_at)
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::with_defaults()
    }
}
