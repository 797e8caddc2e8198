//! In-memory capture of tracing events.
//!
//! ```rust
//! use ragbot_telemetry::CapturedEvents;
//!
//! let events = CapturedEvents::new();
//! tracing::subscriber::with_default(events.subscriber(), || {
//!     tracing::warn!(chunk_index = 3, "skipping input");
//! });
//! assert!(events.contains_message("skipping input"));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

/// One recorded event.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
    /// `ERROR`, `WARN`, `INFO`, `DEBUG` or `TRACE`.
    pub level: String,
    /// The module path or explicit target.
    pub target: String,
    /// The formatted message, if the event had one.
    pub message: Option<String>,
    /// Every other field.
    pub fields: HashMap<String, serde_json::Value>,
}

impl CapturedEvent {
    /// A field by name.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Whether the event was logged at `level`.
    pub fn is(&self, level: Level) -> bool {
        self.level == level.as_str()
    }
}

/// Shared, cloneable storage of captured events.
#[derive(Debug, Clone, Default)]
pub struct CapturedEvents {
    events: Arc<RwLock<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscriber that records into this storage, for
    /// `tracing::subscriber::set_default` or `with_default`.
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        Registry::default().with(EventCaptureLayer::new(self.clone()))
    }

    fn push(&self, event: CapturedEvent) {
        self.events.write().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    /// A copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events recorded at `level`.
    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        self.snapshot().into_iter().filter(|e| e.is(level)).collect()
    }

    /// Whether any event's message contains `needle`.
    pub fn contains_message(&self, needle: &str) -> bool {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.message.as_deref().is_some_and(|m| m.contains(needle)))
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.events.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// A tracing layer that records every event into [`CapturedEvents`].
pub struct EventCaptureLayer {
    storage: CapturedEvents,
}

impl EventCaptureLayer {
    /// Record into `storage`.
    pub fn new(storage: CapturedEvents) -> Self {
        Self { storage }
    }
}

impl<S: Subscriber> Layer<S> for EventCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let mut fields = visitor.0;

        let message = match fields.remove("message") {
            Some(serde_json::Value::String(message)) => Some(message),
            Some(other) => Some(other.to_string()),
            None => None,
        };
        let metadata = event.metadata();

        self.storage.push(CapturedEvent {
            level: metadata.level().as_str().to_string(),
            target: metadata.target().to_string(),
            message,
            fields,
        });
    }
}

#[derive(Default)]
struct JsonVisitor(HashMap<String, serde_json::Value>);

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }
}
