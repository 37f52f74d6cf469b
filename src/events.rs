// ABOUTME: Core event types: inbound gateway events and outbound diagnostic log events.
// ABOUTME: Event kinds map platform wire codes to a closed enum with an Other escape hatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of thing happened on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Ready,
    MessageCreate,
    InteractionCreate,
    MemberJoin,
    /// Wire codes this build does not model; carried verbatim
    Other(String),
}

impl EventKind {
    /// Map a platform wire code to an event kind. Unknown codes are kept
    /// as-is so extensions can still subscribe to them.
    pub fn from_code(code: &str) -> Self {
        match code {
            "READY" => EventKind::Ready,
            "MESSAGE_CREATE" => EventKind::MessageCreate,
            "INTERACTION_CREATE" => EventKind::InteractionCreate,
            "MEMBER_JOIN" => EventKind::MemberJoin,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ready => "READY",
            EventKind::MessageCreate => "MESSAGE_CREATE",
            EventKind::InteractionCreate => "INTERACTION_CREATE",
            EventKind::MemberJoin => "MEMBER_JOIN",
            EventKind::Other(code) => code,
        }
    }
}

/// One inbound event from the gateway, as handed to extension listeners.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    /// Unique per received event, for log correlation
    pub id: String,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl GatewayEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Severity of a diagnostic log event shipped to the webhook sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// One structured diagnostic event bound for the webhook sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub severity: Severity,
    /// Which component emitted this, e.g. "supervisor" or "extension:audit"
    pub source: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, source, message)
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, source, message)
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_roundtrip() {
        assert_eq!(EventKind::from_code("READY"), EventKind::Ready);
        assert_eq!(EventKind::from_code("MESSAGE_CREATE").as_str(), "MESSAGE_CREATE");
        assert_eq!(
            EventKind::from_code("TYPING_START"),
            EventKind::Other("TYPING_START".to_string())
        );
        assert_eq!(EventKind::from_code("TYPING_START").as_str(), "TYPING_START");
    }

    #[test]
    fn test_gateway_events_get_unique_ids() {
        let a = GatewayEvent::new(EventKind::Ready, Value::Null);
        let b = GatewayEvent::new(EventKind::Ready, Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_log_event_serializes_without_empty_context() {
        let event = LogEvent::info("test", "hello");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["severity"], "info");
        assert!(json.get("context").is_none());

        let event = event.with_context(serde_json::json!({"k": "v"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["context"]["k"], "v");
    }
}
