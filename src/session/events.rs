// Session lifecycle events
// Closed set of typed events delivered fire-and-forget through an EventSink

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::security::SecurityFinding;
use super::types::{DestroyReason, RenewalTrigger};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        session_id: String,
        user_id: String,
        expires_at: DateTime<Utc>,
        session_type: Option<String>,
    },
    Validated {
        session_id: String,
        user_id: String,
        warnings: Vec<SecurityFinding>,
    },
    ValidationFailed {
        session_id: String,
        code: String,
        reason: String,
    },
    Renewed {
        session_id: String,
        user_id: String,
        trigger: RenewalTrigger,
        old_expires_at: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    },
    Destroyed {
        session_id: String,
        user_id: String,
        reason: DestroyReason,
        session_lifetime_ms: i64,
        metadata: HashMap<String, String>,
    },
    AutoEvicted {
        session_id: String,
        user_id: String,
        max_sessions: usize,
    },
    RecoveryTokenCreated {
        session_id: String,
        user_id: String,
        recovery_id: String,
        expires_at: DateTime<Utc>,
    },
    Recovered {
        session_id: String,
        user_id: String,
        recovery_id: String,
    },
    IdleWarning {
        session_id: String,
        user_id: String,
        idle_ms: i64,
        idle_timeout_ms: i64,
    },
    ReauthenticationRequired {
        session_id: String,
        user_id: String,
        reason: String,
    },
    MetadataUpdated {
        session_id: String,
        user_id: String,
    },
}

impl SessionEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created { .. } => "session:created",
            SessionEvent::Validated { .. } => "session:validated",
            SessionEvent::ValidationFailed { .. } => "session:validation:failed",
            SessionEvent::Renewed { .. } => "session:renewed",
            SessionEvent::Destroyed { .. } => "session:destroyed",
            SessionEvent::AutoEvicted { .. } => "session:auto_evicted",
            SessionEvent::RecoveryTokenCreated { .. } => "session:recovery_token_created",
            SessionEvent::Recovered { .. } => "session:recovered",
            SessionEvent::IdleWarning { .. } => "session:idle_warning",
            SessionEvent::ReauthenticationRequired { .. } => "session:reauthentication_required",
            SessionEvent::MetadataUpdated { .. } => "session:metadata_updated",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Created { session_id, .. }
            | SessionEvent::Validated { session_id, .. }
            | SessionEvent::ValidationFailed { session_id, .. }
            | SessionEvent::Renewed { session_id, .. }
            | SessionEvent::Destroyed { session_id, .. }
            | SessionEvent::AutoEvicted { session_id, .. }
            | SessionEvent::RecoveryTokenCreated { session_id, .. }
            | SessionEvent::Recovered { session_id, .. }
            | SessionEvent::IdleWarning { session_id, .. }
            | SessionEvent::ReauthenticationRequired { session_id, .. }
            | SessionEvent::MetadataUpdated { session_id, .. } => session_id,
        }
    }
}

/// Publish side of the event port. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// Pub/sub sink; every subscriber gets every event emitted after it subscribed
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Writes every event to the log
#[derive(Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SessionEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            SessionEvent::ValidationFailed { .. }
            | SessionEvent::AutoEvicted { .. }
            | SessionEvent::IdleWarning { .. }
            | SessionEvent::ReauthenticationRequired { .. } => {
                warn!("Session event {} {}", event.name(), payload)
            }
            _ => info!("Session event {} {}", event.name(), payload),
        }
    }
}

/// Forwards each event to several sinks
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: SessionEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> SessionEvent {
        SessionEvent::Created {
            session_id: "s1".to_string(),
            user_id: "user-123".to_string(),
            expires_at: Utc::now(),
            session_type: None,
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(created().name(), "session:created");
        let failed = SessionEvent::ValidationFailed {
            session_id: "s1".to_string(),
            code: "SESSION_EXPIRED".to_string(),
            reason: "Session expired".to_string(),
        };
        assert_eq!(failed.name(), "session:validation:failed");
        assert_eq!(failed.session_id(), "s1");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(created()).unwrap();
        assert_eq!(json["event"], "created");
        assert_eq!(json["user_id"], "user-123");
    }

    #[tokio::test]
    async fn test_broadcast_and_fanout() {
        let first = Arc::new(BroadcastEventSink::default());
        let second = Arc::new(BroadcastEventSink::default());
        let mut rx1 = first.subscribe();
        let mut rx2 = second.subscribe();

        let fanout = FanoutEventSink::new()
            .with(first.clone())
            .with(second.clone())
            .with(Arc::new(TracingEventSink));

        fanout.emit(created());

        assert_eq!(rx1.recv().await.unwrap().name(), "session:created");
        assert_eq!(rx2.recv().await.unwrap().name(), "session:created");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = BroadcastEventSink::new(4);
        sink.emit(created());
    }
}
