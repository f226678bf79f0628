use crate::{JobId, QueueError, Result};
use serde::Deserialize;

/// Channel carrying events for every tracked job
pub const TRACK_CHANNEL: &str = "ql:track";

/// Per-worker notification channel
pub fn worker_channel(worker: &str) -> String {
    format!("ql:w:{}", worker)
}

/// What happened to a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Canceled,
    /// The lease expired and another worker picked the job up
    LockLost,
    /// The job was put into a queue while still assigned
    Put,
    /// Any other event name (completed, popped, failed, ...)
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Canceled => "canceled",
            EventKind::LockLost => "lock_lost",
            EventKind::Put => "put",
            EventKind::Other(name) => name,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "canceled" => EventKind::Canceled,
            "lock_lost" => EventKind::LockLost,
            "put" => EventKind::Put,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// A notification about one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub jid: JobId,
}

#[derive(Deserialize)]
struct WireEvent {
    event: String,
    jid: JobId,
}

impl Event {
    pub fn new(kind: EventKind, jid: impl Into<JobId>) -> Self {
        Event {
            kind,
            jid: jid.into(),
        }
    }

    /// Parse a raw channel message, e.g. `{"event": "lock_lost", "jid": "..."}`.
    /// Extra fields are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(raw)
            .map_err(|e| QueueError::MalformedNotification(format!("{}: {}", e, raw)))?;

        Ok(Event {
            kind: EventKind::from_name(&wire.event),
            jid: wire.jid,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "event": self.kind.as_str(),
            "jid": self.jid,
        })
        .to_string()
    }

    /// Whether the worker that held this job must stop working on it
    pub fn revokes_ownership(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Canceled | EventKind::LockLost | EventKind::Put
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ownership_events() {
        for (name, kind) in [
            ("canceled", EventKind::Canceled),
            ("lock_lost", EventKind::LockLost),
            ("put", EventKind::Put),
        ] {
            let raw = format!(r#"{{"event": "{}", "jid": "abc"}}"#, name);
            let event = Event::parse(&raw).unwrap();
            assert_eq!(event.kind, kind);
            assert_eq!(event.jid, "abc");
            assert!(event.revokes_ownership());
        }
    }

    #[test]
    fn test_other_events_are_kept_but_harmless() {
        let event = Event::parse(r#"{"event": "completed", "jid": "abc", "queue": "q"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Other("completed".to_string()));
        assert!(!event.revokes_ownership());
    }

    #[test]
    fn test_malformed() {
        for raw in ["not json", r#"{"event": "put"}"#, r#"{"jid": 3, "event": "put"}"#] {
            match Event::parse(raw) {
                Err(QueueError::MalformedNotification(_)) => {}
                other => panic!("expected MalformedNotification, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_to_json_parses_back() {
        let event = Event::new(EventKind::LockLost, "jid-9");
        assert_eq!(Event::parse(&event.to_json()).unwrap(), event);
        assert_eq!(worker_channel("host-12"), "ql:w:host-12");
    }
}
