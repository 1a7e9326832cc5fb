//! Lifecycle events published by a [`MonitorController`](super::MonitorController).

use crate::store::ledger::BackupRecord;
use crate::utils::errors::{ErrorKind, SnapkeepError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Maximum number of queued events per subscriber
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MonitorEvent {
    /// The watched file settled after a change
    #[serde(rename = "monitor:changed")]
    Changed { path: PathBuf },

    /// A session began watching `path`
    #[serde(rename = "monitor:started")]
    Started { path: PathBuf },

    /// The session ended (explicit stop or failure)
    #[serde(rename = "monitor:stopped")]
    Stopped,

    /// A new live backup exists
    #[serde(rename = "backup:created")]
    BackupCreated(BackupRecord),

    #[serde(rename = "monitor:error")]
    Error { kind: ErrorKind, message: String },
}

impl MonitorEvent {
    pub fn from_error(err: &SnapkeepError) -> Self {
        MonitorEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Fan-out of events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is not an error
    pub fn emit(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = MonitorEvent::Error {
            kind: ErrorKind::NotFound,
            message: "gone".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "monitor:error");
        assert_eq!(json["payload"]["kind"], "not_found");

        let stopped = serde_json::to_value(&MonitorEvent::Stopped).unwrap();
        assert_eq!(stopped["type"], "monitor:stopped");
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new();
        bus.emit(MonitorEvent::Stopped); // no subscribers yet

        let mut rx = bus.subscribe();
        bus.emit(MonitorEvent::Started {
            path: PathBuf::from("/tmp/x"),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            MonitorEvent::Started {
                path: PathBuf::from("/tmp/x")
            }
        );
    }
}
