//! Progress events emitted during scans and repairs
//!
//! The engine only emits; who listens (a terminal, the dashboard's SSE
//! stream, a test recorder) is decided by whoever injects the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::repair::{Fix, FixObserver, FixOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ScanStart,
    ScanProgress,
    ScanComplete,
    FixStart,
    FixProgress,
    FixComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// 0..=100
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ProgressEvent {
    pub fn message(event_type: EventType, session_id: &str, progress: u8, message: impl Into<String>) -> Self {
        Self {
            event_type,
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            progress: progress.min(100),
            message: Some(message.into()),
            result: None,
        }
    }

    pub fn result(event_type: EventType, session_id: &str, result: Value) -> Self {
        Self {
            event_type,
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            progress: 100,
            message: None,
            result: Some(result),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: ProgressEvent) {
        (**self).emit(event)
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Fan-out to any number of subscribers; lagging subscribers lose events
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ProgressEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Bridges repairer callbacks to fix-* events
pub struct FixProgress<'a> {
    pub sink: &'a dyn EventSink,
    pub session_id: &'a str,
}

impl FixObserver for FixProgress<'_> {
    fn fix_started(&self, fix: &Fix, index: usize, total: usize) {
        let event_type = if index == 0 { EventType::FixStart } else { EventType::FixProgress };
        self.sink.emit(ProgressEvent::message(
            event_type,
            self.session_id,
            percent(index, total),
            format!("{} ({}/{})", fix.title, index + 1, total),
        ));
    }

    fn fix_finished(&self, outcome: &FixOutcome, index: usize, total: usize) {
        self.sink.emit(ProgressEvent::message(
            EventType::FixProgress,
            self.session_id,
            percent(index + 1, total),
            outcome.message.clone(),
        ));
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((done * 100) / total).min(100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent::message(EventType::ScanStart, "s-1", 0, "Scanning");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "scan-start");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["message"], "Scanning");
        assert!(json.get("result").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let sink = BroadcastSink::new(8);
        sink.emit(ProgressEvent::message(EventType::ScanStart, "lost", 0, "nobody listening"));

        let mut rx = sink.subscribe();
        sink.emit(ProgressEvent::result(EventType::ScanComplete, "s-2", serde_json::json!({"issues": 0})));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ScanComplete);
        assert_eq!(event.progress, 100);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(4, 4), 100);
    }
}
