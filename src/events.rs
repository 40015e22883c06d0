//! Outward change-event stream.
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::monitor::models::TargetKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: String,
    pub name: String,
    pub kind: TargetKind,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub description: String,
    /// Base64-encoded JPEG, when one could be produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ChangeEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event` and returns how many subscribers received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(target_id = %event.id, "No subscribers for change event.");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ChangeEvent {
        ChangeEvent {
            id: "camera:10.0.0.5".into(),
            name: "Porch".into(),
            kind: TargetKind::Camera,
            timestamp: Utc::now(),
            score: 0.2,
            description: "A person entered the frame.".into(),
            thumbnail: None,
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let events = EventBroadcaster::new(8);
        assert_eq!(events.emit(event()), 0);

        let mut rx = events.subscribe();
        assert_eq!(events.emit(event()), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "Porch");
    }

    #[test]
    fn test_event_serialization_omits_missing_thumbnail() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["kind"], "camera");
        assert!(json.get("thumbnail").is_none());
    }
}
