//! Push-status notifications
//!
//! Advisory progress events keyed by message id. The pipeline never blocks
//! on delivery and events are dropped silently when nobody subscribed for
//! that id; the final response always travels on the request channel.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "statusText")]
    pub status_text: String,
    #[serde(rename = "elapsedMs", skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub data: serde_json::Value,
}

#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<DashMap<String, mpsc::UnboundedSender<StatusEvent>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one message id, replacing any previous one.
    pub fn subscribe(&self, message_id: &str) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(message_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, message_id: &str) {
        self.subscribers.remove(message_id);
    }

    pub fn notify(
        &self,
        message_id: &str,
        status_text: &str,
        elapsed_ms: Option<u64>,
        data: Option<serde_json::Value>,
    ) {
        let Some(sender) = self.subscribers.get(message_id) else {
            return;
        };
        let event = StatusEvent {
            kind: "status",
            message_id: message_id.to_string(),
            status_text: status_text.to_string(),
            elapsed_ms,
            data: data.unwrap_or_else(|| serde_json::Value::String("NoInfo".to_string())),
        };
        if sender.send(event).is_err() {
            drop(sender);
            self.subscribers.remove(message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscriber() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe("m1");
        notifier.notify("m1", "סיווג שאלה", Some(12), None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status_text, "סיווג שאלה");
        assert_eq!(event.elapsed_ms, Some(12));
        assert_eq!(event.data, serde_json::json!("NoInfo"));
    }

    #[tokio::test]
    async fn test_notify_without_subscriber_is_silent() {
        let notifier = Notifier::new();
        notifier.notify("missing", "סטטוס", None, None);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cleans_up() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe("m2");
        drop(rx);
        notifier.notify("m2", "ראשון", None, None);
        assert!(notifier.subscribers.get("m2").is_none());
    }
}
