//! Event sinks.
//!
//! The core components publish `(channel, payload)` pairs and never know how
//! many listeners exist or what they are.

use duorec_ipc::EventEnvelope;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub trait Notifier: Send + Sync {
    fn publish(&self, channel: &str, payload: Value);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Fans events out to every control-socket subscriber.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, channel: &str, payload: Value) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.tx.send(EventEnvelope {
            channel: channel.to_string(),
            payload,
        });
    }
}

/// Keeps every event in memory, in publish order.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.lock().clone()
    }

    pub fn channel(&self, channel: &str) -> Vec<Value> {
        self.lock()
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EventEnvelope>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Notifier for MemoryNotifier {
    fn publish(&self, channel: &str, payload: Value) {
        self.lock().push(EventEnvelope {
            channel: channel.to_string(),
            payload,
        });
    }
}

pub struct FanoutNotifier {
    sinks: Vec<SharedNotifier>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<SharedNotifier>) -> Self {
        Self { sinks }
    }
}

impl Notifier for FanoutNotifier {
    fn publish(&self, channel: &str, payload: Value) {
        for sink in &self.sinks {
            sink.publish(channel, payload.clone());
        }
    }
}

/// Desktop notifications for the two moments a director cares about:
/// a segment finishing and a recording becoming ready.
pub struct DesktopNotifier;

impl DesktopNotifier {
    fn summarize(channel: &str, payload: &Value) -> Option<(String, String)> {
        match channel {
            "timer/stop" if payload["reason"] == "completed" => Some((
                "Segment complete".to_string(),
                format!("{}s recorded", payload["elapsedSec"].as_u64().unwrap_or(0)),
            )),
            "watcher/status" if payload["state"] == "ready" => Some((
                "Recording ready".to_string(),
                payload["file"].as_str().unwrap_or("unknown file").to_string(),
            )),
            _ => None,
        }
    }
}

impl Notifier for DesktopNotifier {
    fn publish(&self, channel: &str, payload: Value) {
        let Some((title, body)) = Self::summarize(channel, &payload) else {
            return;
        };
        debug!(%title, %body, "desktop notification");
        // Showing a notification can block on the session bus.
        std::thread::spawn(move || {
            if let Err(e) = notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .appname("duorec")
                .show()
            {
                warn!("Failed to send notification: {}", e);
            }
        });
    }
}
