//! Host side of the event bridge.
//!
//! Session events reach the host as `(event name, JSON payload)` pairs, the
//! shape a scripting host or a message bus expects.

use std::sync::Arc;

use mqttlink_session::{EventSink, MqttEvent};
use tracing::{error, info, warn};

type Handler = dyn Fn(&str, serde_json::Value) + Send + Sync;

/// [`EventSink`] forwarding each event by name with its JSON payload.
#[derive(Clone)]
pub struct HostBridge {
    handler: Arc<Handler>,
}

impl HostBridge {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, serde_json::Value) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Bridge writing every event to the log as one JSON line.
    pub fn logging() -> Self {
        Self::new(|name, payload| match name {
            "mqtt_error" | "subscribe_failed" => error!(event = name, "{}", payload),
            "disconnected" => warn!(event = name, "{}", payload),
            _ => info!(event = name, "{}", payload),
        })
    }
}

impl EventSink for HostBridge {
    fn emit(&self, event: MqttEvent) {
        (self.handler)(event.name(), event.payload());
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostBridge")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use mqttlink_session::{EventBridge, ReasonCode};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_events_forwarded_by_name() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let bridge = HostBridge::new(move |name, payload| {
            sink.lock().unwrap().push((name.to_string(), payload));
        });

        let events = EventBridge::new("c1", Arc::new(bridge));
        events.connected(ReasonCode::SUCCESS);
        events.disconnected(ReasonCode::DISCONNECTION, Some("gone".into()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "connected");
        assert_eq!(seen[0].1["clientId"], json!("c1"));
        assert_eq!(seen[0].1["reasonCode"], json!(0));
        assert_eq!(seen[1].0, "disconnected");
        assert_eq!(seen[1].1["reasonCode"], json!(-3));
        assert_eq!(seen[1].1["errorMessage"], json!("gone"));
    }
}
