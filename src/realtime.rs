//! Realtime event hub (spec §4.G): fan-out of per-request lifecycle events
//! to connected observers. Best-effort — an observer that cannot keep up is
//! dropped without disturbing the dispatcher (`tokio::sync::broadcast`'s lag
//! semantics give us this for free: a slow receiver just misses old events
//! instead of blocking the sender). Grounded on the `realtime_hub` calls
//! threaded through `original_source/src/core/base_proxy.py::proxy()`; the
//! hub implementation itself was not in the retrieved pack, so the event
//! catalogue is built directly from spec §4.G.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RequestStarted {
        id: String,
        method: String,
        path: String,
        channel: Option<String>,
        headers: serde_json::Value,
        target_url: Option<String>,
    },
    RequestStreaming {
        id: String,
        elapsed_ms: u64,
    },
    ResponseChunk {
        id: String,
        text: String,
        elapsed_ms: u64,
    },
    LbSwitch {
        id: String,
        from: Option<String>,
        to: String,
        reason: SwitchReason,
        failures: u32,
        threshold: u32,
        attempt: u32,
        path: String,
    },
    LbReset {
        id: String,
        reason: String,
        total_configs: usize,
        threshold: u32,
    },
    LbExhausted {
        id: String,
        reason: String,
        total_configs: usize,
        threshold: u32,
        cooldown_seconds: u64,
        cooldown_remaining_seconds: u64,
    },
    RequestCompleted {
        id: String,
        status_code: Option<u16>,
        duration_ms: u64,
        success: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    HttpNon2xx,
    RequestError,
}

/// One hub per service. Cloned cheaply (an `Arc`-free `broadcast::Sender`
/// clone), so every request task can hold its own handle.
#[derive(Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<Event>,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort: a channel with zero subscribers returns `Err`, which we
    /// silently ignore — the dispatcher's own control flow never depends on
    /// delivery succeeding.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let hub = RealtimeHub::new(16);
        let mut rx = hub.subscribe();

        hub.emit(Event::RequestStarted {
            id: "r1".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            channel: Some("primary".to_string()),
            headers: serde_json::json!({}),
            target_url: None,
        });
        hub.emit(Event::RequestCompleted {
            id: "r1".to_string(),
            status_code: Some(200),
            duration_ms: 5,
            success: true,
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, Event::RequestStarted { .. }));
        assert!(matches!(second, Event::RequestCompleted { .. }));
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let hub = RealtimeHub::new(4);
        hub.emit(Event::RequestCompleted {
            id: "r1".to_string(),
            status_code: None,
            duration_ms: 0,
            success: false,
        });
    }
}
