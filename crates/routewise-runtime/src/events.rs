//! Structured engine events.
//!
//! Breaker transitions, cache traffic and degraded responses are published
//! on a broadcast channel for an external metrics or logging collaborator.
//! Publishing never blocks, and nothing happens when nobody subscribes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use routewise_core::Target;

use crate::cache::{CacheTier, EvictionPolicy};
use crate::resilience::CircuitState;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CircuitTransition {
        provider: String,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
    CacheHit {
        key: String,
        tier: CacheTier,
    },
    CacheMiss {
        key: String,
    },
    CacheEviction {
        key: String,
        policy: EvictionPolicy,
    },
    Degraded {
        target: Target,
    },
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on. Slow subscribers lose the
    /// oldest events rather than stalling the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // Err only means there are no subscribers.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::CacheMiss { key: "k".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::CacheHit {
            key: "abc".into(),
            tier: CacheTier::Exact,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::CacheHit {
                key: "abc".into(),
                tier: CacheTier::Exact
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = EngineEvent::Degraded {
            target: Target::new("openai", "gpt-4o-mini"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "degraded");
        assert_eq!(json["target"]["provider"], "openai");
    }
}
