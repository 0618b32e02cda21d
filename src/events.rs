// =============================================================================
// Engine event bus — typed broadcast channel for strategy observers
// =============================================================================
//
// Observers (UI adapters, the persistence task) subscribe and receive every
// event published after their subscription. A slow observer lags and loses
// the oldest events rather than blocking the engine.
// =============================================================================

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the broadcast ring. Old events are dropped for lagging
/// receivers once the ring wraps.
const EVENT_BUS_CAPACITY: usize = 256;

/// Everything the engine tells the outside world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StrategyAdded(String),
    StrategyStarted(String),
    StrategyStopped(String),
    StrategyUpdated(String),
    StrategyDeleted(String),
    StrategyError { uid: String, message: String },
    SaveRequested(String),
    StrategiesSaved(String),
    StrategiesLoaded(String),
}

impl EngineEvent {
    /// The uid the event refers to, when it refers to a single strategy.
    pub fn uid(&self) -> Option<&str> {
        match self {
            Self::StrategyAdded(uid)
            | Self::StrategyStarted(uid)
            | Self::StrategyStopped(uid)
            | Self::StrategyUpdated(uid)
            | Self::StrategyDeleted(uid)
            | Self::SaveRequested(uid)
            | Self::StrategyError { uid, .. } => Some(uid),
            Self::StrategiesSaved(_) | Self::StrategiesLoaded(_) => None,
        }
    }
}

/// Cloneable handle to the engine's broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send error only means no observer is currently
    /// subscribed, which is fine.
    pub fn publish(&self, event: EngineEvent) {
        debug!(?event, "engine event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::StrategyAdded("abcd1234".into()));
        bus.publish(EngineEvent::StrategyError {
            uid: "abcd1234".into(),
            message: "boom".into(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::StrategyAdded("abcd1234".into())
        );
        match rx.recv().await.unwrap() {
            EngineEvent::StrategyError { uid, message } => {
                assert_eq!(uid, "abcd1234");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::StrategiesSaved("2 strategies".into()));
    }

    #[test]
    fn event_uid_extraction() {
        assert_eq!(
            EngineEvent::SaveRequested("u1".into()).uid(),
            Some("u1")
        );
        assert_eq!(EngineEvent::StrategiesLoaded("ok".into()).uid(), None);
    }
}
