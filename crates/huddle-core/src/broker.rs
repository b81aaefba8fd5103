//! In-process topic broker.
//!
//! The broker is the [`Publisher`] the server hands to the engine. Each
//! topic is a tokio broadcast channel created on first subscription;
//! connections subscribe and forward what they receive to their socket.

use crate::gateway::{GatewayError, Publisher};
use dashmap::DashMap;
use huddle_protocol::{ServerEvent, Topic};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Default broadcast channel capacity.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Pub/sub fan-out keyed by topic.
#[derive(Debug)]
pub struct Broker {
    topics: DashMap<Topic, broadcast::Sender<Arc<ServerEvent>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Broker {
    /// Create a broker with the default per-topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a broker with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransportUnavailable`] once the broker is closed.
    pub fn subscribe(
        &self,
        topic: &Topic,
    ) -> Result<broadcast::Receiver<Arc<ServerEvent>>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::TransportUnavailable("broker closed".into()));
        }
        let receiver = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| {
                debug!(topic = %topic, "Creating topic");
                broadcast::channel(self.capacity).0
            })
            .subscribe();
        Ok(receiver)
    }

    /// Number of live receivers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Number of topics with a channel.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Stop accepting subscriptions and publishes, and drop every channel.
    ///
    /// Receivers see their channel close once pending events are drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.topics.clear();
            info!("Broker closed");
        }
    }

    /// Whether [`Broker::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for Broker {
    fn publish(&self, topic: &Topic, event: Arc<ServerEvent>) -> Result<usize, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::TransportUnavailable("broker closed".into()));
        }

        let Some(sender) = self.topics.get(topic) else {
            trace!(topic = %topic, "No subscribers");
            return Ok(0);
        };
        let count = sender.send(event).unwrap_or_default();
        drop(sender);

        if count == 0 {
            // Every receiver is gone; forget the topic.
            self.topics
                .remove_if(topic, |_, sender| sender.receiver_count() == 0);
            debug!(topic = %topic, "Dropped topic without subscribers");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> Arc<ServerEvent> {
        Arc::new(ServerEvent::system(text, None))
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let broker = Broker::new();
        let topic = Topic::Room("r1".into());

        let mut rx1 = broker.subscribe(&topic).unwrap();
        let mut rx2 = broker.subscribe(&topic).unwrap();
        assert_eq!(broker.subscriber_count(&topic), 2);

        assert_eq!(broker.publish(&topic, event("hi")).unwrap(), 2);
        assert_eq!(*rx1.recv().await.unwrap(), ServerEvent::system("hi", None));
        assert_eq!(*rx2.recv().await.unwrap(), ServerEvent::system("hi", None));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broker = Broker::new();
        assert_eq!(broker.publish(&Topic::Rooms, event("hi")).unwrap(), 0);
        assert_eq!(broker.topic_count(), 0);
    }

    #[test]
    fn test_topic_dropped_when_receivers_gone() {
        let broker = Broker::new();
        let topic = Topic::Rooms;

        let rx = broker.subscribe(&topic).unwrap();
        assert_eq!(broker.topic_count(), 1);
        drop(rx);

        assert_eq!(broker.publish(&topic, event("hi")).unwrap(), 0);
        assert_eq!(broker.topic_count(), 0);
    }

    #[test]
    fn test_topics_are_isolated() {
        let broker = Broker::new();
        let mut room = broker.subscribe(&Topic::Room("r1".into())).unwrap();
        let _user = broker.subscribe(&Topic::User("u1".into())).unwrap();

        broker
            .publish(&Topic::User("u1".into()), event("signal"))
            .unwrap();
        assert!(room.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close() {
        let broker = Broker::new();
        let mut rx = broker.subscribe(&Topic::Rooms).unwrap();

        broker.close();
        assert!(broker.is_closed());
        assert!(broker.subscribe(&Topic::Rooms).is_err());
        assert!(matches!(
            broker.publish(&Topic::Rooms, event("late")),
            Err(GatewayError::TransportUnavailable(_))
        ));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
