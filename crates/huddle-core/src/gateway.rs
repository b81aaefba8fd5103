//! Broadcast gateway.
//!
//! Every event the engine emits leaves through [`Gateway::publish`]. The
//! gateway forwards to a [`Publisher`] supplied by the transport and keeps
//! delivery failures away from the operation that caused them: by the time
//! an event is published the state change has committed.

use huddle_protocol::{ServerEvent, Topic};
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Delivery errors reported by a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The transport could not take the event.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// The capability the engine needs from the transport.
pub trait Publisher: Send + Sync {
    /// Deliver `event` to everyone subscribed to `topic`.
    ///
    /// Returns the number of subscribers reached.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::TransportUnavailable`] if delivery failed.
    fn publish(&self, topic: &Topic, event: Arc<ServerEvent>) -> Result<usize, GatewayError>;
}

/// A publisher that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, _topic: &Topic, _event: Arc<ServerEvent>) -> Result<usize, GatewayError> {
        Ok(0)
    }
}

/// The single choke point for outbound events.
#[derive(Clone)]
pub struct Gateway {
    publisher: Arc<dyn Publisher>,
}

impl Gateway {
    /// Wrap a publisher.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Publish an event, logging and swallowing delivery failures.
    ///
    /// Returns the number of subscribers reached (0 on failure).
    pub fn publish(&self, topic: Topic, event: ServerEvent) -> usize {
        match self.publisher.publish(&topic, Arc::new(event)) {
            Ok(count) => {
                trace!(topic = %topic, recipients = count, "Published event");
                count
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Broadcast failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    impl Publisher for Unreachable {
        fn publish(&self, _: &Topic, _: Arc<ServerEvent>) -> Result<usize, GatewayError> {
            Err(GatewayError::TransportUnavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_failure_is_contained() {
        let gateway = Gateway::new(Arc::new(Unreachable));
        let reached = gateway.publish(Topic::Rooms, ServerEvent::system("hello", None));
        assert_eq!(reached, 0);
    }

    #[test]
    fn test_null_publisher() {
        let gateway = Gateway::new(Arc::new(NullPublisher));
        assert_eq!(
            gateway.publish(Topic::Rooms, ServerEvent::system("hello", None)),
            0
        );
    }
}
