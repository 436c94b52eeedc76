//! Topic routing for relay connections
//!
//! Each WebSocket connection registers once and gets a bounded outbound queue.
//! Connections subscribe to topics; a published frame is delivered to every other
//! subscriber of its topic as a `message` frame.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use pyramid_core::{Error, RelayFrame, Result, SignalMessage};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub type ConnectionId = String;

struct Connection {
    sender: mpsc::Sender<String>,
    topics: HashSet<String>,
}

/// Live counters exposed on the stats endpoint
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub topics: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// Routes frames between relay connections by topic
#[derive(Clone)]
pub struct TopicHub {
    /// topic -> subscribed connections
    topics: Arc<DashMap<String, HashSet<ConnectionId>>>,
    connections: Arc<DashMap<ConnectionId, Connection>>,
    max_topics: usize,
    outbound_buffer: usize,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl TopicHub {
    pub fn new(max_topics: usize, outbound_buffer: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            max_topics,
            outbound_buffer: outbound_buffer.max(1),
            delivered: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a connection and return its id with the queue of frames to write
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let connection_id = nanoid::nanoid!(12);
        let (sender, receiver) = mpsc::channel(self.outbound_buffer);
        self.connections.insert(
            connection_id.clone(),
            Connection {
                sender,
                topics: HashSet::new(),
            },
        );
        debug!(connection_id = %connection_id, "Relay connection registered");
        (connection_id, receiver)
    }

    pub fn subscribe(&self, connection_id: &str, topic: &str) -> Result<()> {
        {
            let mut connection = self
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;
            if !connection.topics.contains(topic) && connection.topics.len() >= self.max_topics {
                return Err(Error::InvalidState(format!(
                    "subscription limit of {} topics reached",
                    self.max_topics
                )));
            }
            connection.topics.insert(topic.to_string());
        }

        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string());

        debug!(connection_id = %connection_id, topic = %topic, "Subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: &str, topic: &str) {
        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            connection.topics.remove(topic);
        }
        self.remove_subscriber(topic, connection_id);
        debug!(connection_id = %connection_id, topic = %topic, "Unsubscribed");
    }

    /// Deliver `message` to every subscriber of `topic` except the publisher.
    ///
    /// Returns the number of connections the frame was queued for. A subscriber
    /// whose queue is full misses the frame; one whose queue is gone is removed.
    pub fn publish(&self, connection_id: &str, topic: &str, message: SignalMessage) -> usize {
        let subscribers: Vec<ConnectionId> = match self.topics.get(topic) {
            Some(subscribers) => subscribers
                .iter()
                .filter(|id| id.as_str() != connection_id)
                .cloned()
                .collect(),
            None => return 0,
        };
        if subscribers.is_empty() {
            return 0;
        }

        let frame = match (RelayFrame::Message {
            topic: topic.to_string(),
            message,
        })
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode relayed frame");
                return 0;
            }
        };

        let mut sent_count = 0;
        let mut failed_connections = Vec::new();
        let mut stale_subscribers = Vec::new();
        for subscriber in subscribers {
            let Some(connection) = self.connections.get(&subscriber) else {
                stale_subscribers.push(subscriber);
                continue;
            };
            match connection.sender.try_send(frame.clone()) {
                Ok(()) => sent_count += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        connection_id = %subscriber,
                        topic = %topic,
                        "Outbound queue full, dropping frame"
                    );
                }
                Err(TrySendError::Closed(_)) => failed_connections.push(subscriber.clone()),
            }
        }

        for connection_id in failed_connections {
            self.disconnect(&connection_id);
        }
        for connection_id in stale_subscribers {
            debug!(connection_id = %connection_id, topic = %topic, "Removing stale subscriber");
            self.remove_subscriber(topic, &connection_id);
        }

        self.delivered.fetch_add(sent_count as u64, Ordering::Relaxed);
        sent_count
    }

    /// Queue a notice for a single connection
    pub fn notify(&self, connection_id: &str, message: impl Into<String>) -> bool {
        let Some(connection) = self.connections.get(connection_id) else {
            return false;
        };
        let notice = RelayFrame::Notice {
            message: message.into(),
        };
        match notice.encode() {
            Ok(frame) => connection.sender.try_send(frame).is_ok(),
            Err(_) => false,
        }
    }

    /// Drop a connection and all of its subscriptions
    pub fn disconnect(&self, connection_id: &str) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };
        for topic in &connection.topics {
            self.remove_subscriber(topic, connection_id);
        }
        debug!(
            connection_id = %connection_id,
            topics = connection.topics.len(),
            "Relay connection removed"
        );
    }

    fn remove_subscriber(&self, topic: &str, connection_id: &str) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(connection_id);
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connection_count(),
            topics: self.topic_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyramid_core::PeerId;

    fn announce(peer: &str) -> SignalMessage {
        SignalMessage::announce(PeerId::from(peer))
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers_only() {
        let hub = TopicHub::new(8, 16);
        let (a, mut a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        let (c, mut c_rx) = hub.connect();

        hub.subscribe(&a, "app@room").unwrap();
        hub.subscribe(&b, "app@room").unwrap();
        hub.subscribe(&c, "app@other").unwrap();
        assert_eq!(hub.subscriber_count("app@room"), 2);

        assert_eq!(hub.publish(&a, "app@room", announce("a")), 1);

        let frame = RelayFrame::decode(&b_rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            RelayFrame::Message {
                topic: "app@room".to_string(),
                message: announce("a"),
            }
        );
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = TopicHub::new(8, 16);
        let (a, _a_rx) = hub.connect();
        assert_eq!(hub.publish(&a, "nobody@here", announce("a")), 0);
    }

    #[tokio::test]
    async fn test_topic_limit() {
        let hub = TopicHub::new(2, 16);
        let (a, _a_rx) = hub.connect();

        hub.subscribe(&a, "one").unwrap();
        hub.subscribe(&a, "two").unwrap();
        // Re-subscribing to a known topic does not count against the limit
        hub.subscribe(&a, "two").unwrap();
        assert!(matches!(
            hub.subscribe(&a, "three"),
            Err(Error::InvalidState(_))
        ));

        hub.unsubscribe(&a, "one");
        hub.subscribe(&a, "three").unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_unknown_connection() {
        let hub = TopicHub::new(2, 16);
        assert!(matches!(hub.subscribe("ghost", "t"), Err(Error::NotFound(_))));
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let hub = TopicHub::new(8, 16);
        let (a, _a_rx) = hub.connect();
        let (b, _b_rx) = hub.connect();
        hub.subscribe(&a, "t1").unwrap();
        hub.subscribe(&a, "t2").unwrap();
        hub.subscribe(&b, "t2").unwrap();

        hub.disconnect(&a);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.topic_count(), 1);
        assert_eq!(hub.subscriber_count("t2"), 1);

        // Disconnecting twice is a no-op
        hub.disconnect(&a);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_frames() {
        let hub = TopicHub::new(8, 1);
        let (a, _a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        hub.subscribe(&b, "t").unwrap();

        assert_eq!(hub.publish(&a, "t", announce("1")), 1);
        assert_eq!(hub.publish(&a, "t", announce("2")), 0);
        assert_eq!(hub.stats().dropped, 1);
        assert_eq!(hub.stats().delivered, 1);

        let frame = RelayFrame::decode(&b_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.topic(), Some("t"));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_removed() {
        let hub = TopicHub::new(8, 4);
        let (a, _a_rx) = hub.connect();
        let (b, b_rx) = hub.connect();
        hub.subscribe(&b, "t").unwrap();
        drop(b_rx);

        assert_eq!(hub.publish(&a, "t", announce("a")), 0);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_stale_subscriber_is_pruned() {
        let hub = TopicHub::new(8, 4);
        let (a, _a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        hub.subscribe(&b, "t").unwrap();
        // A subscription left behind by a connection that no longer exists
        hub.topics.entry("t".to_string()).or_default().insert("gone".to_string());
        assert_eq!(hub.subscriber_count("t"), 2);

        assert_eq!(hub.publish(&a, "t", announce("a")), 1);
        assert_eq!(hub.subscriber_count("t"), 1);
        assert!(b_rx.recv().await.is_some());

        hub.topics.entry("lonely".to_string()).or_default().insert("gone".to_string());
        assert_eq!(hub.publish(&a, "lonely", announce("a")), 0);
        assert_eq!(hub.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_notify() {
        let hub = TopicHub::new(8, 4);
        let (a, mut a_rx) = hub.connect();
        assert!(hub.notify(&a, "hello"));
        assert!(!hub.notify("ghost", "hello"));

        let frame = RelayFrame::decode(&a_rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            RelayFrame::Notice {
                message: "hello".to_string()
            }
        );
    }
}
