//! Cross-instance event propagation.
//!
//! A room lives on one instance while some of its members may be
//! connected to another. Every locally emitted event is also published on
//! the room's bus topic, tagged with the originating instance id;
//! subscribers apply foreign events locally and suppress their own
//! (loopback avoidance happens at the applier, see
//! [`Room::apply_remote`](crate::room::Room::apply_remote)).
//!
//! The bus is optional. Without one the server is a plain single-instance
//! deployment. [`LocalBus`] is the in-process implementation used by
//! tests and single-binary multi-hub setups; networked backends implement
//! the same trait out of tree.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::SignalingError;

/// A published room event as it travels between instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Instance id of the publisher; appliers drop their own envelopes.
    pub origin: String,
    /// Client id the event originated from, if any.
    pub sender_id: String,
    /// Event kind label, for routing and observability.
    pub event: String,
    /// Encoded [`ConferenceMessage`](crate::protocol::ConferenceMessage).
    pub payload: Vec<u8>,
    /// Roles the event targets; empty means all members.
    pub roles: Vec<i32>,
}

/// Receiving side of a topic subscription. Dropping it cancels the
/// subscription.
pub struct BusSubscription {
    receiver: flume::Receiver<BusEnvelope>,
}

impl BusSubscription {
    /// Waits for the next envelope. `None` means the bus side closed the
    /// subscription.
    pub async fn recv(&self) -> Option<BusEnvelope> {
        self.receiver.recv_async().await.ok()
    }
}

/// The pub/sub surface the signaling core consumes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a room event. Failures must be surfaced, never panic;
    /// callers log and move on (local consistency does not depend on the
    /// bus).
    async fn publish(&self, room_id: &str, envelope: BusEnvelope) -> Result<(), SignalingError>;

    /// Delivers an envelope to one user, at-most-once, on whichever
    /// instance currently hosts their session.
    async fn publish_direct(
        &self,
        target_user_id: &str,
        envelope: BusEnvelope,
    ) -> Result<(), SignalingError>;

    async fn subscribe(&self, room_id: &str) -> Result<BusSubscription, SignalingError>;

    /// Subscribes to the direct-delivery topic of one user id.
    async fn subscribe_direct(&self, user_id: &str) -> Result<BusSubscription, SignalingError>;

    /// Distributed set primitive, used for cross-instance membership
    /// tracking per room.
    async fn set_add(&self, key: &str, value: &str) -> Result<(), SignalingError>;
    async fn set_remove(&self, key: &str, value: &str) -> Result<(), SignalingError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, SignalingError>;

    async fn close(&self);
}

fn room_topic(room_id: &str) -> String {
    format!("room:{room_id}")
}

fn user_topic(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[derive(Default)]
struct LocalBusState {
    topics: HashMap<String, Vec<flume::Sender<BusEnvelope>>>,
    sets: HashMap<String, BTreeSet<String>>,
    closed: bool,
}

/// In-process [`EventBus`]: topics are fan-out channel lists, the set
/// primitive is a map of btree sets. Shared between hubs via `Arc`.
#[derive(Default)]
pub struct LocalBus {
    state: Mutex<LocalBusState>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, topic: &str, envelope: BusEnvelope) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SignalingError::Bus("bus closed".to_owned()));
        }
        if let Some(senders) = state.topics.get_mut(topic) {
            // Prune subscriptions whose receiving side went away.
            senders.retain(|tx| tx.send(envelope.clone()).is_ok());
            if senders.is_empty() {
                state.topics.remove(topic);
            }
        }
        Ok(())
    }

    fn register(&self, topic: String) -> Result<BusSubscription, SignalingError> {
        let (tx, rx) = flume::unbounded();
        let mut state = self.state.lock();
        if state.closed {
            return Err(SignalingError::Bus("bus closed".to_owned()));
        }
        state.topics.entry(topic).or_default().push(tx);
        Ok(BusSubscription { receiver: rx })
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, room_id: &str, envelope: BusEnvelope) -> Result<(), SignalingError> {
        self.deliver(&room_topic(room_id), envelope)
    }

    async fn publish_direct(
        &self,
        target_user_id: &str,
        envelope: BusEnvelope,
    ) -> Result<(), SignalingError> {
        // At-most-once: no subscriber, no delivery.
        self.deliver(&user_topic(target_user_id), envelope)
    }

    async fn subscribe(&self, room_id: &str) -> Result<BusSubscription, SignalingError> {
        self.register(room_topic(room_id))
    }

    async fn subscribe_direct(&self, user_id: &str) -> Result<BusSubscription, SignalingError> {
        self.register(user_topic(user_id))
    }

    async fn set_add(&self, key: &str, value: &str) -> Result<(), SignalingError> {
        self.state
            .lock()
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(value.to_owned());
        Ok(())
    }

    async fn set_remove(&self, key: &str, value: &str) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(value);
            if set.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, SignalingError> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.topics.clear();
        state.sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(origin: &str) -> BusEnvelope {
        BusEnvelope {
            origin: origin.to_owned(),
            sender_id: "u1".to_owned(),
            event: "chat".to_owned(),
            payload: vec![1, 2, 3],
            roles: Vec::new(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_room_subscribers() {
        let bus = LocalBus::new();
        let sub_a = bus.subscribe("r1").await.unwrap();
        let sub_b = bus.subscribe("r1").await.unwrap();
        let other = bus.subscribe("r2").await.unwrap();

        bus.publish("r1", envelope("i1")).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap().origin, "i1");
        assert_eq!(sub_b.recv().await.unwrap().origin, "i1");
        assert!(other.receiver.try_recv().is_err(), "topic isolation");
    }

    #[tokio::test]
    async fn direct_delivery_is_at_most_once_per_topic() {
        let bus = LocalBus::new();
        // Nobody home: delivery silently drops.
        bus.publish_direct("u9", envelope("i1")).await.unwrap();

        let sub = bus.subscribe_direct("u9").await.unwrap();
        bus.publish_direct("u9", envelope("i1")).await.unwrap();
        assert!(sub.recv().await.is_some());
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("r1").await.unwrap();
        drop(sub);
        bus.publish("r1", envelope("i1")).await.unwrap();
        assert!(bus.state.lock().topics.is_empty());
    }

    #[tokio::test]
    async fn set_primitive() {
        let bus = LocalBus::new();
        bus.set_add("members:r1", "u1").await.unwrap();
        bus.set_add("members:r1", "u2").await.unwrap();
        bus.set_add("members:r1", "u1").await.unwrap();
        assert_eq!(bus.set_members("members:r1").await.unwrap(), ["u1", "u2"]);

        bus.set_remove("members:r1", "u1").await.unwrap();
        assert_eq!(bus.set_members("members:r1").await.unwrap(), ["u2"]);

        bus.set_remove("members:r1", "u2").await.unwrap();
        assert!(bus.set_members("members:r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_bus_refuses_traffic() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("r1").await.unwrap();
        bus.close().await;

        assert!(bus.publish("r1", envelope("i1")).await.is_err());
        assert!(bus.subscribe("r1").await.is_err());
        assert!(sub.recv().await.is_none(), "subscriptions end on close");
    }
}
