//! Topic based publish/subscribe.
//!
//! Publishing never waits on subscribers.
//! The subscriber table is snapshotted under a read lock,
//! and each snapshotted subscriber gets the event queued on its own delivery lane.
//! A lane is a small task which moves events from an unbounded queue into the
//! subscriber's (bounded) channel, in the order they were published.
//!
//! Waiting for room in a subscriber's channel therefore only ever stalls that
//! subscriber's own lane. What happens when a lane stalls is decided by the
//! [`DeliveryPolicy`].

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, debug_span, trace, warn, Instrument};
use uuid::Uuid;

/// An event as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<P> {
    /// The topic the event was published under.
    pub topic: Arc<str>,

    /// What was published.
    pub payload: P,
}

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a delivery lane does when its subscriber's channel stays full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryPolicy {
    /// Wait for room for as long as it takes.
    Block,

    /// Give up on the subscriber if there has been no room for this long.
    /// The lane drops its sender, so the subscriber sees its channel close
    /// once it has drained what was already delivered.
    Evict {
        /// Milliseconds to wait for room.
        after_ms: u64,
    },
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::Evict { after_ms: 10_000 }
    }
}

/// Create a channel suitable for subscribing.
///
/// The capacity is the subscriber's own bound.
/// Publishers are never held up by it.
pub fn channel<P>(capacity: usize) -> (mpsc::Sender<Event<P>>, mpsc::Receiver<Event<P>>) {
    mpsc::channel(capacity.max(1))
}

struct Lane<P> {
    id: SubscriberId,
    queue: mpsc::UnboundedSender<Event<P>>,
}

enum Undeliverable {
    Closed,
    Stalled,
}

async fn deliver<P>(
    mut queue: mpsc::UnboundedReceiver<Event<P>>,
    channel: mpsc::Sender<Event<P>>,
    policy: DeliveryPolicy,
) {
    while let Some(event) = queue.recv().await {
        let sent = match policy {
            DeliveryPolicy::Block => channel
                .send(event)
                .await
                .map_err(|_| Undeliverable::Closed),
            DeliveryPolicy::Evict { after_ms } => channel
                .send_timeout(event, Duration::from_millis(after_ms))
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => Undeliverable::Stalled,
                    SendTimeoutError::Closed(_) => Undeliverable::Closed,
                }),
        };

        match sent {
            Ok(()) => trace!("Delivered"),
            Err(Undeliverable::Closed) => {
                debug!("Subscriber dropped its receiver");
                return;
            }
            Err(Undeliverable::Stalled) => {
                warn!(?policy, "Subscriber is not draining its channel, evicting");
                return;
            }
        }
    }

    trace!("Lane closed");
}

/// Fans out published events to the current subscribers of a topic.
pub struct EventBus<P> {
    subscribers: RwLock<HashMap<String, Vec<Arc<Lane<P>>>>>,
    policy: DeliveryPolicy,
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self::new(DeliveryPolicy::default())
    }
}

impl<P> EventBus<P> {
    /// A bus without any subscribers.
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            policy,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Arc<Lane<P>>>>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Arc<Lane<P>>>>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop delivering to the given subscriber.
    ///
    /// Events published before this call are still delivered,
    /// events published after it are not.
    /// Returns false if there was no such subscriber.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) -> bool {
        let mut subscribers = self.write();

        let Some(lanes) = subscribers.get_mut(topic) else {
            return false;
        };

        let before = lanes.len();
        lanes.retain(|lane| lane.id != id);
        let removed = lanes.len() != before;

        if lanes.is_empty() {
            subscribers.remove(topic);
        }

        if removed {
            debug!(%topic, %id, "Unsubscribed");
        }

        removed
    }

    /// How many subscribers the topic has right now.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.read().get(topic).map(Vec::len).unwrap_or_default()
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = self.read().keys().cloned().collect::<Vec<_>>();
        topics.sort();
        topics
    }

    fn prune(&self, topic: &str, dead: &[SubscriberId]) {
        for id in dead {
            if self.unsubscribe(topic, *id) {
                debug!(%topic, %id, "Pruned subscriber whose lane has ended");
            }
        }
    }
}

impl<P> EventBus<P>
where
    P: Clone + Send + 'static,
{
    /// Start delivering events published under `topic` to `channel`.
    ///
    /// Subscribing the same channel twice means getting each event twice.
    pub fn subscribe(&self, topic: &str, channel: mpsc::Sender<Event<P>>) -> SubscriberId {
        let id = SubscriberId::new();
        let (queue, lane_queue) = mpsc::unbounded_channel();

        tokio::spawn(
            deliver(lane_queue, channel, self.policy)
                .instrument(debug_span!("lane", %topic, %id)),
        );

        self.write()
            .entry(topic.to_owned())
            .or_default()
            .push(Arc::new(Lane { id, queue }));

        debug!(%topic, %id, "Subscribed");

        id
    }

    /// Publish `payload` to everyone currently subscribed to `topic`.
    ///
    /// Never blocks on subscribers.
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, topic: &str, payload: P) -> usize {
        let snapshot = match self.read().get(topic) {
            Some(lanes) => lanes.clone(),
            None => {
                trace!(%topic, "No subscribers, dropping");
                return 0;
            }
        };

        let topic_shared: Arc<str> = Arc::from(topic);
        let mut delivered = 0;
        let mut dead = vec![];

        for lane in snapshot {
            let event = Event {
                topic: topic_shared.clone(),
                payload: payload.clone(),
            };

            if lane.queue.send(event).is_ok() {
                delivered += 1;
            } else {
                dead.push(lane.id);
            }
        }

        if !dead.is_empty() {
            self.prune(topic, &dead);
        }

        trace!(%topic, "Queued for {delivered} subscriber(s)");

        delivered
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::{sleep, timeout};

    use super::*;

    const PATIENCE: Duration = Duration::from_secs(2);

    async fn next(rx: &mut mpsc::Receiver<Event<u32>>) -> Option<u32> {
        timeout(PATIENCE, rx.recv())
            .await
            .expect("Should not time out")
            .map(|event| event.payload)
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::<u32>::default();

        for i in 0..1000 {
            assert_eq!(bus.publish("nobody", i), 0);
        }

        assert!(bus.topics().is_empty());
    }

    #[tokio::test]
    async fn subscriber_gets_events_in_order() {
        let bus = EventBus::default();
        let (tx, mut rx) = channel(4);
        bus.subscribe("ttyUSB0", tx);

        for i in 0..100 {
            assert_eq!(bus.publish("ttyUSB0", i), 1);
        }

        for i in 0..100 {
            assert_eq!(next(&mut rx).await, Some(i));
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let (tx, mut rx) = channel(4);
        bus.subscribe("ttyUSB0", tx);

        assert_eq!(bus.publish("ttyUSB1", 1), 0);
        bus.publish("ttyUSB0", 2);

        let event = timeout(PATIENCE, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&*event.topic, "ttyUSB0");
        assert_eq!(event.payload, 2);
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_events() {
        let bus = EventBus::default();
        let (early_tx, mut early_rx) = channel(4);
        bus.subscribe("dev", early_tx);

        bus.publish("dev", 1);

        let (late_tx, mut late_rx) = channel(4);
        bus.subscribe("dev", late_tx);

        bus.publish("dev", 2);

        assert_eq!(next(&mut early_rx).await, Some(1));
        assert_eq!(next(&mut early_rx).await, Some(2));
        assert_eq!(next(&mut late_rx).await, Some(2));
    }

    #[tokio::test]
    async fn nothing_arrives_after_unsubscribing() {
        let bus = EventBus::default();
        let (tx, mut rx) = channel(4);
        let id = bus.subscribe("dev", tx);

        bus.publish("dev", 1);
        bus.publish("dev", 2);
        assert!(bus.unsubscribe("dev", id));
        assert_eq!(bus.publish("dev", 3), 0);

        // Published while subscribed, then the lane winds down.
        assert_eq!(next(&mut rx).await, Some(1));
        assert_eq!(next(&mut rx).await, Some(2));
        assert_eq!(next(&mut rx).await, None);
        assert_eq!(bus.subscriber_count("dev"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_a_no_op() {
        let bus = EventBus::<u32>::default();
        assert!(!bus.unsubscribe("dev", SubscriberId::new()));

        let (tx, _rx) = channel(1);
        bus.subscribe("dev", tx);
        assert!(!bus.unsubscribe("dev", SubscriberId::new()));
        assert_eq!(bus.subscriber_count("dev"), 1);
    }

    #[tokio::test]
    async fn same_channel_twice_means_duplicates() {
        let bus = EventBus::default();
        let (tx, mut rx) = channel(4);
        bus.subscribe("dev", tx.clone());
        bus.subscribe("dev", tx);

        assert_eq!(bus.publish("dev", 7), 2);

        assert_eq!(next(&mut rx).await, Some(7));
        assert_eq!(next(&mut rx).await, Some(7));
    }

    #[tokio::test]
    async fn stuck_subscriber_does_not_hold_up_others() {
        let bus = EventBus::new(DeliveryPolicy::Block);

        let (stuck_tx, _stuck_rx) = channel(1);
        bus.subscribe("dev", stuck_tx);

        let (tx, mut rx) = channel(1);
        bus.subscribe("dev", tx);

        for i in 0..50 {
            assert_eq!(bus.publish("dev", i), 2);
        }

        for i in 0..50 {
            assert_eq!(next(&mut rx).await, Some(i));
        }
    }

    #[tokio::test]
    async fn stalled_subscriber_is_evicted() {
        let bus = EventBus::new(DeliveryPolicy::Evict { after_ms: 20 });
        let (tx, mut rx) = channel(1);
        bus.subscribe("dev", tx);

        bus.publish("dev", 1);
        bus.publish("dev", 2);
        bus.publish("dev", 3);

        sleep(Duration::from_millis(200)).await;

        // The lane gave up; the next publish notices and prunes it.
        assert_eq!(bus.publish("dev", 4), 0);
        assert_eq!(bus.subscriber_count("dev"), 0);

        assert_eq!(next(&mut rx).await, Some(1));
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let bus = EventBus::new(DeliveryPolicy::Block);
        let (tx, rx) = channel(1);
        bus.subscribe("dev", tx);
        drop(rx);

        bus.publish("dev", 1);
        sleep(Duration::from_millis(100)).await;
        bus.publish("dev", 2);

        assert_eq!(bus.subscriber_count("dev"), 0);
    }

    #[tokio::test]
    async fn concurrent_publishers_and_subscribers() {
        let bus = Arc::new(EventBus::default());

        let mut receivers = vec![];
        for _ in 0..8 {
            let (tx, rx) = channel(16);
            bus.subscribe("dev", tx);
            receivers.push(rx);
        }

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    bus.publish("dev", i);
                    tokio::task::yield_now().await;
                }
            })
        };

        let churn = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let (tx, _rx) = channel::<u32>(1);
                    let id = bus.subscribe("dev", tx);
                    tokio::task::yield_now().await;
                    bus.unsubscribe("dev", id);
                }
            })
        };

        for mut rx in receivers {
            for i in 0..200 {
                assert_eq!(next(&mut rx).await, Some(i));
            }
        }

        publisher.await.unwrap();
        churn.await.unwrap();
    }
}
