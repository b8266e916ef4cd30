//! Topic subscription registry.
//!
//! Owned by the session task. Subscriptions outlive connections: after a
//! reconnect every registered topic is re-subscribed in registration order.
//! Frames of the new connection queue up behind the resume on the session
//! task, so none is routed before the replay has been sent.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use put0_netproto::frame::Frame;
use tracing::{debug, warn};

/// Registry-assigned subscription id, also used as the STOMP `id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl SubscriptionId {
    pub fn parse(raw: &str) -> Option<Self> {
        raw.strip_prefix("sub-")?.parse().ok().map(SubscriptionId)
    }
}

/// Handler for messages on a topic the presentation layer subscribed to.
///
/// Runs on the session task and must not block.
pub trait TopicHandler: Send + Sync {
    fn on_message(&self, topic: &str, frame: &Frame);
}

impl<F> TopicHandler for F
where
    F: Fn(&str, &Frame) + Send + Sync,
{
    fn on_message(&self, topic: &str, frame: &Frame) {
        self(topic, frame)
    }
}

/// Where messages of a subscription go.
#[derive(Clone)]
pub enum TopicRoute {
    /// Server updates for the session reconciler.
    GameUpdates,
    Custom(Arc<dyn TopicHandler>),
}

impl TopicRoute {
    fn same_handler(&self, other: &TopicRoute) -> bool {
        match (self, other) {
            (TopicRoute::GameUpdates, TopicRoute::GameUpdates) => true,
            (TopicRoute::Custom(a), TopicRoute::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for TopicRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicRoute::GameUpdates => f.write_str("GameUpdates"),
            TopicRoute::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub route: TopicRoute,
    /// Subscribed on the current connection.
    pub active: bool,
}

impl Subscription {
    pub fn subscribe_frame(&self) -> Frame {
        Frame::subscribe(&self.id.to_string(), &self.topic)
    }
}

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// New topic; a SUBSCRIBE must be sent if connected.
    Added(SubscriptionId),
    /// Topic already registered; only the handler changed (or nothing did).
    Replaced(SubscriptionId),
}

impl SubscribeOutcome {
    pub fn id(self) -> SubscriptionId {
        match self {
            SubscribeOutcome::Added(id) | SubscribeOutcome::Replaced(id) => id,
        }
    }
}

/// What to do with an inbound MESSAGE frame.
#[derive(Debug)]
pub enum Delivery {
    Deliver(Subscription, Frame),
    /// No active subscription matches.
    Unrouted,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    // Ids grow with registration, so id order is registration order.
    by_id: BTreeMap<SubscriptionId, Subscription>,
    by_topic: HashMap<String, SubscriptionId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `topic`. A second registration of the same topic replaces the
    /// handler and keeps the original id and position.
    pub fn subscribe(&mut self, topic: &str, route: TopicRoute) -> SubscribeOutcome {
        if let Some(&id) = self.by_topic.get(topic) {
            if let Some(existing) = self.by_id.get_mut(&id) {
                if !existing.route.same_handler(&route) {
                    warn!(topic, %id, "Duplicate subscription; replacing handler");
                    existing.route = route;
                }
                return SubscribeOutcome::Replaced(id);
            }
        }

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.by_topic.insert(topic.to_string(), id);
        self.by_id.insert(
            id,
            Subscription {
                id,
                topic: topic.to_string(),
                route,
                active: false,
            },
        );
        debug!(topic, %id, "Subscription registered");
        SubscribeOutcome::Added(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let sub = self.by_id.remove(&id)?;
        self.by_topic.remove(&sub.topic);
        debug!(topic = %sub.topic, %id, "Subscription removed");
        Some(sub)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.by_id.get(&id)
    }

    pub fn id_for(&self, topic: &str) -> Option<SubscriptionId> {
        self.by_topic.get(topic).copied()
    }

    pub fn mark_active(&mut self, id: SubscriptionId) {
        if let Some(sub) = self.by_id.get_mut(&id) {
            sub.active = true;
        }
    }

    /// Topics in registration order.
    pub fn topics(&self) -> Vec<String> {
        self.by_id.values().map(|s| s.topic.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Connection lost: nothing routes until the next [`Self::replay`].
    pub fn suspend(&mut self) {
        for sub in self.by_id.values_mut() {
            sub.active = false;
        }
    }

    /// SUBSCRIBE frames for every registration, in registration order.
    /// Marks all subscriptions active.
    pub fn replay(&mut self) -> Vec<Frame> {
        self.by_id
            .values_mut()
            .map(|sub| {
                sub.active = true;
                sub.subscribe_frame()
            })
            .collect()
    }

    /// Route a MESSAGE frame, by its `subscription` header or else its destination.
    pub fn dispatch(&self, frame: Frame) -> Delivery {
        match self.route(&frame) {
            Some(sub) => Delivery::Deliver(sub.clone(), frame),
            None => Delivery::Unrouted,
        }
    }

    fn route(&self, frame: &Frame) -> Option<&Subscription> {
        let by_header = frame
            .subscription()
            .and_then(SubscriptionId::parse)
            .and_then(|id| self.by_id.get(&id));
        let sub = match by_header {
            Some(sub) => sub,
            None => {
                let id = self.by_topic.get(frame.destination()?)?;
                self.by_id.get(id)?
            }
        };
        sub.active.then_some(sub)
    }
}
