//! Topic broker: the many-to-many topic ↔ connection relation.
//!
//! Two indexes are kept in step: topic → subscribers and connection → topics.
//! A topic key exists only while at least one connection holds it.

use std::collections::{HashMap, HashSet};

use relay_core::ConnectionId;

#[derive(Debug, Default)]
pub struct TopicBroker {
    by_topic: HashMap<String, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl TopicBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription.  Returns `false` if it already existed.
    pub fn subscribe(&mut self, id: ConnectionId, topic: &str) -> bool {
        let added = self
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .insert(id);
        self.by_connection
            .entry(id)
            .or_default()
            .insert(topic.to_string());
        added
    }

    /// Removes a subscription from both indexes, pruning empty entries.
    /// Returns `false` if there was nothing to remove.
    pub fn unsubscribe(&mut self, id: ConnectionId, topic: &str) -> bool {
        let removed = match self.by_topic.get_mut(topic) {
            Some(subscribers) => {
                let removed = subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
                removed
            }
            None => false,
        };
        if let Some(topics) = self.by_connection.get_mut(&id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.by_connection.remove(&id);
            }
        }
        removed
    }

    /// Drops every subscription held by `id`.  Returns the topics it held.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Vec<String> {
        let Some(topics) = self.by_connection.remove(&id) else {
            return Vec::new();
        };
        for topic in &topics {
            if let Some(subscribers) = self.by_topic.get_mut(topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        topics.into_iter().collect()
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.by_topic
            .get(topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, id: ConnectionId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .by_connection
            .get(&id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn is_subscribed(&self, id: ConnectionId, topic: &str) -> bool {
        self.by_topic
            .get(topic)
            .is_some_and(|s| s.contains(&id))
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    /// Total (topic, connection) pairs.
    pub fn subscription_count(&self) -> usize {
        self.by_topic.values().map(HashSet::len).sum()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
