//! Lock-free subscription registry using `scc::HashMap`.
//!
//! The registry remembers which `(category, id)` pairs the application asked
//! to observe so the connection manager can replay them after a reconnect.
//! Entries are deduplicated and only removed by an explicit unsubscribe.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::envelope::{ControlCommand, ControlMessage};

/// A `(category, id)` pair the application observes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Subscription category.
    pub category: String,
    /// Id of the observed thing.
    pub id: i64,
}

impl Subscription {
    /// Create a new subscription.
    pub fn new(category: impl Into<String>, id: i64) -> Self {
        Self {
            category: category.into(),
            id,
        }
    }

    /// Control message that starts this subscription.
    pub fn subscribe_message(&self) -> ControlMessage {
        self.control(ControlCommand::Subscribe)
    }

    /// Control message that ends this subscription.
    pub fn unsubscribe_message(&self) -> ControlMessage {
        self.control(ControlCommand::Unsubscribe)
    }

    fn control(&self, command: ControlCommand) -> ControlMessage {
        ControlMessage {
            command,
            category: self.category.clone(),
            thing_id: self.id,
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.id)
    }
}

/// Deduplicated set of subscriptions.
///
/// Each entry keeps the sequence number of its first registration so replay
/// happens in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: scc::HashMap<Subscription, u64>,
    sequence: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription.
    ///
    /// Returns `true` if it was not registered before.
    pub fn insert(&self, subscription: Subscription) -> bool {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert_sync(subscription, seq).is_ok()
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if it was registered.
    pub fn remove(&self, subscription: &Subscription) -> bool {
        self.entries.remove_sync(subscription).is_some()
    }

    /// Whether the subscription is registered.
    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.entries
            .update_sync(subscription, |_, _| ())
            .is_some()
    }

    /// All subscriptions in registration order.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut entries = Vec::with_capacity(self.entries.len());
        self.entries.retain_sync(|subscription, seq| {
            entries.push((*seq, subscription.clone()));
            true
        });
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, sub)| sub).collect()
    }

    /// Ids subscribed within one category, in registration order.
    pub fn ids_in(&self, category: &str) -> Vec<i64> {
        self.snapshot()
            .into_iter()
            .filter(|sub| sub.category == category)
            .map(|sub| sub.id)
            .collect()
    }

    /// Get the total number of subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all subscriptions.
    pub fn clear(&self) {
        self.entries.clear_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_deduplicates() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.insert(Subscription::new("dialog", 1)));
        assert!(!registry.insert(Subscription::new("dialog", 1)));
        assert!(registry.insert(Subscription::new("post", 1)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove() {
        let registry = SubscriptionRegistry::new();
        let sub = Subscription::new("dialog", 7);
        registry.insert(sub.clone());

        assert!(registry.remove(&sub));
        assert!(!registry.remove(&sub));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let registry = SubscriptionRegistry::new();
        registry.insert(Subscription::new("b", 2));
        registry.insert(Subscription::new("a", 1));
        registry.insert(Subscription::new("b", 2));
        registry.insert(Subscription::new("c", 3));

        assert_eq!(
            registry.snapshot(),
            vec![
                Subscription::new("b", 2),
                Subscription::new("a", 1),
                Subscription::new("c", 3),
            ]
        );
    }

    #[test]
    fn test_ids_in_category() {
        let registry = SubscriptionRegistry::new();
        registry.insert(Subscription::new("dialog", 3));
        registry.insert(Subscription::new("post", 4));
        registry.insert(Subscription::new("dialog", 5));
        assert_eq!(registry.ids_in("dialog"), vec![3, 5]);
        assert!(registry.ids_in("user").is_empty());
    }

    #[test]
    fn test_control_messages() {
        let sub = Subscription::new("dialog", 9);
        assert_eq!(sub.subscribe_message().command, ControlCommand::Subscribe);
        assert_eq!(sub.unsubscribe_message().thing_id, 9);
        assert_eq!(sub.to_string(), "dialog:9");
    }
}
