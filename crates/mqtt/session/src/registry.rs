//! Subscription registry.
//!
//! Keeps the subscription intent of a session independently of the
//! transport: entries survive disconnects and are re-issued against the
//! broker after every successful (re)connect.
//!
//! Several subscribers may share one topic filter. The broker only sees one
//! subscription per filter, so removing a subscriber only reaches the
//! transport when it was the last one on its filter.
//!
//! Each live entry owns a [`TransportHandle`]. The handle's generation tags
//! the subscribe request in flight; outcomes that come back with an older
//! generation belong to a superseded connection and are dropped.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::config::QoS;

/// Opaque identifier chosen by the caller for one subscribe call.
pub type SubscriberId = String;

/// Transport-side handle of a subscription on the current connection.
#[derive(Debug)]
pub struct TransportHandle {
    generation: u64,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn invalidate(self) {
        self.cancel.cancel();
    }
}

/// One subscriber's intent on one topic filter.
#[derive(Debug)]
pub struct Subscription {
    subscriber_id: SubscriberId,
    topic: String,
    qos: QoS,
    handle: Option<TransportHandle>,
    active: bool,
}

impl Subscription {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Whether the broker acknowledged this subscription on the current
    /// connection.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn handle(&self) -> Option<&TransportHandle> {
        self.handle.as_ref()
    }
}

/// A subscribe that has to be sent to the transport.
#[derive(Debug, Clone)]
pub struct PendingSubscribe {
    pub subscriber_id: SubscriberId,
    pub topic: String,
    pub qos: QoS,
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// Outcome of removing a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Nothing was registered under that subscriber and topic.
    Missing,
    /// Other subscribers still hold the topic filter.
    Remaining(usize),
    /// The topic filter has no subscribers left.
    Last,
}

/// topic filter -> subscriber id -> subscription
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, HashMap<SubscriberId, Subscription>>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. Re-registering the same subscriber on the
    /// same filter replaces the entry and invalidates its old handle.
    /// Returns `true` when an entry was replaced.
    pub fn insert(&mut self, subscriber_id: &str, topic: &str, qos: QoS) -> bool {
        let subscription = Subscription {
            subscriber_id: subscriber_id.to_string(),
            topic: topic.to_string(),
            qos,
            handle: None,
            active: false,
        };
        let previous = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), subscription);

        match previous {
            Some(old) => {
                if let Some(handle) = old.handle {
                    handle.invalidate();
                }
                true
            }
            None => false,
        }
    }

    /// Unregisters a subscriber. Idempotent.
    pub fn remove(&mut self, subscriber_id: &str, topic: &str) -> Removal {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return Removal::Missing;
        };
        let Some(removed) = subscribers.remove(subscriber_id) else {
            return Removal::Missing;
        };
        if let Some(handle) = removed.handle {
            handle.invalidate();
        }

        if subscribers.is_empty() {
            self.topics.remove(topic);
            Removal::Last
        } else {
            Removal::Remaining(subscribers.len())
        }
    }

    /// Gives a subscription a fresh transport handle, invalidating the old
    /// one. Returns the subscribe to issue, or `None` if the entry is gone.
    pub fn attach(&mut self, subscriber_id: &str, topic: &str) -> Option<PendingSubscribe> {
        let generation = self.next_generation + 1;
        let subscription = self.topics.get_mut(topic)?.get_mut(subscriber_id)?;
        self.next_generation = generation;

        if let Some(old) = subscription.handle.take() {
            old.invalidate();
        }
        let cancel = CancellationToken::new();
        subscription.handle = Some(TransportHandle {
            generation,
            cancel: cancel.clone(),
        });
        subscription.active = false;

        Some(PendingSubscribe {
            subscriber_id: subscription.subscriber_id.clone(),
            topic: subscription.topic.clone(),
            qos: subscription.qos,
            generation,
            cancel,
        })
    }

    /// Re-issues every registered subscription exactly once: each prior
    /// handle is invalidated and a fresh one created.
    pub fn replay(&mut self) -> Vec<PendingSubscribe> {
        let keys: Vec<(String, SubscriberId)> = self
            .topics
            .iter()
            .flat_map(|(topic, subscribers)| {
                subscribers
                    .keys()
                    .map(move |id| (topic.clone(), id.clone()))
            })
            .collect();

        keys.into_iter()
            .filter_map(|(topic, id)| self.attach(&id, &topic))
            .collect()
    }

    /// Records the outcome of a subscribe. Returns `false` if the outcome
    /// belongs to a superseded handle and must be ignored.
    pub fn confirm(&mut self, subscriber_id: &str, topic: &str, generation: u64, ok: bool) -> bool {
        let Some(subscription) = self
            .topics
            .get_mut(topic)
            .and_then(|subscribers| subscribers.get_mut(subscriber_id))
        else {
            return false;
        };
        if subscription.handle.as_ref().map(TransportHandle::generation) != Some(generation) {
            return false;
        }

        subscription.active = ok;
        if !ok {
            if let Some(handle) = subscription.handle.take() {
                handle.invalidate();
            }
        }
        true
    }

    /// Drops every transport handle, e.g. when the connection goes away.
    pub fn invalidate_all(&mut self) {
        for subscription in self.topics.values_mut().flat_map(|s| s.values_mut()) {
            if let Some(handle) = subscription.handle.take() {
                handle.invalidate();
            }
            subscription.active = false;
        }
    }

    /// Subscribers that should receive a message published on `topic`.
    pub fn deliveries(&self, topic: &str) -> Vec<(SubscriberId, QoS)> {
        self.topics
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .flat_map(|(_, subscribers)| subscribers.values())
            .filter(|subscription| subscription.handle.is_some())
            .map(|subscription| (subscription.subscriber_id.clone(), subscription.qos))
            .collect()
    }

    pub fn get(&self, subscriber_id: &str, topic: &str) -> Option<&Subscription> {
        self.topics.get(topic)?.get(subscriber_id)
    }

    pub fn contains(&self, subscriber_id: &str, topic: &str) -> bool {
        self.get(subscriber_id, topic).is_some()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashMap::len)
    }

    /// Registered topic filters, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Total number of subscriptions across all filters.
    pub fn len(&self) -> usize {
        self.topics.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// MQTT topic filter matching.
///
/// `+` matches exactly one level, `#` matches the parent level and everything
/// below it and must be last. Filters starting with a wildcard do not match
/// topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    match_levels(&filter_parts, &topic_parts)
}

fn match_levels(filter: &[&str], topic: &[&str]) -> bool {
    let mut filter_idx = 0;
    let mut topic_idx = 0;

    while filter_idx < filter.len() {
        match filter[filter_idx] {
            "#" => return filter_idx == filter.len() - 1,
            "+" => {
                if topic_idx >= topic.len() {
                    return false;
                }
            }
            literal => {
                if topic.get(topic_idx) != Some(&literal) {
                    return false;
                }
            }
        }
        filter_idx += 1;
        topic_idx += 1;
    }

    topic_idx == topic.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_then_unsubscribe_leaves_registry_empty() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("sub-1", "sensors/temp", QoS::AtLeastOnce);
        assert_eq!(registry.remove("sub-1", "sensors/temp"), Removal::Last);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("sub-1", "a/b", QoS::AtMostOnce);
        assert_eq!(registry.remove("sub-1", "a/b"), Removal::Last);
        assert_eq!(registry.remove("sub-1", "a/b"), Removal::Missing);
        assert_eq!(registry.remove("other", "x/y"), Removal::Missing);
    }

    #[test]
    fn test_only_last_subscriber_reports_last() {
        let mut registry = SubscriptionRegistry::new();
        for id in ["a", "b", "c"] {
            registry.insert(id, "home/+/light", QoS::AtMostOnce);
        }
        assert_eq!(registry.subscriber_count("home/+/light"), 3);
        assert_eq!(registry.remove("b", "home/+/light"), Removal::Remaining(2));
        assert_eq!(registry.remove("a", "home/+/light"), Removal::Remaining(1));
        assert_eq!(registry.remove("c", "home/+/light"), Removal::Last);
    }

    #[test]
    fn test_replay_issues_each_subscription_once() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", "t/1", QoS::AtMostOnce);
        registry.insert("b", "t/1", QoS::AtLeastOnce);
        registry.insert("c", "t/2", QoS::ExactlyOnce);

        let first = registry.replay();
        assert_eq!(first.len(), 3);
        let second = registry.replay();
        assert_eq!(second.len(), 3);

        let mut pairs: Vec<(String, String, QoS)> = second
            .iter()
            .map(|p| (p.topic.clone(), p.subscriber_id.clone(), p.qos))
            .collect();
        pairs.sort_by(|x, y| (&x.0, &x.1).cmp(&(&y.0, &y.1)));
        assert_eq!(
            pairs,
            vec![
                ("t/1".into(), "a".into(), QoS::AtMostOnce),
                ("t/1".into(), "b".into(), QoS::AtLeastOnce),
                ("t/2".into(), "c".into(), QoS::ExactlyOnce),
            ]
        );

        for old in &first {
            assert!(old.cancel.is_cancelled());
        }
        for new in &second {
            assert!(!new.cancel.is_cancelled());
        }
    }

    #[test]
    fn test_confirm_rejects_stale_generation() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", "t", QoS::AtMostOnce);
        let stale = registry.attach("a", "t").unwrap();
        let fresh = registry.attach("a", "t").unwrap();

        assert!(!registry.confirm("a", "t", stale.generation, true));
        assert!(registry.confirm("a", "t", fresh.generation, true));
        assert!(registry.get("a", "t").unwrap().is_active());
    }

    #[test]
    fn test_failed_confirm_drops_handle() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", "t", QoS::AtMostOnce);
        let pending = registry.attach("a", "t").unwrap();
        assert!(registry.confirm("a", "t", pending.generation, false));

        let subscription = registry.get("a", "t").unwrap();
        assert!(!subscription.is_active());
        assert!(subscription.handle().is_none());
        assert!(pending.cancel.is_cancelled());
        // the intent is kept for the next reconnect
        assert!(registry.contains("a", "t"));
    }

    #[test]
    fn test_invalidate_all() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", "t/1", QoS::AtMostOnce);
        registry.insert("b", "t/2", QoS::AtMostOnce);
        let pending = registry.replay();
        registry.invalidate_all();

        assert!(pending.iter().all(|p| p.cancel.is_cancelled()));
        assert_eq!(registry.len(), 2);
        assert!(registry.deliveries("t/1").is_empty());
    }

    #[test]
    fn test_reinsert_replaces_and_invalidates() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", "t", QoS::AtMostOnce);
        let pending = registry.attach("a", "t").unwrap();
        assert!(registry.insert("a", "t", QoS::ExactlyOnce));
        assert!(pending.cancel.is_cancelled());
        assert_eq!(registry.get("a", "t").unwrap().qos(), QoS::ExactlyOnce);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deliveries_follow_wildcards() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("exact", "home/kitchen/temp", QoS::AtMostOnce);
        registry.insert("single", "home/+/temp", QoS::AtLeastOnce);
        registry.insert("multi", "home/#", QoS::ExactlyOnce);
        registry.insert("other", "office/#", QoS::AtMostOnce);
        registry.replay();

        let mut ids: Vec<String> = registry
            .deliveries("home/kitchen/temp")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["exact", "multi", "single"]);
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "a/b"));
        assert!(!topic_matches("a/#/c", "a/b/c"));
        assert!(topic_matches("+/+", "/finance"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_topics_sorted() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", "z", QoS::AtMostOnce);
        registry.insert("b", "m", QoS::AtMostOnce);
        assert_eq!(registry.topics(), vec!["m".to_string(), "z".to_string()]);
    }
}
