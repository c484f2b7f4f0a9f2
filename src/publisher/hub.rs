//! Subscription hub.
//!
//! Holds subscription_id -> {send queue, filter}. Broadcast snapshots the
//! subscription set under a short lock and sends outside it; the lock is
//! never held during a send. A failed send marks the subscriber for eviction
//! in a post-iteration pass, so one dead consumer cannot stall the fan-out.

use crate::models::DecisionBroadcast;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Conjunction over up to three fields; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    pub model: Option<String>,
    pub symbol: Option<String>,
    pub event_type: Option<String>,
}

impl SubscriptionFilter {
    /// Build from a client-supplied filters object; unknown keys are dropped.
    pub fn from_json(filters: &Value) -> Self {
        let get = |k: &str| {
            filters
                .get(k)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        Self {
            model: get("model"),
            symbol: get("symbol"),
            event_type: get("event_type"),
        }
    }

    pub fn matches(&self, decision: &DecisionBroadcast) -> bool {
        if let Some(model) = &self.model {
            if *model != decision.model {
                return false;
            }
        }
        if let Some(symbol) = &self.symbol {
            if *symbol != decision.symbol {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if *event_type != decision.event_type {
                return false;
            }
        }
        true
    }
}

struct Subscription {
    sender: mpsc::Sender<String>,
    /// None after an explicit unsubscribe: connected but receiving nothing.
    filter: Option<SubscriptionFilter>,
}

pub struct SubscriptionHub {
    subs: Mutex<HashMap<String, Subscription>>,
    max_connections: usize,
}

impl SubscriptionHub {
    pub fn new(max_connections: usize) -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    /// Register a connection. A fresh subscription matches everything until
    /// the client narrows it. Returns None when the connection cap is hit.
    pub fn register(&self, sender: mpsc::Sender<String>) -> Option<String> {
        let mut subs = self.subs.lock();
        if subs.len() >= self.max_connections {
            return None;
        }
        let id = Uuid::new_v4().to_string();
        subs.insert(
            id.clone(),
            Subscription {
                sender,
                filter: Some(SubscriptionFilter::default()),
            },
        );
        drop(subs);
        metrics::gauge!("lens_ws_connections", self.count() as f64);
        info!(subscription_id = %id, "Subscriber connected");
        Some(id)
    }

    pub fn subscribe(&self, id: &str, filter: SubscriptionFilter) {
        let mut subs = self.subs.lock();
        if let Some(sub) = subs.get_mut(id) {
            sub.filter = Some(filter);
        }
    }

    pub fn unsubscribe(&self, id: &str) {
        let mut subs = self.subs.lock();
        if let Some(sub) = subs.get_mut(id) {
            sub.filter = None;
        }
    }

    pub fn remove(&self, id: &str) {
        self.subs.lock().remove(id);
        metrics::gauge!("lens_ws_connections", self.count() as f64);
        debug!(subscription_id = %id, "Subscriber removed");
    }

    pub fn count(&self) -> usize {
        self.subs.lock().len()
    }

    /// Broadcast a decision to every matching subscriber. Returns the number
    /// of subscribers the message was queued for.
    pub fn broadcast(&self, decision: &DecisionBroadcast) -> usize {
        let message = decision.to_message();

        // Snapshot under the lock, send outside it.
        let snapshot: Vec<(String, mpsc::Sender<String>)> = {
            let subs = self.subs.lock();
            subs.iter()
                .filter(|(_, sub)| {
                    sub.filter
                        .as_ref()
                        .map(|f| f.matches(decision))
                        .unwrap_or(false)
                })
                .map(|(id, sub)| (id.clone(), sub.sender.clone()))
                .collect()
        };

        let mut sent = 0usize;
        let mut dead: Vec<String> = Vec::new();
        for (id, sender) in snapshot {
            // A full queue means the consumer is not draining; treat it the
            // same as a closed connection rather than blocking the fan-out.
            match sender.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(_) => {
                    warn!(subscription_id = %id, "Send failed, evicting subscriber");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.remove(&id);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn decision(model: &str, symbol: &str, event_type: &str) -> DecisionBroadcast {
        DecisionBroadcast {
            event_id: "e1".into(),
            symbol: symbol.into(),
            event_type: event_type.into(),
            model: model.into(),
            decision: json!({ "decision": "HOLD" }),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SubscriptionFilter::default();
        assert!(filter.matches(&decision("chatgpt", "BTC", "OPEN_SIGNAL")));
    }

    #[test]
    fn filter_is_a_conjunction() {
        let filter = SubscriptionFilter {
            model: Some("chatgpt".into()),
            symbol: Some("BTC".into()),
            event_type: None,
        };
        assert!(filter.matches(&decision("chatgpt", "BTC", "OPEN_SIGNAL")));
        assert!(!filter.matches(&decision("gemini", "BTC", "OPEN_SIGNAL")));
        assert!(!filter.matches(&decision("chatgpt", "ETH", "OPEN_SIGNAL")));
    }

    #[test]
    fn unknown_filter_keys_dropped() {
        let filter = SubscriptionFilter::from_json(&json!({
            "model": "chatgpt",
            "wallet": "0xabc",
        }));
        assert_eq!(filter.model.as_deref(), Some("chatgpt"));
        assert_eq!(filter.symbol, None);
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_subscribers_only() {
        let hub = SubscriptionHub::new(10);
        let (tx_all, mut rx_all) = mpsc::channel(8);
        let (tx_eth, mut rx_eth) = mpsc::channel(8);
        let all = hub.register(tx_all).unwrap();
        let eth = hub.register(tx_eth).unwrap();
        hub.subscribe(
            &eth,
            SubscriptionFilter {
                symbol: Some("ETH".into()),
                ..Default::default()
            },
        );

        let sent = hub.broadcast(&decision("chatgpt", "BTC", "OPEN_SIGNAL"));
        assert_eq!(sent, 1);
        assert!(rx_all.try_recv().is_ok());
        assert!(rx_eth.try_recv().is_err());
        let _ = all;
    }

    #[tokio::test]
    async fn unsubscribed_connection_receives_nothing() {
        let hub = SubscriptionHub::new(10);
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.register(tx).unwrap();
        hub.unsubscribe(&id);
        assert_eq!(hub.broadcast(&decision("chatgpt", "BTC", "OPEN_SIGNAL")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_is_evicted_not_blocking() {
        let hub = SubscriptionHub::new(10);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        hub.register(tx).unwrap();
        assert_eq!(hub.count(), 1);
        assert_eq!(hub.broadcast(&decision("chatgpt", "BTC", "OPEN_SIGNAL")), 0);
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn connection_cap_rejects_registration() {
        let hub = SubscriptionHub::new(1);
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        assert!(hub.register(tx1).is_some());
        assert!(hub.register(tx2).is_none());
    }
}
