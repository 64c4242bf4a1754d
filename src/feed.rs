//! In-process consumers of realtime events: the capped notification feed and
//! the latest points balance.

use crate::model::FeedItem;
use crate::realtime::{RealtimeClient, Subscription, EVENT_NOTIFICATION, EVENT_POINTS_UPDATE};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

pub const DEFAULT_FEED_CAPACITY: usize = 10;

/// Most recent notifications, newest first, never longer than `capacity`.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    items: VecDeque<FeedItem>,
    capacity: usize,
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl NotificationFeed {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: FeedItem) {
        self.items.push_front(item);
        self.items.truncate(self.capacity);
    }

    pub fn items(&self) -> Vec<FeedItem> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Payload fields may sit at the top level or under `data`.
fn payload_field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload
        .get(key)
        .or_else(|| payload.get("data").and_then(|d| d.get(key)))
}

/// Build a feed item from a `notification` frame; frames without a message
/// are skipped.
pub fn feed_item_from_payload(payload: &Value) -> Option<FeedItem> {
    let message = payload_field(payload, "message").and_then(Value::as_str)?;
    let timestamp = payload_field(payload, "timestamp")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    let link = payload_field(payload, "link")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(FeedItem {
        message: message.to_string(),
        timestamp,
        link,
    })
}

pub type SharedFeed = Arc<Mutex<NotificationFeed>>;

/// Keep a feed updated from the client's `notification` events.
pub fn attach_feed(client: &RealtimeClient, capacity: usize) -> (SharedFeed, Subscription) {
    let feed: SharedFeed = Arc::new(Mutex::new(NotificationFeed::with_capacity(capacity)));
    let sink = Arc::clone(&feed);
    let sub = client.on(EVENT_NOTIFICATION, move |payload| match feed_item_from_payload(payload) {
        Some(item) => sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(item),
        None => debug!("notification without message ignored"),
    });
    (feed, sub)
}

/// Latest points balance announced over the realtime channel.
#[derive(Debug)]
pub struct PointsTracker {
    balance: watch::Sender<Option<i64>>,
}

impl Default for PointsTracker {
    fn default() -> Self {
        let (balance, _) = watch::channel(None);
        Self { balance }
    }
}

impl PointsTracker {
    pub fn attach(client: &RealtimeClient) -> (Arc<Self>, Subscription) {
        let tracker = Arc::new(Self::default());
        let sink = Arc::clone(&tracker);
        let sub = client.on(EVENT_POINTS_UPDATE, move |payload| sink.apply(payload));
        (tracker, sub)
    }

    pub fn apply(&self, payload: &Value) {
        match payload_field(payload, "points").and_then(Value::as_i64) {
            Some(points) => {
                self.balance.send_replace(Some(points));
            }
            None => debug!("points_update without points ignored"),
        }
    }

    pub fn balance(&self) -> Option<i64> {
        *self.balance.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Option<i64>> {
        self.balance.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(n: usize) -> FeedItem {
        FeedItem {
            message: format!("notification {n}"),
            timestamp: format!("2024-05-01T10:00:{n:02}Z"),
            link: None,
        }
    }

    #[test]
    fn feed_caps_at_ten_newest_first() {
        let mut feed = NotificationFeed::default();
        for n in 1..=11 {
            feed.push(item(n));
            assert!(feed.len() <= 10);
        }
        let items = feed.items();
        assert_eq!(items.len(), 10);
        assert_eq!(items[0].message, "notification 11");
        assert_eq!(items[9].message, "notification 2");
        assert!(items.iter().all(|i| i.message != "notification 1"));
        assert!(items.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn feed_item_reads_top_level_or_data() {
        let top = feed_item_from_payload(&json!({
            "type": "notification",
            "message": "Pickup confirmed",
            "timestamp": "2024-05-01T10:00:00Z",
            "link": "/pickups/4"
        }))
        .unwrap();
        assert_eq!(top.message, "Pickup confirmed");
        assert_eq!(top.link.as_deref(), Some("/pickups/4"));

        let nested = feed_item_from_payload(&json!({
            "type": "notification",
            "data": {"message": "Driver on the way"}
        }))
        .unwrap();
        assert_eq!(nested.message, "Driver on the way");
        assert!(nested.timestamp.ends_with('Z'));
        assert_eq!(nested.link, None);

        assert!(feed_item_from_payload(&json!({"type": "notification"})).is_none());
    }

    #[test]
    fn points_tracker_applies_updates() {
        let tracker = PointsTracker::default();
        assert_eq!(tracker.balance(), None);
        tracker.apply(&json!({"type": "points_update", "points": 120}));
        tracker.apply(&json!({"type": "points_update", "data": {"points": 150}}));
        tracker.apply(&json!({"type": "points_update", "points": "lots"}));
        assert_eq!(tracker.balance(), Some(150));
    }
}
