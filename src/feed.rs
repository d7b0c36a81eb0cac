//! Owner-scoped change feed.
//!
//! One broadcast channel per owner id gives the feed its server-side filter:
//! a subscriber only ever receives events for the owner it asked for. Delivery is at-least-once from the consumer's point of view (the
//! reconciler dedupes by id); a slow consumer that falls off the ring buffer
//! sees a `feed_lagged` error rather than silently missing events.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::Bookmark;

/// Mutation notification for one owner's records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert(Bookmark),
    Delete { id: Uuid },
}

const FEED_DEPTH: usize = 256;

#[derive(Clone)]
pub struct ChangeFeed {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>>,
}

impl Default for ChangeFeed {
    fn default() -> Self { Self::new() }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self { channels: Arc::new(RwLock::new(HashMap::new())) }
    }

    fn sender_for(&self, owner_id: &str) -> broadcast::Sender<ChangeEvent> {
        if let Some(tx) = self.channels.read().get(owner_id) {
            return tx.clone();
        }
        let mut map = self.channels.write();
        map.entry(owner_id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_DEPTH).0)
            .clone()
    }

    /// Publish an event to every live subscription for `owner_id`.
    /// No subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, owner_id: &str, event: ChangeEvent) {
        let tx = self.sender_for(owner_id);
        let delivered = tx.send(event).unwrap_or(0);
        tracing::debug!(owner = %owner_id, delivered, "feed publish");
    }

    /// Open a subscription scoped to one owner. The handle must be
    /// unsubscribed (or dropped) on view teardown or identity change;
    /// subscriptions are never reused across identities.
    pub fn subscribe(&self, owner_id: &str) -> FeedSubscription {
        let rx = self.sender_for(owner_id).subscribe();
        FeedSubscription { owner_id: owner_id.to_string(), rx: Some(rx) }
    }

    /// Drop per-owner channels with no live subscriber. Safe to run anytime:
    /// a later subscribe or publish recreates the channel on demand.
    pub fn prune_idle(&self) -> usize {
        let mut map = self.channels.write();
        let before = map.len();
        map.retain(|_, tx| tx.receiver_count() > 0);
        before - map.len()
    }
}

pub struct FeedSubscription {
    owner_id: String,
    rx: Option<broadcast::Receiver<ChangeEvent>>,
}

impl FeedSubscription {
    pub fn owner_id(&self) -> &str { &self.owner_id }

    /// Next event, `None` once unsubscribed or the channel is gone.
    /// A lagged receiver reports the gap once and then resumes from the
    /// oldest retained event.
    pub async fn recv(&mut self) -> Option<AppResult<ChangeEvent>> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(ev) => Some(Ok(ev)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(owner = %self.owner_id, skipped, "feed subscriber lagged");
                Some(Err(AppError::feed("feed_lagged", "subscriber fell behind the change feed")))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Idempotent: the first call releases the underlying receiver, later
    /// calls are no-ops.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            tracing::debug!(owner = %self.owner_id, "feed unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool { self.rx.is_some() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Bookmark;
    use chrono::Utc;

    fn mark(owner: &str) -> Bookmark {
        Bookmark {
            id: Uuid::new_v4(),
            title: "t".into(),
            url: "https://example.com".into(),
            owner_id: owner.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_reach_only_the_scoped_owner() {
        let feed = ChangeFeed::new();
        let mut sub_u1 = feed.subscribe("u1");
        let mut sub_u2 = feed.subscribe("u2");

        let b = mark("u1");
        feed.publish("u1", ChangeEvent::Insert(b.clone()));
        feed.publish("u2", ChangeEvent::Delete { id: b.id });

        match sub_u1.recv().await {
            Some(Ok(ChangeEvent::Insert(got))) => assert_eq!(got.id, b.id),
            other => panic!("u1 expected its insert, got {:?}", other),
        }
        match sub_u2.recv().await {
            Some(Ok(ChangeEvent::Delete { id })) => assert_eq!(id, b.id),
            other => panic!("u2 expected its delete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let feed = ChangeFeed::new();
        let mut sub = feed.subscribe("u1");
        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let feed = ChangeFeed::new();
        feed.publish("nobody", ChangeEvent::Insert(mark("nobody")));
    }

    #[tokio::test]
    async fn prune_drops_only_subscriberless_channels() {
        let feed = ChangeFeed::new();
        let live = feed.subscribe("live");
        let mut gone = feed.subscribe("gone");
        gone.unsubscribe();

        assert_eq!(feed.prune_idle(), 1);
        assert_eq!(feed.prune_idle(), 0);

        // pruned owner comes back transparently
        let mut again = feed.subscribe("gone");
        let b = mark("gone");
        feed.publish("gone", ChangeEvent::Insert(b.clone()));
        match again.recv().await {
            Some(Ok(ChangeEvent::Insert(got))) => assert_eq!(got.id, b.id),
            other => panic!("expected insert after re-subscribe, got {:?}", other),
        }
        drop(live);
    }
}
