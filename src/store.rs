//! Bookmark records and the record store seam.
//!
//! The durable store is an external collaborator as far as the gateway and
//! reconciler are concerned; the trait
//! keeps the reconciler and HTTP handlers independent of the engine behind it.
//! `MemoryStore` is the in-process implementation: every successful mutation
//! is echoed onto the change feed, which is the only path by which a view's
//! state picks up the result of its own writes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::feed::{ChangeEvent, ChangeFeed};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bookmark {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

pub trait BookmarkStore: Send + Sync {
    fn insert(&self, owner_id: &str, title: &str, url: &str) -> AppResult<Bookmark>;
    fn delete(&self, id: Uuid) -> AppResult<()>;
    /// All bookmarks for one owner, newest first.
    fn list_by_owner(&self, owner_id: &str) -> Vec<Bookmark>;
}

pub struct MemoryStore {
    rows: RwLock<HashMap<Uuid, Bookmark>>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new(feed: ChangeFeed) -> Self {
        Self { rows: RwLock::new(HashMap::new()), feed }
    }

    /// Owner of a record, if it exists. Used by the delete handler to refuse
    /// cross-owner deletes before touching the store.
    pub fn owner_of(&self, id: Uuid) -> Option<String> {
        self.rows.read().get(&id).map(|b| b.owner_id.clone())
    }
}

impl BookmarkStore for MemoryStore {
    fn insert(&self, owner_id: &str, title: &str, url: &str) -> AppResult<Bookmark> {
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            title: title.to_string(),
            url: url.to_string(),
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
        };
        self.rows.write().insert(bookmark.id, bookmark.clone());
        // Echo after the row is durable so subscribers never see a phantom
        self.feed.publish(owner_id, ChangeEvent::Insert(bookmark.clone()));
        Ok(bookmark)
    }

    fn delete(&self, id: Uuid) -> AppResult<()> {
        let removed = self.rows.write().remove(&id);
        match removed {
            Some(b) => {
                self.feed.publish(&b.owner_id, ChangeEvent::Delete { id });
                Ok(())
            }
            None => Err(AppError::not_found("bookmark_not_found", "no bookmark with that id")),
        }
    }

    fn list_by_owner(&self, owner_id: &str) -> Vec<Bookmark> {
        let mut out: Vec<Bookmark> = self
            .rows
            .read()
            .values()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_owner_scoped_and_newest_first() {
        let store = MemoryStore::new(ChangeFeed::new());
        let a = store.insert("u1", "first", "https://a.example").unwrap();
        let b = store.insert("u1", "second", "https://b.example").unwrap();
        store.insert("u2", "other", "https://c.example").unwrap();

        let listed = store.list_by_owner("u1");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[test]
    fn delete_missing_row_is_not_found() {
        let store = MemoryStore::new(ChangeFeed::new());
        let err = store.delete(Uuid::new_v4()).expect_err("missing row");
        assert_eq!(err.code_str(), "bookmark_not_found");
    }

    #[tokio::test]
    async fn mutations_echo_onto_the_feed() {
        let feed = ChangeFeed::new();
        let store = MemoryStore::new(feed.clone());
        let mut sub = feed.subscribe("u1");

        let inserted = store.insert("u1", "t", "https://t.example").unwrap();
        match sub.recv().await {
            Some(Ok(ChangeEvent::Insert(b))) => assert_eq!(b.id, inserted.id),
            other => panic!("expected insert echo, got {:?}", other),
        }

        store.delete(inserted.id).unwrap();
        match sub.recv().await {
            Some(Ok(ChangeEvent::Delete { id })) => assert_eq!(id, inserted.id),
            other => panic!("expected delete echo, got {:?}", other),
        }
    }
}
