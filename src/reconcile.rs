//! List reconciliation for one active view.
//!
//! The reconciler owns the rendered bookmark list for a single identity and
//! is the only writer to it. State changes arrive from two directions: the
//! seeded server snapshot on view activation, and the owner-scoped change
//! feed afterwards. Local inserts and deletes go to the record store and are
//! NOT applied optimistically; the feed echo of the mutation is the sole
//! source of the state change, so handlers must tolerate redelivery and
//! self-echo (dedupe by id).

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::feed::{ChangeEvent, FeedSubscription};
use crate::store::{Bookmark, BookmarkStore};

static SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^https?://").unwrap());

/// Prefix `https://` when the url carries no http(s) scheme.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if SCHEME_RE.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

struct ViewState {
    items: Vec<Bookmark>,
    /// Ids with an in-flight delete; used to disable the delete control.
    deleting: HashSet<Uuid>,
}

/// One view's reconciler. Handlers take the state lock for the whole
/// read-modify-write, so feed events and user actions never interleave
/// mid-update even though they arrive on different tasks.
pub struct Reconciler {
    owner_id: String,
    store: Arc<dyn BookmarkStore>,
    state: Mutex<ViewState>,
}

impl Reconciler {
    pub fn new(owner_id: &str, store: Arc<dyn BookmarkStore>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            store,
            state: Mutex::new(ViewState { items: Vec::new(), deleting: HashSet::new() }),
        }
    }

    pub fn owner_id(&self) -> &str { &self.owner_id }

    /// Replace the view wholesale from the server-fetched snapshot.
    /// Foreign-owner rows are dropped defensively; a correctly scoped
    /// snapshot never contains any.
    pub fn seed(&self, initial: Vec<Bookmark>) {
        let mut st = self.state.lock();
        st.items = initial.into_iter().filter(|b| b.owner_id == self.owner_id).collect();
        st.deleting.clear();
    }

    /// Fold a feed insert into the view. Redelivered and self-echoed events
    /// are no-ops thanks to the id guard; new entries are prepended, treating
    /// feed inserts as newest rather than re-sorting by timestamp.
    pub fn on_feed_insert(&self, b: Bookmark) {
        if b.owner_id != self.owner_id {
            tracing::warn!(owner = %self.owner_id, foreign = %b.owner_id, "dropping cross-owner feed insert");
            return;
        }
        let mut st = self.state.lock();
        if st.items.iter().any(|existing| existing.id == b.id) {
            return;
        }
        st.items.insert(0, b);
    }

    /// Remove the entry if present; an id already gone (e.g. removed by an
    /// earlier delivery of the same event) is a no-op.
    pub fn on_feed_delete(&self, id: Uuid) {
        let mut st = self.state.lock();
        st.items.retain(|b| b.id != id);
        st.deleting.remove(&id);
    }

    pub fn apply(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Insert(b) => self.on_feed_insert(b),
            ChangeEvent::Delete { id } => self.on_feed_delete(id),
        }
    }

    /// Drive feed events into the view until the subscription ends. Lag
    /// errors are survivable: the view may miss events but stays consistent
    /// with whatever does arrive.
    pub async fn pump(&self, mut sub: FeedSubscription) {
        while let Some(res) = sub.recv().await {
            match res {
                Ok(ev) => self.apply(ev),
                Err(e) => tracing::warn!(owner = %self.owner_id, error = %e, "feed gap"),
            }
        }
    }

    /// Validate and store a new bookmark. The view is NOT updated here; the
    /// feed echo (or a refetch) introduces the entry.
    pub fn local_insert(&self, title: &str, url: &str) -> AppResult<Bookmark> {
        let title = title.trim();
        let url = url.trim();
        if title.is_empty() {
            return Err(AppError::user("empty_title", "bookmark title must not be empty"));
        }
        if url.is_empty() {
            return Err(AppError::user("empty_url", "bookmark url must not be empty"));
        }
        let final_url = normalize_url(url);
        self.store.insert(&self.owner_id, title, &final_url)
    }

    /// Fire-and-forget delete. The entry leaves the view only via the feed
    /// Delete echo; on store failure the deleting mark is cleared, the entry
    /// stays visible and the failure is logged rather than surfaced.
    pub fn local_delete(&self, id: Uuid) {
        {
            let mut st = self.state.lock();
            if !st.deleting.insert(id) {
                // delete already in flight for this id
                return;
            }
        }
        if let Err(e) = self.store.delete(id) {
            tracing::warn!(owner = %self.owner_id, %id, error = %e, "bookmark delete failed");
            self.state.lock().deleting.remove(&id);
        }
    }

    pub fn is_deleting(&self, id: Uuid) -> bool {
        self.state.lock().deleting.contains(&id)
    }

    /// Current render order: newest first, unique by id, owner-pure.
    pub fn snapshot(&self) -> Vec<Bookmark> {
        self.state.lock().items.clone()
    }
}
