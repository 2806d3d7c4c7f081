//! In-memory view of messages per channel, as shown to the user.
//!
//! Every entry carries a lifecycle tag. Optimistic sends start `Pending`,
//! become `Confirmed` once delivered (or once the stored copy arrives), and
//! `Failed` on a send error. A confirmed entry is never replaced by a
//! pending one.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::services::types::{Message, SendStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Confirmed,
    Failed { error: String },
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    lifecycle: Lifecycle,
}

type ChannelKey = (String, String);

#[derive(Default)]
pub struct MessageCache {
    channels: RwLock<HashMap<ChannelKey, Vec<Entry>>>,
}

fn key(space_id: &str, channel_id: &str) -> ChannelKey {
    (space_id.to_string(), channel_id.to_string())
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show an optimistic copy with `sendStatus = sending`.
    ///
    /// Returns false when a confirmed copy is already present.
    pub async fn insert_pending(&self, message: &Message) -> bool {
        let mut channels = self.channels.write().await;
        let entries = channels
            .entry(key(&message.space_id, &message.channel_id))
            .or_default();
        if let Some(existing) = entries
            .iter()
            .find(|e| e.message.message_id == message.message_id)
        {
            if existing.lifecycle == Lifecycle::Confirmed {
                log::debug!("Skipping stale pending copy of {}", message.message_id);
                return false;
            }
        }
        let mut shown = message.clone();
        shown.send_status = Some(SendStatus::Sending);
        shown.send_error = None;
        upsert(entries, shown, Lifecycle::Pending);
        true
    }

    /// Insert or replace with a delivered copy.
    pub async fn upsert_confirmed(&self, message: &Message) {
        let mut channels = self.channels.write().await;
        let entries = channels
            .entry(key(&message.space_id, &message.channel_id))
            .or_default();
        upsert(entries, message.without_ephemeral(), Lifecycle::Confirmed);
    }

    pub async fn mark_sent(&self, space_id: &str, channel_id: &str, message_id: &str) {
        self.transition(space_id, channel_id, message_id, |entry| {
            if entry.lifecycle == Lifecycle::Confirmed {
                return;
            }
            entry.lifecycle = Lifecycle::Confirmed;
            entry.message.send_status = None;
            entry.message.send_error = None;
        })
        .await;
    }

    pub async fn mark_failed(&self, space_id: &str, channel_id: &str, message_id: &str, error: &str) {
        self.transition(space_id, channel_id, message_id, |entry| {
            if entry.lifecycle != Lifecycle::Pending {
                return;
            }
            entry.lifecycle = Lifecycle::Failed {
                error: error.to_string(),
            };
            entry.message.send_status = Some(SendStatus::Failed);
            entry.message.send_error = Some(error.to_string());
        })
        .await;
    }

    /// Failed back to pending, for a user-initiated retry.
    pub async fn mark_sending(&self, space_id: &str, channel_id: &str, message_id: &str) -> bool {
        let mut moved = false;
        self.transition(space_id, channel_id, message_id, |entry| {
            if matches!(entry.lifecycle, Lifecycle::Failed { .. }) {
                entry.lifecycle = Lifecycle::Pending;
                entry.message.send_status = Some(SendStatus::Sending);
                entry.message.send_error = None;
                moved = true;
            }
        })
        .await;
        moved
    }

    /// Mutate a cached message in place. Returns false if it is not cached.
    pub async fn update(
        &self,
        space_id: &str,
        channel_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut Message) + Send,
    ) -> bool {
        let mut found = false;
        self.transition(space_id, channel_id, message_id, |entry| {
            f(&mut entry.message);
            found = true;
        })
        .await;
        found
    }

    pub async fn remove(&self, space_id: &str, channel_id: &str, message_id: &str) {
        if let Some(entries) = self.channels.write().await.get_mut(&key(space_id, channel_id)) {
            entries.retain(|e| e.message.message_id != message_id);
        }
    }

    pub async fn clear_space(&self, space_id: &str) {
        self.channels.write().await.retain(|(s, _), _| s != space_id);
    }

    pub async fn get(&self, space_id: &str, channel_id: &str, message_id: &str) -> Option<Message> {
        self.find(space_id, channel_id, message_id)
            .await
            .map(|e| e.message)
    }

    pub async fn lifecycle(&self, space_id: &str, channel_id: &str, message_id: &str) -> Option<Lifecycle> {
        self.find(space_id, channel_id, message_id)
            .await
            .map(|e| e.lifecycle)
    }

    /// Channel contents in display order: by creation time, with in-flight
    /// sends after everything delivered.
    pub async fn messages(&self, space_id: &str, channel_id: &str) -> Vec<Message> {
        let channels = self.channels.read().await;
        let mut entries: Vec<Entry> = channels
            .get(&key(space_id, channel_id))
            .cloned()
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            let a_pending = a.lifecycle == Lifecycle::Pending;
            let b_pending = b.lifecycle == Lifecycle::Pending;
            a_pending
                .cmp(&b_pending)
                .then(a.message.created_date.cmp(&b.message.created_date))
        });
        entries.into_iter().map(|e| e.message).collect()
    }

    async fn find(&self, space_id: &str, channel_id: &str, message_id: &str) -> Option<Entry> {
        self.channels
            .read()
            .await
            .get(&key(space_id, channel_id))
            .and_then(|entries| entries.iter().find(|e| e.message.message_id == message_id))
            .cloned()
    }

    async fn transition(
        &self,
        space_id: &str,
        channel_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut Entry) + Send,
    ) {
        let mut channels = self.channels.write().await;
        if let Some(entry) = channels
            .get_mut(&key(space_id, channel_id))
            .and_then(|entries| entries.iter_mut().find(|e| e.message.message_id == message_id))
        {
            f(entry);
        }
    }
}

fn upsert(entries: &mut Vec<Entry>, message: Message, lifecycle: Lifecycle) {
    entries.retain(|e| e.message.message_id != message.message_id);
    entries.push(Entry { message, lifecycle });
}
