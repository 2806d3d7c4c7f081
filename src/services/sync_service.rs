//! Space history sync between members.
//!
//! A member that comes online broadcasts a `sync-request` with its counts.
//! Peers holding more answer with `sync-info`; after the candidate window
//! settles the requester picks the richest candidate and sends it a
//! `sync-initiate`, which is answered with the peer map, the member list and
//! the messages outside the requester's known range, chunked so no frame
//! exceeds the hub's size limit.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::provider::{Keypair, SpaceSession};
use crate::crypto::ratchet_state::conversation_id;
use crate::error::{QuorumError, Result};
use crate::services::config::SyncSettings;
use crate::services::hub::{keypair, HubRelay};
use crate::services::message_store::MessageStore;
use crate::services::space_control::{ControlMessage, PeerMap, SyncInfo, SyncInitiate, SyncRequest};
use crate::services::space_sessions::{SpaceSessions, SyncCandidate};
use crate::services::types::{key_ids, Content, Message, SpaceMember};

/// Split `items` into runs whose serialized size stays under `limit` bytes.
/// An item larger than the limit travels alone.
pub fn chunk_by_size<T: Serialize>(items: Vec<T>, limit: usize) -> Result<Vec<Vec<T>>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut size = 0usize;
    for item in items {
        let len = serde_json::to_string(&item)?.len();
        if !current.is_empty() && size + len >= limit {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Best peer to sync from: the one holding the most messages, provided it
/// holds more than we do. Earlier answers win ties.
pub fn select_candidate(candidates: &[SyncCandidate], own_message_count: usize) -> Option<&SyncCandidate> {
    let mut best: Option<&SyncCandidate> = None;
    for c in candidates.iter().filter(|c| c.message_count > own_message_count) {
        if best.map_or(true, |b| c.message_count > b.message_count) {
            best = Some(c);
        }
    }
    best
}

/// Addresses whose most recent membership event is a kick.
pub fn kicked_addresses(messages: &[Message]) -> Vec<String> {
    let mut events: Vec<&Message> = messages
        .iter()
        .filter(|m| matches!(m.content, Content::Kick(_) | Content::Join(_)))
        .collect();
    events.sort_by_key(|m| m.created_date);

    let mut last: HashMap<&str, bool> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for m in events {
        let addr = m.content.sender_id();
        if addr.is_empty() {
            continue;
        }
        if !last.contains_key(addr) {
            order.push(addr);
        }
        last.insert(addr, matches!(m.content, Content::Kick(_)));
    }
    order
        .into_iter()
        .filter(|a| last.get(a).copied().unwrap_or(false))
        .map(str::to_string)
        .collect()
}

struct Counts {
    members: Vec<SpaceMember>,
    messages: Vec<Message>,
}

pub struct SyncService {
    store: Arc<dyn MessageStore>,
    hub: Arc<HubRelay>,
    sessions: Arc<SpaceSessions>,
    settings: SyncSettings,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        hub: Arc<HubRelay>,
        sessions: Arc<SpaceSessions>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            hub,
            sessions,
            settings,
        }
    }

    async fn snapshot(&self, space_id: &str) -> Result<Counts> {
        let members = self.store.get_space_members(space_id).await?;
        let mut messages = self.store.get_space_messages(space_id).await?;
        messages.sort_by_key(|m| m.created_date);
        Ok(Counts { members, messages })
    }

    async fn config_keypair(&self, space_id: &str) -> Result<Option<Keypair>> {
        match self.store.get_space_key(space_id, key_ids::CONFIG).await? {
            Some(key) => Ok(Some(keypair(&key)?)),
            None => Ok(None),
        }
    }

    async fn send_directed(
        &self,
        space_id: &str,
        target: &str,
        signer: &Keypair,
        control: &ControlMessage,
    ) -> Result<()> {
        let body = serde_json::to_string(&serde_json::json!({
            "type": "control",
            "message": control,
        }))?;
        let config = self.config_keypair(space_id).await?;
        self.hub
            .send_sync(space_id, target, signer, &body, config.as_ref())
            .await
    }

    // ── Requesting ─────────────────────────────────────────────

    /// Ask the space who has more history, then pick a source once the
    /// request expires or the answers settle.
    pub async fn request_sync(self: &Arc<Self>, space_id: &str) -> Result<()> {
        let inbox = self.hub.space_key(space_id, key_ids::INBOX).await?;
        let inbox_address = inbox
            .address
            .clone()
            .ok_or_else(|| QuorumError::Sync(format!("space {} has no inbox address", space_id)))?;
        let counts = self.snapshot(space_id).await?;
        let expiry = Utc::now().timestamp_millis() + self.settings.request_expiry_ms;

        let request = ControlMessage::SyncRequest(SyncRequest {
            inbox_address,
            expiry,
            member_count: counts.members.len(),
            message_count: counts.messages.len(),
        });
        self.hub.send_control(space_id, &request).await?;

        self.sessions.open_window(space_id, expiry).await;
        let delay = Duration::from_millis(self.settings.request_expiry_ms.max(0) as u64);
        self.schedule_initiate(space_id, delay).await;
        log::info!(
            "Requested sync for space {} ({} messages held)",
            space_id,
            counts.messages.len()
        );
        Ok(())
    }

    async fn schedule_initiate(self: &Arc<Self>, space_id: &str, delay: Duration) {
        let this = Arc::clone(self);
        let space = space_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.initiate_sync(&space).await {
                log::warn!("Sync initiation for space {} failed: {}", space, e);
            }
        });
        self.sessions.set_timer(space_id, timer).await;
    }

    /// Record a `sync-info` answer. Each accepted answer restarts the settle
    /// timer. Incomplete answers and answers outside a window are dropped.
    pub async fn handle_sync_info(self: &Arc<Self>, space_id: &str, info: &SyncInfo, now: i64) -> bool {
        let (Some(inbox_address), Some(message_count), Some(member_count)) =
            (info.inbox_address.clone(), info.message_count, info.member_count)
        else {
            return false;
        };
        if inbox_address.is_empty() || message_count == 0 || member_count == 0 {
            return false;
        }
        let candidate = SyncCandidate {
            inbox_address,
            message_count,
            member_count,
        };
        if !self.sessions.push_candidate(space_id, candidate, now).await {
            return false;
        }
        self.schedule_initiate(space_id, Duration::from_millis(self.settings.candidate_settle_ms))
            .await;
        true
    }

    /// Ask the best candidate to stream what we are missing. Returns the
    /// chosen inbox, or `None` when nobody has more than we do.
    pub async fn initiate_sync(&self, space_id: &str) -> Result<Option<String>> {
        let candidates = self.sessions.take_candidates(space_id).await;
        if candidates.is_empty() {
            log::debug!("No sync candidates for space {}", space_id);
            return Ok(None);
        }
        let counts = self.snapshot(space_id).await?;
        let Some(best) = select_candidate(&candidates, counts.messages.len()) else {
            log::debug!("No candidate holds more than our {} messages", counts.messages.len());
            return Ok(None);
        };

        let inbox = self.hub.space_key(space_id, key_ids::INBOX).await?;
        let initiate = ControlMessage::SyncInitiate(SyncInitiate {
            inbox_address: inbox.address.clone(),
            member_count: counts.members.len(),
            message_count: counts.messages.len(),
            latest_message_timestamp: counts.messages.last().map_or(-1, |m| m.created_date),
            oldest_message_timestamp: counts.messages.first().map_or(-1, |m| m.created_date),
        });
        self.send_directed(space_id, &best.inbox_address, &keypair(&inbox)?, &initiate)
            .await?;
        log::info!(
            "Syncing space {} from {} ({} messages)",
            space_id,
            best.inbox_address,
            best.message_count
        );
        Ok(Some(best.inbox_address.clone()))
    }

    // ── Answering ──────────────────────────────────────────────

    /// Answer a `sync-request` with `sync-info` when we hold more members or
    /// more messages than the requester. Returns whether we answered.
    pub async fn inform_sync_data(&self, space_id: &str, request: &SyncRequest) -> Result<bool> {
        let Some(inbox) = self.store.get_space_key(space_id, key_ids::INBOX).await? else {
            return Ok(false);
        };
        if inbox.address.as_deref() == Some(request.inbox_address.as_str()) {
            return Ok(false);
        }
        let counts = self.snapshot(space_id).await?;
        if request.message_count >= counts.messages.len() && request.member_count >= counts.members.len() {
            return Ok(false);
        }

        let info = ControlMessage::SyncInfo(SyncInfo {
            inbox_address: inbox.address.clone(),
            message_count: Some(counts.messages.len()),
            member_count: Some(counts.members.len()),
        });
        self.send_directed(space_id, &request.inbox_address, &keypair(&inbox)?, &info)
            .await?;
        Ok(true)
    }

    /// Stream peer map, members and the messages outside the requester's
    /// known range, signed with our space inbox key.
    pub async fn direct_sync(&self, space_id: &str, request: &SyncInitiate) -> Result<()> {
        let target = request
            .inbox_address
            .clone()
            .ok_or_else(|| QuorumError::Sync("sync-initiate without inbox address".into()))?;
        let signer = self.hub.space_keypair(space_id, key_ids::INBOX).await?;
        self.stream_space(space_id, &target, &signer, Some(request)).await
    }

    /// Owner-side full sync to a freshly joined inbox.
    pub async fn synchronize_all(&self, space_id: &str, inbox_address: &str) -> Result<()> {
        let Some(owner) = self.store.get_space_key(space_id, key_ids::OWNER).await? else {
            log::debug!("Not an owner of space {}, skipping full sync", space_id);
            return Ok(());
        };
        self.stream_space(space_id, inbox_address, &keypair(&owner)?, None)
            .await
    }

    async fn stream_space(
        &self,
        space_id: &str,
        target: &str,
        signer: &Keypair,
        known: Option<&SyncInitiate>,
    ) -> Result<()> {
        let state = self
            .store
            .get_latest_state(&conversation_id(space_id))
            .await?
            .ok_or_else(|| QuorumError::Sync(format!("no ratchet state for space {}", space_id)))?;
        let ratchet = SpaceSession::parse(&state.state)?.ratchet()?;
        let peer_map = ControlMessage::SyncPeerMap {
            peer_map: PeerMap::of(&ratchet),
        };
        self.send_directed(space_id, target, signer, &peer_map).await?;

        let counts = self.snapshot(space_id).await?;
        let limit = self.settings.chunk_size_bytes;

        let member_chunks = chunk_by_size(counts.members, limit)?;
        for members in member_chunks {
            self.send_directed(space_id, target, signer, &ControlMessage::SyncMembers { members })
                .await?;
        }

        let missing: Vec<Message> = counts
            .messages
            .into_iter()
            .filter(|m| known.map_or(true, |k| !k.covers(m.created_date)))
            .collect();
        let sent = missing.len();
        for messages in chunk_by_size(missing, limit)? {
            self.send_directed(space_id, target, signer, &ControlMessage::SyncMessages { messages })
                .await?;
        }
        log::info!("Streamed {} messages of space {} to {}", sent, space_id, target);
        Ok(())
    }

    /// Tell every member, under the owner key, which addresses were last
    /// kicked so peers that missed a kick drop them too.
    pub async fn send_verify_kicked_statuses(&self, space_id: &str) -> Result<usize> {
        let messages = self.store.get_space_messages(space_id).await?;
        let addresses = kicked_addresses(&messages);
        if addresses.is_empty() {
            return Ok(0);
        }
        let owner = self
            .hub
            .space_keypair(space_id, key_ids::OWNER)
            .await
            .map_err(|_| QuorumError::PermissionDenied("only a space owner can confirm kicks".into()))?;
        let own_inbox = self.hub.space_key(space_id, key_ids::INBOX).await?.address;
        let count = addresses.len();
        let control = ControlMessage::VerifyKicked { addresses };
        for member in self.store.get_space_members(space_id).await? {
            if member.inbox_address.is_empty() || Some(&member.inbox_address) == own_inbox.as_ref() {
                continue;
            }
            self.send_directed(space_id, &member.inbox_address, &owner, &control)
                .await?;
        }
        Ok(count)
    }
}
