//! Typed views over persisted ratchet session blobs.
//!
//! A conversation's `EncryptionState.state` is a JSON string holding either
//! a direct (double-ratchet) session with its inbox keys, or a space
//! session wrapping the serialized triple-ratchet state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::provider::{DirectSessionState, SpaceSession};
use crate::error::{QuorumError, Result};

/// One stored session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionState {
    pub state: String,
    pub timestamp: i64,
    pub inbox_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_accept: Option<bool>,
}

impl EncryptionState {
    pub fn session(&self) -> Result<SessionState> {
        serde_json::from_str(&self.state)
            .map_err(|e| QuorumError::Crypto(format!("parse session state: {}", e)))
    }

    /// Conversation ids are `{address}/{address}`; the prefix is the space or peer.
    pub fn owner_id(&self) -> &str {
        self.conversation_id
            .split('/')
            .next()
            .unwrap_or(&self.conversation_id)
    }
}

pub fn conversation_id(address: &str) -> String {
    format!("{}/{}", address, address)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionState {
    Direct(DirectSessionState),
    Space(SpaceSession),
}

impl SessionState {
    pub fn tag(&self) -> Option<&str> {
        match self {
            SessionState::Direct(d) => Some(&d.tag),
            SessionState::Space(_) => None,
        }
    }
}

/// Public material for one ratchet peer slot (base64 fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: String,
    #[serde(default)]
    pub identity_public_key: String,
    #[serde(default)]
    pub signed_pre_public_key: String,
}

/// Triple-ratchet state. Only the fields the orchestrator rewrites are
/// typed; everything else round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripleRatchet {
    /// Keyed by the decimal peer id.
    #[serde(default)]
    pub id_peer_map: BTreeMap<String, PeerEntry>,
    #[serde(default)]
    pub peer_id_map: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_key: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dkg_ratchet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_dkg_ratchet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_private_key: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TripleRatchet {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| QuorumError::Crypto(format!("parse triple ratchet: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn dkg(&self) -> Result<DkgRatchet> {
        let raw = self
            .dkg_ratchet
            .as_deref()
            .ok_or_else(|| QuorumError::Crypto("template has no dkg ratchet".into()))?;
        serde_json::from_str(raw)
            .map_err(|e| QuorumError::Crypto(format!("parse dkg ratchet: {}", e)))
    }

    /// Install `dkg` as both the current and next DKG ratchet.
    pub fn set_dkg(&mut self, dkg: &DkgRatchet) -> Result<()> {
        let raw = serde_json::to_string(dkg)?;
        self.dkg_ratchet = Some(raw.clone());
        self.next_dkg_ratchet = Some(raw);
        Ok(())
    }

    /// Register a peer in both directions of the peer map.
    pub fn insert_peer(&mut self, id: u64, entry: PeerEntry) {
        self.peer_id_map.insert(entry.public_key.clone(), id);
        self.id_peer_map.insert(id.to_string(), entry);
    }

    pub fn peer(&self, id: u64) -> Option<&PeerEntry> {
        self.id_peer_map.get(&id.to_string())
    }
}

/// The per-peer DKG slot embedded in a ratchet template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DkgRatchet {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub scalar: String,
    #[serde(default)]
    pub point: serde_json::Value,
    #[serde(default)]
    pub random_commitment_point: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SpaceSession {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| QuorumError::Crypto(format!("parse space session: {}", e)))
    }

    pub fn ratchet(&self) -> Result<TripleRatchet> {
        TripleRatchet::parse(&self.state)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Serializes read → ratchet → write sequences per conversation.
///
/// Two concurrent operations against one ratchet would fork it, so every
/// caller that touches a session holds the guard for its conversation id.
#[derive(Default)]
pub struct ConversationLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
