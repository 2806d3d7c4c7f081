//! Local persistent store.
//!
//! [`MessageStore`] is the collaborator every service reads and writes
//! through. [`MemoryStore`] keeps everything in memory; [`FileStore`] adds a
//! JSON snapshot on disk with secret material (space keys and ratchet
//! states) sealed by the [`KeyStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::types::{Conversation, Message, MuteRecord, Space, SpaceKey, SpaceMember, UserConfig};
use crate::crypto::key_store::KeyStore;
use crate::crypto::ratchet_state::EncryptionState;
use crate::error::{QuorumError, Result};

#[async_trait]
pub trait MessageStore: Send + Sync {
    // ── Encryption states ──────────────────────────────────────

    async fn get_encryption_states(&self, conversation_id: &str) -> Result<Vec<EncryptionState>>;
    async fn get_encryption_state(
        &self,
        conversation_id: &str,
        inbox_id: &str,
    ) -> Result<Option<EncryptionState>>;
    /// Session whose `inbox_id` is the given inbox address.
    async fn find_state_by_inbox(&self, inbox_address: &str) -> Result<Option<EncryptionState>>;
    /// Replace the record for `(conversation_id, inbox_id)`; optionally mark it latest.
    async fn save_encryption_state(&self, state: &EncryptionState, update_latest: bool)
        -> Result<()>;
    async fn delete_encryption_state(&self, conversation_id: &str, inbox_id: &str) -> Result<()>;
    async fn delete_encryption_states(&self, conversation_id: &str) -> Result<()>;
    async fn get_latest_state(&self, conversation_id: &str) -> Result<Option<EncryptionState>>;

    async fn save_inbox_mapping(&self, inbox_address: &str, conversation_id: &str) -> Result<()>;
    async fn get_inbox_mapping(&self, inbox_address: &str) -> Result<Option<String>>;
    async fn delete_inbox_mapping(&self, inbox_address: &str) -> Result<()>;

    // ── Messages ───────────────────────────────────────────────

    async fn save_message(&self, message: &Message) -> Result<()>;
    async fn get_message(&self, message_id: &str) -> Result<Option<Message>>;
    /// Channel history ordered by creation date.
    async fn get_messages(&self, space_id: &str, channel_id: &str) -> Result<Vec<Message>>;
    async fn get_space_messages(&self, space_id: &str) -> Result<Vec<Message>>;
    async fn delete_message(&self, message_id: &str) -> Result<()>;
    async fn delete_space_messages(&self, space_id: &str) -> Result<()>;
    async fn add_deleted_message_id(&self, message_id: &str) -> Result<()>;
    async fn is_message_deleted(&self, message_id: &str) -> Result<bool>;

    // ── Spaces, members, keys, mutes ───────────────────────────

    async fn get_space(&self, space_id: &str) -> Result<Option<Space>>;
    async fn get_spaces(&self) -> Result<Vec<Space>>;
    async fn save_space(&self, space: &Space) -> Result<()>;
    async fn delete_space(&self, space_id: &str) -> Result<()>;

    async fn get_space_member(&self, space_id: &str, user_address: &str)
        -> Result<Option<SpaceMember>>;
    async fn get_space_members(&self, space_id: &str) -> Result<Vec<SpaceMember>>;
    async fn save_space_member(&self, space_id: &str, member: &SpaceMember) -> Result<()>;
    async fn delete_space_member(&self, space_id: &str, user_address: &str) -> Result<()>;

    async fn get_space_key(&self, space_id: &str, key_id: &str) -> Result<Option<SpaceKey>>;
    async fn get_space_keys(&self, space_id: &str) -> Result<Vec<SpaceKey>>;
    async fn save_space_key(&self, key: &SpaceKey) -> Result<()>;
    async fn delete_space_key(&self, space_id: &str, key_id: &str) -> Result<()>;

    async fn save_mute(&self, mute: &MuteRecord) -> Result<()>;
    async fn get_mute(&self, space_id: &str, target_user_id: &str) -> Result<Option<MuteRecord>>;
    async fn get_mutes(&self, space_id: &str) -> Result<Vec<MuteRecord>>;
    async fn delete_mute(&self, space_id: &str, target_user_id: &str) -> Result<()>;

    // ── Conversations and user config ──────────────────────────

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    async fn get_conversations(&self) -> Result<Vec<Conversation>>;
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;

    async fn get_user_config(&self, address: &str) -> Result<Option<UserConfig>>;
    async fn save_user_config(&self, config: &UserConfig) -> Result<()>;
}

// ── Snapshot ───────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PublicData {
    inbox_mappings: HashMap<String, String>,
    messages: HashMap<String, Message>,
    deleted_message_ids: HashSet<String>,
    spaces: HashMap<String, Space>,
    members: HashMap<String, BTreeMap<String, SpaceMember>>,
    mutes: HashMap<String, BTreeMap<String, MuteRecord>>,
    conversations: HashMap<String, Conversation>,
    user_configs: HashMap<String, UserConfig>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SecretData {
    /// conversation id → inbox id → state
    encryption_states: HashMap<String, BTreeMap<String, EncryptionState>>,
    latest_states: HashMap<String, String>,
    /// space id → key id → key
    space_keys: HashMap<String, BTreeMap<String, SpaceKey>>,
}

#[derive(Debug, Default)]
struct StoreData {
    public: PublicData,
    secrets: SecretData,
}

/// Where a store writes its snapshot after each mutation.
pub trait Persistence: Send + Sync {
    fn commit(&self, public: &[u8], secrets: &[u8]) -> Result<()>;
}

/// No-op persistence for in-memory stores.
pub struct Ephemeral;

impl Persistence for Ephemeral {
    fn commit(&self, _public: &[u8], _secrets: &[u8]) -> Result<()> {
        Ok(())
    }
}

const PUBLIC_FILE: &str = "store.json";
const SECRETS_BLOB: &str = "store_secrets";

/// `{dir}/store/store.json` plus a sealed secrets blob in the key store.
pub struct SealedFiles {
    dir: PathBuf,
    key_store: KeyStore,
}

impl Persistence for SealedFiles {
    fn commit(&self, public: &[u8], secrets: &[u8]) -> Result<()> {
        std::fs::write(self.dir.join(PUBLIC_FILE), public)
            .map_err(|e| QuorumError::Storage(format!("Write store snapshot: {}", e)))?;
        self.key_store.save_sealed(SECRETS_BLOB, secrets)
    }
}

pub struct Store<P: Persistence> {
    data: RwLock<StoreData>,
    persistence: P,
}

pub type MemoryStore = Store<Ephemeral>;
pub type FileStore = Store<SealedFiles>;

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            persistence: Ephemeral,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStore {
    /// Open or create the store under `{base_dir}/store`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        let dir = base_dir.join("store");
        std::fs::create_dir_all(&dir)
            .map_err(|e| QuorumError::Storage(format!("Create store dir: {}", e)))?;
        let key_store = KeyStore::new(&dir)?;

        let public = match std::fs::read_to_string(dir.join(PUBLIC_FILE)) {
            Ok(raw) => serde_json::from_str::<PublicData>(&raw).unwrap_or_else(|e| {
                log::warn!("Failed to parse store snapshot: {}", e);
                PublicData::default()
            }),
            Err(_) => PublicData::default(),
        };
        let secrets = match key_store.load_sealed(SECRETS_BLOB) {
            Ok(Some(raw)) => serde_json::from_slice::<SecretData>(&raw).unwrap_or_else(|e| {
                log::warn!("Failed to parse sealed store secrets: {}", e);
                SecretData::default()
            }),
            Ok(None) => SecretData::default(),
            Err(e) => {
                log::warn!("Failed to open sealed store secrets: {}", e);
                SecretData::default()
            }
        };

        log::info!(
            "Loaded store: {} spaces, {} messages, {} conversations",
            public.spaces.len(),
            public.messages.len(),
            public.conversations.len()
        );
        Ok(Self {
            data: RwLock::new(StoreData { public, secrets }),
            persistence: SealedFiles { dir, key_store },
        })
    }
}

impl<P: Persistence> Store<P> {
    fn commit(&self, data: &StoreData) -> Result<()> {
        let public = serde_json::to_vec(&data.public)?;
        let secrets = serde_json::to_vec(&data.secrets)?;
        self.persistence.commit(&public, &secrets)
    }

    /// Apply `f` under the write lock and persist the result.
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> T + Send) -> Result<T> {
        let mut data = self.data.write().await;
        let out = f(&mut data);
        self.commit(&data)?;
        Ok(out)
    }
}

fn sorted_by_created(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(|a, b| {
        a.created_date
            .cmp(&b.created_date)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
    messages
}

#[async_trait]
impl<P: Persistence> MessageStore for Store<P> {
    async fn get_encryption_states(&self, conversation_id: &str) -> Result<Vec<EncryptionState>> {
        let data = self.data.read().await;
        Ok(data
            .secrets
            .encryption_states
            .get(conversation_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_encryption_state(
        &self,
        conversation_id: &str,
        inbox_id: &str,
    ) -> Result<Option<EncryptionState>> {
        let data = self.data.read().await;
        Ok(data
            .secrets
            .encryption_states
            .get(conversation_id)
            .and_then(|m| m.get(inbox_id))
            .cloned())
    }

    async fn find_state_by_inbox(&self, inbox_address: &str) -> Result<Option<EncryptionState>> {
        let data = self.data.read().await;
        if let Some(conversation_id) = data.public.inbox_mappings.get(inbox_address) {
            if let Some(state) = data
                .secrets
                .encryption_states
                .get(conversation_id)
                .and_then(|m| m.get(inbox_address))
            {
                return Ok(Some(state.clone()));
            }
        }
        Ok(data
            .secrets
            .encryption_states
            .values()
            .flat_map(|m| m.values())
            .find(|s| s.inbox_id == inbox_address)
            .cloned())
    }

    async fn save_encryption_state(
        &self,
        state: &EncryptionState,
        update_latest: bool,
    ) -> Result<()> {
        let state = state.clone();
        self.mutate(move |d| {
            if update_latest {
                d.secrets
                    .latest_states
                    .insert(state.conversation_id.clone(), state.inbox_id.clone());
            }
            d.secrets
                .encryption_states
                .entry(state.conversation_id.clone())
                .or_default()
                .insert(state.inbox_id.clone(), state);
        })
        .await
    }

    async fn delete_encryption_state(&self, conversation_id: &str, inbox_id: &str) -> Result<()> {
        self.mutate(|d| {
            if let Some(m) = d.secrets.encryption_states.get_mut(conversation_id) {
                m.remove(inbox_id);
                if m.is_empty() {
                    d.secrets.encryption_states.remove(conversation_id);
                }
            }
            if d.secrets.latest_states.get(conversation_id).map(String::as_str) == Some(inbox_id) {
                d.secrets.latest_states.remove(conversation_id);
            }
        })
        .await
    }

    async fn delete_encryption_states(&self, conversation_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.secrets.encryption_states.remove(conversation_id);
            d.secrets.latest_states.remove(conversation_id);
        })
        .await
    }

    async fn get_latest_state(&self, conversation_id: &str) -> Result<Option<EncryptionState>> {
        let data = self.data.read().await;
        let states = match data.secrets.encryption_states.get(conversation_id) {
            Some(m) => m,
            None => return Ok(None),
        };
        if let Some(inbox) = data.secrets.latest_states.get(conversation_id) {
            if let Some(state) = states.get(inbox) {
                return Ok(Some(state.clone()));
            }
        }
        Ok(states.values().max_by_key(|s| s.timestamp).cloned())
    }

    async fn save_inbox_mapping(&self, inbox_address: &str, conversation_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.public
                .inbox_mappings
                .insert(inbox_address.to_string(), conversation_id.to_string());
        })
        .await
    }

    async fn get_inbox_mapping(&self, inbox_address: &str) -> Result<Option<String>> {
        Ok(self.data.read().await.public.inbox_mappings.get(inbox_address).cloned())
    }

    async fn delete_inbox_mapping(&self, inbox_address: &str) -> Result<()> {
        self.mutate(|d| {
            d.public.inbox_mappings.remove(inbox_address);
        })
        .await
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        let message = message.clone();
        self.mutate(move |d| {
            d.public.messages.insert(message.message_id.clone(), message);
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self.data.read().await.public.messages.get(message_id).cloned())
    }

    async fn get_messages(&self, space_id: &str, channel_id: &str) -> Result<Vec<Message>> {
        let data = self.data.read().await;
        Ok(sorted_by_created(
            data.public
                .messages
                .values()
                .filter(|m| m.space_id == space_id && m.channel_id == channel_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_space_messages(&self, space_id: &str) -> Result<Vec<Message>> {
        let data = self.data.read().await;
        Ok(sorted_by_created(
            data.public
                .messages
                .values()
                .filter(|m| m.space_id == space_id)
                .cloned()
                .collect(),
        ))
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.public.messages.remove(message_id);
        })
        .await
    }

    async fn delete_space_messages(&self, space_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.public.messages.retain(|_, m| m.space_id != space_id);
        })
        .await
    }

    async fn add_deleted_message_id(&self, message_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.public.deleted_message_ids.insert(message_id.to_string());
        })
        .await
    }

    async fn is_message_deleted(&self, message_id: &str) -> Result<bool> {
        Ok(self
            .data
            .read()
            .await
            .public
            .deleted_message_ids
            .contains(message_id))
    }

    async fn get_space(&self, space_id: &str) -> Result<Option<Space>> {
        Ok(self.data.read().await.public.spaces.get(space_id).cloned())
    }

    async fn get_spaces(&self) -> Result<Vec<Space>> {
        let data = self.data.read().await;
        let mut spaces: Vec<Space> = data.public.spaces.values().cloned().collect();
        spaces.sort_by_key(|s| s.created_date);
        Ok(spaces)
    }

    async fn save_space(&self, space: &Space) -> Result<()> {
        let space = space.clone();
        self.mutate(move |d| {
            d.public.spaces.insert(space.space_id.clone(), space);
        })
        .await
    }

    async fn delete_space(&self, space_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.public.spaces.remove(space_id);
            d.public.members.remove(space_id);
            d.public.mutes.remove(space_id);
        })
        .await
    }

    async fn get_space_member(
        &self,
        space_id: &str,
        user_address: &str,
    ) -> Result<Option<SpaceMember>> {
        let data = self.data.read().await;
        Ok(data
            .public
            .members
            .get(space_id)
            .and_then(|m| m.get(user_address))
            .cloned())
    }

    async fn get_space_members(&self, space_id: &str) -> Result<Vec<SpaceMember>> {
        let data = self.data.read().await;
        Ok(data
            .public
            .members
            .get(space_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_space_member(&self, space_id: &str, member: &SpaceMember) -> Result<()> {
        let member = member.clone();
        self.mutate(move |d| {
            d.public
                .members
                .entry(space_id.to_string())
                .or_default()
                .insert(member.user_address.clone(), member);
        })
        .await
    }

    async fn delete_space_member(&self, space_id: &str, user_address: &str) -> Result<()> {
        self.mutate(|d| {
            if let Some(m) = d.public.members.get_mut(space_id) {
                m.remove(user_address);
            }
        })
        .await
    }

    async fn get_space_key(&self, space_id: &str, key_id: &str) -> Result<Option<SpaceKey>> {
        let data = self.data.read().await;
        Ok(data
            .secrets
            .space_keys
            .get(space_id)
            .and_then(|m| m.get(key_id))
            .cloned())
    }

    async fn get_space_keys(&self, space_id: &str) -> Result<Vec<SpaceKey>> {
        let data = self.data.read().await;
        Ok(data
            .secrets
            .space_keys
            .get(space_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_space_key(&self, key: &SpaceKey) -> Result<()> {
        let key = key.clone();
        self.mutate(move |d| {
            d.secrets
                .space_keys
                .entry(key.space_id.clone())
                .or_default()
                .insert(key.key_id.clone(), key);
        })
        .await
    }

    async fn delete_space_key(&self, space_id: &str, key_id: &str) -> Result<()> {
        self.mutate(|d| {
            if let Some(m) = d.secrets.space_keys.get_mut(space_id) {
                m.remove(key_id);
                if m.is_empty() {
                    d.secrets.space_keys.remove(space_id);
                }
            }
        })
        .await
    }

    async fn save_mute(&self, mute: &MuteRecord) -> Result<()> {
        let mute = mute.clone();
        self.mutate(move |d| {
            d.public
                .mutes
                .entry(mute.space_id.clone())
                .or_default()
                .insert(mute.target_user_id.clone(), mute);
        })
        .await
    }

    async fn get_mute(&self, space_id: &str, target_user_id: &str) -> Result<Option<MuteRecord>> {
        let data = self.data.read().await;
        Ok(data
            .public
            .mutes
            .get(space_id)
            .and_then(|m| m.get(target_user_id))
            .cloned())
    }

    async fn get_mutes(&self, space_id: &str) -> Result<Vec<MuteRecord>> {
        let data = self.data.read().await;
        Ok(data
            .public
            .mutes
            .get(space_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_mute(&self, space_id: &str, target_user_id: &str) -> Result<()> {
        self.mutate(|d| {
            if let Some(m) = d.public.mutes.get_mut(space_id) {
                m.remove(target_user_id);
            }
        })
        .await
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .data
            .read()
            .await
            .public
            .conversations
            .get(conversation_id)
            .cloned())
    }

    async fn get_conversations(&self) -> Result<Vec<Conversation>> {
        let data = self.data.read().await;
        let mut conversations: Vec<Conversation> =
            data.public.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(conversations)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.mutate(move |d| {
            d.public
                .conversations
                .insert(conversation.conversation_id.clone(), conversation);
        })
        .await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.mutate(|d| {
            d.public.conversations.remove(conversation_id);
        })
        .await
    }

    async fn get_user_config(&self, address: &str) -> Result<Option<UserConfig>> {
        Ok(self.data.read().await.public.user_configs.get(address).cloned())
    }

    async fn save_user_config(&self, config: &UserConfig) -> Result<()> {
        let config = config.clone();
        self.mutate(move |d| {
            d.public.user_configs.insert(config.address.clone(), config);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::types::{Content, PostContent};
    use tempfile::TempDir;

    fn state(conversation: &str, inbox: &str, ts: i64) -> EncryptionState {
        EncryptionState {
            state: format!("{{\"n\":{}}}", ts),
            timestamp: ts,
            inbox_id: inbox.into(),
            conversation_id: conversation.into(),
            sent_accept: None,
        }
    }

    fn post(space: &str, channel: &str, id: &str, created: i64) -> Message {
        Message::new(
            space,
            channel,
            id.into(),
            "n".into(),
            created,
            Content::Post(PostContent {
                sender_id: "QmA".into(),
                text: "hi".into(),
                replies_to_message_id: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_encryption_state_replaced_per_inbox() {
        let store = MemoryStore::new();
        store.save_encryption_state(&state("c/c", "i1", 1), true).await.unwrap();
        store.save_encryption_state(&state("c/c", "i1", 2), true).await.unwrap();
        store.save_encryption_state(&state("c/c", "i2", 3), false).await.unwrap();

        let states = store.get_encryption_states("c/c").await.unwrap();
        assert_eq!(states.len(), 2);
        let latest = store.get_latest_state("c/c").await.unwrap().unwrap();
        assert_eq!(latest.inbox_id, "i1");
        assert_eq!(latest.timestamp, 2);

        let found = store.find_state_by_inbox("i2").await.unwrap().unwrap();
        assert_eq!(found.conversation_id, "c/c");

        store.delete_encryption_state("c/c", "i1").await.unwrap();
        let latest = store.get_latest_state("c/c").await.unwrap().unwrap();
        assert_eq!(latest.inbox_id, "i2");
    }

    #[tokio::test]
    async fn test_messages_ordered_and_scoped() {
        let store = MemoryStore::new();
        store.save_message(&post("s", "c1", "b", 20)).await.unwrap();
        store.save_message(&post("s", "c1", "a", 10)).await.unwrap();
        store.save_message(&post("s", "c2", "c", 5)).await.unwrap();
        store.save_message(&post("t", "c1", "d", 1)).await.unwrap();

        let ids: Vec<_> = store
            .get_messages("s", "c1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get_space_messages("s").await.unwrap().len(), 3);

        store.delete_space_messages("s").await.unwrap();
        assert!(store.get_space_messages("s").await.unwrap().is_empty());
        assert!(store.get_message("d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_persists_and_seals_keys() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStore::open(tmp.path()).unwrap();
            store
                .save_space_key(&SpaceKey {
                    space_id: "QmSpace".into(),
                    key_id: "config".into(),
                    address: None,
                    public_key: "aa".into(),
                    private_key: "deadbeefcafe".into(),
                })
                .await
                .unwrap();
            store.save_message(&post("QmSpace", "c", "m1", 1)).await.unwrap();
            store.add_deleted_message_id("gone").await.unwrap();
        }

        let public = std::fs::read_to_string(tmp.path().join("store/store.json")).unwrap();
        assert!(!public.contains("deadbeefcafe"));

        let store = FileStore::open(tmp.path()).unwrap();
        let key = store.get_space_key("QmSpace", "config").await.unwrap().unwrap();
        assert_eq!(key.private_key, "deadbeefcafe");
        assert!(store.get_message("m1").await.unwrap().is_some());
        assert!(store.is_message_deleted("gone").await.unwrap());
    }
}
