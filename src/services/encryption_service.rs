//! Encryption state housekeeping and space address migration.
//!
//! A space created before its identity key was stored locally has no
//! `<spaceId>` key. [`EncryptionService::ensure_key_for_space`] mints a new
//! space keypair, moves every record to the derived address and registers
//! the space under it.

use chrono::Utc;
use std::sync::Arc;

use crate::crypto::digest::inbox_address;
use crate::crypto::provider::CryptoProvider;
use crate::crypto::ratchet_state::{conversation_id, EncryptionState};
use crate::error::{QuorumError, Result};
use crate::services::api_client::DirectoryApi;
use crate::services::hub;
use crate::services::message_store::MessageStore;
use crate::services::space_service::{sign_registration, SpaceService};
use crate::services::space_sessions::SpaceSessions;
use crate::services::types::{key_ids, Message, SpaceKey};
use crate::services::user_config::UserConfigService;

/// What [`migrate_space_records`] moved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Migration {
    pub keys: usize,
    pub messages: usize,
    pub members: usize,
    pub states: usize,
    /// The space inbox address, if the space had one.
    pub inbox_address: Option<String>,
}

/// Move every local record of `old` to `new`.
///
/// The old config key is dropped rather than moved; the caller saves a
/// fresh one. Our own member row is pointed at the space inbox.
pub async fn migrate_space_records(
    store: &dyn MessageStore,
    old: &str,
    new: &str,
    self_address: &str,
) -> Result<Migration> {
    let mut migration = Migration::default();

    for key in store.get_space_keys(old).await? {
        store.delete_space_key(old, &key.key_id).await?;
        if key.key_id == key_ids::INBOX {
            migration.inbox_address = key.address.clone();
        }
        if key.key_id == key_ids::CONFIG {
            continue;
        }
        store
            .save_space_key(&SpaceKey {
                space_id: new.to_string(),
                ..key
            })
            .await?;
        migration.keys += 1;
    }

    let prefix = format!("{}/", old);
    for conversation in store.get_conversations().await? {
        let Some(channel) = conversation.conversation_id.strip_prefix(&prefix) else {
            continue;
        };
        let mut moved = conversation.clone();
        moved.conversation_id = format!("{}/{}", new, channel);
        store.delete_conversation(&conversation.conversation_id).await?;
        store.save_conversation(&moved).await?;
    }

    for message in store.get_space_messages(old).await? {
        store
            .save_message(&Message {
                space_id: new.to_string(),
                ..message
            })
            .await?;
        migration.messages += 1;
    }

    let old_conversation = conversation_id(old);
    let new_conversation = conversation_id(new);
    let states = store.get_encryption_states(&old_conversation).await?;
    store.delete_encryption_states(&old_conversation).await?;
    for state in states {
        store.save_inbox_mapping(&state.inbox_id, &new_conversation).await?;
        store
            .save_encryption_state(
                &EncryptionState {
                    conversation_id: new_conversation.clone(),
                    ..state
                },
                true,
            )
            .await?;
        migration.states += 1;
    }

    for mut member in store.get_space_members(old).await? {
        store.delete_space_member(old, &member.user_address).await?;
        if member.user_address == self_address {
            if let Some(inbox) = &migration.inbox_address {
                member.inbox_address = inbox.clone();
            }
        }
        store.save_space_member(new, &member).await?;
        migration.members += 1;
    }

    Ok(migration)
}

pub struct EncryptionService {
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    api: Arc<dyn DirectoryApi>,
    sessions: Arc<SpaceSessions>,
    user_config: Arc<UserConfigService>,
    spaces: Arc<SpaceService>,
    self_address: String,
}

impl EncryptionService {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn MessageStore>,
        api: Arc<dyn DirectoryApi>,
        sessions: Arc<SpaceSessions>,
        user_config: Arc<UserConfigService>,
        spaces: Arc<SpaceService>,
        self_address: String,
    ) -> Self {
        Self {
            crypto,
            store,
            api,
            sessions,
            user_config,
            spaces,
            self_address,
        }
    }

    /// Drop every ratchet state of a conversation along with the inbox
    /// mappings that point at it.
    pub async fn delete_encryption_states(&self, conversation_id: &str) -> Result<()> {
        for state in self.store.get_encryption_states(conversation_id).await? {
            if state.inbox_id.is_empty() {
                continue;
            }
            if let Err(e) = self.store.delete_inbox_mapping(&state.inbox_id).await {
                log::debug!("No inbox mapping for {}: {}", state.inbox_id, e);
            }
        }
        self.store.delete_encryption_states(conversation_id).await
    }

    /// Make sure the space identity key is stored locally, migrating the
    /// space to a newly derived address when it is not. Returns the id the
    /// space lives under afterwards.
    pub async fn ensure_key_for_space(&self, space_id: &str) -> Result<String> {
        if self.store.get_space_key(space_id, space_id).await?.is_some() {
            return Ok(space_id.to_string());
        }
        let mut space = self
            .store
            .get_space(space_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(format!("space {}", space_id)))?;
        let owner = match self.store.get_space_key(space_id, key_ids::OWNER).await? {
            Some(key) => hub::keypair(&key)?,
            None => {
                return Err(QuorumError::PermissionDenied(format!(
                    "no owner key for space {}",
                    space_id
                )))
            }
        };

        let crypto = self.crypto.as_ref();
        let space_pair = crypto.generate_ed448()?;
        let config_pair = crypto.generate_x448()?;
        let address = inbox_address(&space_pair.public_key);

        let migration = migrate_space_records(self.store.as_ref(), space_id, &address, &self.self_address).await?;
        log::info!(
            "Migrating space {} to {}: {} keys, {} messages, {} members, {} states",
            space_id,
            address,
            migration.keys,
            migration.messages,
            migration.members,
            migration.states
        );

        self.store
            .save_space_key(&SpaceKey {
                space_id: address.clone(),
                key_id: key_ids::CONFIG.to_string(),
                address: None,
                public_key: config_pair.public_hex(),
                private_key: config_pair.private_hex(),
            })
            .await?;

        let registration = sign_registration(
            crypto,
            &space_pair,
            &config_pair.public_key,
            &owner,
            Utc::now().timestamp_millis(),
        )?;
        self.api.post_space(&address, &registration).await?;
        self.sessions.forget_registration(space_id).await;
        self.sessions.set_registration(&address, registration).await;

        self.user_config.rename_space(space_id, &address).await?;

        self.store.delete_space(space_id).await?;
        self.store
            .save_space_key(&SpaceKey {
                space_id: address.clone(),
                key_id: address.clone(),
                address: Some(address.clone()),
                public_key: space_pair.public_hex(),
                private_key: space_pair.private_hex(),
            })
            .await?;

        space.space_id = address.clone();
        for channel in space.groups.iter_mut().flat_map(|g| g.channels.iter_mut()) {
            channel.space_id = address.clone();
        }
        self.store.save_space(&space).await?;
        self.spaces.update_space(space).await?;
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::message_store::MemoryStore;
    use crate::services::types::{Content, Conversation, ConversationType, PostContent, SpaceMember};

    fn key(space: &str, id: &str, address: Option<&str>) -> SpaceKey {
        SpaceKey {
            space_id: space.into(),
            key_id: id.into(),
            address: address.map(str::to_string),
            public_key: "aa".into(),
            private_key: "bb".into(),
        }
    }

    fn member(address: &str, inbox: &str) -> SpaceMember {
        SpaceMember {
            user_address: address.into(),
            inbox_address: inbox.into(),
            ..Default::default()
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for k in [
            key("old", key_ids::CONFIG, None),
            key("old", key_ids::OWNER, None),
            key("old", key_ids::INBOX, Some("QmInbox")),
            key("old", "QmChannel", None),
        ] {
            store.save_space_key(&k).await.unwrap();
        }
        store
            .save_message(&Message::new(
                "old",
                "QmChannel",
                "m1".into(),
                "n".into(),
                1,
                Content::Post(PostContent {
                    sender_id: "QmMe".into(),
                    text: "hi".into(),
                    replies_to_message_id: None,
                }),
            ))
            .await
            .unwrap();
        store
            .save_encryption_state(
                &EncryptionState {
                    state: "{}".into(),
                    timestamp: 1,
                    inbox_id: "QmInbox".into(),
                    conversation_id: conversation_id("old"),
                    sent_accept: None,
                },
                true,
            )
            .await
            .unwrap();
        store
            .save_conversation(&Conversation {
                conversation_id: "old/QmChannel".into(),
                conversation_type: ConversationType::Group,
                timestamp: 1,
                address: "old".into(),
                icon: String::new(),
                display_name: "general".into(),
                last_read_timestamp: 0,
                is_repudiable: None,
                save_edit_history: None,
                last_message_id: None,
            })
            .await
            .unwrap();
        store.save_space_member("old", &member("QmMe", "")).await.unwrap();
        store.save_space_member("old", &member("QmPeer", "QmPeerInbox")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_migration_moves_records_and_drops_config() {
        let store = seeded().await;
        let migration = migrate_space_records(&store, "old", "new", "QmMe").await.unwrap();

        assert_eq!(migration.keys, 3);
        assert_eq!(migration.messages, 1);
        assert_eq!(migration.members, 2);
        assert_eq!(migration.states, 1);
        assert_eq!(migration.inbox_address.as_deref(), Some("QmInbox"));

        assert!(store.get_space_keys("old").await.unwrap().is_empty());
        assert!(store.get_space_key("new", key_ids::CONFIG).await.unwrap().is_none());
        assert!(store.get_space_key("new", "QmChannel").await.unwrap().is_some());

        assert_eq!(store.get_message("m1").await.unwrap().unwrap().space_id, "new");
        assert!(store.get_encryption_states(&conversation_id("old")).await.unwrap().is_empty());
        assert_eq!(
            store.get_inbox_mapping("QmInbox").await.unwrap().as_deref(),
            Some(conversation_id("new").as_str())
        );
        assert!(store.get_conversation("new/QmChannel").await.unwrap().is_some());
        assert!(store.get_conversation("old/QmChannel").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migration_points_self_at_space_inbox() {
        let store = seeded().await;
        migrate_space_records(&store, "old", "new", "QmMe").await.unwrap();

        let me = store.get_space_member("new", "QmMe").await.unwrap().unwrap();
        assert_eq!(me.inbox_address, "QmInbox");
        let peer = store.get_space_member("new", "QmPeer").await.unwrap().unwrap();
        assert_eq!(peer.inbox_address, "QmPeerInbox");
        assert!(store.get_space_members("old").await.unwrap().is_empty());
    }
}
