//! Encrypted backup of direct conversations.
//!
//! A backup file is JSON `{version, iv, ciphertext, createdAt}` where the
//! ciphertext is AES-256-GCM over the payload JSON. The key is derived from
//! the user's private key with a `quorum-backup-v1` domain prefix, so it
//! never matches the key the synced user config is sealed under.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::key_store;
use crate::crypto::ratchet_state::EncryptionState;
use crate::error::{BackupErrorKind, QuorumError, Result};
use crate::services::message_store::MessageStore;
use crate::services::types::{Conversation, ConversationType, Identity, Message, UserConfig};

pub const BACKUP_VERSION: u32 = 1;
const DOMAIN_PREFIX: &[u8] = b"quorum-backup-v1";

/// On-disk backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub version: u32,
    pub iv: String,
    pub ciphertext: String,
    pub created_at: i64,
}

/// What a backup carries once decrypted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupPayload {
    pub messages: Vec<Message>,
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub encryption_states: Vec<EncryptionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_config: Option<UserConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub messages_written: usize,
    pub conversations_written: usize,
}

/// SHA-512("quorum-backup-v1" || private key), first 32 bytes.
pub fn backup_key(user_private_key: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha512::new();
    hasher.update(DOMAIN_PREFIX);
    hasher.update(user_private_key);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest[..32]);
    key
}

pub fn seal_backup(key: &[u8], payload: &BackupPayload, created_at: i64) -> Result<BackupFile> {
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let (iv, ciphertext) = key_store::seal(key, &plaintext)?;
    Ok(BackupFile {
        version: BACKUP_VERSION,
        iv: hex::encode(iv),
        ciphertext: hex::encode(ciphertext),
        created_at,
    })
}

/// Check the outer file shape before touching any key material.
pub fn parse_backup_file(raw: &str) -> Result<BackupFile> {
    let invalid = |message: &str| QuorumError::backup(BackupErrorKind::InvalidFormat, message);
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| invalid("file is not valid JSON"))?;
    if !value.is_object() {
        return Err(invalid("file is not a valid backup"));
    }
    match value.get("version").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(BACKUP_VERSION) => {}
        _ => {
            return Err(invalid(&format!("unknown backup version: {}", value["version"])));
        }
    }
    serde_json::from_value(value).map_err(|_| invalid("backup file is missing required fields"))
}

pub fn open_backup(key: &[u8], file: &BackupFile) -> Result<BackupPayload> {
    let wrong_key =
        || QuorumError::backup(BackupErrorKind::DecryptionFailed, "wrong account or corrupted backup file");
    let iv = hex::decode(&file.iv).map_err(|_| wrong_key())?;
    let ciphertext = hex::decode(&file.ciphertext).map_err(|_| wrong_key())?;
    let plaintext = Zeroizing::new(key_store::open(key, &iv, &ciphertext).map_err(|_| wrong_key())?);

    let value: serde_json::Value = serde_json::from_slice(&plaintext).map_err(|_| {
        QuorumError::backup(BackupErrorKind::DecryptionFailed, "decrypted data is not valid JSON")
    })?;
    if !value["messages"].is_array() || !value["conversations"].is_array() {
        return Err(QuorumError::backup(
            BackupErrorKind::InvalidFormat,
            "backup payload is missing messages or conversations",
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| QuorumError::backup(BackupErrorKind::InvalidFormat, e.to_string()))
}

/// Clears the in-progress flag when an export or import ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BackupService {
    identity: Arc<Identity>,
    store: Arc<dyn MessageStore>,
    running: AtomicBool,
}

impl BackupService {
    pub fn new(identity: Arc<Identity>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            identity,
            store,
            running: AtomicBool::new(false),
        }
    }

    fn begin(&self) -> Result<Running<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                QuorumError::backup(BackupErrorKind::ImportFailed, "a backup operation is already in progress")
            })?;
        Ok(Running(&self.running))
    }

    fn key(&self) -> Zeroizing<[u8; 32]> {
        backup_key(&self.identity.user_keyset.user_key.private_key)
    }

    async fn collect(&self) -> Result<BackupPayload> {
        let mut payload = BackupPayload {
            user_config: self.store.get_user_config(&self.identity.user_address).await?,
            ..Default::default()
        };
        for conversation in self.store.get_conversations().await? {
            if conversation.conversation_type != ConversationType::Direct {
                continue;
            }
            payload
                .messages
                .extend(self.store.get_space_messages(&conversation.address).await?);
            payload.encryption_states.extend(
                self.store
                    .get_encryption_states(&conversation.conversation_id)
                    .await?,
            );
            payload.conversations.push(conversation);
        }
        Ok(payload)
    }

    /// Seal every direct conversation, its history and sessions, plus the
    /// local user config, into backup file contents.
    pub async fn export_backup(&self) -> Result<String> {
        let _running = self.begin()?;
        log::info!("Starting backup export");
        let payload = self.collect().await?;
        log::info!(
            "Backing up {} messages, {} conversations, {} sessions",
            payload.messages.len(),
            payload.conversations.len(),
            payload.encryption_states.len()
        );
        let file = seal_backup(self.key().as_slice(), &payload, Utc::now().timestamp_millis())?;
        Ok(serde_json::to_string(&file)?)
    }

    /// Restore messages and conversations from backup file contents.
    ///
    /// Sessions and user config in the backup are left alone; the ones in
    /// use on this device stay authoritative. Deleted messages stay deleted
    /// and a newer local conversation row is kept.
    pub async fn import_backup(&self, contents: &str) -> Result<ImportSummary> {
        let _running = self.begin()?;
        log::info!("Starting backup import");
        let file = parse_backup_file(contents)?;
        let payload = open_backup(self.key().as_slice(), &file)?;
        log::debug!(
            "Backup from {} holds {} messages and {} conversations",
            file.created_at,
            payload.messages.len(),
            payload.conversations.len()
        );

        self.restore(payload).await.map_err(|e| match e {
            QuorumError::Backup { .. } => e,
            other => QuorumError::backup(BackupErrorKind::ImportFailed, other.to_string()),
        })
    }

    async fn restore(&self, payload: BackupPayload) -> Result<ImportSummary> {
        let mut summary = ImportSummary {
            messages_written: 0,
            conversations_written: 0,
        };
        for message in payload.messages {
            if !message.is_direct() || self.store.is_message_deleted(&message.message_id).await? {
                continue;
            }
            self.store.save_message(&message.without_ephemeral()).await?;
            summary.messages_written += 1;
        }
        for conversation in payload.conversations {
            let local = self.store.get_conversation(&conversation.conversation_id).await?;
            if local.is_some_and(|c| c.timestamp > conversation.timestamp) {
                continue;
            }
            self.store.save_conversation(&conversation).await?;
            summary.conversations_written += 1;
        }
        log::info!(
            "Backup import complete: {} messages, {} conversations",
            summary.messages_written,
            summary.conversations_written
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::types::{Content, PostContent};

    fn dm(peer: &str, id: &str) -> Message {
        Message::new(
            peer,
            peer,
            id.to_string(),
            format!("n-{}", id),
            5,
            Content::Post(PostContent {
                sender_id: peer.to_string(),
                text: "hello".into(),
                replies_to_message_id: None,
            }),
        )
    }

    fn payload() -> BackupPayload {
        BackupPayload {
            messages: vec![dm("QmPeer", "m1")],
            ..Default::default()
        }
    }

    fn kind(err: QuorumError) -> BackupErrorKind {
        match err {
            QuorumError::Backup { kind, .. } => kind,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_backup_key_is_domain_separated() {
        let private = [3u8; 57];
        let key = backup_key(&private);
        assert_ne!(&key[..], &Sha512::digest(private)[..32]);
        assert_eq!(&key[..], &backup_key(&private)[..]);
    }

    #[test]
    fn test_sealed_backup_opens_only_under_same_key() {
        let key = backup_key(b"alice");
        let file = seal_backup(key.as_slice(), &payload(), 42).unwrap();
        assert_eq!(file.version, BACKUP_VERSION);
        assert_eq!(file.iv.len(), key_store::NONCE_LEN * 2);

        let raw = serde_json::to_string(&file).unwrap();
        assert!(raw.contains("\"createdAt\":42"));
        let opened = open_backup(key.as_slice(), &parse_backup_file(&raw).unwrap()).unwrap();
        assert_eq!(opened.messages[0].message_id, "m1");

        let other = backup_key(b"mallory");
        let err = open_backup(other.as_slice(), &file).unwrap_err();
        assert_eq!(kind(err), BackupErrorKind::DecryptionFailed);
    }

    #[test]
    fn test_malformed_files_are_rejected_before_decrypting() {
        for raw in [
            "not json",
            "[1, 2]",
            r#"{"version": 2, "iv": "00", "ciphertext": "00", "createdAt": 1}"#,
            r#"{"version": 1, "iv": "00", "createdAt": 1}"#,
            r#"{"version": 1, "iv": "00", "ciphertext": "00", "createdAt": "yesterday"}"#,
        ] {
            let err = parse_backup_file(raw).unwrap_err();
            assert_eq!(kind(err), BackupErrorKind::InvalidFormat, "{}", raw);
        }
    }

    #[test]
    fn test_payload_without_conversations_is_invalid() {
        let key = backup_key(b"alice");
        let (iv, ciphertext) = key_store::seal(key.as_slice(), br#"{"messages": []}"#).unwrap();
        let file = BackupFile {
            version: BACKUP_VERSION,
            iv: hex::encode(iv),
            ciphertext: hex::encode(ciphertext),
            created_at: 1,
        };
        let err = open_backup(key.as_slice(), &file).unwrap_err();
        assert_eq!(kind(err), BackupErrorKind::InvalidFormat);
    }
}
