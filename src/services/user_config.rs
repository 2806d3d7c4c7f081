//! Per-user settings synced through the directory.
//!
//! The config travels as `hex(ciphertext) || hex(iv)`, AES-256-GCM under
//! the first 32 bytes of SHA-512 over the user's private key, signed with
//! the user key over `utf8(blob) || int64(timestamp)`. Spaces present in a
//! newer remote copy but missing here are re-joined from the bundled keys.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha512};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::digest::{inbox_address, int64_to_bytes};
use crate::crypto::key_store::{self, NONCE_LEN};
use crate::crypto::provider::{CryptoProvider, Keypair};
use crate::crypto::ratchet_state::{conversation_id, EncryptionState};
use crate::error::{QuorumError, Result};
use crate::services::api_client::{DirectoryApi, UserConfigPayload};
use crate::services::hub::{hub_control, HubRelay};
use crate::services::message_store::MessageStore;
use crate::services::space_control::decrypt_manifest;
use crate::services::space_sessions::SpaceSessions;
use crate::services::transport::OutboundFrame;
use crate::services::types::{key_ids, Identity, SpaceKey, SpaceKeyBundle, UserConfig};

const IV_HEX_LEN: usize = NONCE_LEN * 2;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncAnnouncement<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    inbox_address: &'a str,
}

/// AES key for the synced blob, derived from the user's private key.
pub fn config_key(user_private_key: &[u8]) -> Zeroizing<[u8; 32]> {
    let digest = Sha512::digest(user_private_key);
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest[..32]);
    key
}

/// Encrypt a config into the `hex(ct) || hex(iv)` wire string.
pub fn seal_config(key: &[u8], config: &UserConfig) -> Result<String> {
    let plaintext = serde_json::to_vec(config)?;
    let (iv, ciphertext) = key_store::seal(key, &plaintext)?;
    Ok(format!("{}{}", hex::encode(ciphertext), hex::encode(iv)))
}

pub fn open_config(key: &[u8], blob: &str) -> Result<UserConfig> {
    if blob.len() < IV_HEX_LEN || !blob.is_char_boundary(blob.len() - IV_HEX_LEN) {
        return Err(QuorumError::Crypto("user config blob too short".into()));
    }
    let (ct_hex, iv_hex) = blob.split_at(blob.len() - IV_HEX_LEN);
    let iv = hex::decode(iv_hex).map_err(|e| QuorumError::Crypto(format!("config iv: {}", e)))?;
    let ciphertext = hex::decode(ct_hex)
        .map_err(|e| QuorumError::Crypto(format!("config ciphertext: {}", e)))?;
    let plaintext = key_store::open(key, &iv, &ciphertext)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Bytes covered by the config signature.
pub fn signed_bytes(blob: &str, timestamp: i64) -> Vec<u8> {
    let mut out = blob.as_bytes().to_vec();
    out.extend_from_slice(&int64_to_bytes(timestamp));
    out
}

pub struct UserConfigService {
    identity: Arc<Identity>,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    api: Arc<dyn DirectoryApi>,
    hub: Arc<HubRelay>,
    sessions: Arc<SpaceSessions>,
}

impl UserConfigService {
    pub fn new(
        identity: Arc<Identity>,
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn MessageStore>,
        api: Arc<dyn DirectoryApi>,
        hub: Arc<HubRelay>,
        sessions: Arc<SpaceSessions>,
    ) -> Self {
        Self {
            identity,
            crypto,
            store,
            api,
            hub,
            sessions,
        }
    }

    fn address(&self) -> &str {
        &self.identity.user_address
    }

    /// Locally stored config, or a fresh one.
    pub async fn local_config(&self) -> Result<UserConfig> {
        Ok(self
            .store
            .get_user_config(self.address())
            .await?
            .unwrap_or_else(|| UserConfig::new(self.address())))
    }

    /// Newest of local and remote config.
    ///
    /// A remote copy wins only when strictly newer and correctly signed. Any
    /// problem reaching or opening it falls back to the local copy.
    pub async fn get_config(&self) -> Result<UserConfig> {
        let stored = self.store.get_user_config(self.address()).await?;
        let remote = match self.api.get_user_settings(self.address()).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Could not fetch remote user config: {}", e);
                None
            }
        };

        let Some(remote) = remote else {
            return Ok(stored.unwrap_or_else(|| UserConfig::new(self.address())));
        };
        let stored_ts = stored.as_ref().map(|c| c.timestamp).unwrap_or(0);
        if remote.timestamp <= stored_ts {
            if remote.timestamp < stored_ts {
                log::warn!("Remote user config is out of date");
            }
            return Ok(stored.unwrap_or_else(|| UserConfig::new(self.address())));
        }

        let user_key = &self.identity.user_keyset.user_key;
        if !self.verify_payload(&remote, user_key) {
            log::warn!("Received user config with invalid signature");
            return Ok(stored.unwrap_or_else(|| UserConfig::new(self.address())));
        }

        let key = config_key(&user_key.private_key);
        let mut config = match open_config(key.as_ref(), &remote.user_config) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Could not open remote user config: {}", e);
                return Ok(stored.unwrap_or_else(|| UserConfig::new(self.address())));
            }
        };

        for bundle in &config.space_keys {
            if self.store.get_space(&bundle.space_id).await?.is_some() {
                continue;
            }
            if let Err(e) = self.restore_space(bundle).await {
                log::error!("Could not restore space {}: {}", bundle.space_id, e);
            }
        }

        config.timestamp = remote.timestamp;
        self.store.save_user_config(&config).await?;
        log::info!("Applied remote user config from {}", remote.timestamp);
        Ok(config)
    }

    fn verify_payload(&self, payload: &UserConfigPayload, user_key: &Keypair) -> bool {
        let Ok(signature) = hex::decode(&payload.signature) else {
            return false;
        };
        self.crypto
            .verify_ed448(
                &user_key.public_key,
                &signed_bytes(&payload.user_config, payload.timestamp),
                &signature,
            )
            .unwrap_or(false)
    }

    /// Re-join a space from keys carried in the synced config: fresh inbox,
    /// hub registration, then announce it so peers can sync us.
    async fn restore_space(&self, bundle: &SpaceKeyBundle) -> Result<()> {
        let space_id = &bundle.space_id;
        let find = |id: &str| bundle.keys.iter().find(|k| k.key_id == id);
        let config = find(key_ids::CONFIG)
            .ok_or_else(|| QuorumError::NotFound(format!("config key for {}", space_id)))?;
        let hub = find(key_ids::HUB)
            .ok_or_else(|| QuorumError::NotFound(format!("hub key for {}", space_id)))?;

        for key in &bundle.keys {
            self.store.save_space_key(key).await?;
        }

        let registration = self.api.get_space(space_id).await?;
        self.sessions.set_registration(space_id, registration).await;

        let manifest = self.api.get_space_manifest(space_id).await?;
        let space = decrypt_manifest(self.crypto.as_ref(), config, &manifest)?;

        let inbox = self.crypto.generate_ed448()?;
        let inbox_addr = inbox_address(&inbox.public_key);

        self.store.save_space(&space).await?;
        self.store
            .save_encryption_state(
                &EncryptionState {
                    inbox_id: inbox_addr.clone(),
                    conversation_id: conversation_id(space_id),
                    ..bundle.encryption_state.clone()
                },
                true,
            )
            .await?;

        self.api
            .post_hub_add(&hub_control(self.crypto.as_ref(), "add", hub, &inbox)?)
            .await?;
        self.hub.outbound().push(OutboundFrame::listen(&inbox_addr)).await;

        self.store
            .save_space_key(&SpaceKey {
                space_id: space_id.clone(),
                key_id: key_ids::INBOX.to_string(),
                address: Some(inbox_addr.clone()),
                public_key: inbox.public_hex(),
                private_key: inbox.private_hex(),
            })
            .await?;

        self.hub
            .send_control(
                space_id,
                &SyncAnnouncement {
                    kind: "sync",
                    inbox_address: &inbox_addr,
                },
            )
            .await?;
        log::info!("Restored space {} from synced config", space_id);
        Ok(())
    }

    /// Stamp, optionally publish, and store `config`.
    pub async fn save_config(&self, mut config: UserConfig) -> Result<UserConfig> {
        let timestamp = Utc::now().timestamp_millis();
        config.timestamp = timestamp;

        if config.allow_sync {
            config.space_keys = self.bundles(&config.space_ids).await?;
            let user_key = &self.identity.user_keyset.user_key;
            let key = config_key(&user_key.private_key);
            let blob = seal_config(key.as_ref(), &config)?;
            let signature = self
                .crypto
                .sign_ed448(&user_key.private_key, &signed_bytes(&blob, timestamp))?;
            self.api
                .post_user_settings(
                    self.address(),
                    &UserConfigPayload {
                        user_address: self.address().to_string(),
                        user_public_key: user_key.public_hex(),
                        user_config: blob,
                        timestamp,
                        signature: hex::encode(signature),
                    },
                )
                .await?;
        }

        self.store.save_user_config(&config).await?;
        Ok(config)
    }

    async fn bundles(&self, space_ids: &[String]) -> Result<Vec<SpaceKeyBundle>> {
        let mut bundles = Vec::with_capacity(space_ids.len());
        for space_id in space_ids {
            let Some(encryption_state) = self
                .store
                .get_latest_state(&conversation_id(space_id))
                .await?
            else {
                continue;
            };
            bundles.push(SpaceKeyBundle {
                space_id: space_id.clone(),
                encryption_state,
                keys: self.store.get_space_keys(space_id).await?,
            });
        }
        Ok(bundles)
    }

    pub async fn add_space(&self, space_id: &str) -> Result<UserConfig> {
        let mut config = self.local_config().await?;
        if !config.space_ids.iter().any(|s| s == space_id) {
            config.space_ids.push(space_id.to_string());
        }
        self.save_config(config).await
    }

    pub async fn remove_space(&self, space_id: &str) -> Result<UserConfig> {
        let mut config = self.local_config().await?;
        config.space_ids.retain(|s| s != space_id);
        self.save_config(config).await
    }

    /// Replace `old` with `new` in the membership list.
    pub async fn rename_space(&self, old: &str, new: &str) -> Result<UserConfig> {
        let mut config = self.local_config().await?;
        for id in config.space_ids.iter_mut() {
            if id == old {
                *id = new.to_string();
            }
        }
        self.save_config(config).await
    }
}
