//! Space lifecycle: creation, manifest updates, leaving, kicking and
//! channel keys.
//!
//! Kicking a member and minting a public invite link both rotate the config
//! key and hand out a fresh DKG ratchet; [`SpaceService::rekey`] does that
//! work for both.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::crypto::digest::{inbox_address, int64_to_bytes};
use crate::crypto::dkg::{self, RemainingMember, SpareShare};
use crate::crypto::provider::{CryptoProvider, Keypair, SpaceSession};
use crate::crypto::ratchet_state::{conversation_id, ConversationLocks, EncryptionState, TripleRatchet};
use crate::error::{QuorumError, Result};
use crate::services::action_handlers::{KickTask, SpaceUpdateTask};
use crate::services::action_queue::ActionKind;
use crate::services::api_client::{DirectoryApi, SpaceInviteEvals, SpaceRegistration};
use crate::services::config::InviteSettings;
use crate::services::hub::{hub_control, HubRelay};
use crate::services::message_service::MessageService;
use crate::services::message_store::MessageStore;
use crate::services::space_control::{
    membership_row, seal_manifest, seal_manifest_with, ControlMessage, RekeyPayload,
};
use crate::services::space_sessions::SpaceSessions;
use crate::services::transport::OutboundFrame;
use crate::services::types::{key_ids, Channel, Group, Identity, Space, SpaceKey, SpaceMember};
use crate::services::user_config::UserConfigService;

/// DKG shares minted when a space is created; one-time invite links draw
/// from this pool.
pub const INITIAL_SESSION_SHARES: usize = 10_000;

const DEFAULT_GROUP: &str = "Text Channels";
const DEFAULT_CHANNEL: &str = "general";
const DEFAULT_TOPIC: &str = "General Chat";

/// Plaintext of one public invite eval, sealed to the config key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteEval {
    pub id: u64,
    /// Serialized ratchet template for the slot.
    pub template: String,
    /// Hex DKG share.
    pub secret: String,
    /// Hex hub private key.
    pub hub_key: String,
}

/// Identifiers of a newly created space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSpace {
    pub space_id: String,
    pub channel_id: String,
}

/// Outcome of a config key rotation.
#[derive(Debug, Clone)]
pub struct Rekeyed {
    pub config_key: Keypair,
    pub invite_url: String,
    pub rekeyed_members: usize,
    pub spare_shares: usize,
}

/// Bytes the space and owner keys sign to register a space.
pub fn registration_signed_bytes(
    space_public: &[u8],
    config_public: &[u8],
    owner_public: &[u8],
    timestamp: i64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(space_public.len() + config_public.len() + owner_public.len() + 8);
    out.extend_from_slice(space_public);
    out.extend_from_slice(config_public);
    out.extend_from_slice(owner_public);
    out.extend_from_slice(&int64_to_bytes(timestamp));
    out
}

/// Registration binding `space` to `config_public` under `owner`.
pub fn sign_registration(
    crypto: &dyn CryptoProvider,
    space: &Keypair,
    config_public: &[u8],
    owner: &Keypair,
    timestamp: i64,
) -> Result<SpaceRegistration> {
    let signed = registration_signed_bytes(&space.public_key, config_public, &owner.public_key, timestamp);
    let space_signature = crypto.sign_ed448(&space.private_key, &signed)?;
    let owner_signature = crypto.sign_ed448(&owner.private_key, &signed)?;
    Ok(SpaceRegistration {
        space_address: inbox_address(&space.public_key),
        space_public_key: space.public_hex(),
        space_signature: hex::encode(space_signature),
        config_public_key: hex::encode(config_public),
        owner_public_keys: vec![owner.public_hex()],
        owner_signatures: vec![hex::encode(owner_signature)],
        timestamp,
    })
}

/// Seal spare shares as single-use invite payloads for the public pool.
///
/// `ephemeral` must be the key the accompanying manifest is sealed with.
pub fn seal_invite_evals(
    crypto: &dyn CryptoProvider,
    space_id: &str,
    spares: &[SpareShare],
    config: &Keypair,
    ephemeral: &Keypair,
    hub_private_hex: &str,
    owner: &Keypair,
) -> Result<SpaceInviteEvals> {
    let mut space_evals = Vec::with_capacity(spares.len());
    for spare in spares {
        let eval = InviteEval {
            id: spare.id,
            template: spare.template.to_json()?,
            secret: spare.secret_hex.clone(),
            hub_key: hub_private_hex.to_string(),
        };
        space_evals.push(crypto.encrypt_inbox_message(
            &config.public_key,
            &ephemeral.private_key,
            &serde_json::to_vec(&eval)?,
        )?);
    }
    let signed: Vec<u8> = space_evals.iter().flat_map(|e| e.bytes()).collect();
    let signature = crypto.sign_ed448(&owner.private_key, &signed)?;
    Ok(SpaceInviteEvals {
        config_public_key: config.public_hex(),
        space_address: space_id.to_string(),
        space_evals,
        ephemeral_public_key: ephemeral.public_hex(),
        owner_public_key: owner.public_hex(),
        owner_signature: hex::encode(signature),
    })
}

/// Reusable link; the config key alone lets the holder claim an eval.
pub fn public_invite_url(invites: &InviteSettings, space_id: &str, config_private_hex: &str) -> String {
    format!(
        "{}#spaceId={}&configKey={}",
        invites.base(true),
        space_id,
        config_private_hex
    )
}

fn control_body(control: &ControlMessage) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({
        "type": "control",
        "message": control,
    }))?)
}

fn space_key(space_id: &str, key_id: &str, address: Option<String>, pair: &Keypair) -> SpaceKey {
    SpaceKey {
        space_id: space_id.to_string(),
        key_id: key_id.to_string(),
        address,
        public_key: pair.public_hex(),
        private_key: pair.private_hex(),
    }
}

pub struct SpaceServiceDeps {
    pub identity: Arc<Identity>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub store: Arc<dyn MessageStore>,
    pub api: Arc<dyn DirectoryApi>,
    pub hub: Arc<HubRelay>,
    pub sessions: Arc<SpaceSessions>,
    pub user_config: Arc<UserConfigService>,
    pub messages: Arc<MessageService>,
    pub locks: Arc<ConversationLocks>,
    pub invites: InviteSettings,
    pub spare_shares: usize,
}

pub struct SpaceService {
    identity: Arc<Identity>,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    api: Arc<dyn DirectoryApi>,
    hub: Arc<HubRelay>,
    sessions: Arc<SpaceSessions>,
    user_config: Arc<UserConfigService>,
    messages: Arc<MessageService>,
    locks: Arc<ConversationLocks>,
    invites: InviteSettings,
    spare_shares: usize,
}

impl SpaceService {
    pub fn new(deps: SpaceServiceDeps) -> Self {
        Self {
            identity: deps.identity,
            crypto: deps.crypto,
            store: deps.store,
            api: deps.api,
            hub: deps.hub,
            sessions: deps.sessions,
            user_config: deps.user_config,
            messages: deps.messages,
            locks: deps.locks,
            invites: deps.invites,
            spare_shares: deps.spare_shares,
        }
    }

    // ── Create ─────────────────────────────────────────────────

    /// Create a space owned by this user with one default channel.
    ///
    /// Registers the space and its manifest with the directory, adds our
    /// inbox to the hub, starts the owner's ratchet and persists every key.
    pub async fn create_space(
        &self,
        name: &str,
        icon_url: &str,
        is_repudiable: bool,
        is_public: bool,
    ) -> Result<CreatedSpace> {
        let crypto = self.crypto.as_ref();
        let space_pair = crypto.generate_ed448()?;
        let config_pair = crypto.generate_x448()?;
        let group_pair = crypto.generate_ed448()?;
        let hub_pair = crypto.generate_ed448()?;
        let inbox_pair = crypto.generate_ed448()?;
        let owner_pair = crypto.generate_ed448()?;

        let space_id = inbox_address(&space_pair.public_key);
        let channel_id = inbox_address(&group_pair.public_key);
        let hub_address = inbox_address(&hub_pair.public_key);
        let inbox = inbox_address(&inbox_pair.public_key);
        let now = Utc::now().timestamp_millis();

        let registration = sign_registration(crypto, &space_pair, &config_pair.public_key, &owner_pair, now)?;
        self.api.post_space(&space_id, &registration).await?;
        self.sessions.set_registration(&space_id, registration).await;

        let space = Space {
            space_id: space_id.clone(),
            space_name: name.to_string(),
            description: Some(String::new()),
            icon_url: icon_url.to_string(),
            default_channel_id: channel_id.clone(),
            hub_address: hub_address.clone(),
            created_date: now,
            modified_date: now,
            is_repudiable,
            is_public,
            groups: vec![Group {
                group_name: DEFAULT_GROUP.to_string(),
                channels: vec![Channel {
                    channel_id: channel_id.clone(),
                    space_id: space_id.clone(),
                    channel_name: DEFAULT_CHANNEL.to_string(),
                    channel_topic: DEFAULT_TOPIC.to_string(),
                    created_date: now,
                    modified_date: now,
                    ..Default::default()
                }],
            }],
            ..Default::default()
        };

        let manifest = seal_manifest(crypto, &space, &config_pair.public_hex(), &owner_pair, now)?;
        self.api.post_space_manifest(&space_id, &manifest).await?;

        let hub_key = space_key(&space_id, key_ids::HUB, Some(hub_address), &hub_pair);
        self.api
            .post_hub_add(&hub_control(crypto, "add", &hub_key, &inbox_pair)?)
            .await?;

        let session = crypto
            .establish_triple_ratchet_session_for_space(
                &self.identity.user_keyset,
                &self.identity.device_keyset,
                &self.identity.registration,
                INITIAL_SESSION_SHARES,
            )
            .await?;

        for key in [
            space_key(&space_id, key_ids::CONFIG, None, &config_pair),
            hub_key,
            space_key(&space_id, key_ids::OWNER, None, &owner_pair),
            space_key(&space_id, key_ids::INBOX, Some(inbox.clone()), &inbox_pair),
            space_key(&space_id, &channel_id, None, &group_pair),
            space_key(&space_id, &space_id, None, &space_pair),
        ] {
            self.store.save_space_key(&key).await?;
        }
        self.store.save_space(&space).await?;
        self.store
            .save_space_member(
                &space_id,
                &SpaceMember {
                    user_address: self.identity.user_address.clone(),
                    inbox_address: inbox.clone(),
                    display_name: Some(self.identity.display_name.clone()),
                    user_icon: self.identity.user_icon.clone(),
                    is_kicked: None,
                },
            )
            .await?;
        self.store
            .save_encryption_state(
                &EncryptionState {
                    state: session.to_json()?,
                    timestamp: now,
                    inbox_id: inbox.clone(),
                    conversation_id: conversation_id(&space_id),
                    sent_accept: None,
                },
                true,
            )
            .await?;
        self.user_config.add_space(&space_id).await?;
        self.hub.outbound().push(OutboundFrame::listen(&inbox)).await;

        log::info!("Created space {} ({})", space_id, name);
        Ok(CreatedSpace {
            space_id,
            channel_id,
        })
    }

    /// Mint a key for a new channel. Returns the channel id.
    pub async fn create_channel(&self, space_id: &str) -> Result<String> {
        let pair = self.crypto.generate_ed448()?;
        let channel_id = inbox_address(&pair.public_key);
        self.store
            .save_space_key(&space_key(space_id, &channel_id, None, &pair))
            .await?;
        log::debug!("Created channel key {} in space {}", channel_id, space_id);
        Ok(channel_id)
    }

    // ── Update ─────────────────────────────────────────────────

    /// Save `space` locally and queue the manifest publication.
    pub async fn update_space(&self, mut space: Space) -> Result<()> {
        if self.store.get_space(&space.space_id).await?.is_none() {
            return Err(QuorumError::NotFound(format!("space {}", space.space_id)));
        }
        space.modified_date = Utc::now().timestamp_millis();
        self.store.save_space(&space).await?;
        let key = format!("update-space:{}:{}", space.space_id, space.modified_date);
        let task = SpaceUpdateTask { space };
        self.messages
            .queue()
            .enqueue(ActionKind::UpdateSpace, serde_json::to_value(&task)?, &key)
            .await?;
        Ok(())
    }

    /// Seal `space` into a new manifest, post it and broadcast it to members.
    pub async fn publish_space(&self, space: &Space) -> Result<()> {
        let owner = self
            .hub
            .space_keypair(&space.space_id, key_ids::OWNER)
            .await
            .map_err(|_| QuorumError::PermissionDenied("only a space owner can update the space".into()))?;
        let config = self.hub.space_key(&space.space_id, key_ids::CONFIG).await?;
        let manifest = seal_manifest(
            self.crypto.as_ref(),
            space,
            &config.public_key,
            &owner,
            Utc::now().timestamp_millis(),
        )?;
        self.api.post_space_manifest(&space.space_id, &manifest).await?;
        self.store.save_space(space).await?;
        self.hub
            .send_control(&space.space_id, &ControlMessage::SpaceManifest { manifest })
            .await?;
        log::info!("Published manifest for space {}", space.space_id);
        Ok(())
    }

    // ── Leave ──────────────────────────────────────────────────

    /// Leave a space: announce it to the members, then drop everything
    /// local about it.
    pub async fn delete_space(&self, space_id: &str) -> Result<()> {
        let hub_key = self.store.get_space_key(space_id, key_ids::HUB).await?;
        let Some(hub_key) = hub_key.filter(|k| k.address.is_some()) else {
            return Err(QuorumError::Validation(format!(
                "space {} has no hub key, its local data may be corrupted",
                space_id
            )));
        };
        let inbox = self.hub.space_keypair(space_id, key_ids::INBOX).await?;
        let signature = self.crypto.sign_ed448(
            &inbox.private_key,
            format!("delete{}", hub_key.public_key).as_bytes(),
        )?;
        self.hub
            .send_control(
                space_id,
                &ControlMessage::Leave {
                    inbox_public_key: inbox.public_hex(),
                    inbox_signature: hex::encode(signature),
                },
            )
            .await?;
        self.messages.forget_space(space_id).await?;
        log::info!("Left space {}", space_id);
        Ok(())
    }

    // ── Kick ───────────────────────────────────────────────────

    /// Queue a kick; the handler runs [`SpaceService::kick_user`].
    pub async fn request_kick(&self, space_id: &str, user_address: &str) -> Result<u64> {
        let task = KickTask {
            space_id: space_id.to_string(),
            user_address: user_address.to_string(),
        };
        let key = format!("kick:{}:{}", space_id, user_address);
        self.messages
            .queue()
            .enqueue(ActionKind::KickUser, serde_json::to_value(&task)?, &key)
            .await
    }

    /// Remove `user_address` from the space.
    ///
    /// The config key rotates and every remaining member receives a new
    /// ratchet slot, so the kicked user cannot read anything sent after
    /// this. The kick notice itself goes out under the old config key,
    /// which the kicked user still holds.
    pub async fn kick_user(&self, space_id: &str, user_address: &str) -> Result<()> {
        if self.store.get_space(space_id).await?.is_none() {
            return Err(QuorumError::NotFound(format!("space {}", space_id)));
        }
        if user_address == self.identity.user_address {
            return Err(QuorumError::Validation("cannot kick the space owner".into()));
        }
        let old_config = self.hub.space_keypair(space_id, key_ids::CONFIG).await?;
        let kicked = self.store.get_space_member(space_id, user_address).await?;

        let rekeyed = self.rekey(space_id, Some(user_address)).await?;

        let owner = self.hub.space_keypair(space_id, key_ids::OWNER).await?;
        if let Some(inbox) = kicked.as_ref().map(|m| m.inbox_address.as_str()).filter(|a| !a.is_empty()) {
            let notice = control_body(&ControlMessage::Kick {
                kick: user_address.to_string(),
            })?;
            self.hub
                .send_sync(space_id, inbox, &owner, &notice, Some(&old_config))
                .await?;
        }

        if let Some(space) = self.store.get_space(space_id).await? {
            let now = Utc::now().timestamp_millis();
            self.messages
                .record_row(membership_row("kick", user_address, &space, user_address, now))
                .await?;
        }
        if let Some(mut member) = kicked {
            member.inbox_address.clear();
            member.is_kicked = Some(true);
            self.store.save_space_member(space_id, &member).await?;
        }
        log::info!(
            "Kicked {} from {}; {} members rekeyed",
            user_address,
            space_id,
            rekeyed.rekeyed_members
        );
        Ok(())
    }

    /// Rotate the config key and redistribute the space ratchet to every
    /// member except ourselves and `kicked`. Spare shares are published as
    /// the public invite pool.
    pub async fn rekey(&self, space_id: &str, kicked: Option<&str>) -> Result<Rekeyed> {
        let crypto = self.crypto.as_ref();
        let mut space = self
            .store
            .get_space(space_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(format!("space {}", space_id)))?;
        let identity_key = self.hub.space_keypair(space_id, space_id).await?;
        let owner = self
            .hub
            .space_keypair(space_id, key_ids::OWNER)
            .await
            .map_err(|_| QuorumError::PermissionDenied("only a space owner can rekey the space".into()))?;
        let hub_key = self.hub.space_key(space_id, key_ids::HUB).await?;

        let config = crypto.generate_x448()?;
        let now = Utc::now().timestamp_millis();
        let registration = sign_registration(crypto, &identity_key, &config.public_key, &owner, now)?;
        self.api.post_space(space_id, &registration).await?;
        self.sessions.set_registration(space_id, registration).await;
        self.store
            .save_space_key(&space_key(space_id, key_ids::CONFIG, None, &config))
            .await?;

        let members: Vec<SpaceMember> = self
            .store
            .get_space_members(space_id)
            .await?
            .into_iter()
            .filter(|m| {
                !m.inbox_address.is_empty()
                    && Some(m.user_address.as_str()) != kicked
                    && m.user_address != self.identity.user_address
            })
            .collect();

        let conversation = conversation_id(space_id);
        let _guard = self.locks.acquire(&conversation).await;
        let current = self
            .store
            .get_latest_state(&conversation)
            .await?
            .ok_or_else(|| QuorumError::Crypto(format!("no ratchet state for space {}", space_id)))?;
        let previous = SpaceSession::parse(&current.state)?.ratchet()?;

        let session = crypto
            .establish_triple_ratchet_session_for_space(
                &self.identity.user_keyset,
                &self.identity.device_keyset,
                &self.identity.registration,
                members.len() + self.spare_shares,
            )
            .await?;

        let mut remaining = Vec::with_capacity(members.len());
        for member in &members {
            remaining.push(RemainingMember {
                user_address: member.user_address.clone(),
                inbox_address: member.inbox_address.clone(),
                peer_key: self.known_device_key(&member.user_address, &previous).await,
            });
        }
        let redistribution = dkg::redistribute(crypto, &previous, session, &remaining)?;

        for rekey in &redistribution.rekeys {
            let payload = RekeyPayload {
                config_key: config.private_hex(),
                state: rekey.template.to_json()?,
            };
            let sealed = crypto
                .seal_inbox_envelope(&rekey.peer_public_key, &serde_json::to_string(&payload)?)
                .await?;
            let body = control_body(&ControlMessage::Rekey {
                info: serde_json::to_string(&sealed)?,
                kick: kicked.map(str::to_string),
            })?;
            self.hub
                .send_sync(space_id, &rekey.inbox_address, &owner, &body, None)
                .await?;
        }

        let ephemeral = crypto.generate_x448()?;
        if !redistribution.spares.is_empty() {
            let evals = seal_invite_evals(
                crypto,
                space_id,
                &redistribution.spares,
                &config,
                &ephemeral,
                &hub_key.private_key,
                &owner,
            )?;
            self.api.post_space_invite_evals(&evals).await?;
        }

        space.invite_url = public_invite_url(&self.invites, space_id, &config.private_hex());
        let manifest = seal_manifest_with(crypto, &space, &config.public_hex(), &owner, &ephemeral, now)?;
        self.api.post_space_manifest(space_id, &manifest).await?;
        self.store.save_space(&space).await?;

        self.store
            .save_encryption_state(
                &EncryptionState {
                    state: redistribution.session.to_json()?,
                    timestamp: now,
                    ..current
                },
                true,
            )
            .await?;

        log::info!(
            "Rekeyed space {}: {} members, {} spare shares",
            space_id,
            redistribution.rekeys.len(),
            redistribution.spares.len()
        );
        Ok(Rekeyed {
            config_key: config,
            invite_url: space.invite_url,
            rekeyed_members: redistribution.rekeys.len(),
            spare_shares: redistribution.spares.len(),
        })
    }

    /// Base64 inbox key of the member's device the old ratchet knows, if any.
    async fn known_device_key(
        &self,
        user_address: &str,
        previous: &TripleRatchet,
    ) -> Option<String> {
        use base64::engine::general_purpose::STANDARD as B64;
        use base64::Engine;

        let user = match self.api.get_user(user_address).await {
            Ok(user) => user,
            Err(e) => {
                log::warn!("No registration for member {}: {}", user_address, e);
                return None;
            }
        };
        user.device_registrations.iter().find_map(|device| {
            let raw = hex::decode(&device.inbox_registration.inbox_encryption_public_key).ok()?;
            let key = B64.encode(raw);
            previous.peer_id_map.contains_key(&key).then_some(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_bytes_layout() {
        let bytes = registration_signed_bytes(&[1, 2], &[3], &[4, 5], 258);
        assert_eq!(&bytes[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(&bytes[5..], &int64_to_bytes(258));
    }

    #[test]
    fn test_public_invite_url_carries_config_key() {
        let invites = InviteSettings::default();
        let url = public_invite_url(&invites, "QmSpace", "abcd");
        assert!(url.starts_with(&invites.public_base));
        assert!(url.ends_with("#spaceId=QmSpace&configKey=abcd"));
    }

    #[test]
    fn test_control_body_wraps_message() {
        let body = control_body(&ControlMessage::Kick { kick: "QmUser".into() }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["type"], "control");
        assert_eq!(value["message"]["type"], "kick");
        assert_eq!(value["message"]["kick"], "QmUser");
    }

    #[test]
    fn test_invite_eval_wire_names() {
        let eval = InviteEval {
            id: 7,
            template: "{}".into(),
            secret: "00".into(),
            hub_key: "ff".into(),
        };
        let value = serde_json::to_value(&eval).unwrap();
        assert_eq!(value["hubKey"], "ff");
        assert_eq!(value["id"], 7);
    }
}
