//! Space control plane: the hub payload shapes and the checks each control
//! message must pass before it may touch local state.
//!
//! Dispatch lives in the message service; everything here is either a wire
//! type or a pure verification helper so it can be tested without a hub.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::digest::{event_id, inbox_address_from_hex, int64_to_bytes};
use crate::crypto::provider::{CryptoProvider, ExteriorEnvelope, Keypair};
use crate::crypto::ratchet_state::{conversation_id, PeerEntry, TripleRatchet};
use crate::error::{QuorumError, Result};
use crate::services::api_client::{DirectoryApi, SpaceManifest};
use crate::services::message_store::MessageStore;
use crate::services::space_sessions::SpaceSessions;
use crate::services::types::{Content, Message, SenderOnlyContent, Space, SpaceKey, SpaceMember};

// ── Wire shapes ────────────────────────────────────────────────

/// What a hub envelope opens to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "lowercase")]
pub enum HubEnvelope {
    /// Triple-ratchet envelope, still encrypted.
    Message(serde_json::Value),
    Control(ControlMessage),
}

/// A member announcing its ratchet slot and device keys. Key fields are hex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub address: String,
    pub id: u64,
    pub inbox_address: String,
    /// Device inbox signing key the signature verifies under.
    pub inbox_pub_key: String,
    /// DKG point for slot `id`.
    pub pub_key: String,
    /// Device inbox X448 key; becomes the ratchet peer key.
    pub inbox_key: String,
    pub identity_key: String,
    pub pre_key: String,
    #[serde(default)]
    pub user_icon: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub signature: String,
}

impl Participant {
    pub fn signed_bytes(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{}{}{}{}{}",
            self.address,
            self.id,
            self.inbox_address,
            self.pub_key,
            self.inbox_key,
            self.identity_key,
            self.pre_key,
            self.user_icon,
            self.display_name
        )
        .into_bytes()
    }
}

/// The ratchet's peer maps plus whatever ratchet fields the sender chose
/// to include.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerMap {
    #[serde(default)]
    pub id_peer_map: std::collections::BTreeMap<String, PeerEntry>,
    #[serde(default)]
    pub peer_id_map: std::collections::BTreeMap<String, u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PeerMap {
    pub fn of(ratchet: &TripleRatchet) -> Self {
        let mut extra = serde_json::Map::new();
        if let Some(root) = &ratchet.root_key {
            extra.insert("root_key".into(), root.clone());
        }
        if let Some(dkg) = &ratchet.dkg_ratchet {
            extra.insert("dkg_ratchet".into(), dkg.clone().into());
        }
        for field in [
            "receiving_group_key",
            "receiving_chain_key",
            "current_header_key",
            "next_header_key",
            "async_dkg_pubkey",
            "threshold",
        ] {
            if let Some(v) = ratchet.extra.get(field) {
                extra.insert(field.into(), v.clone());
            }
        }
        Self {
            id_peer_map: ratchet.id_peer_map.clone(),
            peer_id_map: ratchet.peer_id_map.clone(),
            extra,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub inbox_address: String,
    pub expiry: i64,
    #[serde(default)]
    pub member_count: usize,
    #[serde(default)]
    pub message_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    #[serde(default)]
    pub inbox_address: Option<String>,
    #[serde(default)]
    pub message_count: Option<usize>,
    #[serde(default)]
    pub member_count: Option<usize>,
}

/// Counts and history bounds of the peer asking to be synced. `-1` bounds
/// mean an empty history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInitiate {
    #[serde(default)]
    pub inbox_address: Option<String>,
    #[serde(default)]
    pub member_count: usize,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default = "no_bound")]
    pub latest_message_timestamp: i64,
    #[serde(default = "no_bound")]
    pub oldest_message_timestamp: i64,
}

fn no_bound() -> i64 {
    -1
}

impl SyncInitiate {
    /// Whether the requester already holds messages created at `created`.
    pub fn covers(&self, created: i64) -> bool {
        self.oldest_message_timestamp > -1
            && self.latest_message_timestamp > -1
            && created >= self.oldest_message_timestamp
            && created <= self.latest_message_timestamp
    }
}

/// Sealed rekey payload opened with the device inbox key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekeyPayload {
    pub config_key: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    Join {
        participant: Participant,
    },
    SyncPeerMap {
        #[serde(rename = "peerMap")]
        peer_map: PeerMap,
    },
    SpaceManifest {
        manifest: SpaceManifest,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        inbox_public_key: String,
        inbox_signature: String,
    },
    Rekey {
        /// Inbox envelope (JSON string) carrying a [`RekeyPayload`].
        info: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kick: Option<String>,
    },
    Kick {
        kick: String,
    },
    #[serde(rename_all = "camelCase")]
    Sync {
        inbox_address: String,
    },
    SyncRequest(SyncRequest),
    SyncInfo(SyncInfo),
    SyncInitiate(SyncInitiate),
    SyncMembers {
        members: Vec<SpaceMember>,
    },
    VerifyKicked {
        addresses: Vec<String>,
    },
    SyncMessages {
        messages: Vec<Message>,
    },
    /// Control types this client does not speak.
    #[serde(other)]
    Unsupported,
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Join { .. } => "join",
            ControlMessage::SyncPeerMap { .. } => "sync-peer-map",
            ControlMessage::SpaceManifest { .. } => "space-manifest",
            ControlMessage::Leave { .. } => "leave",
            ControlMessage::Rekey { .. } => "rekey",
            ControlMessage::Kick { .. } => "kick",
            ControlMessage::Sync { .. } => "sync",
            ControlMessage::SyncRequest(_) => "sync-request",
            ControlMessage::SyncInfo(_) => "sync-info",
            ControlMessage::SyncInitiate(_) => "sync-initiate",
            ControlMessage::SyncMembers { .. } => "sync-members",
            ControlMessage::VerifyKicked { .. } => "verify-kicked",
            ControlMessage::SyncMessages { .. } => "sync-messages",
            ControlMessage::Unsupported => "unsupported",
        }
    }
}

// ── Verification ───────────────────────────────────────────────

fn verify_hex(crypto: &dyn CryptoProvider, public_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let (Ok(pk), Ok(sig)) = (hex::decode(public_hex), hex::decode(signature_hex)) else {
        return false;
    };
    crypto.verify_ed448(&pk, message, &sig).unwrap_or(false)
}

/// A join is accepted when the announced point belongs to the claimed slot
/// and the participant record is signed by the announced inbox key.
pub fn verify_join(crypto: &dyn CryptoProvider, ratchet_state: &str, participant: &Participant) -> bool {
    match crypto.verify_point(ratchet_state, &participant.pub_key, participant.id) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            log::warn!("Join point check failed: {}", e);
            return false;
        }
    }
    verify_hex(
        crypto,
        &participant.inbox_pub_key,
        &participant.signed_bytes(),
        &participant.signature,
    )
}

/// Register a verified participant in the ratchet's peer maps.
pub fn add_participant(ratchet: &mut TripleRatchet, participant: &Participant) -> Result<()> {
    let b64 = |hex_value: &str| -> Result<String> {
        hex::decode(hex_value)
            .map(|bytes| B64.encode(bytes))
            .map_err(|e| QuorumError::Validation(format!("participant key hex: {}", e)))
    };
    ratchet.insert_peer(
        participant.id,
        PeerEntry {
            public_key: b64(&participant.inbox_key)?,
            identity_public_key: b64(&participant.identity_key)?,
            signed_pre_public_key: b64(&participant.pre_key)?,
        },
    );
    Ok(())
}

/// Inbox address of a departing member whose `delete` signature over the
/// hub key checks out.
pub fn verify_leave(
    crypto: &dyn CryptoProvider,
    hub_public_hex: &str,
    inbox_public_key: &str,
    inbox_signature: &str,
) -> Option<String> {
    let signed = format!("delete{}", hub_public_hex);
    if !verify_hex(crypto, inbox_public_key, signed.as_bytes(), inbox_signature) {
        return None;
    }
    inbox_address_from_hex(inbox_public_key).ok()
}

/// Exterior signature check for owner-issued control messages.
///
/// The signer must be a registered owner, unless `trust_any_signer` is set
/// (a sync window is open and the data was solicited from a peer).
pub async fn verify_exterior(
    crypto: &dyn CryptoProvider,
    sessions: &SpaceSessions,
    api: &dyn DirectoryApi,
    space_id: &str,
    exterior: &ExteriorEnvelope,
    trust_any_signer: bool,
) -> bool {
    let is_owner = sessions
        .is_owner_key(api, space_id, &exterior.owner_public_key)
        .await;
    if !is_owner && !trust_any_signer {
        log::warn!("Control message for {} not signed by an owner", space_id);
        return false;
    }
    exterior.verify(crypto)
}

// ── Manifests ──────────────────────────────────────────────────

pub fn manifest_signed_bytes(space_manifest: &str, timestamp: i64) -> Vec<u8> {
    let mut out = space_manifest.as_bytes().to_vec();
    out.extend_from_slice(&int64_to_bytes(timestamp));
    out
}

pub fn verify_manifest(crypto: &dyn CryptoProvider, manifest: &SpaceManifest) -> bool {
    verify_hex(
        crypto,
        &manifest.owner_public_key,
        &manifest_signed_bytes(&manifest.space_manifest, manifest.timestamp),
        &manifest.owner_signature,
    )
}

/// Open a manifest with the space's config key.
pub fn decrypt_manifest(crypto: &dyn CryptoProvider, config: &SpaceKey, manifest: &SpaceManifest) -> Result<Space> {
    let private = hex::decode(&config.private_key)
        .map_err(|e| QuorumError::Crypto(format!("config key hex: {}", e)))?;
    let ephemeral = hex::decode(&manifest.ephemeral_public_key)
        .map_err(|e| QuorumError::Crypto(format!("manifest ephemeral key hex: {}", e)))?;
    let plaintext = crypto.decrypt_inbox_message(&private, &ephemeral, &manifest.space_manifest)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| QuorumError::Crypto(format!("parse space manifest: {}", e)))
}

/// Encrypt `space` to the config key and sign it with the owner key.
pub fn seal_manifest(
    crypto: &dyn CryptoProvider,
    space: &Space,
    config_public_hex: &str,
    owner: &Keypair,
    timestamp: i64,
) -> Result<SpaceManifest> {
    let ephemeral = crypto.generate_x448()?;
    seal_manifest_with(crypto, space, config_public_hex, owner, &ephemeral, timestamp)
}

/// [`seal_manifest`] under a caller-chosen ephemeral key. Invite evals
/// published alongside the manifest are sealed with the same key, since
/// joiners open them with the manifest's ephemeral public key.
pub fn seal_manifest_with(
    crypto: &dyn CryptoProvider,
    space: &Space,
    config_public_hex: &str,
    owner: &Keypair,
    ephemeral: &Keypair,
    timestamp: i64,
) -> Result<SpaceManifest> {
    let config_public = hex::decode(config_public_hex)
        .map_err(|e| QuorumError::Crypto(format!("config key hex: {}", e)))?;
    let space_manifest = crypto.encrypt_inbox_message(
        &config_public,
        &ephemeral.private_key,
        &serde_json::to_vec(space)?,
    )?;
    let signature = crypto.sign_ed448(
        &owner.private_key,
        &manifest_signed_bytes(&space_manifest, timestamp),
    )?;
    Ok(SpaceManifest {
        space_address: space.space_id.clone(),
        space_manifest,
        ephemeral_public_key: ephemeral.public_hex(),
        timestamp,
        owner_public_key: owner.public_hex(),
        owner_signature: hex::encode(signature),
    })
}

// ── Local effects ──────────────────────────────────────────────

/// History row for a membership event; the id doubles as the nonce so
/// replays land on the same row.
pub fn membership_row(kind: &str, subject: &str, space: &Space, sender: &str, now: i64) -> Message {
    let id = event_id(kind, subject);
    let content = SenderOnlyContent {
        sender_id: sender.to_string(),
    };
    let content = match kind {
        "join" => Content::Join(content),
        "leave" => Content::Leave(content),
        _ => Content::Kick(content),
    };
    Message::new(
        &space.space_id,
        &space.default_channel_id,
        id.clone(),
        id,
        now,
        content,
    )
}

/// Drop every local trace of a space: sessions, history, members, keys,
/// mutes and the space row itself.
pub async fn purge_space(store: &dyn MessageStore, space_id: &str) -> Result<()> {
    store
        .delete_encryption_states(&conversation_id(space_id))
        .await?;
    store.delete_space_messages(space_id).await?;
    for member in store.get_space_members(space_id).await? {
        store
            .delete_space_member(space_id, &member.user_address)
            .await?;
    }
    for key in store.get_space_keys(space_id).await? {
        store.delete_space_key(space_id, &key.key_id).await?;
    }
    for mute in store.get_mutes(space_id).await? {
        store.delete_mute(space_id, &mute.target_user_id).await?;
    }
    store.delete_space(space_id).await?;
    log::info!("Purged local state for space {}", space_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_envelope_shapes() {
        let raw = r#"{"type":"control","message":{"type":"sync-info","inboxAddress":"QmA","messageCount":3,"memberCount":2}}"#;
        match serde_json::from_str::<HubEnvelope>(raw).unwrap() {
            HubEnvelope::Control(ControlMessage::SyncInfo(info)) => {
                assert_eq!(info.inbox_address.as_deref(), Some("QmA"));
                assert_eq!(info.message_count, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }

        let raw = r#"{"type":"message","message":{"envelope":"x"}}"#;
        assert!(matches!(
            serde_json::from_str::<HubEnvelope>(raw).unwrap(),
            HubEnvelope::Message(_)
        ));
    }

    #[test]
    fn test_unknown_control_type_is_unsupported() {
        let raw = r#"{"type":"control","message":{"type":"sync-delta","isFinal":true}}"#;
        assert!(matches!(
            serde_json::from_str::<HubEnvelope>(raw).unwrap(),
            HubEnvelope::Control(ControlMessage::Unsupported)
        ));
    }

    #[test]
    fn test_leave_wire_fields_are_camel_case() {
        let leave = ControlMessage::Leave {
            inbox_public_key: "aa".into(),
            inbox_signature: "bb".into(),
        };
        let json = serde_json::to_value(&leave).unwrap();
        assert_eq!(json["type"], "leave");
        assert_eq!(json["inboxPublicKey"], "aa");
    }

    #[test]
    fn test_sync_initiate_range_coverage() {
        let parsed: SyncInitiate = serde_json::from_str(r#"{"inboxAddress":"QmA"}"#).unwrap();
        assert!(!parsed.covers(5));

        let ranged = SyncInitiate {
            oldest_message_timestamp: 10,
            latest_message_timestamp: 20,
            ..Default::default()
        };
        assert!(ranged.covers(10));
        assert!(ranged.covers(20));
        assert!(!ranged.covers(21));
    }

    #[test]
    fn test_participant_enters_peer_maps_as_base64() {
        let participant = Participant {
            id: 4,
            inbox_key: "0102".into(),
            identity_key: "03".into(),
            pre_key: "04".into(),
            ..Default::default()
        };
        let mut ratchet = TripleRatchet::default();
        add_participant(&mut ratchet, &participant).unwrap();
        assert_eq!(ratchet.peer_id_map.get("AQI="), Some(&4));
        assert_eq!(ratchet.peer(4).unwrap().identity_public_key, "Aw==");
    }

    #[test]
    fn test_membership_row_is_deterministic() {
        let space = Space {
            space_id: "QmS".into(),
            default_channel_id: "general".into(),
            ..Default::default()
        };
        let a = membership_row("join", "QmInbox", &space, "QmUser", 1);
        let b = membership_row("join", "QmInbox", &space, "QmUser", 2);
        assert_eq!(a.message_id, b.message_id);
        assert_eq!(a.nonce, a.message_id);
        assert_eq!(a.channel_id, "general");
        assert_eq!(a.content.type_tag(), "join");
    }
}
