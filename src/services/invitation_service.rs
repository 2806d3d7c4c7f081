//! Invite links.
//!
//! A one-time link carries everything needed to join in its fragment: the
//! config key, a ratchet template, one DKG share and the hub key. A public
//! link carries only the config key; the joiner claims a share from the
//! eval pool the owner published at the last rekey.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use url::Url;

use crate::crypto::digest::inbox_address;
use crate::crypto::dkg::fill_share;
use crate::crypto::provider::{CryptoProvider, Keypair, SpaceSession};
use crate::crypto::ratchet_state::{conversation_id, ConversationLocks, EncryptionState, TripleRatchet};
use crate::error::{QuorumError, Result};
use crate::services::api_client::{DirectoryApi, SpaceManifest};
use crate::services::config::InviteSettings;
use crate::services::hub::{hub_control, HubRelay};
use crate::services::message_service::MessageService;
use crate::services::message_store::MessageStore;
use crate::services::space_control::{ControlMessage, Participant};
use crate::services::space_service::{CreatedSpace, InviteEval, Rekeyed, SpaceService, INITIAL_SESSION_SHARES};
use crate::services::sync_service::SyncService;
use crate::services::transport::OutboundFrame;
use crate::services::types::{key_ids, Content, Identity, PostContent, Space, SpaceKey, SpaceMember};
use crate::services::user_config::UserConfigService;

const INVALID_LINK: &str = "invalid link";
const EXHAUSTED_LINK: &str = "This public invite link is no longer valid.";

/// Parameters carried in an invite link fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InviteParams {
    pub space_id: String,
    /// Hex X448 private config key.
    pub config_key: String,
    /// Hex of the template JSON; one-time links only.
    pub template: Option<String>,
    /// Hex DKG share; one-time links only.
    pub secret: Option<String>,
    /// Hex hub private key; one-time links only.
    pub hub_key: Option<String>,
}

impl InviteParams {
    /// Parse the fragment of an invite link. `spaceId` and `configKey` are
    /// required; empty values count as missing.
    pub fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link.trim()).map_err(|_| QuorumError::InvalidInvite(INVALID_LINK.into()))?;
        let fragment = url
            .fragment()
            .ok_or_else(|| QuorumError::InvalidInvite(INVALID_LINK.into()))?;

        let mut params = InviteParams::default();
        for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "spaceId" => params.space_id = value,
                "configKey" => params.config_key = value,
                "template" => params.template = Some(value),
                "secret" => params.secret = Some(value),
                "hubKey" => params.hub_key = Some(value),
                _ => {}
            }
        }
        if params.space_id.is_empty() || params.config_key.is_empty() {
            return Err(QuorumError::InvalidInvite(INVALID_LINK.into()));
        }
        Ok(params)
    }

    /// Whether the link carries its own share rather than relying on the pool.
    pub fn is_one_time(&self) -> bool {
        self.secret.is_some() && self.template.is_some() && self.hub_key.is_some()
    }
}

/// One-time link for `space_id`.
pub fn one_time_link(
    invites: &InviteSettings,
    space_id: &str,
    config_private_hex: &str,
    template_json: &str,
    secret_hex: &str,
    hub_private_hex: &str,
) -> String {
    format!(
        "{}#spaceId={}&configKey={}&template={}&secret={}&hubKey={}",
        invites.base(false),
        space_id,
        config_private_hex,
        hex::encode(template_json.as_bytes()),
        secret_hex,
        hub_private_hex
    )
}

fn decode_hex(label: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| QuorumError::InvalidInvite(format!("{} is not hex: {}", label, e)))
}

/// Share material a joiner ends up with, from the link or from the pool.
struct Claim {
    template: TripleRatchet,
    secret: Vec<u8>,
    hub_private: Vec<u8>,
}

pub struct InvitationServiceDeps {
    pub identity: Arc<Identity>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub store: Arc<dyn MessageStore>,
    pub api: Arc<dyn DirectoryApi>,
    pub hub: Arc<HubRelay>,
    pub locks: Arc<ConversationLocks>,
    pub user_config: Arc<UserConfigService>,
    pub messages: Arc<MessageService>,
    pub spaces: Arc<SpaceService>,
    pub sync: Arc<SyncService>,
    pub invites: InviteSettings,
}

pub struct InvitationService {
    identity: Arc<Identity>,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    api: Arc<dyn DirectoryApi>,
    hub: Arc<HubRelay>,
    locks: Arc<ConversationLocks>,
    user_config: Arc<UserConfigService>,
    messages: Arc<MessageService>,
    spaces: Arc<SpaceService>,
    sync: Arc<SyncService>,
    invites: InviteSettings,
}

impl InvitationService {
    pub fn new(deps: InvitationServiceDeps) -> Self {
        Self {
            identity: deps.identity,
            crypto: deps.crypto,
            store: deps.store,
            api: deps.api,
            hub: deps.hub,
            locks: deps.locks,
            user_config: deps.user_config,
            messages: deps.messages,
            spaces: deps.spaces,
            sync: deps.sync,
            invites: deps.invites,
        }
    }

    // ── Issuing ────────────────────────────────────────────────

    /// The space's public link if it has one, otherwise a one-time link that
    /// consumes a share from the local session.
    pub async fn construct_invite_link(&self, space_id: &str) -> Result<String> {
        let space = self
            .store
            .get_space(space_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(format!("space {}", space_id)))?;
        if !space.invite_url.is_empty() {
            return Ok(space.invite_url);
        }

        let config = self.hub.space_key(space_id, key_ids::CONFIG).await?;
        let hub_key = self.hub.space_key(space_id, key_ids::HUB).await?;

        let conversation = conversation_id(space_id);
        let _guard = self.locks.acquire(&conversation).await;
        let current = self
            .store
            .get_latest_state(&conversation)
            .await?
            .ok_or_else(|| QuorumError::Crypto(format!("no ratchet state for space {}", space_id)))?;
        let mut session = SpaceSession::parse(&current.state)?;
        let own = session.ratchet()?;
        let Some(mut template) = session.template.clone() else {
            return Err(QuorumError::PermissionDenied(
                "only the space owner can issue one-time invites".into(),
            ));
        };
        if session.evals.is_empty() {
            return Err(QuorumError::InvalidInvite("no invite shares left for this space".into()));
        }

        let mut dkg = template.dkg()?;
        dkg.id = (INITIAL_SESSION_SHARES + 1).saturating_sub(session.evals.len()) as u64;
        template.set_dkg(&dkg)?;
        template.root_key = own.root_key.clone();
        let secret = session.evals.remove(0);

        self.store
            .save_encryption_state(
                &EncryptionState {
                    state: session.to_json()?,
                    ..current
                },
                true,
            )
            .await?;
        log::info!("Issued one-time invite slot {} for {}", dkg.id, space_id);

        Ok(one_time_link(
            &self.invites,
            space_id,
            &config.private_key,
            &template.to_json()?,
            &hex::encode(secret),
            &hub_key.private_key,
        ))
    }

    /// DM an invite link for `space_id` to `address`.
    pub async fn send_invite_to_user(&self, address: &str, space_id: &str) -> Result<()> {
        let link = self.construct_invite_link(space_id).await?;
        self.messages
            .submit_message(
                address,
                Content::Post(PostContent {
                    sender_id: self.identity.user_address.clone(),
                    text: link.as_str().into(),
                    replies_to_message_id: None,
                }),
            )
            .await?;
        Ok(())
    }

    /// Rotate the config key and publish a fresh eval pool behind a new
    /// public link. Members keep access through the rekey.
    pub async fn generate_new_invite_link(&self, space_id: &str) -> Result<String> {
        let Rekeyed {
            invite_url,
            spare_shares,
            ..
        } = self.spaces.rekey(space_id, None).await?;
        log::info!("New public invite for {} backed by {} shares", space_id, spare_shares);
        Ok(invite_url)
    }

    // ── Joining ────────────────────────────────────────────────

    async fn manifest_and_space(&self, params: &InviteParams) -> Result<(SpaceManifest, Space)> {
        let manifest = self.api.get_space_manifest(&params.space_id).await?;
        let private = decode_hex("configKey", &params.config_key)?;
        let ephemeral = decode_hex("manifest ephemeral key", &manifest.ephemeral_public_key)?;
        let plaintext = self
            .crypto
            .decrypt_inbox_message(&private, &ephemeral, &manifest.space_manifest)
            .map_err(|_| QuorumError::InvalidInvite(INVALID_LINK.into()))?;
        let space: Space = serde_json::from_slice(&plaintext)
            .map_err(|e| QuorumError::InvalidInvite(format!("unreadable space manifest: {}", e)))?;
        Ok((manifest, space))
    }

    /// Validate a link and return the space it leads to.
    pub async fn process_invite_link(&self, link: &str) -> Result<Space> {
        let params = InviteParams::parse(link)?;
        let (_, space) = self.manifest_and_space(&params).await?;
        if space.invite_url.is_empty() && !params.is_one_time() {
            return Err(QuorumError::InvalidInvite(INVALID_LINK.into()));
        }
        Ok(space)
    }

    async fn claim(&self, params: &InviteParams, manifest: &SpaceManifest, space: &Space) -> Result<Claim> {
        if let (Some(template), Some(secret), Some(hub_key)) = (&params.template, &params.secret, &params.hub_key) {
            let template = String::from_utf8(decode_hex("template", template)?)
                .map_err(|_| QuorumError::InvalidInvite("template is not utf-8".into()))?;
            return Ok(Claim {
                template: TripleRatchet::parse(&template)?,
                secret: decode_hex("secret", secret)?,
                hub_private: decode_hex("hubKey", hub_key)?,
            });
        }
        if space.invite_url.is_empty() {
            return Err(QuorumError::InvalidInvite(INVALID_LINK.into()));
        }

        let config_private = decode_hex("configKey", &params.config_key)?;
        let config_public = self.crypto.get_pubkey_x448(&config_private)?;
        let ciphertext = match self.api.get_space_invite_eval(&hex::encode(&config_public)).await {
            Ok(ciphertext) => ciphertext,
            Err(e) if e.status() == Some(404) => {
                return Err(QuorumError::InvalidInvite(EXHAUSTED_LINK.into()))
            }
            Err(e) => return Err(e),
        };
        let ephemeral = decode_hex("manifest ephemeral key", &manifest.ephemeral_public_key)?;
        let plaintext = self
            .crypto
            .decrypt_inbox_message(&config_private, &ephemeral, &ciphertext)?;
        let eval: InviteEval = serde_json::from_slice(&plaintext)
            .map_err(|e| QuorumError::InvalidInvite(format!("unreadable invite eval: {}", e)))?;
        log::debug!("Claimed public invite slot {} for {}", eval.id, space.space_id);
        Ok(Claim {
            template: TripleRatchet::parse(&eval.template)?,
            secret: decode_hex("secret", &eval.secret)?,
            hub_private: decode_hex("hubKey", &eval.hub_key)?,
        })
    }

    /// Join the space behind `link`: install the claimed ratchet slot,
    /// register a fresh space inbox with the hub, announce ourselves and
    /// ask the members for history.
    pub async fn join_invite_link(&self, link: &str) -> Result<CreatedSpace> {
        let params = InviteParams::parse(link)?;
        let (manifest, space) = self.manifest_and_space(&params).await?;
        if self.store.get_space(&space.space_id).await?.is_some()
            && self.store.get_space_key(&space.space_id, key_ids::INBOX).await?.is_some()
        {
            return Err(QuorumError::Validation(format!("already a member of {}", space.space_id)));
        }
        let Claim {
            mut template,
            secret,
            hub_private,
        } = self.claim(&params, &manifest, &space).await?;

        let crypto = self.crypto.as_ref();
        let device = &self.identity.device_keyset;
        let inbox_pair = crypto.generate_ed448()?;
        let inbox = inbox_address(&inbox_pair.public_key);
        let hub_pair = Keypair {
            public_key: crypto.get_pubkey_ed448(&hub_private)?,
            private_key: hub_private,
        };
        let hub_address = inbox_address(&hub_pair.public_key);

        let mut dkg = template.dkg()?;
        dkg.total += 1;
        fill_share(crypto, &mut dkg, &secret)?;
        template.set_dkg(&dkg)?;
        template.next_dkg_ratchet = template.dkg_ratchet.clone();
        template.peer_key = Some(B64.encode(&device.inbox_keyset.inbox_encryption_key.private_key));
        template.ephemeral_private_key = Some(B64.encode(&crypto.generate_x448()?.private_key));

        let session = SpaceSession {
            state: template.to_json()?,
            ..Default::default()
        };
        let space_id = space.space_id.clone();
        let hub_key = SpaceKey {
            space_id: space_id.clone(),
            key_id: key_ids::HUB.to_string(),
            address: Some(hub_address),
            public_key: hub_pair.public_hex(),
            private_key: hub_pair.private_hex(),
        };
        self.api
            .post_hub_add(&hub_control(crypto, "add", &hub_key, &inbox_pair)?)
            .await?;

        // Nothing is persisted until the hub has accepted the inbox.
        self.store
            .save_encryption_state(
                &EncryptionState {
                    state: session.to_json()?,
                    timestamp: Utc::now().timestamp_millis(),
                    inbox_id: inbox.clone(),
                    conversation_id: conversation_id(&space_id),
                    sent_accept: None,
                },
                true,
            )
            .await?;

        let config_private = decode_hex("configKey", &params.config_key)?;
        for key in [
            hub_key,
            SpaceKey {
                space_id: space_id.clone(),
                key_id: key_ids::CONFIG.to_string(),
                address: None,
                public_key: hex::encode(crypto.get_pubkey_x448(&config_private)?),
                private_key: params.config_key.clone(),
            },
            SpaceKey {
                space_id: space_id.clone(),
                key_id: key_ids::INBOX.to_string(),
                address: Some(inbox.clone()),
                public_key: inbox_pair.public_hex(),
                private_key: inbox_pair.private_hex(),
            },
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
        self.user_config.add_space(&space_id).await?;
        self.hub.outbound().push(OutboundFrame::listen(&inbox)).await;

        let participant = self.participant(dkg.id, &inbox, &secret)?;
        self.hub
            .send_control(&space_id, &ControlMessage::Join { participant })
            .await?;

        if let Err(e) = self.sync.request_sync(&space_id).await {
            log::warn!("Sync request after joining {} failed: {}", space_id, e);
        }
        log::info!("Joined space {} in slot {}", space_id, dkg.id);
        Ok(CreatedSpace {
            space_id,
            channel_id: space.default_channel_id,
        })
    }

    /// Signed join announcement for ratchet slot `id`.
    fn participant(&self, id: u64, inbox: &str, secret: &[u8]) -> Result<Participant> {
        let device = &self.identity.device_keyset;
        let mut participant = Participant {
            address: self.identity.user_address.clone(),
            id,
            inbox_address: inbox.to_string(),
            inbox_pub_key: device.inbox_keyset.inbox_key.public_hex(),
            pub_key: hex::encode(self.crypto.get_pubkey_x448(secret)?),
            inbox_key: device.inbox_keyset.inbox_encryption_key.public_hex(),
            identity_key: device.identity_key.public_hex(),
            pre_key: device.pre_key.public_hex(),
            user_icon: self.identity.user_icon.clone().unwrap_or_default(),
            display_name: self.identity.display_name.clone(),
            signature: String::new(),
        };
        let signature = self
            .crypto
            .sign_ed448(&device.inbox_keyset.inbox_key.private_key, &participant.signed_bytes())?;
        participant.signature = hex::encode(signature);
        Ok(participant)
    }
}
