// Shared harness for the integration tests: a transparent crypto provider,
// an in-memory directory and helpers to route frames between clients.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use quorum_core::crypto::digest::{inbox_address, sha256};
use quorum_core::crypto::provider::*;
use quorum_core::crypto::ratchet_state::{DkgRatchet, PeerEntry, TripleRatchet};
use quorum_core::services::api_client::*;
use quorum_core::services::config::AppConfig;
use quorum_core::services::message_store::{MemoryStore, MessageStore};
use quorum_core::services::transport::OutboundFrame;
use quorum_core::services::space_service::CreatedSpace;
use quorum_core::services::types::{key_ids, Content, EncryptedMessage, Identity, PostContent};
use quorum_core::{AppState, QuorumError, Result};

/// Cap on evals minted per session; the real SDK mints one per share.
const MAX_EVALS: usize = 16;

// ── Crypto ─────────────────────────────────────────────────────

/// Deterministic stand-in for the ratchet SDK. Nothing is hidden, but every
/// key check the real primitives make is enforced: envelopes only open
/// under the key they were sealed to and signatures only verify under the
/// signer's public key.
#[derive(Default)]
pub struct FakeCrypto;

fn public_of(private_key: &[u8]) -> Vec<u8> {
    let mut preimage = b"pub".to_vec();
    preimage.extend_from_slice(private_key);
    sha256(&preimage).to_vec()
}

fn signature(public_key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut preimage = public_key.to_vec();
    preimage.extend_from_slice(message);
    sha256(&preimage).to_vec()
}

fn field<'a>(envelope: &'a Envelope, name: &str) -> Result<&'a str> {
    envelope
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| QuorumError::Crypto(format!("envelope has no {}", name)))
}

fn opt_field(envelope: &Envelope, name: &str) -> Option<String> {
    envelope.get(name).and_then(Value::as_str).map(str::to_string)
}

fn to_envelope(value: Value) -> Envelope {
    match value {
        Value::Object(map) => map,
        _ => Envelope::new(),
    }
}

impl FakeCrypto {
    pub fn keypair(&self) -> Keypair {
        let private_key = rand::random::<[u8; 32]>().to_vec();
        Keypair {
            public_key: public_of(&private_key),
            private_key,
        }
    }

    pub fn inbox_keyset(&self) -> InboxKeyset {
        let inbox_key = self.keypair();
        InboxKeyset {
            inbox_address: inbox_address(&inbox_key.public_key),
            inbox_key,
            inbox_encryption_key: self.keypair(),
        }
    }

    /// First-contact envelope to `target_inbox`, returning via `receiving`.
    fn init_envelope(
        &self,
        device: &DeviceKeyset,
        self_address: &str,
        target_inbox: &str,
        receiving: &InboxKeyset,
        message: &str,
        display_name: &str,
        user_icon: Option<&str>,
    ) -> Envelope {
        to_envelope(json!({
            "kind": "init",
            "inbox_address": target_inbox,
            "user_address": self_address,
            "display_name": display_name,
            "user_icon": user_icon,
            "tag": device.inbox_keyset.inbox_address,
            "return_inbox_address": receiving.inbox_address,
            "return_inbox_encryption_key": receiving.inbox_encryption_key.public_hex(),
            "return_inbox_public_key": receiving.inbox_key.public_hex(),
            "return_inbox_private_key": receiving.inbox_key.private_hex(),
            "message": message,
        }))
    }
}

#[async_trait]
impl CryptoProvider for FakeCrypto {
    fn generate_ed448(&self) -> Result<Keypair> {
        Ok(self.keypair())
    }

    fn generate_x448(&self) -> Result<Keypair> {
        Ok(self.keypair())
    }

    fn get_pubkey_ed448(&self, private_key: &[u8]) -> Result<Vec<u8>> {
        Ok(public_of(private_key))
    }

    fn get_pubkey_x448(&self, private_key: &[u8]) -> Result<Vec<u8>> {
        Ok(public_of(private_key))
    }

    fn sign_ed448(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        Ok(signature(&public_of(private_key), message))
    }

    fn verify_ed448(&self, public_key: &[u8], message: &[u8], sig: &[u8]) -> Result<bool> {
        Ok(signature(public_key, message) == sig)
    }

    fn encrypt_inbox_message(
        &self,
        inbox_public_key: &[u8],
        ephemeral_private_key: &[u8],
        plaintext: &[u8],
    ) -> Result<String> {
        Ok(json!({
            "to": hex::encode(inbox_public_key),
            "from": hex::encode(public_of(ephemeral_private_key)),
            "pt": hex::encode(plaintext),
        })
        .to_string())
    }

    fn decrypt_inbox_message(
        &self,
        inbox_private_key: &[u8],
        ephemeral_public_key: &[u8],
        ciphertext: &str,
    ) -> Result<Vec<u8>> {
        let sealed: Envelope = serde_json::from_str(ciphertext)?;
        if field(&sealed, "to")? != hex::encode(public_of(inbox_private_key))
            || field(&sealed, "from")? != hex::encode(ephemeral_public_key)
        {
            return Err(QuorumError::Crypto("inbox message sealed to another key".into()));
        }
        hex::decode(field(&sealed, "pt")?).map_err(|e| QuorumError::Crypto(e.to_string()))
    }

    fn verify_point(&self, _ratchet_state: &str, _point: &str, _index: u64) -> Result<bool> {
        Ok(true)
    }

    async fn seal_hub_envelope(&self, hub_address: &str, hub_key: &Keypair, message: &str) -> Result<Envelope> {
        Ok(to_envelope(json!({
            "hub_address": hub_address,
            "hub_public_key": hub_key.public_hex(),
            "message": message,
        })))
    }

    async fn unseal_hub_envelope(&self, hub_key: &Keypair, envelope: &Envelope) -> Result<Vec<u8>> {
        if field(envelope, "hub_public_key")? != hub_key.public_hex() {
            return Err(QuorumError::Crypto("hub envelope for another hub".into()));
        }
        Ok(field(envelope, "message")?.as_bytes().to_vec())
    }

    async fn seal_sync_envelope(
        &self,
        inbox_address: &str,
        hub_address: &str,
        hub_key: &Keypair,
        signer_key: &Keypair,
        message: &str,
        config_key: Option<&Keypair>,
    ) -> Result<Envelope> {
        let sig = self.sign_ed448(&signer_key.private_key, message.as_bytes())?;
        Ok(to_envelope(json!({
            "inbox_address": inbox_address,
            "hub_address": hub_address,
            "hub_public_key": hub_key.public_hex(),
            "message": message,
            "envelope": message,
            "owner_public_key": signer_key.public_hex(),
            "owner_signature": hex::encode(sig),
            "config_public_key": config_key.map(Keypair::public_hex),
        })))
    }

    async fn seal_inbox_envelope(&self, recipient_public_key: &str, message: &str) -> Result<Envelope> {
        Ok(to_envelope(json!({ "to": recipient_public_key, "message": message })))
    }

    async fn unseal_inbox_envelope(&self, private_key: &[u8], envelope: &Envelope) -> Result<Vec<u8>> {
        if field(envelope, "to")? != B64.encode(public_of(private_key)) {
            return Err(QuorumError::Crypto("inbox envelope sealed to another key".into()));
        }
        Ok(field(envelope, "message")?.as_bytes().to_vec())
    }

    fn unseal_initialization_envelope(&self, device: &DeviceKeyset, envelope: &Envelope) -> Result<InitializationEnvelope> {
        if field(envelope, "kind")? != "init" || field(envelope, "inbox_address")? != device.inbox_keyset.inbox_address {
            return Err(QuorumError::Crypto("not an initialization envelope for this device".into()));
        }
        Ok(InitializationEnvelope {
            user_address: field(envelope, "user_address")?.to_string(),
            display_name: opt_field(envelope, "display_name"),
            user_icon: opt_field(envelope, "user_icon"),
            timestamp: 0,
            sealed: envelope.clone(),
        })
    }

    async fn new_double_ratchet_sender_session(
        &self,
        device: &DeviceKeyset,
        self_address: &str,
        target: &DeviceRegistration,
        message: &str,
        display_name: &str,
        user_icon: Option<&str>,
    ) -> Result<Vec<SealedMessageAndMetadata>> {
        let receiving = self.inbox_keyset();
        let target_inbox = target.inbox_registration.inbox_address.clone();
        let sealed_message =
            self.init_envelope(device, self_address, &target_inbox, &receiving, message, display_name, user_icon);
        Ok(vec![SealedMessageAndMetadata {
            ratchet_state: json!({ "sent": 1 }).to_string(),
            receiving_inbox: receiving,
            tag: target_inbox.clone(),
            sending_inbox: SendingInbox {
                inbox_address: target_inbox,
                ..Default::default()
            },
            sent_accept: false,
            sealed_message,
        }])
    }

    async fn confirm_double_ratchet_sender_session(
        &self,
        state: &DirectSessionState,
        envelope: &Envelope,
    ) -> Result<DoubleRatchetDecryptResult> {
        let mut result = self.double_ratchet_inbox_decrypt(state, envelope).await?;
        result.sending_inbox = Some(SendingInbox {
            inbox_address: field(envelope, "reply_inbox")?.to_string(),
            inbox_encryption_key: field(envelope, "reply_encryption_key")?.to_string(),
            inbox_public_key: field(envelope, "reply_public_key")?.to_string(),
            inbox_private_key: String::new(),
        });
        result.user_profile = Some(PeerProfile {
            user_address: field(envelope, "user_address")?.to_string(),
            display_name: opt_field(envelope, "display_name"),
            user_icon: None,
        });
        Ok(result)
    }

    async fn new_double_ratchet_recipient_session(
        &self,
        _device: &DeviceKeyset,
        envelope: &InitializationEnvelope,
    ) -> Result<RecipientSession> {
        let sealed = &envelope.sealed;
        Ok(RecipientSession {
            user_address: envelope.user_address.clone(),
            state: json!({ "received": 1 }).to_string(),
            tag: field(sealed, "tag")?.to_string(),
            message: field(sealed, "message")?.to_string(),
            return_inbox_address: field(sealed, "return_inbox_address")?.to_string(),
            return_inbox_encryption_key: field(sealed, "return_inbox_encryption_key")?.to_string(),
            return_inbox_public_key: field(sealed, "return_inbox_public_key")?.to_string(),
            return_inbox_private_key: field(sealed, "return_inbox_private_key")?.to_string(),
        })
    }

    fn double_ratchet_inbox_encrypt(
        &self,
        _device: &DeviceKeyset,
        states: &[DirectSessionState],
        message: &str,
        self_registration: &UserRegistration,
        display_name: &str,
        _user_icon: Option<&str>,
    ) -> Result<Vec<SealedMessageAndMetadata>> {
        Ok(states
            .iter()
            .map(|state| SealedMessageAndMetadata {
                ratchet_state: state.ratchet_state.clone(),
                receiving_inbox: state.receiving_inbox.clone(),
                tag: state.tag.clone(),
                sending_inbox: state.sending_inbox.clone(),
                sent_accept: true,
                sealed_message: to_envelope(json!({
                    "kind": "message",
                    "inbox_address": state.sending_inbox.inbox_address,
                    "user_address": self_registration.user_address,
                    "display_name": display_name,
                    "reply_inbox": state.receiving_inbox.inbox_address,
                    "reply_encryption_key": state.receiving_inbox.inbox_encryption_key.public_hex(),
                    "reply_public_key": state.receiving_inbox.inbox_key.public_hex(),
                    "message": message,
                })),
            })
            .collect())
    }

    fn double_ratchet_inbox_encrypt_force_sender_init(
        &self,
        device: &DeviceKeyset,
        states: &[DirectSessionState],
        message: &str,
        self_registration: &UserRegistration,
        display_name: &str,
        user_icon: Option<&str>,
    ) -> Result<Vec<SealedMessageAndMetadata>> {
        Ok(states
            .iter()
            .map(|state| SealedMessageAndMetadata {
                ratchet_state: state.ratchet_state.clone(),
                receiving_inbox: state.receiving_inbox.clone(),
                tag: state.tag.clone(),
                sending_inbox: state.sending_inbox.clone(),
                sent_accept: false,
                sealed_message: self.init_envelope(
                    device,
                    &self_registration.user_address,
                    &state.tag,
                    &state.receiving_inbox,
                    message,
                    display_name,
                    user_icon,
                ),
            })
            .collect())
    }

    async fn double_ratchet_inbox_decrypt(
        &self,
        state: &DirectSessionState,
        envelope: &Envelope,
    ) -> Result<DoubleRatchetDecryptResult> {
        if field(envelope, "inbox_address")? != state.receiving_inbox.inbox_address {
            return Err(QuorumError::Crypto("message for another inbox".into()));
        }
        Ok(DoubleRatchetDecryptResult {
            ratchet_state: state.ratchet_state.clone(),
            message: field(envelope, "message")?.to_string(),
            receiving_inbox: None,
            sending_inbox: None,
            tag: None,
            user_profile: None,
        })
    }

    async fn new_inbox_keyset(&self) -> Result<InboxKeyset> {
        Ok(self.inbox_keyset())
    }

    async fn establish_triple_ratchet_session_for_space(
        &self,
        _user: &UserKeyset,
        device: &DeviceKeyset,
        _registration: &UserRegistration,
        total: usize,
    ) -> Result<SpaceSession> {
        let root = json!(hex::encode(rand::random::<[u8; 16]>()));
        let mut state = TripleRatchet {
            root_key: Some(root.clone()),
            ..Default::default()
        };
        state.insert_peer(
            1,
            PeerEntry {
                public_key: B64.encode(&device.inbox_keyset.inbox_encryption_key.public_key),
                identity_public_key: B64.encode(&device.identity_key.public_key),
                signed_pre_public_key: B64.encode(&device.pre_key.public_key),
            },
        );
        state.set_dkg(&DkgRatchet {
            id: 1,
            total: total as u64 + 1,
            ..Default::default()
        })?;
        let mut template = TripleRatchet {
            root_key: Some(root),
            ..Default::default()
        };
        template.set_dkg(&DkgRatchet {
            total: total as u64 + 1,
            ..Default::default()
        })?;
        Ok(SpaceSession {
            state: state.to_json()?,
            template: Some(template),
            evals: (0..total.min(MAX_EVALS))
                .map(|_| rand::random::<[u8; 32]>().to_vec())
                .collect(),
        })
    }

    fn triple_ratchet_encrypt(&self, ratchet_state: &str, message: &[u8]) -> Result<TripleRatchetEncryptResult> {
        Ok(TripleRatchetEncryptResult {
            ratchet_state: ratchet_state.to_string(),
            envelope: json!({ "pt": hex::encode(message) }).to_string(),
        })
    }

    async fn triple_ratchet_decrypt(&self, ratchet_state: &str, envelope: &str) -> Result<TripleRatchetDecryptResult> {
        let sealed: Envelope = serde_json::from_str(envelope)?;
        Ok(TripleRatchetDecryptResult {
            ratchet_state: ratchet_state.to_string(),
            message: hex::decode(field(&sealed, "pt")?).map_err(|e| QuorumError::Crypto(e.to_string()))?,
        })
    }
}

// ── Directory ──────────────────────────────────────────────────

#[derive(Default)]
pub struct DirectoryState {
    pub users: HashMap<String, UserRegistration>,
    pub settings: HashMap<String, UserConfigPayload>,
    pub spaces: HashMap<String, SpaceRegistration>,
    pub manifests: HashMap<String, SpaceManifest>,
    pub evals: HashMap<String, VecDeque<String>>,
    pub hub_adds: Vec<HubControlMessage>,
    pub hub_deletes: Vec<HubControlMessage>,
    pub inbox_deletes: Vec<DeleteMessages>,
    /// Hub registrations to refuse before accepting again.
    pub refuse_hub_adds: usize,
}

/// Directory shared by every client in a test.
#[derive(Default)]
pub struct FakeDirectory {
    pub state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    pub fn with<T>(&self, f: impl FnOnce(&mut DirectoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn register(&self, registration: &UserRegistration) {
        self.with(|s| {
            s.users
                .insert(registration.user_address.clone(), registration.clone())
        });
    }

    pub fn remaining_evals(&self, config_public_hex: &str) -> usize {
        self.with(|s| s.evals.get(config_public_hex).map_or(0, VecDeque::len))
    }
}

fn missing(what: &str) -> QuorumError {
    QuorumError::Api {
        status: 404,
        message: format!("{} not found", what),
    }
}

#[async_trait]
impl DirectoryApi for FakeDirectory {
    async fn get_user(&self, address: &str) -> Result<UserRegistration> {
        self.with(|s| s.users.get(address).cloned())
            .ok_or_else(|| missing(address))
    }

    async fn get_user_settings(&self, address: &str) -> Result<Option<UserConfigPayload>> {
        Ok(self.with(|s| s.settings.get(address).cloned()))
    }

    async fn post_user_settings(&self, address: &str, payload: &UserConfigPayload) -> Result<()> {
        self.with(|s| s.settings.insert(address.to_string(), payload.clone()));
        Ok(())
    }

    async fn get_space(&self, address: &str) -> Result<SpaceRegistration> {
        self.with(|s| s.spaces.get(address).cloned())
            .ok_or_else(|| missing(address))
    }

    async fn post_space(&self, address: &str, registration: &SpaceRegistration) -> Result<()> {
        self.with(|s| s.spaces.insert(address.to_string(), registration.clone()));
        Ok(())
    }

    async fn get_space_manifest(&self, address: &str) -> Result<SpaceManifest> {
        self.with(|s| s.manifests.get(address).cloned())
            .ok_or_else(|| missing(address))
    }

    async fn post_space_manifest(&self, address: &str, manifest: &SpaceManifest) -> Result<()> {
        self.with(|s| s.manifests.insert(address.to_string(), manifest.clone()));
        Ok(())
    }

    async fn post_hub_add(&self, message: &HubControlMessage) -> Result<()> {
        self.with(|s| {
            if s.refuse_hub_adds > 0 {
                s.refuse_hub_adds -= 1;
                return Err(QuorumError::Api {
                    status: 503,
                    message: "hub unavailable".into(),
                });
            }
            s.hub_adds.push(message.clone());
            Ok(())
        })
    }

    async fn post_hub_delete(&self, message: &HubControlMessage) -> Result<()> {
        self.with(|s| s.hub_deletes.push(message.clone()));
        Ok(())
    }

    async fn post_space_invite_evals(&self, evals: &SpaceInviteEvals) -> Result<()> {
        self.with(|s| {
            s.evals
                .entry(evals.config_public_key.clone())
                .or_default()
                .extend(evals.space_evals.iter().cloned())
        });
        Ok(())
    }

    async fn get_space_invite_eval(&self, config_public_key_hex: &str) -> Result<String> {
        self.with(|s| {
            s.evals
                .get_mut(config_public_key_hex)
                .and_then(VecDeque::pop_front)
        })
        .ok_or_else(|| missing("invite eval"))
    }

    async fn get_inbox(&self, _address: &str) -> Result<Vec<EncryptedMessage>> {
        Ok(Vec::new())
    }

    async fn delete_inbox(&self, messages: &DeleteMessages) -> Result<()> {
        self.with(|s| s.inbox_deletes.push(messages.clone()));
        Ok(())
    }
}

// ── Clients ────────────────────────────────────────────────────

pub fn identity(crypto: &FakeCrypto, display_name: &str) -> Identity {
    let user_key = crypto.keypair();
    let device = DeviceKeyset {
        identity_key: crypto.keypair(),
        pre_key: crypto.keypair(),
        inbox_keyset: crypto.inbox_keyset(),
    };
    let user_address = inbox_address(&user_key.public_key);
    let registration = UserRegistration {
        user_address: user_address.clone(),
        user_public_key: user_key.public_hex(),
        peer_public_key: String::new(),
        device_registrations: vec![DeviceRegistration {
            identity_public_key: device.identity_key.public_hex(),
            pre_public_key: device.pre_key.public_hex(),
            inbox_registration: InboxRegistration {
                inbox_address: device.inbox_keyset.inbox_address.clone(),
                inbox_encryption_public_key: device.inbox_keyset.inbox_encryption_key.public_hex(),
            },
        }],
        signature: String::new(),
    };
    Identity {
        user_address,
        user_keyset: UserKeyset {
            user_key,
            peer_key: crypto.keypair(),
        },
        device_keyset: device,
        registration,
        display_name: display_name.to_string(),
        user_icon: None,
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.sync.public_invite_spares = 3;
    // Keep sync timers from firing while a test runs.
    config.sync.request_expiry_ms = 600_000;
    config.sync.candidate_settle_ms = 600_000;
    config
}

/// A signed-in client over an in-memory store and the shared directory.
pub async fn client(directory: &Arc<FakeDirectory>, display_name: &str) -> AppState {
    let crypto = FakeCrypto;
    let identity = identity(&crypto, display_name);
    directory.register(&identity.registration);
    let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
    let api: Arc<dyn DirectoryApi> = directory.clone();
    AppState::build(test_config(), identity, Arc::new(FakeCrypto), store, api, None).await
}

/// Every frame the client has queued so far, emptying the queue.
pub async fn drain(state: &AppState) -> Vec<OutboundFrame> {
    let frames = state.outbound.pending().await;
    let sink = NullSink;
    state.outbound.flush(&sink).await.unwrap();
    frames
}

struct NullSink;

#[async_trait]
impl quorum_core::services::transport::FrameSink for NullSink {
    async fn send(&self, _line: String) -> Result<()> {
        Ok(())
    }
}

/// Sealed envelopes of the given kind (`group`, `sync`, `direct`).
pub fn envelopes(frames: &[OutboundFrame], kind: &str) -> Vec<Envelope> {
    frames
        .iter()
        .filter(|f| f.kind() == kind)
        .filter_map(|f| match f {
            OutboundFrame::Group(e) | OutboundFrame::Sync(e) | OutboundFrame::Direct(e) => Some(e.clone()),
            OutboundFrame::Listen { .. } => None,
        })
        .collect()
}

/// Deliver `envelope` to `state` as if the hub pushed it to `inbox`.
pub async fn deliver(state: &AppState, inbox: &str, envelope: &Envelope, timestamp: i64) {
    state
        .messages
        .handle_new_message(EncryptedMessage {
            inbox_address: inbox.to_string(),
            encrypted_content: serde_json::to_string(envelope).unwrap(),
            timestamp,
        })
        .await
        .unwrap();
}

/// Hub control payload carried by a group or sync envelope.
pub fn control_type(envelope: &Envelope) -> Option<String> {
    let body: Value = serde_json::from_str(envelope.get("message")?.as_str()?).ok()?;
    if body["type"] != "control" {
        return None;
    }
    body["message"]["type"].as_str().map(str::to_string)
}

// ── Spaces ─────────────────────────────────────────────────────

pub fn post(text: &str) -> Content {
    Content::Post(PostContent {
        sender_id: String::new(),
        text: text.into(),
        replies_to_message_id: None,
    })
}

pub async fn space_inbox(state: &AppState, space_id: &str) -> String {
    state
        .store
        .get_space_key(space_id, key_ids::INBOX)
        .await
        .unwrap()
        .and_then(|k| k.address)
        .unwrap()
}

pub async fn owned_space(owner: &AppState) -> CreatedSpace {
    let created = owner
        .spaces
        .create_space("Test Space", "", false, false)
        .await
        .unwrap();
    drain(owner).await;
    created
}

/// Join through the space's current public link and let the owner see
/// the announcement.
pub async fn join_space(owner: &AppState, member: &AppState, space_id: &str) {
    let link = owner.store.get_space(space_id).await.unwrap().unwrap().invite_url;
    member.invitations.join_invite_link(&link).await.unwrap();

    let frames = drain(member).await;
    let join = envelopes(&frames, "group")
        .into_iter()
        .find(|e| control_type(e).as_deref() == Some("join"))
        .expect("join announcement");
    let owner_inbox = space_inbox(owner, space_id).await;
    deliver(owner, &owner_inbox, &join, 1).await;
    drain(owner).await;
}

/// Owner plus a member who joined through the public link.
pub async fn joined_pair(directory: &Arc<FakeDirectory>) -> (AppState, AppState, CreatedSpace) {
    let owner = client(directory, "Owner").await;
    let joiner = client(directory, "Joiner").await;
    let created = owned_space(&owner).await;

    owner
        .invitations
        .generate_new_invite_link(&created.space_id)
        .await
        .unwrap();
    join_space(&owner, &joiner, &created.space_id).await;
    (owner, joiner, created)
}
