//! Contract with the external ratchet/crypto SDK.
//!
//! Every primitive (Ed448/X448, sealed boxes, double and triple ratchet)
//! lives behind [`CryptoProvider`]. The orchestration layer only moves the
//! resulting JSON shapes around.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{QuorumError, Result};

/// Opaque sealed envelope. Frames splice its fields next to the `type` tag.
pub type Envelope = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl Keypair {
    pub fn from_hex(public_hex: &str, private_hex: &str) -> Result<Self> {
        Ok(Self {
            public_key: hex::decode(public_hex)
                .map_err(|e| QuorumError::Crypto(format!("public key hex: {}", e)))?,
            private_key: hex::decode(private_hex)
                .map_err(|e| QuorumError::Crypto(format!("private key hex: {}", e)))?,
        })
    }

    pub fn public_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    pub fn private_hex(&self) -> String {
        hex::encode(&self.private_key)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxKeyset {
    pub inbox_address: String,
    /// Ed448 signing key for inbox operations.
    pub inbox_key: Keypair,
    /// X448 key envelopes are sealed to.
    pub inbox_encryption_key: Keypair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeyset {
    pub identity_key: Keypair,
    pub pre_key: Keypair,
    pub inbox_keyset: InboxKeyset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyset {
    pub user_key: Keypair,
    pub peer_key: Keypair,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxRegistration {
    pub inbox_address: String,
    /// Hex-encoded X448 public key.
    pub inbox_encryption_public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub identity_public_key: String,
    pub pre_public_key: String,
    pub inbox_registration: InboxRegistration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRegistration {
    pub user_address: String,
    pub user_public_key: String,
    pub peer_public_key: String,
    #[serde(default)]
    pub device_registrations: Vec<DeviceRegistration>,
    #[serde(default)]
    pub signature: String,
}

/// Return path of a double-ratchet session. An empty `inbox_public_key`
/// marks a sender session the peer has not confirmed yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendingInbox {
    pub inbox_address: String,
    #[serde(default)]
    pub inbox_encryption_key: String,
    #[serde(default)]
    pub inbox_public_key: String,
    #[serde(default)]
    pub inbox_private_key: String,
}

impl SendingInbox {
    pub fn is_unconfirmed(&self) -> bool {
        self.inbox_public_key.is_empty()
    }
}

/// Persisted double-ratchet state for one peer inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectSessionState {
    pub ratchet_state: String,
    pub receiving_inbox: InboxKeyset,
    pub tag: String,
    pub sending_inbox: SendingInbox,
}

/// One encrypted copy of an outbound DM plus the advanced session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMessageAndMetadata {
    pub ratchet_state: String,
    pub receiving_inbox: InboxKeyset,
    pub tag: String,
    pub sending_inbox: SendingInbox,
    #[serde(default)]
    pub sent_accept: bool,
    pub sealed_message: Envelope,
}

impl SealedMessageAndMetadata {
    pub fn session_state(&self) -> DirectSessionState {
        DirectSessionState {
            ratchet_state: self.ratchet_state.clone(),
            receiving_inbox: self.receiving_inbox.clone(),
            tag: self.tag.clone(),
            sending_inbox: self.sending_inbox.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub user_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_icon: Option<String>,
}

/// First-contact envelope opened with the device keyset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializationEnvelope {
    pub user_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_icon: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub sealed: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSession {
    pub user_address: String,
    pub state: String,
    pub tag: String,
    pub message: String,
    pub return_inbox_address: String,
    pub return_inbox_encryption_key: String,
    pub return_inbox_public_key: String,
    pub return_inbox_private_key: String,
}

/// Result of a double-ratchet decrypt or sender confirmation. The inbox
/// fields are only present when the peer rotated its return path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoubleRatchetDecryptResult {
    pub ratchet_state: String,
    pub message: String,
    #[serde(default)]
    pub receiving_inbox: Option<InboxKeyset>,
    #[serde(default)]
    pub sending_inbox: Option<SendingInbox>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub user_profile: Option<PeerProfile>,
}

/// Output of establishing a triple-ratchet session: the owner's ratchet,
/// a template for other peers and the unused DKG evaluation shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpaceSession {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<super::ratchet_state::TripleRatchet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleRatchetEncryptResult {
    pub ratchet_state: String,
    pub envelope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleRatchetDecryptResult {
    pub ratchet_state: String,
    pub message: Vec<u8>,
}

/// The SDK surface consumed by the services.
///
/// Key generation, signing and sealed-box helpers are synchronous; envelope
/// and ratchet operations may suspend.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    // ── Primitives ─────────────────────────────────────────────

    fn generate_ed448(&self) -> Result<Keypair>;
    fn generate_x448(&self) -> Result<Keypair>;
    fn get_pubkey_ed448(&self, private_key: &[u8]) -> Result<Vec<u8>>;
    fn get_pubkey_x448(&self, private_key: &[u8]) -> Result<Vec<u8>>;
    fn sign_ed448(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>>;
    fn verify_ed448(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool>;

    /// Sealed-box encrypt; returns the serialized ciphertext object.
    fn encrypt_inbox_message(
        &self,
        inbox_public_key: &[u8],
        ephemeral_private_key: &[u8],
        plaintext: &[u8],
    ) -> Result<String>;

    fn decrypt_inbox_message(
        &self,
        inbox_private_key: &[u8],
        ephemeral_public_key: &[u8],
        ciphertext: &str,
    ) -> Result<Vec<u8>>;

    /// DKG share check: does `point` belong to peer slot `index` of the ratchet?
    fn verify_point(&self, ratchet_state: &str, point: &str, index: u64) -> Result<bool>;

    // ── Envelopes ──────────────────────────────────────────────

    async fn seal_hub_envelope(
        &self,
        hub_address: &str,
        hub_key: &Keypair,
        message: &str,
    ) -> Result<Envelope>;

    async fn unseal_hub_envelope(&self, hub_key: &Keypair, envelope: &Envelope) -> Result<Vec<u8>>;

    /// Seal a message addressed to one inbox through the hub, signed by
    /// `signer_key` (owner or inbox key).
    async fn seal_sync_envelope(
        &self,
        inbox_address: &str,
        hub_address: &str,
        hub_key: &Keypair,
        signer_key: &Keypair,
        message: &str,
        config_key: Option<&Keypair>,
    ) -> Result<Envelope>;

    async fn seal_inbox_envelope(&self, recipient_public_key: &str, message: &str)
        -> Result<Envelope>;

    async fn unseal_inbox_envelope(&self, private_key: &[u8], envelope: &Envelope)
        -> Result<Vec<u8>>;

    fn unseal_initialization_envelope(
        &self,
        device: &DeviceKeyset,
        envelope: &Envelope,
    ) -> Result<InitializationEnvelope>;

    // ── Double ratchet ─────────────────────────────────────────

    async fn new_double_ratchet_sender_session(
        &self,
        device: &DeviceKeyset,
        self_address: &str,
        target: &DeviceRegistration,
        message: &str,
        display_name: &str,
        user_icon: Option<&str>,
    ) -> Result<Vec<SealedMessageAndMetadata>>;

    async fn confirm_double_ratchet_sender_session(
        &self,
        state: &DirectSessionState,
        envelope: &Envelope,
    ) -> Result<DoubleRatchetDecryptResult>;

    async fn new_double_ratchet_recipient_session(
        &self,
        device: &DeviceKeyset,
        envelope: &InitializationEnvelope,
    ) -> Result<RecipientSession>;

    fn double_ratchet_inbox_encrypt(
        &self,
        device: &DeviceKeyset,
        states: &[DirectSessionState],
        message: &str,
        self_registration: &UserRegistration,
        display_name: &str,
        user_icon: Option<&str>,
    ) -> Result<Vec<SealedMessageAndMetadata>>;

    /// Re-send the sender-init payload for a session the peer never confirmed.
    fn double_ratchet_inbox_encrypt_force_sender_init(
        &self,
        device: &DeviceKeyset,
        states: &[DirectSessionState],
        message: &str,
        self_registration: &UserRegistration,
        display_name: &str,
        user_icon: Option<&str>,
    ) -> Result<Vec<SealedMessageAndMetadata>>;

    async fn double_ratchet_inbox_decrypt(
        &self,
        state: &DirectSessionState,
        envelope: &Envelope,
    ) -> Result<DoubleRatchetDecryptResult>;

    async fn new_inbox_keyset(&self) -> Result<InboxKeyset>;

    // ── Triple ratchet ─────────────────────────────────────────

    async fn establish_triple_ratchet_session_for_space(
        &self,
        user: &UserKeyset,
        device: &DeviceKeyset,
        registration: &UserRegistration,
        total: usize,
    ) -> Result<SpaceSession>;

    fn triple_ratchet_encrypt(
        &self,
        ratchet_state: &str,
        message: &[u8],
    ) -> Result<TripleRatchetEncryptResult>;

    async fn triple_ratchet_decrypt(
        &self,
        ratchet_state: &str,
        envelope: &str,
    ) -> Result<TripleRatchetDecryptResult>;
}

/// The signed wrapper around sync/control envelopes, as seen by the receiver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExteriorEnvelope {
    #[serde(default)]
    pub envelope: String,
    #[serde(default)]
    pub owner_public_key: String,
    #[serde(default)]
    pub owner_signature: String,
}

impl ExteriorEnvelope {
    /// Verify the exterior signature over the inner envelope bytes.
    pub fn verify(&self, crypto: &dyn CryptoProvider) -> bool {
        let (Ok(pk), Ok(sig)) = (
            hex::decode(&self.owner_public_key),
            hex::decode(&self.owner_signature),
        ) else {
            return false;
        };
        crypto
            .verify_ed448(&pk, self.envelope.as_bytes(), &sig)
            .unwrap_or(false)
    }
}
