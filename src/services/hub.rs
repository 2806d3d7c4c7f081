//! Everything that leaves through a space hub.
//!
//! Space traffic is sealed with the space's hub key and pushed as `group`
//! frames; directed sync traffic goes out as `sync` frames addressed to one
//! inbox. Services that need to talk to a space share one [`HubRelay`].

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::crypto::provider::{CryptoProvider, Keypair, SpaceSession};
use crate::crypto::ratchet_state::{conversation_id, ConversationLocks, EncryptionState};
use crate::error::{QuorumError, Result};
use crate::services::api_client::HubControlMessage;
use crate::services::message_store::MessageStore;
use crate::services::transport::{OutboundFrame, OutboundQueue};
use crate::services::types::{key_ids, Message, SpaceKey};

/// How [`HubRelay::encrypt_and_send_to_space`] treats the message and state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Drop `sendStatus`/`sendError` before encrypting (retries).
    pub strip_ephemeral: bool,
    /// Persist the advanced ratchet only once the frame is queued.
    pub save_state_after_send: bool,
}

#[derive(Serialize)]
struct HubPayload<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: &'a T,
}

pub fn keypair(key: &SpaceKey) -> Result<Keypair> {
    Keypair::from_hex(&key.public_key, &key.private_key)
}

/// Hub membership change (`add` or `delete`) for `inbox`, countersigned by
/// the hub key and the inbox key over each other's public key.
pub fn hub_control(
    crypto: &dyn CryptoProvider,
    op: &str,
    hub: &SpaceKey,
    inbox: &Keypair,
) -> Result<HubControlMessage> {
    let hub_pair = keypair(hub)?;
    let hub_signature = crypto.sign_ed448(
        &hub_pair.private_key,
        format!("{}{}", op, inbox.public_hex()).as_bytes(),
    )?;
    let inbox_signature = crypto.sign_ed448(
        &inbox.private_key,
        format!("{}{}", op, hub.public_key).as_bytes(),
    )?;
    Ok(HubControlMessage {
        hub_address: hub.address.clone().unwrap_or_default(),
        hub_public_key: hub.public_key.clone(),
        hub_signature: hex::encode(hub_signature),
        inbox_public_key: inbox.public_hex(),
        inbox_signature: hex::encode(inbox_signature),
    })
}

pub struct HubRelay {
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    outbound: Arc<OutboundQueue>,
    locks: Arc<ConversationLocks>,
}

impl HubRelay {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn MessageStore>,
        outbound: Arc<OutboundQueue>,
        locks: Arc<ConversationLocks>,
    ) -> Self {
        Self {
            crypto,
            store,
            outbound,
            locks,
        }
    }

    pub async fn space_key(&self, space_id: &str, key_id: &str) -> Result<SpaceKey> {
        self.store
            .get_space_key(space_id, key_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(format!("{} key for space {}", key_id, space_id)))
    }

    pub async fn space_keypair(&self, space_id: &str, key_id: &str) -> Result<Keypair> {
        keypair(&self.space_key(space_id, key_id).await?)
    }

    /// Seal `message` with the hub key and queue it as a `group` frame.
    pub async fn send_hub_message(&self, space_id: &str, message: &str) -> Result<()> {
        let hub = self.space_key(space_id, key_ids::HUB).await?;
        let hub_address = hub.address.clone().unwrap_or_default();
        let envelope = self
            .crypto
            .seal_hub_envelope(&hub_address, &keypair(&hub)?, message)
            .await?;
        self.outbound.push(OutboundFrame::Group(envelope)).await;
        Ok(())
    }

    /// Broadcast a control message (`{type: "control", message}`).
    pub async fn send_control<T: Serialize + Sync>(&self, space_id: &str, control: &T) -> Result<()> {
        let body = serde_json::to_string(&HubPayload {
            kind: "control",
            message: control,
        })?;
        self.send_hub_message(space_id, &body).await
    }

    /// Triple-ratchet encrypt `message` under the space session and relay it.
    ///
    /// The session lock is held from read to write so concurrent senders
    /// never fork the ratchet.
    pub async fn encrypt_and_send_to_space(
        &self,
        space_id: &str,
        message: &Message,
        options: SendOptions,
    ) -> Result<()> {
        let conversation = conversation_id(space_id);
        let _guard = self.locks.acquire(&conversation).await;

        let current = self
            .store
            .get_latest_state(&conversation)
            .await?
            .ok_or_else(|| QuorumError::Crypto(format!("no ratchet state for space {}", space_id)))?;
        let mut session = SpaceSession::parse(&current.state)?;

        let plaintext = if options.strip_ephemeral {
            serde_json::to_vec(&message.without_ephemeral())?
        } else {
            serde_json::to_vec(message)?
        };
        let result = self.crypto.triple_ratchet_encrypt(&session.state, &plaintext)?;
        session.state = result.ratchet_state;

        let inbox_id = self
            .store
            .get_space_key(space_id, key_ids::INBOX)
            .await?
            .and_then(|k| k.address)
            .unwrap_or_else(|| current.inbox_id.clone());
        let next = EncryptionState {
            state: session.to_json()?,
            timestamp: Utc::now().timestamp_millis(),
            inbox_id,
            conversation_id: conversation.clone(),
            sent_accept: Some(false),
        };

        if !options.save_state_after_send {
            self.store.save_encryption_state(&next, true).await?;
        }

        let envelope: serde_json::Value = serde_json::from_str(&result.envelope)
            .map_err(|e| QuorumError::Crypto(format!("parse ratchet envelope: {}", e)))?;
        let body = serde_json::to_string(&HubPayload {
            kind: "message",
            message: &envelope,
        })?;
        self.send_hub_message(space_id, &body).await?;

        if options.save_state_after_send {
            self.store.save_encryption_state(&next, true).await?;
        }
        log::debug!("Relayed {} to space {}", message.message_id, space_id);
        Ok(())
    }

    /// Seal `message` for a single inbox through the hub as a `sync` frame.
    pub async fn send_sync(
        &self,
        space_id: &str,
        inbox_address: &str,
        signer: &Keypair,
        message: &str,
        config_key: Option<&Keypair>,
    ) -> Result<()> {
        let hub = self.space_key(space_id, key_ids::HUB).await?;
        let hub_address = hub.address.clone().unwrap_or_default();
        let envelope = self
            .crypto
            .seal_sync_envelope(
                inbox_address,
                &hub_address,
                &keypair(&hub)?,
                signer,
                message,
                config_key,
            )
            .await?;
        self.outbound.push(OutboundFrame::Sync(envelope)).await;
        Ok(())
    }

    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }
}
