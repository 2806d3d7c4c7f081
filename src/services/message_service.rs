//! Message orchestration: building, sending, receiving and applying
//! direct and space messages.
//!
//! Outbound DMs fan out over one double-ratchet session per peer device;
//! space messages are triple-ratchet encrypted once and relayed by the hub.
//! Every inbound frame enters through [`MessageService::handle_new_message`],
//! which picks the branch from the session stored for the receiving inbox.
//! All content, local or remote, lands through one apply pipeline that runs
//! the acceptance rules before anything is persisted.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use std::sync::{Arc, OnceLock};

use crate::crypto::digest::{event_id, inbox_address_from_hex, message_digest, new_nonce};
use crate::crypto::provider::{
    CryptoProvider, DirectSessionState, ExteriorEnvelope, Keypair, PeerProfile, SendingInbox,
    SpaceSession, UserRegistration,
};
use crate::crypto::ratchet_state::{
    conversation_id, ConversationLocks, EncryptionState, SessionState, TripleRatchet,
};
use crate::error::{sanitize_error, QuorumError, Result};
use crate::services::action_handlers::{ChannelMessageTask, DirectMessageTask};
use crate::services::action_queue::{ActionKind, ActionQueue};
use crate::services::api_client::{DeleteMessages, DirectoryApi};
use crate::services::config::InviteSettings;
use crate::services::hub::{self, hub_control, HubRelay, SendOptions};
use crate::services::message_cache::MessageCache;
use crate::services::message_store::MessageStore;
use crate::services::message_validation::{extract_mentions, MessageValidator, Rejection};
use crate::services::space_control::{
    add_participant, decrypt_manifest, membership_row, purge_space, verify_exterior, verify_join,
    verify_leave, verify_manifest, ControlMessage, HubEnvelope, Participant, PeerMap, RekeyPayload,
};
use crate::services::space_sessions::SpaceSessions;
use crate::services::sync_service::SyncService;
use crate::services::transport::{parse_envelope, InboundHandler, OutboundFrame};
use crate::services::types::{
    key_ids, Content, Conversation, ConversationType, EncryptedMessage, Identity, Message,
    MuteAction, MuteRecord, PinAction, ReplyMetadata, SenderOnlyContent, Space, SpaceKey,
    SpaceMember, UpdateProfileContent,
    PERMISSION_MENTION_EVERYONE, UNKNOWN_USER,
};
use crate::services::user_config::UserConfigService;

/// Where a message being applied came from. Decides which checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Authored on this device; already checked at submit time.
    Local,
    /// Decrypted from a DM session.
    Direct,
    /// Decrypted from the space ratchet.
    Space,
    /// Delivered in a sync batch.
    Sync,
}

/// Content that becomes its own history row rather than acting on one.
pub fn creates_row(content: &Content) -> bool {
    matches!(
        content,
        Content::Post(_) | Content::Sticker(_) | Content::Embed(_)
    )
}

fn replies_to(content: &Content) -> Option<&str> {
    match content {
        Content::Post(p) => p.replies_to_message_id.as_deref(),
        Content::Sticker(s) => s.replies_to_message_id.as_deref(),
        Content::Embed(e) => e.replies_to_message_id.as_deref(),
        _ => None,
    }
}

/// Bytes signed to prove ownership of an inbox when deleting from it.
pub fn inbox_delete_signed_bytes(inbox_address: &str, timestamps: &[i64]) -> Vec<u8> {
    let mut out = inbox_address.to_string();
    for ts in timestamps {
        out.push_str(&ts.to_string());
    }
    out.into_bytes()
}

fn rejected(rejection: Rejection) -> QuorumError {
    QuorumError::Validation(rejection.to_string())
}

/// Collaborators of [`MessageService`].
pub struct MessageServiceDeps {
    pub identity: Arc<Identity>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub store: Arc<dyn MessageStore>,
    pub api: Arc<dyn DirectoryApi>,
    pub hub: Arc<HubRelay>,
    pub sessions: Arc<SpaceSessions>,
    pub sync: Arc<SyncService>,
    pub user_config: Arc<UserConfigService>,
    pub cache: Arc<MessageCache>,
    pub validator: Arc<MessageValidator>,
    pub locks: Arc<ConversationLocks>,
    pub invites: InviteSettings,
}

pub struct MessageService {
    identity: Arc<Identity>,
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn MessageStore>,
    api: Arc<dyn DirectoryApi>,
    hub: Arc<HubRelay>,
    sessions: Arc<SpaceSessions>,
    sync: Arc<SyncService>,
    user_config: Arc<UserConfigService>,
    cache: Arc<MessageCache>,
    validator: Arc<MessageValidator>,
    locks: Arc<ConversationLocks>,
    invites: InviteSettings,
    action_queue: OnceLock<Arc<ActionQueue>>,
}

impl MessageService {
    pub fn new(deps: MessageServiceDeps) -> Self {
        Self {
            identity: deps.identity,
            crypto: deps.crypto,
            store: deps.store,
            api: deps.api,
            hub: deps.hub,
            sessions: deps.sessions,
            sync: deps.sync,
            user_config: deps.user_config,
            cache: deps.cache,
            validator: deps.validator,
            locks: deps.locks,
            invites: deps.invites,
            action_queue: OnceLock::new(),
        }
    }

    /// Wire the queue optimistic sends are handed to. Later calls are ignored.
    pub fn set_action_queue(&self, queue: Arc<ActionQueue>) {
        if self.action_queue.set(queue).is_err() {
            log::warn!("Action queue already set");
        }
    }

    pub(crate) fn queue(&self) -> &ActionQueue {
        match self.action_queue.get() {
            Some(queue) => queue,
            None => panic!("MessageService used before set_action_queue"),
        }
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    fn address(&self) -> &str {
        &self.identity.user_address
    }

    // ── Building ───────────────────────────────────────────────

    /// Assign nonce, content-addressed id and signature.
    fn build_message(
        &self,
        space_id: &str,
        channel_id: &str,
        content: Content,
        signer: &Keypair,
    ) -> Result<Message> {
        let nonce = new_nonce();
        let now = Utc::now().timestamp_millis();
        if let Content::DeleteConversation(_) = content {
            let id = event_id("delete-conversation", &nonce);
            return Ok(Message::new(space_id, channel_id, id, nonce, now, content));
        }

        let digest = message_digest(&nonce, content.type_tag(), content.sender_id(), &content)?;
        let signature = self.crypto.sign_ed448(&signer.private_key, &digest)?;
        let mut message = Message::new(
            space_id,
            channel_id,
            hex::encode(digest),
            nonce,
            now,
            content,
        );
        message.public_key = Some(signer.public_hex());
        message.signature = Some(hex::encode(signature));
        Ok(message)
    }

    async fn reply_metadata(&self, message: &Message) -> Result<Option<ReplyMetadata>> {
        let Some(parent_id) = replies_to(&message.content) else {
            return Ok(None);
        };
        let Some(parent) = self.store.get_message(parent_id).await? else {
            return Ok(None);
        };
        let parent_author = parent.content.sender_id();
        if parent_author == self.address() {
            return Ok(None);
        }
        Ok(Some(ReplyMetadata {
            parent_author: parent_author.to_string(),
            parent_channel_id: message.channel_id.clone(),
        }))
    }

    /// Checks a locally authored edit or pin must pass before it is sent.
    async fn precheck(&self, space: Option<&Space>, message: &Message) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        match &message.content {
            Content::EditMessage(edit) => {
                let original = self
                    .store
                    .get_message(&edit.original_message_id)
                    .await?
                    .ok_or_else(|| {
                        QuorumError::NotFound(format!("message {}", edit.original_message_id))
                    })?;
                self.validator
                    .check_edit(&original, edit, now)
                    .map_err(rejected)
            }
            Content::Pin(pin) => {
                if self.store.get_message(&pin.target_message_id).await?.is_none() {
                    return Err(QuorumError::NotFound(format!(
                        "message {}",
                        pin.target_message_id
                    )));
                }
                let pinned = self.pinned_count(&message.space_id, &message.channel_id).await?;
                self.validator
                    .check_pin(space, message, pin.action, pinned)
                    .map_err(rejected)
            }
            _ => Ok(()),
        }
    }

    async fn pinned_count(&self, space_id: &str, channel_id: &str) -> Result<usize> {
        Ok(self
            .store
            .get_messages(space_id, channel_id)
            .await?
            .iter()
            .filter(|m| m.is_pinned())
            .count())
    }

    // ── Direct messages ────────────────────────────────────────

    /// Send `content` to the user at `address`.
    ///
    /// New rows on an established conversation are shown at once and handed
    /// to the action queue. The first message of a conversation creates the
    /// sessions inline. Everything else is encrypted and sent immediately.
    pub async fn submit_message(&self, address: &str, mut content: Content) -> Result<Message> {
        content.set_sender_id(self.address());
        let user_key = self.identity.user_keyset.user_key.clone();
        let mut message = self.build_message(address, address, content, &user_key)?;
        message.reply_metadata = self.reply_metadata(&message).await?;

        let established = !self
            .store
            .get_encryption_states(&conversation_id(address))
            .await?
            .is_empty();

        if creates_row(&message.content) {
            self.cache.insert_pending(&message).await;
            if established {
                let task = DirectMessageTask {
                    address: address.to_string(),
                    message: message.clone(),
                };
                let key = format!("send-dm:{}:{}", address, message.message_id);
                self.queue()
                    .enqueue(ActionKind::SendDm, serde_json::to_value(&task)?, &key)
                    .await?;
                return Ok(message);
            }
            log::info!("No session with {} yet, sending inline", address);
            if let Err(e) = self.deliver_direct(address, &message).await {
                self.cache
                    .mark_failed(address, address, &message.message_id, &sanitize_error(&e))
                    .await;
                return Err(e);
            }
            return Ok(message);
        }

        self.precheck(None, &message).await?;
        let counterparty = self.api.get_user(address).await?;
        self.fan_out_direct(address, &counterparty, &message).await?;
        if !matches!(message.content, Content::DeleteConversation(_)) {
            self.apply(message.clone(), Origin::Local, None).await?;
            self.touch_conversation(address, message.created_date, None, None)
                .await?;
        }
        Ok(message)
    }

    /// Encrypt a queued or retried DM to every device of the peer, then
    /// store it as sent.
    pub async fn deliver_direct(&self, address: &str, message: &Message) -> Result<()> {
        let outgoing = message.without_ephemeral();
        let counterparty = self.api.get_user(address).await?;
        self.fan_out_direct(address, &counterparty, &outgoing).await?;
        self.apply(outgoing.clone(), Origin::Local, None).await?;
        self.cache
            .mark_sent(address, address, &message.message_id)
            .await;
        let last = creates_row(&outgoing.content).then(|| outgoing.message_id.clone());
        self.touch_conversation(address, outgoing.created_date, None, last)
            .await
    }

    /// One envelope per target inbox: the peer's devices and our other
    /// devices. Confirmed sessions ratchet forward, unconfirmed ones resend
    /// the init payload, and unknown inboxes get a fresh sender session.
    async fn fan_out_direct(
        &self,
        address: &str,
        counterparty: &UserRegistration,
        message: &Message,
    ) -> Result<()> {
        let conversation = conversation_id(address);
        let _guard = self.locks.acquire(&conversation).await;

        let own = &self.identity.registration;
        let devices: Vec<_> = own
            .device_registrations
            .iter()
            .chain(counterparty.device_registrations.iter())
            .collect();
        let mut inboxes: Vec<String> = devices
            .iter()
            .map(|d| d.inbox_registration.inbox_address.clone())
            .collect();
        inboxes.sort();
        inboxes.dedup();

        let mut sessions: Vec<DirectSessionState> = Vec::new();
        for state in self.store.get_encryption_states(&conversation).await? {
            match state.session() {
                Ok(SessionState::Direct(s)) if inboxes.contains(&s.tag) => sessions.push(s),
                _ => {
                    log::debug!("Dropping stale session {} for {}", state.inbox_id, address);
                    self.store
                        .delete_encryption_state(&conversation, &state.inbox_id)
                        .await?;
                    self.store.delete_inbox_mapping(&state.inbox_id).await?;
                }
            }
        }

        let body = serde_json::to_string(message)?;
        let device = &self.identity.device_keyset;
        let name = self.identity.display_name.as_str();
        let icon = self.identity.user_icon.as_deref();
        let mut sealed = Vec::new();
        for inbox in inboxes.iter().filter(|i| *i != self.identity.device_inbox()) {
            match sessions.iter().find(|s| &s.tag == inbox) {
                Some(session) if session.sending_inbox.is_unconfirmed() => {
                    sealed.extend(self.crypto.double_ratchet_inbox_encrypt_force_sender_init(
                        device,
                        std::slice::from_ref(session),
                        &body,
                        own,
                        name,
                        icon,
                    )?);
                }
                Some(session) => {
                    sealed.extend(self.crypto.double_ratchet_inbox_encrypt(
                        device,
                        std::slice::from_ref(session),
                        &body,
                        own,
                        name,
                        icon,
                    )?);
                }
                None => {
                    let Some(target) = devices
                        .iter()
                        .find(|d| &d.inbox_registration.inbox_address == inbox)
                    else {
                        continue;
                    };
                    sealed.extend(
                        self.crypto
                            .new_double_ratchet_sender_session(
                                device,
                                self.address(),
                                target,
                                &body,
                                name,
                                icon,
                            )
                            .await?,
                    );
                }
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut frames = Vec::with_capacity(sealed.len() * 2);
        for s in sealed {
            let session = s.session_state();
            let inbox_id = session.receiving_inbox.inbox_address.clone();
            for previous in sessions.iter().filter(|p| p.tag == session.tag) {
                let old = &previous.receiving_inbox.inbox_address;
                if *old != inbox_id {
                    self.store.delete_encryption_state(&conversation, old).await?;
                    self.store.delete_inbox_mapping(old).await?;
                }
            }
            let state = EncryptionState {
                state: serde_json::to_string(&session)?,
                timestamp: now,
                inbox_id: inbox_id.clone(),
                conversation_id: conversation.clone(),
                sent_accept: Some(s.sent_accept),
            };
            self.store.save_encryption_state(&state, true).await?;
            self.store.save_inbox_mapping(&inbox_id, &conversation).await?;
            frames.push(OutboundFrame::listen(&inbox_id));
            frames.push(OutboundFrame::Direct(s.sealed_message));
        }
        let count = frames.len() / 2;
        self.hub.outbound().extend(frames).await;
        log::debug!("Queued {} direct envelopes for {}", count, address);
        Ok(())
    }

    /// Resend a failed DM with a fresh envelope; id and signature stay.
    pub async fn retry_direct_message(&self, address: &str, message_id: &str) -> Result<()> {
        let cached = self
            .cache
            .get(address, address, message_id)
            .await
            .ok_or_else(|| QuorumError::NotFound(format!("message {}", message_id)))?;
        if !self.cache.mark_sending(address, address, message_id).await {
            return Ok(());
        }
        if let Err(e) = self.deliver_direct(address, &cached).await {
            self.cache
                .mark_failed(address, address, message_id, &sanitize_error(&e))
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Forget a conversation. DMs first tell the peer, best effort.
    pub async fn delete_conversation(&self, conversation: &str) -> Result<()> {
        let address = conversation.split('/').next().unwrap_or(conversation).to_string();
        let existing = self.store.get_conversation(conversation).await?;
        let is_direct = existing.map_or(true, |c| c.conversation_type == ConversationType::Direct);
        if is_direct {
            let notice = Content::DeleteConversation(SenderOnlyContent {
                sender_id: self.address().to_string(),
            });
            if let Err(e) = self.submit_message(&address, notice).await {
                log::warn!("Could not notify {} of conversation delete: {}", address, e);
            }
        }

        {
            let _guard = self.locks.acquire(conversation).await;
            for state in self.store.get_encryption_states(conversation).await? {
                self.store.delete_inbox_mapping(&state.inbox_id).await?;
            }
            self.store.delete_encryption_states(conversation).await?;
        }
        self.store.delete_space_messages(&address).await?;
        self.store.delete_conversation(conversation).await?;
        self.cache.clear_space(&address).await;
        log::info!("Deleted conversation {}", conversation);
        Ok(())
    }

    /// Create or refresh the conversation row for a DM peer.
    async fn touch_conversation(
        &self,
        address: &str,
        timestamp: i64,
        profile: Option<&PeerProfile>,
        last_message_id: Option<String>,
    ) -> Result<()> {
        let id = conversation_id(address);
        let mut conversation = self
            .store
            .get_conversation(&id)
            .await?
            .unwrap_or_else(|| Conversation {
                conversation_id: id.clone(),
                conversation_type: ConversationType::Direct,
                timestamp,
                address: address.to_string(),
                icon: String::new(),
                display_name: UNKNOWN_USER.to_string(),
                last_read_timestamp: 0,
                is_repudiable: None,
                save_edit_history: None,
                last_message_id: None,
            });
        conversation.timestamp = conversation.timestamp.max(timestamp);
        if let Some(profile) = profile {
            if let Some(name) = profile.display_name.as_deref().filter(|n| !n.is_empty()) {
                conversation.display_name = name.to_string();
            }
            if let Some(icon) = profile.user_icon.as_deref().filter(|i| !i.is_empty()) {
                conversation.icon = icon.to_string();
            }
        }
        if last_message_id.is_some() {
            conversation.last_message_id = last_message_id;
        }
        self.store.save_conversation(&conversation).await
    }

    // ── Space messages ─────────────────────────────────────────

    /// Send `content` to a space channel.
    ///
    /// New rows are shown at once and queued. Edits, pins and profile
    /// updates are checked, encrypted and relayed immediately. Reactions,
    /// deletes and mutes apply locally and go through the queue.
    pub async fn submit_channel_message(
        &self,
        space_id: &str,
        channel_id: &str,
        mut content: Content,
    ) -> Result<Message> {
        content.set_sender_id(self.address());
        let space = self
            .store
            .get_space(space_id)
            .await?
            .ok_or_else(|| QuorumError::NotFound(format!("space {}", space_id)))?;
        let inbox = self.hub.space_keypair(space_id, key_ids::INBOX).await?;
        let mut message = self.build_message(space_id, channel_id, content, &inbox)?;

        if let Content::Post(post) = &message.content {
            let allow_everyone = space.has_role_permission(self.address(), PERMISSION_MENTION_EVERYONE);
            let mentions = extract_mentions(&post.text.joined(), Some(&space), allow_everyone);
            if !mentions.is_empty() {
                message.mentions = Some(mentions);
            }
        }
        message.reply_metadata = self.reply_metadata(&message).await?;

        match &message.content {
            Content::EditMessage(_) | Content::Pin(_) | Content::UpdateProfile(_) => {
                self.precheck(Some(&space), &message).await?;
                self.hub
                    .encrypt_and_send_to_space(space_id, &message, SendOptions::default())
                    .await?;
                self.apply(message.clone(), Origin::Local, None).await?;
            }
            content => {
                if creates_row(content) {
                    self.cache.insert_pending(&message).await;
                } else {
                    self.apply(message.clone(), Origin::Local, None).await?;
                }
                let task = ChannelMessageTask {
                    space_id: space_id.to_string(),
                    channel_id: channel_id.to_string(),
                    message: message.clone(),
                };
                let key = format!("send:{}:{}:{}", space_id, channel_id, message.message_id);
                self.queue()
                    .enqueue(
                        ActionKind::SendChannelMessage,
                        serde_json::to_value(&task)?,
                        &key,
                    )
                    .await?;
            }
        }
        Ok(message)
    }

    /// Encrypt a queued or retried channel message and store it as sent.
    pub async fn deliver_channel_message(&self, message: &Message) -> Result<()> {
        let outgoing = message.without_ephemeral();
        self.hub
            .encrypt_and_send_to_space(
                &message.space_id,
                &outgoing,
                SendOptions {
                    strip_ephemeral: true,
                    save_state_after_send: true,
                },
            )
            .await?;
        if creates_row(&outgoing.content) {
            self.apply(outgoing, Origin::Local, None).await?;
        }
        self.cache
            .mark_sent(&message.space_id, &message.channel_id, &message.message_id)
            .await;
        Ok(())
    }

    /// Resend a failed channel message with a fresh envelope.
    pub async fn retry_message(&self, space_id: &str, channel_id: &str, message_id: &str) -> Result<()> {
        let cached = self
            .cache
            .get(space_id, channel_id, message_id)
            .await
            .ok_or_else(|| QuorumError::NotFound(format!("message {}", message_id)))?;
        if !self.cache.mark_sending(space_id, channel_id, message_id).await {
            return Ok(());
        }
        if let Err(e) = self.deliver_channel_message(&cached).await {
            self.cache
                .mark_failed(space_id, channel_id, message_id, &sanitize_error(&e))
                .await;
            return Err(e);
        }
        Ok(())
    }

    // ── Inbound ────────────────────────────────────────────────

    /// Entry point for every inbound frame.
    ///
    /// Undecryptable or rejected frames are dropped and still removed from
    /// the inbox; a ratchet never gets a second chance at the same message.
    pub async fn handle_new_message(&self, message: EncryptedMessage) -> Result<()> {
        if message.inbox_address == self.identity.device_inbox() {
            return self.handle_initialization(&message).await;
        }
        let Some(found) = self.store.find_state_by_inbox(&message.inbox_address).await? else {
            log::debug!("No session for inbox {}, ignoring", message.inbox_address);
            return Ok(());
        };
        match found.session() {
            Ok(SessionState::Direct(keys)) => self.handle_direct(&message, &found, keys).await,
            Ok(SessionState::Space(_)) => self.handle_space(&message, &found).await,
            Err(e) => {
                log::warn!("Unreadable session for inbox {}: {}", message.inbox_address, e);
                Ok(())
            }
        }
    }

    async fn delete_inbox_message(&self, inbox_address: &str, signer: &Keypair, timestamps: &[i64]) {
        let signed = inbox_delete_signed_bytes(inbox_address, timestamps);
        let signature = match self.crypto.sign_ed448(&signer.private_key, &signed) {
            Ok(sig) => sig,
            Err(e) => {
                log::warn!("Could not sign inbox delete for {}: {}", inbox_address, e);
                return;
            }
        };
        let request = DeleteMessages {
            inbox_address: inbox_address.to_string(),
            timestamps: timestamps.to_vec(),
            inbox_public_key: signer.public_hex(),
            inbox_signature: hex::encode(signature),
        };
        if let Err(e) = self.api.delete_inbox(&request).await {
            log::warn!("Inbox delete for {} failed: {}", inbox_address, e);
        }
    }

    async fn delete_space_inbox_message(&self, space_id: &str, timestamp: i64) {
        match self.store.get_space_key(space_id, key_ids::INBOX).await {
            Ok(Some(key)) => {
                let Some(address) = key.address.clone() else {
                    return;
                };
                match hub::keypair(&key) {
                    Ok(signer) => self.delete_inbox_message(&address, &signer, &[timestamp]).await,
                    Err(e) => log::warn!("Bad inbox key for space {}: {}", space_id, e),
                }
            }
            Ok(None) => log::debug!("Space {} inbox key gone, not deleting", space_id),
            Err(e) => log::warn!("Inbox key lookup for {} failed: {}", space_id, e),
        }
    }

    /// First contact: a peer opened a session against our device inbox.
    async fn handle_initialization(&self, message: &EncryptedMessage) -> Result<()> {
        let device_inbox = self.identity.device_keyset.inbox_keyset.clone();
        if let Err(e) = self.accept_initialization(message).await {
            log::warn!("Dropping initialization envelope at {}: {}", message.timestamp, e);
        }
        self.delete_inbox_message(
            &device_inbox.inbox_address,
            &device_inbox.inbox_key,
            &[message.timestamp],
        )
        .await;
        Ok(())
    }

    async fn accept_initialization(&self, message: &EncryptedMessage) -> Result<()> {
        let device = &self.identity.device_keyset;
        let envelope = parse_envelope(&message.encrypted_content)?;
        let mut init = self.crypto.unseal_initialization_envelope(device, &envelope)?;
        init.timestamp = message.timestamp;
        let session = self
            .crypto
            .new_double_ratchet_recipient_session(device, &init)
            .await?;
        let content: Message = serde_json::from_str(&session.message)
            .map_err(|e| QuorumError::Crypto(format!("parse direct message: {}", e)))?;

        let peer = if session.user_address == self.address() {
            content.channel_id.clone()
        } else {
            session.user_address.clone()
        };
        let conversation = conversation_id(&peer);

        if let Content::DeleteConversation(_) = content.content {
            let _guard = self.locks.acquire(&conversation).await;
            self.store.delete_encryption_states(&conversation).await?;
            log::info!("Peer {} deleted the conversation", peer);
            return Ok(());
        }

        {
            let _guard = self.locks.acquire(&conversation).await;
            for state in self.store.get_encryption_states(&conversation).await? {
                if state.session().ok().as_ref().and_then(|s| s.tag()) == Some(session.tag.as_str()) {
                    self.store
                        .delete_encryption_state(&conversation, &state.inbox_id)
                        .await?;
                    self.store.delete_inbox_mapping(&state.inbox_id).await?;
                }
            }
            let receiving = self.crypto.new_inbox_keyset().await?;
            let inbox_id = receiving.inbox_address.clone();
            let keys = DirectSessionState {
                ratchet_state: session.state.clone(),
                receiving_inbox: receiving,
                tag: session.tag.clone(),
                sending_inbox: SendingInbox {
                    inbox_address: session.return_inbox_address.clone(),
                    inbox_encryption_key: session.return_inbox_encryption_key.clone(),
                    inbox_public_key: session.return_inbox_public_key.clone(),
                    inbox_private_key: session.return_inbox_private_key.clone(),
                },
            };
            let state = EncryptionState {
                state: serde_json::to_string(&keys)?,
                timestamp: message.timestamp,
                inbox_id: inbox_id.clone(),
                conversation_id: conversation.clone(),
                sent_accept: Some(false),
            };
            self.store.save_encryption_state(&state, true).await?;
            self.store.save_inbox_mapping(&inbox_id, &conversation).await?;
            self.hub.outbound().push(OutboundFrame::listen(&inbox_id)).await;
        }

        let profile = (init.user_address != self.address()).then(|| PeerProfile {
            user_address: init.user_address.clone(),
            display_name: init.display_name.clone(),
            user_icon: init.user_icon.clone(),
        });
        self.receive_direct(&peer, content, profile.as_ref()).await
    }

    /// Apply a decrypted DM and refresh its conversation row.
    async fn receive_direct(&self, peer: &str, mut content: Message, profile: Option<&PeerProfile>) -> Result<()> {
        content.space_id = peer.to_string();
        content.channel_id = peer.to_string();
        let last = creates_row(&content.content).then(|| content.message_id.clone());
        let created = content.created_date;
        self.apply(content, Origin::Direct, profile).await?;
        self.touch_conversation(peer, created, profile, last).await
    }

    async fn handle_direct(
        &self,
        message: &EncryptedMessage,
        found: &EncryptionState,
        stale: DirectSessionState,
    ) -> Result<()> {
        let receiving = stale.receiving_inbox.clone();
        match self.open_direct(message, found).await {
            Ok(Some((peer, content, profile))) => {
                if let Err(e) = self.receive_direct(&peer, content, profile.as_ref()).await {
                    log::warn!("Direct message from {} not applied: {}", peer, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!(
                "Dropping undecryptable message at {} for {}: {}",
                message.timestamp,
                receiving.inbox_address,
                e
            ),
        }
        self.delete_inbox_message(&receiving.inbox_address, &receiving.inbox_key, &[message.timestamp])
            .await;
        Ok(())
    }

    /// Decrypt under the conversation lock and persist the advanced session.
    /// A failed decrypt leaves the stored session untouched.
    async fn open_direct(
        &self,
        message: &EncryptedMessage,
        found: &EncryptionState,
    ) -> Result<Option<(String, Message, Option<PeerProfile>)>> {
        let conversation = found.conversation_id.clone();
        let peer = found.owner_id().to_string();
        let envelope = parse_envelope(&message.encrypted_content)?;

        let _guard = self.locks.acquire(&conversation).await;
        let current = self
            .store
            .get_encryption_state(&conversation, &found.inbox_id)
            .await?
            .unwrap_or_else(|| found.clone());
        let SessionState::Direct(keys) = current.session()? else {
            return Err(QuorumError::Crypto("expected a direct session".into()));
        };

        let confirming = keys.sending_inbox.is_unconfirmed();
        let result = if confirming {
            self.crypto
                .confirm_double_ratchet_sender_session(&keys, &envelope)
                .await?
        } else {
            self.crypto.double_ratchet_inbox_decrypt(&keys, &envelope).await?
        };

        let rotated = confirming || result.user_profile.is_some();
        let next = DirectSessionState {
            ratchet_state: result.ratchet_state.clone(),
            receiving_inbox: match (&result.receiving_inbox, rotated) {
                (Some(inbox), true) => inbox.clone(),
                _ => keys.receiving_inbox.clone(),
            },
            tag: match (&result.tag, rotated) {
                (Some(tag), true) => tag.clone(),
                _ => keys.tag.clone(),
            },
            sending_inbox: match (&result.sending_inbox, rotated) {
                (Some(inbox), true) => inbox.clone(),
                _ => keys.sending_inbox.clone(),
            },
        };
        let sent_accept = if confirming { Some(true) } else { current.sent_accept };

        let content: Message = match serde_json::from_str(&result.message) {
            Ok(content) => content,
            Err(e) => {
                self.save_direct_state(&current, &next, message.timestamp, sent_accept)
                    .await?;
                return Err(QuorumError::Crypto(format!("parse direct message: {}", e)));
            }
        };

        if let Content::DeleteConversation(_) = content.content {
            for state in self.store.get_encryption_states(&conversation).await? {
                self.store.delete_inbox_mapping(&state.inbox_id).await?;
            }
            self.store.delete_encryption_states(&conversation).await?;
            log::info!("Peer {} deleted the conversation", peer);
            return Ok(None);
        }

        self.save_direct_state(&current, &next, message.timestamp, sent_accept)
            .await?;
        Ok(Some((peer, content, result.user_profile)))
    }

    async fn save_direct_state(
        &self,
        current: &EncryptionState,
        next: &DirectSessionState,
        timestamp: i64,
        sent_accept: Option<bool>,
    ) -> Result<()> {
        let inbox_id = next.receiving_inbox.inbox_address.clone();
        let state = EncryptionState {
            state: serde_json::to_string(next)?,
            timestamp,
            inbox_id: inbox_id.clone(),
            conversation_id: current.conversation_id.clone(),
            sent_accept,
        };
        if inbox_id != current.inbox_id {
            self.store
                .delete_encryption_state(&current.conversation_id, &current.inbox_id)
                .await?;
            self.store.delete_inbox_mapping(&current.inbox_id).await?;
            self.store
                .save_inbox_mapping(&inbox_id, &current.conversation_id)
                .await?;
            self.hub.outbound().push(OutboundFrame::listen(&inbox_id)).await;
        }
        self.store.save_encryption_state(&state, true).await
    }

    async fn handle_space(&self, message: &EncryptedMessage, found: &EncryptionState) -> Result<()> {
        let space_id = found.owner_id().to_string();
        if let Err(e) = self.open_space(message, &space_id).await {
            log::warn!(
                "Dropping space message at {} for {}: {}",
                message.timestamp,
                space_id,
                e
            );
        }
        self.delete_space_inbox_message(&space_id, message.timestamp)
            .await;
        Ok(())
    }

    async fn open_space(&self, message: &EncryptedMessage, space_id: &str) -> Result<()> {
        let hub_key = self.hub.space_keypair(space_id, key_ids::HUB).await?;
        let envelope = parse_envelope(&message.encrypted_content)?;
        let opened = self.crypto.unseal_hub_envelope(&hub_key, &envelope).await?;
        let payload: HubEnvelope = serde_json::from_slice(&opened)
            .map_err(|e| QuorumError::Crypto(format!("parse hub payload: {}", e)))?;
        match payload {
            HubEnvelope::Message(inner) => self.receive_space_message(space_id, message, inner).await,
            HubEnvelope::Control(control) => {
                let exterior: ExteriorEnvelope =
                    serde_json::from_str(&message.encrypted_content).unwrap_or_default();
                self.handle_control(space_id, message.timestamp, control, &exterior)
                    .await
            }
        }
    }

    async fn receive_space_message(
        &self,
        space_id: &str,
        message: &EncryptedMessage,
        inner: serde_json::Value,
    ) -> Result<()> {
        let conversation = conversation_id(space_id);
        let plaintext = {
            let _guard = self.locks.acquire(&conversation).await;
            let current = self
                .store
                .get_latest_state(&conversation)
                .await?
                .ok_or_else(|| QuorumError::Crypto(format!("no ratchet state for space {}", space_id)))?;
            let mut session = SpaceSession::parse(&current.state)?;
            let result = self
                .crypto
                .triple_ratchet_decrypt(&session.state, &inner.to_string())
                .await?;
            session.state = result.ratchet_state;
            let next = EncryptionState {
                state: session.to_json()?,
                timestamp: message.timestamp,
                inbox_id: current.inbox_id.clone(),
                conversation_id: conversation.clone(),
                sent_accept: current.sent_accept,
            };
            self.store.save_encryption_state(&next, true).await?;
            result.message
        };

        let mut decoded: Message = serde_json::from_slice(&plaintext)
            .map_err(|e| QuorumError::Crypto(format!("parse space message: {}", e)))?;
        decoded.space_id = space_id.to_string();
        let space = self.store.get_space(space_id).await?;
        self.check_signature(space.as_ref(), &mut decoded).await;
        if matches!(decoded.content, Content::UpdateProfile(_)) && decoded.signature.is_none() {
            log::debug!("Dropped {}: {}", decoded.message_id, Rejection::UnsignedProfile);
            return Ok(());
        }
        self.apply(decoded, Origin::Space, None).await?;
        Ok(())
    }

    /// Strip a signature that does not prove authorship. Repudiable spaces
    /// keep whatever was sent.
    async fn check_signature(&self, space: Option<&Space>, message: &mut Message) {
        if space.is_some_and(|s| s.is_repudiable) {
            return;
        }
        let (Some(public_key), Some(signature)) = (message.public_key.clone(), message.signature.clone())
        else {
            return;
        };
        let member = self
            .store
            .get_space_member(&message.space_id, message.content.sender_id())
            .await
            .ok()
            .flatten();
        if !self.signature_valid(message, &public_key, &signature, member.as_ref()) {
            log::warn!("Stripping invalid signature from {}", message.message_id);
            message.public_key = None;
            message.signature = None;
        }
    }

    fn signature_valid(
        &self,
        message: &Message,
        public_key: &str,
        signature: &str,
        member: Option<&SpaceMember>,
    ) -> bool {
        if let Some(member) = member.filter(|m| !m.inbox_address.is_empty()) {
            match inbox_address_from_hex(public_key) {
                Ok(address) if address == member.inbox_address => {}
                _ => return false,
            }
        }
        let Ok(digest) = message_digest(
            &message.nonce,
            message.content.type_tag(),
            message.content.sender_id(),
            &message.content,
        ) else {
            return false;
        };
        if hex::encode(digest) != message.message_id {
            return false;
        }
        let (Ok(pk), Ok(sig)) = (hex::decode(public_key), hex::decode(signature)) else {
            return false;
        };
        self.crypto.verify_ed448(&pk, &digest, &sig).unwrap_or(false)
    }

    // ── Space control ──────────────────────────────────────────

    async fn authorized(&self, space_id: &str, exterior: &ExteriorEnvelope, solicited: bool) -> bool {
        let trust_any = solicited && self.sessions.has_requested(space_id).await;
        verify_exterior(
            self.crypto.as_ref(),
            &self.sessions,
            self.api.as_ref(),
            space_id,
            exterior,
            trust_any,
        )
        .await
    }

    /// Read, mutate and write the space ratchet under its lock. The closure
    /// returns false to leave the stored state alone.
    async fn update_ratchet(
        &self,
        space_id: &str,
        timestamp: i64,
        f: impl FnOnce(&mut SpaceSession) -> Result<bool> + Send,
    ) -> Result<bool> {
        let conversation = conversation_id(space_id);
        let _guard = self.locks.acquire(&conversation).await;
        let current = self
            .store
            .get_latest_state(&conversation)
            .await?
            .ok_or_else(|| QuorumError::Crypto(format!("no ratchet state for space {}", space_id)))?;
        let mut session = SpaceSession::parse(&current.state)?;
        if !f(&mut session)? {
            return Ok(false);
        }
        let next = EncryptionState {
            state: session.to_json()?,
            timestamp,
            inbox_id: current.inbox_id.clone(),
            conversation_id: conversation.clone(),
            sent_accept: current.sent_accept,
        };
        self.store.save_encryption_state(&next, true).await?;
        Ok(true)
    }

    /// Persist a synthetic history row unless it was tombstoned.
    pub(crate) async fn record_row(&self, row: Message) -> Result<()> {
        if self.store.is_message_deleted(&row.message_id).await? {
            return Ok(());
        }
        self.store.save_message(&row).await?;
        self.cache.upsert_confirmed(&row).await;
        Ok(())
    }

    async fn handle_control(
        &self,
        space_id: &str,
        timestamp: i64,
        control: ControlMessage,
        exterior: &ExteriorEnvelope,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        log::debug!("Control {} for space {}", control.kind(), space_id);
        match control {
            ControlMessage::Join { participant } => self.on_join(space_id, timestamp, &participant, now).await,
            ControlMessage::SyncPeerMap { peer_map } => {
                if !self.authorized(space_id, exterior, true).await {
                    return Ok(());
                }
                self.on_peer_map(space_id, timestamp, peer_map).await
            }
            ControlMessage::SpaceManifest { manifest } => {
                let owner = self
                    .sessions
                    .is_owner_key(self.api.as_ref(), space_id, &manifest.owner_public_key)
                    .await;
                if !owner || !verify_manifest(self.crypto.as_ref(), &manifest) {
                    log::warn!("Rejected manifest for space {}", space_id);
                    return Ok(());
                }
                let config = self.hub.space_key(space_id, key_ids::CONFIG).await?;
                let mut space = decrypt_manifest(self.crypto.as_ref(), &config, &manifest)?;
                space.space_id = space_id.to_string();
                self.store.save_space(&space).await?;
                log::info!("Applied manifest for space {}", space_id);
                Ok(())
            }
            ControlMessage::Leave {
                inbox_public_key,
                inbox_signature,
            } => self.on_leave(space_id, &inbox_public_key, &inbox_signature, now).await,
            ControlMessage::Rekey { info, kick } => {
                if !self.authorized(space_id, exterior, false).await {
                    return Ok(());
                }
                self.on_rekey(space_id, timestamp, &info, kick, now).await
            }
            ControlMessage::Kick { kick } => {
                if !self.authorized(space_id, exterior, false).await {
                    return Ok(());
                }
                if kick == self.address() {
                    log::info!("Kicked from space {}", space_id);
                    return self.forget_space(space_id).await;
                }
                if let Some(mut member) = self.store.get_space_member(space_id, &kick).await? {
                    member.inbox_address.clear();
                    member.is_kicked = Some(true);
                    self.store.save_space_member(space_id, &member).await?;
                }
                Ok(())
            }
            ControlMessage::Sync { inbox_address } => {
                self.sync.synchronize_all(space_id, &inbox_address).await
            }
            ControlMessage::SyncRequest(request) => {
                if request.expiry > now {
                    self.sync.inform_sync_data(space_id, &request).await?;
                }
                Ok(())
            }
            ControlMessage::SyncInfo(info) => {
                self.sync.handle_sync_info(space_id, &info, now).await;
                Ok(())
            }
            ControlMessage::SyncInitiate(initiate) => {
                if initiate.inbox_address.is_some() {
                    self.sync.direct_sync(space_id, &initiate).await?;
                }
                Ok(())
            }
            ControlMessage::SyncMembers { members } => {
                if !self.authorized(space_id, exterior, true).await {
                    return Ok(());
                }
                for mut member in members {
                    let existing = self
                        .store
                        .get_space_member(space_id, &member.user_address)
                        .await?;
                    member.is_kicked = existing.and_then(|m| m.is_kicked).or(Some(false));
                    self.store.save_space_member(space_id, &member).await?;
                }
                Ok(())
            }
            ControlMessage::VerifyKicked { addresses } => {
                if !self.authorized(space_id, exterior, false).await {
                    return Ok(());
                }
                for address in addresses {
                    if let Some(mut member) = self.store.get_space_member(space_id, &address).await? {
                        member.is_kicked = Some(true);
                        self.store.save_space_member(space_id, &member).await?;
                    }
                }
                Ok(())
            }
            ControlMessage::SyncMessages { messages } => {
                if !self.authorized(space_id, exterior, true).await {
                    return Ok(());
                }
                let space = self.store.get_space(space_id).await?;
                let total = messages.len();
                let mut applied = 0;
                for mut message in messages {
                    message.space_id = space_id.to_string();
                    self.check_signature(space.as_ref(), &mut message).await;
                    if self.apply(message, Origin::Sync, None).await? {
                        applied += 1;
                    }
                }
                log::info!("Synced {}/{} messages into space {}", applied, total, space_id);
                Ok(())
            }
            ControlMessage::Unsupported => {
                log::debug!("Ignoring unsupported control message for {}", space_id);
                Ok(())
            }
        }
    }

    async fn on_join(&self, space_id: &str, timestamp: i64, participant: &Participant, now: i64) -> Result<()> {
        let crypto = Arc::clone(&self.crypto);
        let accepted = self
            .update_ratchet(space_id, timestamp, move |session| {
                if !verify_join(crypto.as_ref(), &session.state, participant) {
                    return Ok(false);
                }
                let mut ratchet = TripleRatchet::parse(&session.state)?;
                add_participant(&mut ratchet, participant)?;
                session.state = ratchet.to_json()?;
                Ok(true)
            })
            .await?;
        if !accepted {
            log::warn!("Rejected join of {} to space {}", participant.address, space_id);
            return Ok(());
        }

        let member = SpaceMember {
            user_address: participant.address.clone(),
            inbox_address: participant.inbox_address.clone(),
            display_name: Some(participant.display_name.clone()),
            user_icon: Some(participant.user_icon.clone()),
            is_kicked: Some(false),
        };
        self.store.save_space_member(space_id, &member).await?;
        if let Some(space) = self.store.get_space(space_id).await? {
            self.record_row(membership_row(
                "join",
                &participant.inbox_address,
                &space,
                &participant.address,
                now,
            ))
            .await?;
        }
        log::info!("{} joined space {}", participant.address, space_id);
        Ok(())
    }

    async fn on_peer_map(&self, space_id: &str, timestamp: i64, peer_map: PeerMap) -> Result<()> {
        self.update_ratchet(space_id, timestamp, move |session| {
            let mut ratchet = TripleRatchet::parse(&session.state)?;
            ratchet.id_peer_map = peer_map.id_peer_map;
            ratchet.peer_id_map = peer_map.peer_id_map;
            session.state = ratchet.to_json()?;
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn on_leave(
        &self,
        space_id: &str,
        inbox_public_key: &str,
        inbox_signature: &str,
        now: i64,
    ) -> Result<()> {
        let hub = self.hub.space_key(space_id, key_ids::HUB).await?;
        let Some(inbox_address) =
            verify_leave(self.crypto.as_ref(), &hub.public_key, inbox_public_key, inbox_signature)
        else {
            log::warn!("Rejected leave for space {}", space_id);
            return Ok(());
        };
        let Some(mut member) = self
            .store
            .get_space_members(space_id)
            .await?
            .into_iter()
            .find(|m| m.inbox_address == inbox_address)
        else {
            return Ok(());
        };
        member.inbox_address.clear();
        self.store.save_space_member(space_id, &member).await?;

        if let Some(mut space) = self.store.get_space(space_id).await? {
            space.remove_from_roles(&member.user_address);
            self.store.save_space(&space).await?;
            self.record_row(membership_row("leave", &inbox_address, &space, &member.user_address, now))
                .await?;
        }
        log::info!("{} left space {}", member.user_address, space_id);
        Ok(())
    }

    async fn on_rekey(
        &self,
        space_id: &str,
        timestamp: i64,
        info: &str,
        kick: Option<String>,
        now: i64,
    ) -> Result<()> {
        let encryption_key = &self.identity.device_keyset.inbox_keyset.inbox_encryption_key;
        let sealed = parse_envelope(info)?;
        let opened = self
            .crypto
            .unseal_inbox_envelope(&encryption_key.private_key, &sealed)
            .await?;
        let payload: RekeyPayload = serde_json::from_slice(&opened)
            .map_err(|e| QuorumError::Crypto(format!("parse rekey payload: {}", e)))?;

        let config_private = hex::decode(&payload.config_key)
            .map_err(|e| QuorumError::Crypto(format!("config key hex: {}", e)))?;
        let config_public = self.crypto.get_pubkey_x448(&config_private)?;
        self.store
            .save_space_key(&SpaceKey {
                space_id: space_id.to_string(),
                key_id: key_ids::CONFIG.to_string(),
                address: None,
                public_key: hex::encode(config_public),
                private_key: payload.config_key.clone(),
            })
            .await?;

        let mut template = TripleRatchet::parse(&payload.state)?;
        template.peer_key = Some(B64.encode(&encryption_key.private_key));
        let state = template.to_json()?;
        self.update_ratchet(space_id, timestamp, move |session| {
            session.state = state;
            Ok(true)
        })
        .await?;

        if let Some(mut space) = self.store.get_space(space_id).await? {
            if let Some(kicked) = kick {
                self.record_row(membership_row("kick", &kicked, &space, &kicked, now))
                    .await?;
            }
            if !space.invite_url.is_empty() {
                space.invite_url = format!(
                    "{}#spaceId={}&configKey={}",
                    self.invites.base(true),
                    space_id,
                    payload.config_key
                );
                self.store.save_space(&space).await?;
            }
        }
        log::info!("Space {} rekeyed", space_id);
        Ok(())
    }

    /// Drop out of a space locally: unregister the inbox from the hub, purge
    /// every local record and remove it from the user config.
    pub async fn forget_space(&self, space_id: &str) -> Result<()> {
        let hub = self.store.get_space_key(space_id, key_ids::HUB).await?;
        let inbox = self.store.get_space_key(space_id, key_ids::INBOX).await?;
        if let (Some(hub), Some(inbox)) = (hub, inbox) {
            let unregistered = hub::keypair(&inbox)
                .and_then(|pair| hub_control(self.crypto.as_ref(), "delete", &hub, &pair));
            match unregistered {
                Ok(request) => {
                    if let Err(e) = self.api.post_hub_delete(&request).await {
                        log::warn!("Hub delete for space {} failed: {}", space_id, e);
                    }
                }
                Err(e) => log::warn!("Could not sign hub delete for {}: {}", space_id, e),
            }
        }

        {
            let _guard = self.locks.acquire(&conversation_id(space_id)).await;
            purge_space(self.store.as_ref(), space_id).await?;
        }
        self.cache.clear_space(space_id).await;
        self.sessions.close_window(space_id).await;
        self.sessions.forget_registration(space_id).await;
        if let Err(e) = self.user_config.remove_space(space_id).await {
            log::warn!("Could not drop {} from user config: {}", space_id, e);
        }
        Ok(())
    }

    // ── Apply ──────────────────────────────────────────────────

    /// Validate and persist one message. Returns false when it was dropped.
    pub async fn apply(
        &self,
        message: Message,
        origin: Origin,
        profile: Option<&PeerProfile>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let space = if message.is_direct() {
            None
        } else {
            self.store.get_space(&message.space_id).await?
        };
        let checked = origin != Origin::Local;

        let outcome: std::result::Result<(), Rejection> = match &message.content {
            Content::Reaction(r) | Content::RemoveReaction(r) => {
                let Some(mut target) = self.same_conversation_target(&message, &r.message_id).await?
                else {
                    return Ok(self.dropped(&message, Rejection::TargetMissing));
                };
                if matches!(message.content, Content::Reaction(_)) {
                    target.add_reaction(&r.reaction, &r.sender_id);
                } else {
                    target.remove_reaction(&r.reaction, &r.sender_id);
                }
                self.save_target(target).await?;
                Ok(())
            }
            Content::RemoveMessage(rm) => {
                let Some(target) = self.store.get_message(&rm.remove_message_id).await? else {
                    return Ok(self.dropped(&message, Rejection::TargetMissing));
                };
                if checked {
                    if let Err(r) = self
                        .validator
                        .check_delete(space.as_ref(), Some(&target), &message)
                    {
                        return Ok(self.dropped(&message, r));
                    }
                }
                self.store.add_deleted_message_id(&rm.remove_message_id).await?;
                self.store.delete_message(&rm.remove_message_id).await?;
                self.cache
                    .remove(&target.space_id, &target.channel_id, &target.message_id)
                    .await;
                Ok(())
            }
            Content::EditMessage(edit) => {
                let Some(mut target) = self
                    .same_conversation_target(&message, &edit.original_message_id)
                    .await?
                else {
                    return Ok(self.dropped(&message, Rejection::TargetMissing));
                };
                if checked {
                    if let Err(r) = self.validator.check_edit(&target, edit, now) {
                        return Ok(self.dropped(&message, r));
                    }
                }
                let keep_history = if message.is_direct() {
                    self.store
                        .get_conversation(&conversation_id(&message.space_id))
                        .await?
                        .and_then(|c| c.save_edit_history)
                        .unwrap_or(false)
                } else {
                    space.as_ref().and_then(|s| s.save_edit_history).unwrap_or(false)
                };
                target.apply_edit(edit, keep_history);
                self.save_target(target).await?;
                Ok(())
            }
            Content::Pin(pin) => {
                let Some(mut target) = self
                    .same_conversation_target(&message, &pin.target_message_id)
                    .await?
                else {
                    return Ok(self.dropped(&message, Rejection::TargetMissing));
                };
                if checked {
                    let pinned = self.pinned_count(&message.space_id, &message.channel_id).await?;
                    let pinned = if pin.action == PinAction::Pin && target.is_pinned() {
                        pinned.saturating_sub(1)
                    } else {
                        pinned
                    };
                    if let Err(r) = self
                        .validator
                        .check_pin(space.as_ref(), &message, pin.action, pinned)
                    {
                        return Ok(self.dropped(&message, r));
                    }
                }
                target.set_pinned(pin.action, &pin.sender_id, now);
                self.save_target(target).await?;
                Ok(())
            }
            Content::UpdateProfile(update) => {
                if message.is_direct() {
                    let peer = PeerProfile {
                        user_address: update.sender_id.clone(),
                        display_name: Some(update.display_name.clone()),
                        user_icon: Some(update.user_icon.clone()),
                    };
                    if update.sender_id != self.address() {
                        self.touch_conversation(&message.space_id, message.created_date, Some(&peer), None)
                            .await?;
                    }
                    Ok(())
                } else {
                    self.apply_profile(&message, update).await
                }
            }
            Content::Mute(mute) => {
                let existing = self
                    .store
                    .get_mute(&message.space_id, &mute.target_user_id)
                    .await?;
                if checked {
                    if let Err(r) = self
                        .validator
                        .check_mute(space.as_ref(), &message, mute, existing.as_ref())
                    {
                        return Ok(self.dropped(&message, r));
                    }
                }
                match mute.action {
                    MuteAction::Mute => {
                        self.store
                            .save_mute(&MuteRecord {
                                space_id: message.space_id.clone(),
                                target_user_id: mute.target_user_id.clone(),
                                muted_by: mute.sender_id.clone(),
                                mute_id: mute.mute_id.clone(),
                                timestamp: mute.timestamp,
                                expires_at: mute.duration.map(|d| mute.timestamp + d),
                            })
                            .await?
                    }
                    MuteAction::Unmute => {
                        self.store
                            .delete_mute(&message.space_id, &mute.target_user_id)
                            .await?
                    }
                }
                Ok(())
            }
            Content::DeleteConversation(_) => Ok(()),
            _ => {
                if self.store.is_message_deleted(&message.message_id).await? {
                    return Ok(self.dropped(&message, Rejection::TargetMissing));
                }
                if checked {
                    let mute = if message.is_direct() || origin == Origin::Sync {
                        None
                    } else {
                        self.store
                            .get_mute(&message.space_id, message.content.sender_id())
                            .await?
                    };
                    if let Err(r) = self.validator.check_new_row(
                        space.as_ref(),
                        &message,
                        mute.as_ref(),
                        origin == Origin::Space,
                        now,
                    ) {
                        return Ok(self.dropped(&message, r));
                    }
                }
                let stored = message.without_ephemeral();
                self.store.save_message(&stored).await?;
                self.cache.upsert_confirmed(&stored).await;
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                if let Some(profile) = profile.filter(|p| p.user_address != self.address()) {
                    if message.is_direct() {
                        self.touch_conversation(&message.space_id, message.created_date, Some(profile), None)
                            .await?;
                    }
                }
                Ok(true)
            }
            Err(rejection) => Ok(self.dropped(&message, rejection)),
        }
    }

    fn dropped(&self, message: &Message, rejection: Rejection) -> bool {
        log::debug!(
            "Dropped {} {}: {}",
            message.content.type_tag(),
            message.message_id,
            rejection
        );
        false
    }

    /// The referenced message, if it lives in the same space and channel.
    async fn same_conversation_target(&self, message: &Message, target_id: &str) -> Result<Option<Message>> {
        Ok(self
            .store
            .get_message(target_id)
            .await?
            .filter(|t| t.space_id == message.space_id && t.channel_id == message.channel_id))
    }

    async fn save_target(&self, target: Message) -> Result<()> {
        self.store.save_message(&target).await?;
        let updated = target.clone();
        let found = self
            .cache
            .update(&target.space_id, &target.channel_id, &target.message_id, move |m| {
                let status = m.send_status;
                let error = m.send_error.take();
                *m = updated;
                m.send_status = status;
                m.send_error = error;
            })
            .await;
        if !found {
            self.cache.upsert_confirmed(&target).await;
        }
        Ok(())
    }

    /// A member's signed profile change. The signing key must hash to the
    /// member's known inbox, if one is known.
    async fn apply_profile(
        &self,
        message: &Message,
        update: &UpdateProfileContent,
    ) -> std::result::Result<(), Rejection> {
        let Ok(Some(mut member)) = self
            .store
            .get_space_member(&message.space_id, &update.sender_id)
            .await
        else {
            return Err(Rejection::TargetMissing);
        };
        let Some(public_key) = message.public_key.as_deref() else {
            return Err(Rejection::UnsignedProfile);
        };
        let Ok(inbox) = inbox_address_from_hex(public_key) else {
            return Err(Rejection::UnsignedProfile);
        };
        if !member.inbox_address.is_empty() && member.inbox_address != inbox {
            return Err(Rejection::InboxMismatch);
        }
        member.display_name = Some(update.display_name.clone());
        member.user_icon = Some(update.user_icon.clone());
        member.inbox_address = inbox;
        if let Err(e) = self.store.save_space_member(&message.space_id, &member).await {
            log::warn!("Could not save profile of {}: {}", update.sender_id, e);
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for MessageService {
    async fn handle_encrypted(&self, message: EncryptedMessage) -> Result<()> {
        self.handle_new_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::types::{PostContent, ReactionContent};

    #[test]
    fn test_inbox_delete_bytes_concatenate_timestamps() {
        let bytes = inbox_delete_signed_bytes("QmInbox", &[10, 200]);
        assert_eq!(bytes, b"QmInbox10200".to_vec());
        assert_eq!(inbox_delete_signed_bytes("QmInbox", &[]), b"QmInbox".to_vec());
    }

    #[test]
    fn test_only_posts_stickers_and_embeds_create_rows() {
        let post = Content::Post(PostContent {
            sender_id: "a".into(),
            text: "hi".into(),
            replies_to_message_id: Some("parent".into()),
        });
        assert!(creates_row(&post));
        assert_eq!(replies_to(&post), Some("parent"));

        let reaction = Content::Reaction(ReactionContent {
            sender_id: "a".into(),
            message_id: "m".into(),
            reaction: "+1".into(),
        });
        assert!(!creates_row(&reaction));
        assert!(!creates_row(&Content::Join(SenderOnlyContent { sender_id: "a".into() })));
    }
}
