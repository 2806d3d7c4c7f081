//! Action queue handlers, one per task kind.
//!
//! Each handler deserializes its task context, re-checks that the target
//! still exists (a space may have been deleted while the task waited) and
//! hands the work to the owning service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::crypto::digest::sha256;
use crate::error::{sanitize_error, QuorumError, Result};
use crate::services::action_queue::{ActionHandler, ActionKind, ActionQueue};
use crate::services::message_service::MessageService;
use crate::services::message_store::MessageStore;
use crate::services::space_service::SpaceService;
use crate::services::types::{Content, Message, Space};

// ── Task contexts ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessageTask {
    pub space_id: String,
    pub channel_id: String,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageTask {
    pub address: String,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceUpdateTask {
    pub space: Space,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickTask {
    pub space_id: String,
    pub user_address: String,
}

/// Moderation or reaction content to submit to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelActionTask {
    pub space_id: String,
    pub channel_id: String,
    pub content: Content,
}

fn context<T: for<'de> Deserialize<'de>>(value: &serde_json::Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| QuorumError::Queue(format!("Malformed task context: {}", e)))
}

fn has_status(error: &QuorumError, codes: &[u16]) -> bool {
    error.status().is_some_and(|s| codes.contains(&s))
}

fn is_permission_error(error: &QuorumError) -> bool {
    matches!(error, QuorumError::PermissionDenied(_))
        || error.to_string().to_lowercase().contains("permission")
}

/// Queue `content` for a channel under a key derived from the content, so
/// a double-clicked reaction or pin is only sent once.
pub async fn enqueue_channel_action(
    queue: &ActionQueue,
    kind: ActionKind,
    space_id: &str,
    channel_id: &str,
    content: Content,
) -> Result<u64> {
    let digest = hex::encode(sha256(&serde_json::to_vec(&content)?));
    let key = format!("{}:{}:{}:{}", kind.as_str(), space_id, channel_id, digest);
    let task = ChannelActionTask {
        space_id: space_id.to_string(),
        channel_id: channel_id.to_string(),
        content,
    };
    queue.enqueue(kind, serde_json::to_value(&task)?, &key).await
}

// ── Sends ──────────────────────────────────────────────────────

pub struct SendChannelMessageHandler {
    store: Arc<dyn MessageStore>,
    messages: Arc<MessageService>,
}

impl SendChannelMessageHandler {
    pub fn new(store: Arc<dyn MessageStore>, messages: Arc<MessageService>) -> Self {
        Self { store, messages }
    }
}

#[async_trait]
impl ActionHandler for SendChannelMessageHandler {
    async fn execute(&self, value: &serde_json::Value) -> Result<()> {
        let task: ChannelMessageTask = context(value)?;
        let Some(space) = self.store.get_space(&task.space_id).await? else {
            log::info!("Discarding message for deleted space {}", task.space_id);
            return Ok(());
        };
        if space.find_channel(&task.channel_id).is_none() {
            log::info!("Discarding message for deleted channel {}", task.channel_id);
            return Ok(());
        }
        self.messages.deliver_channel_message(&task.message).await
    }

    fn is_permanent_error(&self, error: &QuorumError) -> bool {
        has_status(error, &[400, 403, 404]) || error.is_not_found()
    }

    async fn on_failure(&self, value: &serde_json::Value, error: &QuorumError) {
        let Ok(task) = context::<ChannelMessageTask>(value) else {
            return;
        };
        self.messages
            .cache()
            .mark_failed(
                &task.space_id,
                &task.channel_id,
                &task.message.message_id,
                &sanitize_error(error),
            )
            .await;
    }
}

pub struct SendDmHandler {
    messages: Arc<MessageService>,
}

impl SendDmHandler {
    pub fn new(messages: Arc<MessageService>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl ActionHandler for SendDmHandler {
    async fn execute(&self, value: &serde_json::Value) -> Result<()> {
        let task: DirectMessageTask = context(value)?;
        self.messages.deliver_direct(&task.address, &task.message).await
    }

    fn is_permanent_error(&self, error: &QuorumError) -> bool {
        has_status(error, &[400, 403, 404])
    }

    async fn on_failure(&self, value: &serde_json::Value, error: &QuorumError) {
        let Ok(task) = context::<DirectMessageTask>(value) else {
            return;
        };
        self.messages
            .cache()
            .mark_failed(
                &task.address,
                &task.address,
                &task.message.message_id,
                &sanitize_error(error),
            )
            .await;
    }
}

// ── Space administration ───────────────────────────────────────

pub struct UpdateSpaceHandler {
    store: Arc<dyn MessageStore>,
    spaces: Arc<SpaceService>,
}

impl UpdateSpaceHandler {
    pub fn new(store: Arc<dyn MessageStore>, spaces: Arc<SpaceService>) -> Self {
        Self { store, spaces }
    }
}

#[async_trait]
impl ActionHandler for UpdateSpaceHandler {
    async fn execute(&self, value: &serde_json::Value) -> Result<()> {
        let task: SpaceUpdateTask = context(value)?;
        if self.store.get_space(&task.space.space_id).await?.is_none() {
            log::info!("Discarding update for deleted space {}", task.space.space_id);
            return Ok(());
        }
        self.spaces.publish_space(&task.space).await
    }

    fn is_permanent_error(&self, error: &QuorumError) -> bool {
        is_permission_error(error) || has_status(error, &[403]) || error.is_not_found()
    }

    async fn on_failure(&self, value: &serde_json::Value, error: &QuorumError) {
        if let Ok(task) = context::<SpaceUpdateTask>(value) {
            log::error!("Space update for {} failed: {}", task.space.space_id, error);
        }
    }
}

pub struct KickUserHandler {
    store: Arc<dyn MessageStore>,
    spaces: Arc<SpaceService>,
}

impl KickUserHandler {
    pub fn new(store: Arc<dyn MessageStore>, spaces: Arc<SpaceService>) -> Self {
        Self { store, spaces }
    }
}

#[async_trait]
impl ActionHandler for KickUserHandler {
    async fn execute(&self, value: &serde_json::Value) -> Result<()> {
        let task: KickTask = context(value)?;
        let present = self
            .store
            .get_space_member(&task.space_id, &task.user_address)
            .await?
            .is_some_and(|m| m.is_kicked != Some(true));
        if !present {
            log::info!("{} already left {}, skipping kick", task.user_address, task.space_id);
            return Ok(());
        }
        self.spaces.kick_user(&task.space_id, &task.user_address).await
    }

    fn is_permanent_error(&self, error: &QuorumError) -> bool {
        is_permission_error(error) || has_status(error, &[403]) || error.is_not_found()
    }

    async fn on_failure(&self, value: &serde_json::Value, error: &QuorumError) {
        if let Ok(task) = context::<KickTask>(value) {
            log::error!(
                "Kick of {} from {} failed: {}",
                task.user_address,
                task.space_id,
                error
            );
        }
    }
}

// ── Channel actions ────────────────────────────────────────────

/// Mute, unmute, pin, unpin, edit, delete and reaction tasks. They differ
/// only in their precondition and which errors are final.
pub struct ChannelActionHandler {
    kind: ActionKind,
    store: Arc<dyn MessageStore>,
    messages: Arc<MessageService>,
}

impl ChannelActionHandler {
    pub fn new(kind: ActionKind, store: Arc<dyn MessageStore>, messages: Arc<MessageService>) -> Self {
        Self {
            kind,
            store,
            messages,
        }
    }

    fn target(content: &Content) -> Option<&str> {
        match content {
            Content::Pin(p) => Some(&p.target_message_id),
            Content::EditMessage(e) => Some(&e.original_message_id),
            _ => None,
        }
    }
}

#[async_trait]
impl ActionHandler for ChannelActionHandler {
    async fn execute(&self, value: &serde_json::Value) -> Result<()> {
        let task: ChannelActionTask = context(value)?;
        if let Some(target) = Self::target(&task.content) {
            if self.store.get_message(target).await?.is_none() {
                log::info!("{} target {} is gone, skipping", self.kind.as_str(), target);
                return Ok(());
            }
        }
        let sent = self
            .messages
            .submit_channel_message(&task.space_id, &task.channel_id, task.content)
            .await;
        match sent {
            Err(e) if self.kind == ActionKind::DeleteMessage && e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn is_permanent_error(&self, error: &QuorumError) -> bool {
        match self.kind {
            ActionKind::MuteUser | ActionKind::UnmuteUser => {
                is_permission_error(error) || has_status(error, &[403])
            }
            ActionKind::DeleteMessage => false,
            _ => has_status(error, &[404]),
        }
    }

    async fn on_failure(&self, value: &serde_json::Value, error: &QuorumError) {
        if let Ok(task) = context::<ChannelActionTask>(value) {
            log::warn!(
                "{} in {}/{} failed: {}",
                self.kind.as_str(),
                task.space_id,
                task.channel_id,
                error
            );
        }
    }
}

/// Register every handler on `queue`.
pub async fn register_handlers(
    queue: &ActionQueue,
    store: Arc<dyn MessageStore>,
    messages: Arc<MessageService>,
    spaces: Arc<SpaceService>,
) {
    queue
        .register(
            ActionKind::SendChannelMessage,
            Arc::new(SendChannelMessageHandler::new(store.clone(), messages.clone())),
        )
        .await;
    queue
        .register(ActionKind::SendDm, Arc::new(SendDmHandler::new(messages.clone())))
        .await;
    queue
        .register(
            ActionKind::UpdateSpace,
            Arc::new(UpdateSpaceHandler::new(store.clone(), spaces.clone())),
        )
        .await;
    queue
        .register(
            ActionKind::KickUser,
            Arc::new(KickUserHandler::new(store.clone(), spaces)),
        )
        .await;
    for kind in [
        ActionKind::MuteUser,
        ActionKind::UnmuteUser,
        ActionKind::PinMessage,
        ActionKind::UnpinMessage,
        ActionKind::EditMessage,
        ActionKind::DeleteMessage,
        ActionKind::Reaction,
    ] {
        queue
            .register(
                kind,
                Arc::new(ChannelActionHandler::new(kind, store.clone(), messages.clone())),
            )
            .await;
    }
}
