//! Shared message, space and conversation types.
//!
//! Wire shapes use camelCase to stay compatible with other clients on the
//! same hub; member rows keep their snake_case field names.

use serde::{Deserialize, Serialize};

// ── Message content ────────────────────────────────────────────

/// Post/edit text: either a single string or a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Text {
    Single(String),
    Lines(Vec<String>),
}

impl Text {
    pub fn joined(&self) -> String {
        match self {
            Text::Single(s) => s.clone(),
            Text::Lines(lines) => lines.concat(),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            Text::Single(s) => s.chars().count(),
            Text::Lines(lines) => lines.iter().map(|l| l.chars().count()).sum(),
        }
    }
}

impl From<&str> for Text {
    fn from(s: &str) -> Self {
        Text::Single(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostContent {
    pub sender_id: String,
    pub text: Text,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies_to_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionContent {
    pub sender_id: String,
    pub message_id: String,
    pub reaction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMessageContent {
    pub sender_id: String,
    pub remove_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageContent {
    pub sender_id: String,
    pub original_message_id: String,
    pub edited_text: Text,
    pub edited_at: i64,
    pub edit_nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinAction {
    Pin,
    Unpin,
}

impl PinAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinAction::Pin => "pin",
            PinAction::Unpin => "unpin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinContent {
    pub sender_id: String,
    pub target_message_id: String,
    pub action: PinAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileContent {
    pub sender_id: String,
    pub display_name: String,
    pub user_icon: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteAction {
    Mute,
    Unmute,
}

impl MuteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MuteAction::Mute => "mute",
            MuteAction::Unmute => "unmute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteContent {
    pub sender_id: String,
    pub target_user_id: String,
    pub mute_id: String,
    pub timestamp: i64,
    pub action: MuteAction,
    /// Milliseconds; absent means indefinite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerContent {
    pub sender_id: String,
    pub sticker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies_to_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedContent {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_large_gif: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies_to_message_id: Option<String>,
}

/// Content that only names its sender (join, leave, kick, delete-conversation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderOnlyContent {
    pub sender_id: String,
}

/// Message payload, discriminated by the `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Content {
    Post(PostContent),
    Reaction(ReactionContent),
    RemoveReaction(ReactionContent),
    RemoveMessage(RemoveMessageContent),
    EditMessage(EditMessageContent),
    Pin(PinContent),
    UpdateProfile(UpdateProfileContent),
    Mute(MuteContent),
    Join(SenderOnlyContent),
    Leave(SenderOnlyContent),
    Kick(SenderOnlyContent),
    Sticker(StickerContent),
    Embed(EmbedContent),
    DeleteConversation(SenderOnlyContent),
}

impl Content {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Content::Post(_) => "post",
            Content::Reaction(_) => "reaction",
            Content::RemoveReaction(_) => "remove-reaction",
            Content::RemoveMessage(_) => "remove-message",
            Content::EditMessage(_) => "edit-message",
            Content::Pin(_) => "pin",
            Content::UpdateProfile(_) => "update-profile",
            Content::Mute(_) => "mute",
            Content::Join(_) => "join",
            Content::Leave(_) => "leave",
            Content::Kick(_) => "kick",
            Content::Sticker(_) => "sticker",
            Content::Embed(_) => "embed",
            Content::DeleteConversation(_) => "delete-conversation",
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Content::Post(c) => &c.sender_id,
            Content::Reaction(c) | Content::RemoveReaction(c) => &c.sender_id,
            Content::RemoveMessage(c) => &c.sender_id,
            Content::EditMessage(c) => &c.sender_id,
            Content::Pin(c) => &c.sender_id,
            Content::UpdateProfile(c) => &c.sender_id,
            Content::Mute(c) => &c.sender_id,
            Content::Join(c)
            | Content::Leave(c)
            | Content::Kick(c)
            | Content::DeleteConversation(c) => &c.sender_id,
            Content::Sticker(c) => &c.sender_id,
            Content::Embed(c) => &c.sender_id,
        }
    }

    pub fn set_sender_id(&mut self, sender: &str) {
        let slot = match self {
            Content::Post(c) => &mut c.sender_id,
            Content::Reaction(c) | Content::RemoveReaction(c) => &mut c.sender_id,
            Content::RemoveMessage(c) => &mut c.sender_id,
            Content::EditMessage(c) => &mut c.sender_id,
            Content::Pin(c) => &mut c.sender_id,
            Content::UpdateProfile(c) => &mut c.sender_id,
            Content::Mute(c) => &mut c.sender_id,
            Content::Join(c)
            | Content::Leave(c)
            | Content::Kick(c)
            | Content::DeleteConversation(c) => &mut c.sender_id,
            Content::Sticker(c) => &mut c.sender_id,
            Content::Embed(c) => &mut c.sender_id,
        };
        *slot = sender.to_string();
    }

    pub fn is_post(&self) -> bool {
        matches!(self, Content::Post(_))
    }
}

// ── Message ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sending,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mentions {
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub everyone: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mention_count: Option<usize>,
}

impl Mentions {
    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
            && self.role_ids.is_empty()
            && self.channel_ids.is_empty()
            && !self.everyone.unwrap_or(false)
    }

    pub fn total(&self) -> usize {
        self.member_ids.len()
            + self.role_ids.len()
            + self.channel_ids.len()
            + usize::from(self.everyone.unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji_id: String,
    pub emoji_name: String,
    pub space_id: String,
    pub count: usize,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMetadata {
    pub parent_author: String,
    pub parent_channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub text: Text,
    pub modified_date: i64,
    pub last_modified_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub space_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub digest_algorithm: String,
    pub nonce: String,
    pub created_date: i64,
    pub modified_date: i64,
    pub last_modified_hash: String,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Mentions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_metadata: Option<ReplyMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<Vec<EditRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_status: Option<SendStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_error: Option<String>,
}

pub const DIGEST_ALGORITHM: &str = "SHA-256";

impl Message {
    pub fn new(
        space_id: &str,
        channel_id: &str,
        message_id: String,
        nonce: String,
        now: i64,
        content: Content,
    ) -> Self {
        Self {
            space_id: space_id.to_string(),
            channel_id: channel_id.to_string(),
            message_id,
            digest_algorithm: DIGEST_ALGORITHM.to_string(),
            nonce,
            created_date: now,
            modified_date: now,
            last_modified_hash: String::new(),
            content,
            mentions: None,
            reply_metadata: None,
            reactions: Vec::new(),
            edits: None,
            is_pinned: None,
            pinned_at: None,
            pinned_by: None,
            public_key: None,
            signature: None,
            send_status: None,
            send_error: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.space_id == self.channel_id
    }

    /// Copy with the UI-only delivery fields removed.
    pub fn without_ephemeral(&self) -> Self {
        let mut m = self.clone();
        m.send_status = None;
        m.send_error = None;
        m
    }

    /// Add `member` to the reaction set for `emoji`. Re-adding is a no-op.
    pub fn add_reaction(&mut self, emoji: &str, member: &str) {
        let mut members: Vec<String> = self
            .reactions
            .iter()
            .find(|r| r.emoji_id == emoji)
            .map(|r| r.member_ids.clone())
            .unwrap_or_default();
        members.retain(|m| m != member);
        members.push(member.to_string());
        self.put_reaction(emoji, members);
    }

    /// Drop `member` from the reaction set; an emptied set disappears.
    pub fn remove_reaction(&mut self, emoji: &str, member: &str) {
        let Some(existing) = self.reactions.iter().find(|r| r.emoji_id == emoji) else {
            return;
        };
        let members: Vec<String> = existing
            .member_ids
            .iter()
            .filter(|m| *m != member)
            .cloned()
            .collect();
        if members.is_empty() {
            self.reactions.retain(|r| r.emoji_id != emoji);
        } else {
            self.put_reaction(emoji, members);
        }
    }

    fn put_reaction(&mut self, emoji: &str, members: Vec<String>) {
        let space_id = if self.is_direct() {
            String::new()
        } else {
            self.space_id.clone()
        };
        self.reactions.retain(|r| r.emoji_id != emoji);
        self.reactions.push(Reaction {
            emoji_id: emoji.to_string(),
            emoji_name: emoji.to_string(),
            space_id,
            count: members.len(),
            member_ids: members,
        });
    }

    /// Replace the post text with `edit`, keeping history when enabled.
    ///
    /// An edit whose nonce already matches `last_modified_hash` leaves the
    /// history alone so replays do not stack duplicate entries.
    pub fn apply_edit(&mut self, edit: &EditMessageContent, keep_history: bool) {
        let Content::Post(post) = &mut self.content else {
            return;
        };
        let current = post.text.clone();
        let existing = self.edits.take().unwrap_or_default();

        let edits = if self.last_modified_hash == edit.edit_nonce {
            existing
        } else if !keep_history {
            Vec::new()
        } else if self.modified_date == self.created_date {
            vec![EditRecord {
                text: current,
                modified_date: self.created_date,
                last_modified_hash: self.nonce.clone(),
            }]
        } else if !existing.is_empty() {
            let hash = if self.last_modified_hash.is_empty() {
                self.nonce.clone()
            } else {
                self.last_modified_hash.clone()
            };
            let mut edits = existing;
            edits.push(EditRecord {
                text: current,
                modified_date: self.modified_date,
                last_modified_hash: hash,
            });
            edits
        } else {
            existing
        };

        post.text = edit.edited_text.clone();
        self.modified_date = edit.edited_at;
        self.last_modified_hash = edit.edit_nonce.clone();
        self.edits = Some(edits);
    }

    pub fn set_pinned(&mut self, action: PinAction, by: &str, now: i64) {
        match action {
            PinAction::Pin => {
                self.is_pinned = Some(true);
                self.pinned_at = Some(now);
                self.pinned_by = Some(by.to_string());
            }
            PinAction::Unpin => {
                self.is_pinned = Some(false);
                self.pinned_at = None;
                self.pinned_by = None;
            }
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.is_pinned.unwrap_or(false)
    }
}

// ── Spaces ─────────────────────────────────────────────────────

pub const PERMISSION_DELETE: &str = "message:delete";
pub const PERMISSION_PIN: &str = "message:pin";
pub const PERMISSION_MENTION_EVERYONE: &str = "mention:everyone";
pub const PERMISSION_MUTE: &str = "user:mute";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role_tag: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    pub space_id: String,
    pub channel_name: String,
    #[serde(default)]
    pub channel_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_key: Option<String>,
    pub created_date: i64,
    pub modified_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_role_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_name: String,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Emoji {
    pub name: String,
    pub id: String,
    pub img_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub space_id: String,
    pub space_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub vanity_url: String,
    #[serde(default)]
    pub invite_url: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default)]
    pub banner_url: String,
    pub default_channel_id: String,
    pub hub_address: String,
    pub created_date: i64,
    pub modified_date: i64,
    #[serde(default)]
    pub is_repudiable: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_edit_history: Option<bool>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub emojis: Vec<Emoji>,
    #[serde(default)]
    pub stickers: Vec<Emoji>,
}

impl Space {
    pub fn find_channel(&self, channel_id: &str) -> Option<&Channel> {
        self.groups
            .iter()
            .flat_map(|g| g.channels.iter())
            .find(|c| c.channel_id == channel_id)
    }

    /// Role-granted permission check. Ownership never implies a permission.
    pub fn has_role_permission(&self, user_address: &str, permission: &str) -> bool {
        self.roles.iter().any(|r| {
            r.members.iter().any(|m| m == user_address)
                && r.permissions.iter().any(|p| p == permission)
        })
    }

    pub fn is_channel_manager(&self, channel: &Channel, user_address: &str) -> bool {
        let managers = match &channel.manager_role_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => return false,
        };
        self.roles.iter().any(|r| {
            managers.contains(&r.role_id) && r.members.iter().any(|m| m == user_address)
        })
    }

    pub fn remove_from_roles(&mut self, user_address: &str) {
        for role in &mut self.roles {
            role.members.retain(|m| m != user_address);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceMember {
    pub user_address: String,
    #[serde(default)]
    pub inbox_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_icon: Option<String>,
    #[serde(default, rename = "isKicked", skip_serializing_if = "Option::is_none")]
    pub is_kicked: Option<bool>,
}

/// Named key material for a space (`config`, `hub`, `owner`, `inbox`,
/// the space id itself, or a channel group address).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceKey {
    pub space_id: String,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub public_key: String,
    pub private_key: String,
}

impl std::fmt::Debug for SpaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceKey")
            .field("space_id", &self.space_id)
            .field("key_id", &self.key_id)
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

pub mod key_ids {
    pub const CONFIG: &str = "config";
    pub const HUB: &str = "hub";
    pub const OWNER: &str = "owner";
    pub const INBOX: &str = "inbox";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteRecord {
    pub space_id: String,
    pub target_user_id: String,
    pub muted_by: String,
    pub mute_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

// ── Conversations and user config ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub timestamp: i64,
    pub address: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub last_read_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_repudiable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_edit_history: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

pub const UNKNOWN_USER: &str = "Unknown User";

/// Profile details attached to a DM conversation row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_icon: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub address: String,
    #[serde(default)]
    pub space_ids: Vec<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub allow_sync: bool,
    #[serde(default)]
    pub non_repudiable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub space_keys: Vec<SpaceKeyBundle>,
}

impl UserConfig {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }
}

/// Keys and current ratchet state for one space, carried in synced config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceKeyBundle {
    pub space_id: String,
    pub encryption_state: crate::crypto::ratchet_state::EncryptionState,
    pub keys: Vec<SpaceKey>,
}

// ── Local identity ─────────────────────────────────────────────

/// The signed-in user's key material and public profile.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_address: String,
    pub user_keyset: crate::crypto::provider::UserKeyset,
    pub device_keyset: crate::crypto::provider::DeviceKeyset,
    pub registration: crate::crypto::provider::UserRegistration,
    pub display_name: String,
    pub user_icon: Option<String>,
}

impl Identity {
    pub fn device_inbox(&self) -> &str {
        &self.device_keyset.inbox_keyset.inbox_address
    }
}

/// Raw inbound frame delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub inbox_address: String,
    pub encrypted_content: String,
    pub timestamp: i64,
}
