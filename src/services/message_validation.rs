//! Acceptance rules for inbound content.
//!
//! Rejections are silent drops: the caller logs the message id and moves
//! on. Ownership of a space never implies a permission; only roles do.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

use crate::services::config::MessagingSettings;
use crate::services::types::{
    Channel, Content, EditMessageContent, Mentions, Message, MuteAction, MuteContent, MuteRecord,
    PinAction, Space, PERMISSION_DELETE, PERMISSION_MUTE, PERMISSION_PIN,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("space data unavailable")]
    SpaceUnavailable,
    #[error("channel not found")]
    ChannelNotFound,
    #[error("read-only channel and sender is not a manager")]
    ReadOnlyChannel,
    #[error("message too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
    #[error("too many mentions ({count} > {max})")]
    TooManyMentions { count: usize, max: usize },
    #[error("sender rate limited")]
    RateLimited,
    #[error("sender is muted")]
    SenderMuted,
    #[error("target message missing")]
    TargetMissing,
    #[error("sender does not own the original message")]
    NotOriginalSender,
    #[error("only posts can be edited")]
    NotAPost,
    #[error("edit window expired")]
    EditWindowExpired,
    #[error("not supported in direct conversations")]
    DirectConversation,
    #[error("sender lacks permission")]
    NotPermitted,
    #[error("pin limit reached")]
    PinLimitReached,
    #[error("cannot mute yourself")]
    SelfMute,
    #[error("mute already applied")]
    DuplicateMute,
    #[error("unsigned profile update")]
    UnsignedProfile,
    #[error("conflicting inbox for profile update")]
    InboxMismatch,
}

// ── Rate limiting ──────────────────────────────────────────────

/// Sliding-window limiter, one window per sender.
#[derive(Debug)]
pub struct RateLimiter {
    max_messages: usize,
    window_ms: i64,
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl RateLimiter {
    pub fn new(max_messages: usize, window_ms: i64) -> Self {
        Self {
            max_messages,
            window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt at `now`; false if the sender is over the limit.
    pub fn allow(&self, sender: &str, now: i64) -> bool {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window_ms = self.window_ms;
        windows.retain(|_, window| {
            while window.front().is_some_and(|t| now - *t >= window_ms) {
                window.pop_front();
            }
            !window.is_empty()
        });
        let window = windows.entry(sender.to_string()).or_default();
        if window.len() >= self.max_messages {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Senders with at least one attempt still inside the window.
    pub fn tracked_senders(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

// ── Pipeline ───────────────────────────────────────────────────

pub struct MessageValidator {
    settings: MessagingSettings,
    limiter: RateLimiter,
}

impl MessageValidator {
    pub fn new(settings: MessagingSettings) -> Self {
        let limiter = RateLimiter::new(settings.rate_limit_max_messages, settings.rate_limit_window_ms);
        Self { settings, limiter }
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    /// Checks for content that lands as a new row, in order: channel access,
    /// length, mentions, rate limit (spaces only), mute.
    pub fn check_new_row(
        &self,
        space: Option<&Space>,
        message: &Message,
        mute: Option<&MuteRecord>,
        rate_limited: bool,
        now: i64,
    ) -> Result<(), Rejection> {
        let is_post = message.content.is_post();
        if !message.is_direct() && is_post {
            check_channel_access(space, &message.channel_id, message.content.sender_id())?;
        }
        if let Content::Post(post) = &message.content {
            self.check_length(post.text.char_len())?;
        }
        if let Some(mentions) = &message.mentions {
            self.check_mentions(mentions)?;
        }
        if rate_limited && !message.is_direct() && !self.limiter.allow(message.content.sender_id(), now) {
            return Err(Rejection::RateLimited);
        }
        if mute.is_some_and(|m| is_mute_active(m, now)) {
            return Err(Rejection::SenderMuted);
        }
        Ok(())
    }

    pub fn check_length(&self, len: usize) -> Result<(), Rejection> {
        if len > self.settings.max_message_length {
            return Err(Rejection::TooLong {
                len,
                max: self.settings.max_message_length,
            });
        }
        Ok(())
    }

    pub fn check_mentions(&self, mentions: &Mentions) -> Result<(), Rejection> {
        let count = mentions.total();
        if count > self.settings.max_mentions_per_message {
            return Err(Rejection::TooManyMentions {
                count,
                max: self.settings.max_mentions_per_message,
            });
        }
        Ok(())
    }

    pub fn check_edit(
        &self,
        original: &Message,
        edit: &EditMessageContent,
        now: i64,
    ) -> Result<(), Rejection> {
        if original.content.sender_id() != edit.sender_id {
            return Err(Rejection::NotOriginalSender);
        }
        if !original.content.is_post() {
            return Err(Rejection::NotAPost);
        }
        if now - original.created_date > self.settings.edit_window_ms {
            return Err(Rejection::EditWindowExpired);
        }
        self.check_length(edit.edited_text.char_len())
    }

    /// Pin/unpin authorization plus the per-channel pin limit.
    pub fn check_pin(
        &self,
        space: Option<&Space>,
        message: &Message,
        action: PinAction,
        pinned_in_channel: usize,
    ) -> Result<(), Rejection> {
        if message.is_direct() {
            return Err(Rejection::DirectConversation);
        }
        let sender = message.content.sender_id();
        let space = space.ok_or(Rejection::SpaceUnavailable)?;
        let allowed = match space.find_channel(&message.channel_id) {
            Some(channel) if is_read_only(channel) => space.is_channel_manager(channel, sender),
            _ => space.has_role_permission(sender, PERMISSION_PIN),
        };
        if !allowed {
            return Err(Rejection::NotPermitted);
        }
        if action == PinAction::Pin && pinned_in_channel >= self.settings.max_pinned_messages {
            return Err(Rejection::PinLimitReached);
        }
        Ok(())
    }

    /// Can `request` (a remove-message) delete `target`?
    ///
    /// Without the target there is nothing to authorize against, so no
    /// tombstone may be written for it.
    pub fn check_delete(
        &self,
        space: Option<&Space>,
        target: Option<&Message>,
        request: &Message,
    ) -> Result<(), Rejection> {
        let Some(target) = target else {
            return Err(Rejection::TargetMissing);
        };
        let sender = request.content.sender_id();
        if target.content.sender_id() == sender {
            return Ok(());
        }
        if request.is_direct() {
            return Err(Rejection::NotPermitted);
        }
        if target.space_id != request.space_id || target.channel_id != request.channel_id {
            return Err(Rejection::NotPermitted);
        }
        let space = space.ok_or(Rejection::SpaceUnavailable)?;
        match space.find_channel(&request.channel_id) {
            Some(channel) if is_read_only(channel) => {
                if space.is_channel_manager(channel, sender) {
                    Ok(())
                } else {
                    Err(Rejection::NotPermitted)
                }
            }
            _ if space.has_role_permission(sender, PERMISSION_DELETE) => Ok(()),
            _ => Err(Rejection::NotPermitted),
        }
    }

    pub fn check_mute(
        &self,
        space: Option<&Space>,
        message: &Message,
        mute: &MuteContent,
        existing: Option<&MuteRecord>,
    ) -> Result<(), Rejection> {
        if message.is_direct() {
            return Err(Rejection::DirectConversation);
        }
        if mute.action == MuteAction::Mute && mute.target_user_id == mute.sender_id {
            return Err(Rejection::SelfMute);
        }
        let space = space.ok_or(Rejection::SpaceUnavailable)?;
        if !space.has_role_permission(&mute.sender_id, PERMISSION_MUTE) {
            return Err(Rejection::NotPermitted);
        }
        if mute.action == MuteAction::Mute && existing.is_some_and(|m| m.mute_id == mute.mute_id) {
            return Err(Rejection::DuplicateMute);
        }
        Ok(())
    }
}

fn is_read_only(channel: &Channel) -> bool {
    channel.is_read_only.unwrap_or(false)
}

/// Fail-secure channel gate for space posts.
pub fn check_channel_access(
    space: Option<&Space>,
    channel_id: &str,
    sender: &str,
) -> Result<(), Rejection> {
    let space = space.ok_or(Rejection::SpaceUnavailable)?;
    let channel = space
        .find_channel(channel_id)
        .ok_or(Rejection::ChannelNotFound)?;
    if is_read_only(channel) && !space.is_channel_manager(channel, sender) {
        return Err(Rejection::ReadOnlyChannel);
    }
    Ok(())
}

pub fn is_mute_active(mute: &MuteRecord, now: i64) -> bool {
    mute.expires_at.map_or(true, |at| at > now)
}

// ── Mentions ───────────────────────────────────────────────────

/// Pull `@everyone`, `@<address>`, `@roletag` and `#<channelId>` mentions
/// out of post text. Only whitespace-delimited tokens count.
pub fn extract_mentions(text: &str, space: Option<&Space>, allow_everyone: bool) -> Mentions {
    let mut mentions = Mentions::default();
    for raw in text.split_whitespace() {
        let token = raw.trim_end_matches(|c: char| ",.!?;:)".contains(c));
        if token.eq_ignore_ascii_case("@everyone") {
            if allow_everyone {
                mentions.everyone = Some(true);
            }
        } else if let Some(address) = bracketed(token, '@') {
            if !mentions.member_ids.iter().any(|m| m == address) {
                mentions.member_ids.push(address.to_string());
            }
        } else if let Some(channel_id) = bracketed(token, '#') {
            let known = space.is_some_and(|s| s.find_channel(channel_id).is_some());
            if known && !mentions.channel_ids.iter().any(|c| c == channel_id) {
                mentions.channel_ids.push(channel_id.to_string());
            }
        } else if let Some(tag) = token.strip_prefix('@') {
            let role = space.and_then(|s| {
                s.roles.iter().find(|r| {
                    r.is_public != Some(false)
                        && !r.role_tag.is_empty()
                        && r.role_tag.eq_ignore_ascii_case(tag)
                })
            });
            if let Some(role) = role {
                if !mentions.role_ids.contains(&role.role_id) {
                    mentions.role_ids.push(role.role_id.clone());
                }
            }
        }
    }
    mentions
}

fn bracketed(token: &str, sigil: char) -> Option<&str> {
    token
        .strip_prefix(sigil)?
        .strip_prefix('<')?
        .strip_suffix('>')
        .filter(|inner| !inner.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::types::*;
    use rstest::rstest;

    fn settings() -> MessagingSettings {
        MessagingSettings {
            rate_limit_max_messages: 2,
            ..Default::default()
        }
    }

    fn read_only_space() -> Space {
        Space {
            space_id: "space".into(),
            groups: vec![Group {
                group_name: "g".into(),
                channels: vec![
                    Channel {
                        channel_id: "news".into(),
                        space_id: "space".into(),
                        channel_name: "news".into(),
                        is_read_only: Some(true),
                        manager_role_ids: Some(vec!["mod".into()]),
                        ..Default::default()
                    },
                    Channel {
                        channel_id: "chat".into(),
                        space_id: "space".into(),
                        channel_name: "chat".into(),
                        ..Default::default()
                    },
                ],
            }],
            roles: vec![Role {
                role_id: "mod".into(),
                role_tag: "mods".into(),
                members: vec!["mallory".into()],
                permissions: vec![PERMISSION_PIN.into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn post(channel: &str, sender: &str, text: &str) -> Message {
        Message::new(
            "space",
            channel,
            "m".into(),
            "n".into(),
            0,
            Content::Post(PostContent {
                sender_id: sender.into(),
                text: text.into(),
                replies_to_message_id: None,
            }),
        )
    }

    #[rstest]
    #[case("bob", Err(Rejection::ReadOnlyChannel))]
    #[case("mallory", Ok(()))]
    fn test_read_only_channel_gate(#[case] sender: &str, #[case] expected: Result<(), Rejection>) {
        let v = MessageValidator::new(settings());
        let space = read_only_space();
        let msg = post("news", sender, "hello");
        assert_eq!(v.check_new_row(Some(&space), &msg, None, true, 0), expected);
    }

    #[test]
    fn test_missing_space_fails_secure() {
        let v = MessageValidator::new(settings());
        let msg = post("chat", "bob", "hello");
        assert_eq!(
            v.check_new_row(None, &msg, None, true, 0),
            Err(Rejection::SpaceUnavailable)
        );
    }

    #[test]
    fn test_length_checked_before_rate_limit() {
        let v = MessageValidator::new(settings());
        let space = read_only_space();
        let long = "x".repeat(2501);
        let msg = post("chat", "bob", &long);
        assert!(matches!(
            v.check_new_row(Some(&space), &msg, None, true, 0),
            Err(Rejection::TooLong { len: 2501, .. })
        ));
    }

    #[test]
    fn test_rate_limit_window_slides() {
        let limiter = RateLimiter::new(2, 1000);
        assert!(limiter.allow("bob", 0));
        assert!(limiter.allow("bob", 10));
        assert!(!limiter.allow("bob", 20));
        assert!(limiter.allow("carol", 20));
        assert!(limiter.allow("bob", 1000));
    }

    #[test]
    fn test_rate_limiter_forgets_idle_senders() {
        let limiter = RateLimiter::new(2, 1000);
        assert!(limiter.allow("bob", 0));
        assert!(limiter.allow("carol", 500));
        assert_eq!(limiter.tracked_senders(), 2);
        assert!(limiter.allow("dave", 1200));
        assert_eq!(limiter.tracked_senders(), 2);
        assert!(limiter.allow("erin", 5000));
        assert_eq!(limiter.tracked_senders(), 1);
    }

    #[test]
    fn test_expired_mute_is_ignored() {
        let v = MessageValidator::new(settings());
        let space = read_only_space();
        let msg = post("chat", "bob", "hi");
        let mut mute = MuteRecord {
            space_id: "space".into(),
            target_user_id: "bob".into(),
            muted_by: "mallory".into(),
            mute_id: "x".into(),
            timestamp: 0,
            expires_at: Some(100),
        };
        assert_eq!(
            v.check_new_row(Some(&space), &msg, Some(&mute), false, 50),
            Err(Rejection::SenderMuted)
        );
        assert!(v.check_new_row(Some(&space), &msg, Some(&mute), false, 100).is_ok());
        mute.expires_at = None;
        assert!(v.check_new_row(Some(&space), &msg, Some(&mute), false, 10_000).is_err());
    }

    #[rstest]
    #[case(15 * 60 * 1000 + 1, Err(Rejection::EditWindowExpired))]
    #[case(14 * 60 * 1000 + 59 * 1000, Ok(()))]
    fn test_edit_window(#[case] elapsed: i64, #[case] expected: Result<(), Rejection>) {
        let v = MessageValidator::new(settings());
        let original = post("chat", "bob", "v1");
        let edit = EditMessageContent {
            sender_id: "bob".into(),
            original_message_id: "m".into(),
            edited_text: "v2".into(),
            edited_at: elapsed,
            edit_nonce: "e".into(),
            edit_signature: None,
        };
        assert_eq!(v.check_edit(&original, &edit, elapsed), expected);
    }

    #[test]
    fn test_pin_limit_and_owner_has_no_implicit_permission() {
        let v = MessageValidator::new(settings());
        let space = read_only_space();
        let by_mod = post("chat", "mallory", "");
        assert!(v.check_pin(Some(&space), &by_mod, PinAction::Pin, 49).is_ok());
        assert_eq!(
            v.check_pin(Some(&space), &by_mod, PinAction::Pin, 50),
            Err(Rejection::PinLimitReached)
        );
        assert!(v.check_pin(Some(&space), &by_mod, PinAction::Unpin, 50).is_ok());

        let by_owner = post("chat", "owner", "");
        assert_eq!(
            v.check_pin(Some(&space), &by_owner, PinAction::Pin, 0),
            Err(Rejection::NotPermitted)
        );
    }

    #[test]
    fn test_delete_rules() {
        let v = MessageValidator::new(settings());
        let space = read_only_space();
        let target = post("news", "mallory", "announcement");
        let mut request = post("news", "bob", "");
        assert_eq!(
            v.check_delete(Some(&space), Some(&target), &request),
            Err(Rejection::NotPermitted)
        );
        request.content.set_sender_id("mallory");
        assert!(v.check_delete(Some(&space), Some(&target), &request).is_ok());
        assert_eq!(
            v.check_delete(Some(&space), None, &request),
            Err(Rejection::TargetMissing)
        );
    }

    #[test]
    fn test_extract_mentions() {
        let space = read_only_space();
        let m = extract_mentions(
            "hey @<QmBob>, @mods see #<news> and @everyone @<QmBob>",
            Some(&space),
            false,
        );
        assert_eq!(m.member_ids, vec!["QmBob".to_string()]);
        assert_eq!(m.role_ids, vec!["mod".to_string()]);
        assert_eq!(m.channel_ids, vec!["news".to_string()]);
        assert_eq!(m.everyone, None);

        let m = extract_mentions("@everyone", None, true);
        assert_eq!(m.everyone, Some(true));
    }
}
