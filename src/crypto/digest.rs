//! Content addressing: message ids, inbox addresses and canonical forms.

use sha2::{Digest, Sha256};

use crate::error::{QuorumError, Result};
use crate::services::types::Content;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Multihash prefix for a 32-byte SHA-256 digest.
const SHA256_MULTIHASH: [u8; 2] = [0x12, 0x20];

/// Address of an inbox, space or hub: base58btc of the public key's
/// SHA-256 multihash, which is why addresses start with `Qm`.
pub fn inbox_address(public_key: &[u8]) -> String {
    let mut bytes = SHA256_MULTIHASH.to_vec();
    bytes.extend_from_slice(&sha256(public_key));
    bs58::encode(bytes).into_string()
}

pub fn inbox_address_from_hex(public_key_hex: &str) -> Result<String> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| QuorumError::Crypto(format!("public key hex: {}", e)))?;
    Ok(inbox_address(&bytes))
}

/// Big-endian 8-byte encoding used in signed registration payloads.
pub fn int64_to_bytes(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Canonical string form of message content used in id derivation.
///
/// Membership events and conversation deletes have no canonical form; their
/// ids are derived separately.
pub fn canonicalize(content: &Content) -> Result<String> {
    let out = match content {
        Content::Post(p) => p.text.joined(),
        Content::UpdateProfile(u) => format!("update-profile{}{}", u.display_name, u.user_icon),
        Content::Embed(e) => format!(
            "embed{}{}{}{}{}",
            e.width.as_deref().unwrap_or(""),
            e.height.as_deref().unwrap_or(""),
            e.image_url.as_deref().unwrap_or(""),
            e.replies_to_message_id.as_deref().unwrap_or(""),
            e.video_url.as_deref().unwrap_or(""),
        ),
        Content::Reaction(r) => format!("reaction{}{}", r.message_id, r.reaction),
        Content::RemoveReaction(r) => format!("remove-reaction{}{}", r.message_id, r.reaction),
        Content::RemoveMessage(r) => format!("remove-message{}", r.remove_message_id),
        Content::Sticker(s) => format!(
            "sticker{}{}",
            s.sticker_id,
            s.replies_to_message_id.as_deref().unwrap_or("")
        ),
        Content::EditMessage(e) => format!(
            "edit-message{}{}{}",
            e.original_message_id,
            e.edited_text.joined(),
            e.edit_nonce
        ),
        Content::Pin(p) => format!("pin{}{}", p.target_message_id, p.action.as_str()),
        Content::Mute(m) => format!(
            "mute{}{}{}{}",
            m.target_user_id,
            m.mute_id,
            m.timestamp,
            m.action.as_str()
        ),
        other => {
            return Err(QuorumError::Validation(format!(
                "invalid message type: {}",
                other.type_tag()
            )))
        }
    };
    Ok(out)
}

/// Raw digest behind a message id: `SHA-256(nonce + tag + sender + canonical)`.
pub fn message_digest(nonce: &str, type_tag: &str, sender: &str, content: &Content) -> Result<[u8; 32]> {
    let canonical = canonicalize(content)?;
    let preimage = format!("{}{}{}{}", nonce, type_tag, sender, canonical);
    Ok(sha256(preimage.as_bytes()))
}

pub fn message_id(nonce: &str, type_tag: &str, sender: &str, content: &Content) -> Result<String> {
    Ok(hex::encode(message_digest(nonce, type_tag, sender, content)?))
}

/// Deterministic id for a synthetic history row (`join`, `leave`, `kick`).
/// Doubles as the row's nonce.
pub fn event_id(kind: &str, subject: &str) -> String {
    hex::encode(sha256(format!("{}{}", kind, subject).as_bytes()))
}

/// Fresh random nonce for outbound messages.
pub fn new_nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::types::*;
    use rstest::rstest;

    fn post(text: Text) -> Content {
        Content::Post(PostContent {
            sender_id: "QmSender".into(),
            text,
            replies_to_message_id: None,
        })
    }

    #[rstest]
    #[case(post("hello".into()), "hello")]
    #[case(post(Text::Lines(vec!["a".into(), "b".into()])), "ab")]
    #[case(
        Content::Reaction(ReactionContent { sender_id: "s".into(), message_id: "m1".into(), reaction: "👍".into() }),
        "reactionm1👍"
    )]
    #[case(
        Content::RemoveMessage(RemoveMessageContent { sender_id: "s".into(), remove_message_id: "m2".into() }),
        "remove-messagem2"
    )]
    #[case(
        Content::Sticker(StickerContent { sender_id: "s".into(), sticker_id: "st".into(), replies_to_message_id: None }),
        "stickerst"
    )]
    #[case(
        Content::Pin(PinContent { sender_id: "s".into(), target_message_id: "t".into(), action: PinAction::Unpin }),
        "pintunpin"
    )]
    #[case(
        Content::Mute(MuteContent {
            sender_id: "s".into(), target_user_id: "u".into(), mute_id: "x".into(),
            timestamp: 42, action: MuteAction::Mute, duration: Some(5)
        }),
        "muteux42mute"
    )]
    #[case(
        Content::Embed(EmbedContent {
            sender_id: "s".into(), image_url: Some("i".into()), thumbnail_url: None,
            video_url: None, width: Some("10".into()), height: None, is_large_gif: None,
            replies_to_message_id: None
        }),
        "embed10i"
    )]
    fn test_canonicalize(#[case] content: Content, #[case] expected: &str) {
        assert_eq!(canonicalize(&content).unwrap(), expected);
    }

    #[test]
    fn test_canonicalize_rejects_membership_events() {
        let join = Content::Join(SenderOnlyContent {
            sender_id: "s".into(),
        });
        assert!(canonicalize(&join).is_err());
    }

    #[test]
    fn test_message_id_is_deterministic() {
        let content = post("hello".into());
        let a = message_id("n1", "post", "QmSender", &content).unwrap();
        let b = message_id("n1", "post", "QmSender", &content).unwrap();
        let c = message_id("n2", "post", "QmSender", &content).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, hex::encode(sha256(b"n1postQmSenderhello")));
    }

    #[test]
    fn test_inbox_address_is_base58_multihash() {
        let addr = inbox_address(&[1, 2, 3]);
        assert!(addr.starts_with("Qm"));
        let decoded = bs58::decode(&addr).into_vec().unwrap();
        assert_eq!(&decoded[..2], &[0x12, 0x20]);
        assert_eq!(&decoded[2..], &sha256(&[1, 2, 3])[..]);
        assert_eq!(inbox_address_from_hex("010203").unwrap(), addr);
    }

    #[test]
    fn test_event_id_matches_nonce_scheme() {
        assert_eq!(event_id("kick", "QmU"), hex::encode(sha256(b"kickQmU")));
    }
}
