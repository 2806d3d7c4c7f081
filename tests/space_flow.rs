// Integration tests for the space lifecycle: creation, channel traffic,
// public invites, joining and kicking, with clients talking through a
// shared in-memory directory.

mod common;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::sync::Arc;

use common::{
    client, control_type, deliver, drain, envelopes, join_space, joined_pair, owned_space, post, space_inbox,
    FakeDirectory,
};
use quorum_core::crypto::provider::SpaceSession;
use quorum_core::crypto::ratchet_state::conversation_id;
use quorum_core::services::space_control::ControlMessage;
use quorum_core::services::transport::OutboundFrame;
use quorum_core::services::types::{key_ids, Content, SpaceMember};
use quorum_core::{AppState, QuorumError};

async fn config_public(state: &AppState, space_id: &str) -> String {
    state
        .store
        .get_space_key(space_id, key_ids::CONFIG)
        .await
        .unwrap()
        .unwrap()
        .public_key
}

async fn kicked_flag(state: &AppState, space_id: &str, address: &str) -> Option<bool> {
    state
        .store
        .get_space_member(space_id, address)
        .await
        .unwrap()
        .unwrap()
        .is_kicked
}

fn inbox_key(state: &AppState) -> String {
    B64.encode(&state.identity.device_keyset.inbox_keyset.inbox_encryption_key.public_key)
}

#[tokio::test]
async fn test_create_space_persists_keys_and_registers() {
    let directory = Arc::new(FakeDirectory::default());
    let owner = client(&directory, "Owner").await;

    let created = owner
        .spaces
        .create_space("Test Space", "https://img/icon.png", false, true)
        .await
        .unwrap();

    let space = owner.store.get_space(&created.space_id).await.unwrap().unwrap();
    assert_eq!(space.space_name, "Test Space");
    assert_eq!(space.default_channel_id, created.channel_id);
    assert!(space.find_channel(&created.channel_id).is_some());
    assert!(space.invite_url.is_empty());

    for key_id in [
        key_ids::CONFIG,
        key_ids::HUB,
        key_ids::OWNER,
        key_ids::INBOX,
        created.channel_id.as_str(),
        created.space_id.as_str(),
    ] {
        assert!(
            owner.store.get_space_key(&created.space_id, key_id).await.unwrap().is_some(),
            "missing {} key",
            key_id
        );
    }

    let states = owner
        .store
        .get_encryption_states(&conversation_id(&created.space_id))
        .await
        .unwrap();
    assert_eq!(states.len(), 1);
    assert!(SpaceSession::parse(&states[0].state).unwrap().template.is_some());

    let me = owner
        .store
        .get_space_member(&created.space_id, &owner.identity.user_address)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(me.inbox_address, space_inbox(&owner, &created.space_id).await);

    directory.with(|d| {
        assert!(d.spaces.contains_key(&created.space_id));
        assert!(d.manifests.contains_key(&created.space_id));
        assert_eq!(d.hub_adds.len(), 1);
    });
    let config = owner.user_config.local_config().await.unwrap();
    assert_eq!(config.space_ids, vec![created.space_id.clone()]);

    let frames = drain(&owner).await;
    assert!(matches!(&frames[..], [OutboundFrame::Listen { .. }]));
}

#[tokio::test]
async fn test_channel_post_is_queued_then_relayed() {
    let directory = Arc::new(FakeDirectory::default());
    let owner = client(&directory, "Owner").await;
    let created = owned_space(&owner).await;

    let sent = owner
        .messages
        .submit_channel_message(&created.space_id, &created.channel_id, post("hello"))
        .await
        .unwrap();
    assert!(envelopes(&owner.outbound.pending().await, "group").is_empty());
    assert!(owner.store.get_message(&sent.message_id).await.unwrap().is_none());

    let outcome = owner.action_queue.process_batch().await.unwrap();
    assert_eq!(outcome.completed, 1);

    let frames = drain(&owner).await;
    let group = envelopes(&frames, "group");
    assert_eq!(group.len(), 1);
    let body: serde_json::Value =
        serde_json::from_str(group[0]["message"].as_str().unwrap()).unwrap();
    assert_eq!(body["type"], "message");

    let stored = owner.store.get_message(&sent.message_id).await.unwrap().unwrap();
    assert_eq!(stored.content.sender_id(), owner.identity.user_address);
    assert!(stored.send_status.is_none());
}

#[tokio::test]
async fn test_public_invite_join_adds_member_on_owner() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let space_id = &created.space_id;

    let config = config_public(&owner, space_id).await;
    assert_eq!(directory.remaining_evals(&config), 2);
    assert_eq!(config_public(&joiner, space_id).await, config);

    let member = owner
        .store
        .get_space_member(space_id, &joiner.identity.user_address)
        .await
        .unwrap()
        .expect("joiner recorded on owner");
    assert_eq!(member.inbox_address, space_inbox(&joiner, space_id).await);
    assert_eq!(member.display_name.as_deref(), Some("Joiner"));

    let history = owner.store.get_messages(space_id, &created.channel_id).await.unwrap();
    assert!(history.iter().any(|m| matches!(m.content, Content::Join(_))));

    let state = owner.store.get_latest_state(&conversation_id(space_id)).await.unwrap().unwrap();
    let ratchet = SpaceSession::parse(&state.state).unwrap().ratchet().unwrap();
    assert!(ratchet.peer_id_map.contains_key(&inbox_key(&joiner)));

    let joined = joiner.user_config.local_config().await.unwrap();
    assert_eq!(joined.space_ids, vec![space_id.clone()]);
}

#[tokio::test]
async fn test_member_receives_owner_post() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let space_id = &created.space_id;

    let sent = owner
        .messages
        .submit_channel_message(space_id, &created.channel_id, post("welcome"))
        .await
        .unwrap();
    owner.action_queue.process_batch().await.unwrap();
    let frames = drain(&owner).await;
    let group = envelopes(&frames, "group");
    assert_eq!(group.len(), 1);

    let inbox = space_inbox(&joiner, space_id).await;
    deliver(&joiner, &inbox, &group[0], 2).await;

    let received = joiner
        .store
        .get_message(&sent.message_id)
        .await
        .unwrap()
        .expect("post delivered");
    assert_eq!(received.space_id, *space_id);
    assert!(received.signature.is_some());
    match received.content {
        Content::Post(p) => assert_eq!(p.text.joined(), "welcome"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_frame_for_another_hub_is_dropped() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let other = owned_space(&owner).await;

    let sent = owner
        .messages
        .submit_channel_message(&other.space_id, &other.channel_id, post("elsewhere"))
        .await
        .unwrap();
    owner.action_queue.process_batch().await.unwrap();
    let group = envelopes(&drain(&owner).await, "group");

    let inbox = space_inbox(&joiner, &created.space_id).await;
    deliver(&joiner, &inbox, &group[0], 3).await;
    assert!(joiner.store.get_message(&sent.message_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_kick_rotates_config_and_evicts_member() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let space_id = &created.space_id;
    let old_config = config_public(&owner, space_id).await;
    let old_link = owner.store.get_space(space_id).await.unwrap().unwrap().invite_url;
    let joiner_inbox = space_inbox(&joiner, space_id).await;

    owner
        .spaces
        .request_kick(space_id, &joiner.identity.user_address)
        .await
        .unwrap();
    let outcome = owner.action_queue.process_batch().await.unwrap();
    assert_eq!(outcome.completed, 1);

    let new_config = config_public(&owner, space_id).await;
    assert_ne!(new_config, old_config);
    assert_eq!(directory.remaining_evals(&new_config), 3);

    let member = owner
        .store
        .get_space_member(space_id, &joiner.identity.user_address)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(member.is_kicked, Some(true));
    assert!(member.inbox_address.is_empty());
    let history = owner.store.get_messages(space_id, &created.channel_id).await.unwrap();
    assert!(history.iter().any(|m| matches!(m.content, Content::Kick(_))));

    let latecomer = client(&directory, "Latecomer").await;
    let err = latecomer.invitations.process_invite_link(&old_link).await.unwrap_err();
    assert!(matches!(err, QuorumError::InvalidInvite(_)));

    let frames = drain(&owner).await;
    let notice = envelopes(&frames, "sync")
        .into_iter()
        .find(|e| control_type(e).as_deref() == Some("kick"))
        .expect("kick notice");
    assert_eq!(notice["inbox_address"], joiner_inbox.as_str());

    deliver(&joiner, &joiner_inbox, &notice, 4).await;
    assert!(joiner.store.get_space(space_id).await.unwrap().is_none());
    assert!(joiner.store.get_space_keys(space_id).await.unwrap().is_empty());
    assert!(joiner.user_config.local_config().await.unwrap().space_ids.is_empty());
    directory.with(|d| assert_eq!(d.hub_deletes.len(), 1));
}

#[tokio::test]
async fn test_public_pool_exhaustion_is_reported() {
    let directory = Arc::new(FakeDirectory::default());
    let owner = client(&directory, "Owner").await;
    let created = owned_space(&owner).await;
    let link = owner
        .invitations
        .generate_new_invite_link(&created.space_id)
        .await
        .unwrap();

    for name in ["A", "B", "C"] {
        let member = client(&directory, name).await;
        member.invitations.join_invite_link(&link).await.unwrap();
    }
    let late = client(&directory, "D").await;
    let err = late.invitations.join_invite_link(&link).await.unwrap_err();
    match err {
        QuorumError::InvalidInvite(msg) => assert!(msg.contains("no longer valid")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_joining_twice_is_rejected() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let link = owner.store.get_space(&created.space_id).await.unwrap().unwrap().invite_url;

    let err = joiner.invitations.join_invite_link(&link).await.unwrap_err();
    assert!(matches!(err, QuorumError::Validation(_)));
}

#[tokio::test]
async fn test_leaving_announces_and_purges() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let space_id = &created.space_id;

    joiner.spaces.delete_space(space_id).await.unwrap();
    assert!(joiner.store.get_space(space_id).await.unwrap().is_none());

    let leave = envelopes(&drain(&joiner).await, "group")
        .into_iter()
        .find(|e| control_type(e).as_deref() == Some("leave"))
        .expect("leave announcement");
    let owner_inbox = space_inbox(&owner, space_id).await;
    deliver(&owner, &owner_inbox, &leave, 5).await;

    let member = owner
        .store
        .get_space_member(space_id, &joiner.identity.user_address)
        .await
        .unwrap()
        .unwrap();
    assert!(member.inbox_address.is_empty());
    let history = owner.store.get_messages(space_id, &created.channel_id).await.unwrap();
    assert!(history.iter().any(|m| matches!(m.content, Content::Leave(_))));
}

#[tokio::test]
async fn test_kicked_member_is_cut_off_while_others_keep_reading() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let space_id = &created.space_id;
    let third = client(&directory, "Third").await;
    join_space(&owner, &third, space_id).await;
    let joiner_inbox = space_inbox(&joiner, space_id).await;
    let third_inbox = space_inbox(&third, space_id).await;

    owner
        .spaces
        .request_kick(space_id, &joiner.identity.user_address)
        .await
        .unwrap();
    assert_eq!(owner.action_queue.process_batch().await.unwrap().completed, 1);
    let new_config = config_public(&owner, space_id).await;

    let state = owner.store.get_latest_state(&conversation_id(space_id)).await.unwrap().unwrap();
    let ratchet = SpaceSession::parse(&state.state).unwrap().ratchet().unwrap();
    assert!(ratchet.peer_id_map.contains_key(&inbox_key(&third)));
    assert!(!ratchet.peer_id_map.contains_key(&inbox_key(&joiner)));

    let sync = envelopes(&drain(&owner).await, "sync");
    let addressed = |kind: &str, inbox: &str| {
        sync.iter()
            .find(|e| control_type(e).as_deref() == Some(kind) && e["inbox_address"] == inbox)
            .cloned()
    };
    assert!(addressed("rekey", &joiner_inbox).is_none());
    let rekey = addressed("rekey", &third_inbox).expect("rekey for the remaining member");
    let notice = addressed("kick", &joiner_inbox).expect("kick notice");

    deliver(&third, &third_inbox, &rekey, 4).await;
    assert_eq!(config_public(&third, space_id).await, new_config);
    deliver(&joiner, &joiner_inbox, &notice, 4).await;
    assert!(joiner.store.get_space(space_id).await.unwrap().is_none());

    let sent = owner
        .messages
        .submit_channel_message(space_id, &created.channel_id, post("after the kick"))
        .await
        .unwrap();
    owner.action_queue.process_batch().await.unwrap();
    let group = envelopes(&drain(&owner).await, "group");
    assert_eq!(group.len(), 1);

    deliver(&third, &third_inbox, &group[0], 5).await;
    deliver(&joiner, &joiner_inbox, &group[0], 5).await;
    assert!(third.store.get_message(&sent.message_id).await.unwrap().is_some());
    assert!(joiner.store.get_message(&sent.message_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_kick_confirmations_need_the_owner_key() {
    let directory = Arc::new(FakeDirectory::default());
    let (owner, joiner, created) = joined_pair(&directory).await;
    let space_id = &created.space_id;
    let third = client(&directory, "Third").await;
    join_space(&owner, &third, space_id).await;
    let joiner_inbox = space_inbox(&joiner, space_id).await;
    let third_address = third.identity.user_address.clone();
    let owner_address = owner.identity.user_address.clone();

    // The joiner never saw the kick itself.
    for address in [&owner_address, &third_address] {
        joiner
            .store
            .save_space_member(
                space_id,
                &SpaceMember {
                    user_address: address.clone(),
                    inbox_address: format!("inbox-of-{}", address),
                    display_name: None,
                    user_icon: None,
                    is_kicked: Some(false),
                },
            )
            .await
            .unwrap();
    }

    // A member may reach the joiner directly, but cannot vouch for kicks.
    let forged = ControlMessage::VerifyKicked {
        addresses: vec![owner_address.clone()],
    };
    let body = serde_json::json!({ "type": "control", "message": &forged }).to_string();
    let third_inbox_pair = third.hub.space_keypair(space_id, key_ids::INBOX).await.unwrap();
    third
        .hub
        .send_sync(space_id, &joiner_inbox, &third_inbox_pair, &body, None)
        .await
        .unwrap();
    third.hub.send_control(space_id, &forged).await.unwrap();
    let frames = drain(&third).await;
    let mut forgeries = envelopes(&frames, "sync");
    forgeries.extend(envelopes(&frames, "group"));
    assert_eq!(forgeries.len(), 2);
    for envelope in &forgeries {
        deliver(&joiner, &joiner_inbox, envelope, 3).await;
    }
    assert_eq!(kicked_flag(&joiner, space_id, &owner_address).await, Some(false));

    // Kick rows are ordered by creation time after the join rows.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    owner.spaces.request_kick(space_id, &third_address).await.unwrap();
    owner.action_queue.process_batch().await.unwrap();
    drain(&owner).await;

    assert_eq!(owner.sync.send_verify_kicked_statuses(space_id).await.unwrap(), 1);
    let confirmations: Vec<_> = envelopes(&drain(&owner).await, "sync")
        .into_iter()
        .filter(|e| control_type(e).as_deref() == Some("verify-kicked"))
        .collect();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0]["inbox_address"], joiner_inbox.as_str());
    deliver(&joiner, &joiner_inbox, &confirmations[0], 4).await;
    assert_eq!(kicked_flag(&joiner, space_id, &third_address).await, Some(true));
    assert_eq!(kicked_flag(&joiner, space_id, &owner_address).await, Some(false));
}

#[tokio::test]
async fn test_refused_hub_registration_leaves_no_session() {
    let directory = Arc::new(FakeDirectory::default());
    let owner = client(&directory, "Owner").await;
    let joiner = client(&directory, "Joiner").await;
    let created = owned_space(&owner).await;
    let link = owner
        .invitations
        .generate_new_invite_link(&created.space_id)
        .await
        .unwrap();
    let conversation = conversation_id(&created.space_id);

    directory.with(|d| d.refuse_hub_adds = 1);
    let err = joiner.invitations.join_invite_link(&link).await.unwrap_err();
    assert_eq!(err.status(), Some(503));
    assert!(joiner.store.get_encryption_states(&conversation).await.unwrap().is_empty());
    assert!(joiner.store.get_space(&created.space_id).await.unwrap().is_none());

    joiner.invitations.join_invite_link(&link).await.unwrap();
    let states = joiner.store.get_encryption_states(&conversation).await.unwrap();
    assert_eq!(states.len(), 1);
    let inbox = space_inbox(&joiner, &created.space_id).await;
    let latest = joiner.store.get_latest_state(&conversation).await.unwrap().unwrap();
    assert_eq!(latest.inbox_id, inbox);
}
