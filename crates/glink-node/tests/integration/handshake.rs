//! Chat invite handshake over real connections.

use glink_storage::Storage;
use glink_sync::UiEvent;

use crate::harness::{wait_until, TestNode, WAIT};

/// A discovers B, runs `!conn`, and both end up in the same chat.
#[tokio::test]
async fn test_invite_creates_chat_on_both_sides() {
    let mut alice = TestNode::start("alice").await.unwrap();
    let bob = TestNode::start("bob").await.unwrap();

    bob.announce_to(&alice).await.unwrap();
    alice
        .wait_event(|e| matches!(e, UiEvent::Candidates(list) if list.iter().any(|c| c.name == "bob")))
        .await
        .unwrap();

    alice.send("", "!conn bob").await.unwrap();

    let bob_chats = {
        let storage = bob.storage.clone();
        wait_until("bob to store the chat", WAIT, || {
            storage.list_chats().map(|c| c.len() == 1).unwrap_or(false)
        })
        .await
        .unwrap();
        bob.chats()
    };
    let cid = bob_chats[0].cid.clone();
    assert_eq!(bob_chats[0].name, "alice");
    assert!(!bob_chats[0].group);

    let expected = vec![alice.uid(), bob.uid()];
    assert_eq!(bob_chats[0].participants, expected);

    let storage = alice.storage.clone();
    let want = expected.clone();
    wait_until("alice to see bob join", WAIT, || {
        storage
            .chat_info(&cid)
            .ok()
            .flatten()
            .is_some_and(|c| c.participants == want)
    })
    .await
    .unwrap();
    assert_eq!(alice.chats()[0].name, "bob");

    // Live messages flow both ways on the new link
    alice.send(&cid, "hi bob").await.unwrap();
    bob.wait_message_count(&cid, 1).await.unwrap();
    bob.send(&cid, "hi alice").await.unwrap();
    alice.wait_message_count(&cid, 2).await.unwrap();

    let texts: Vec<String> = alice.messages(&cid).into_iter().map(|m| m.text).collect();
    assert!(texts.contains(&"hi bob".to_string()));
    assert!(texts.contains(&"hi alice".to_string()));
    assert!(bob.messages(&cid).iter().all(|m| m.index == 1));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_rejected() {
    let mut alice = TestNode::start("alice").await.unwrap();

    alice.send("", "!frobnicate").await.unwrap();
    let event = alice
        .wait_event(|e| matches!(e, UiEvent::CommandRejected { .. }))
        .await
        .unwrap();
    assert!(matches!(
        event,
        UiEvent::CommandRejected { reason, .. } if reason.contains("frobnicate")
    ));

    alice.send("", "!conn nobody").await.unwrap();
    alice
        .wait_event(|e| matches!(e, UiEvent::CommandRejected { reason, .. } if reason.contains("nobody")))
        .await
        .unwrap();

    assert!(alice.chats().is_empty());
    alice.shutdown().await;
}

/// Inviting a candidate that is no longer reachable leaves the chat local
/// and the invite expires.
#[tokio::test]
async fn test_invite_to_unreachable_peer_expires() {
    let mut alice = TestNode::start("alice").await.unwrap();
    let bob = TestNode::start("bob").await.unwrap();
    let announce = bob.node.node_announce();
    bob.shutdown().await;

    alice.node.announce(announce).await.unwrap();
    alice
        .wait_event(|e| matches!(e, UiEvent::Candidates(_)))
        .await
        .unwrap();
    alice.send("", "!conn bob").await.unwrap();

    let event = alice
        .wait_event(|e| matches!(e, UiEvent::InviteExpired { .. }))
        .await
        .unwrap();
    let UiEvent::InviteExpired { cid, .. } = event else {
        unreachable!()
    };
    let chats = alice.chats();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].cid, cid);
    assert_eq!(chats[0].participants, vec![alice.uid()]);

    alice.shutdown().await;
}
