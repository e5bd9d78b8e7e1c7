//! History reconciliation between nodes that already share a chat.

use crate::harness::TestNode;

/// Both sides hold part of a chat. Connecting once is enough to exchange the rest.
#[tokio::test]
async fn test_disjoint_histories_converge() {
    let alice = TestNode::start("alice").await.unwrap();
    let bob = TestNode::start("bob").await.unwrap();

    alice.seed_chat("c", &[&alice, &bob]);
    bob.seed_chat("c", &[&alice, &bob]);
    alice.seed_messages("c", &alice, 1..=3);
    bob.seed_messages("c", &bob, 1..=2);

    // A known peer is dialled as soon as it announces itself
    alice.remember(&bob);
    bob.announce_to(&alice).await.unwrap();

    alice.wait_message_count("c", 5).await.unwrap();
    bob.wait_message_count("c", 5).await.unwrap();

    let texts = |node: &TestNode| -> Vec<String> {
        let mut t: Vec<String> = node.messages("c").into_iter().map(|m| m.text).collect();
        t.sort();
        t
    };
    assert_eq!(texts(&alice), texts(&bob));
    assert_eq!(
        texts(&alice),
        vec!["alice#1", "alice#2", "alice#3", "bob#1", "bob#2"]
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

/// A peer holding a later message without the earlier ones gets the hole filled.
#[tokio::test]
async fn test_missing_lower_indices_are_fetched() {
    let alice = TestNode::start("alice").await.unwrap();
    let bob = TestNode::start("bob").await.unwrap();

    alice.seed_chat("c", &[&alice, &bob]);
    bob.seed_chat("c", &[&alice, &bob]);
    alice.seed_messages("c", &alice, 1..=4);
    // bob only ever saw alice#4, and alice lacks bob#1
    bob.seed_messages("c", &alice, 4..=4);
    bob.seed_messages("c", &bob, 2..=2);
    alice.seed_messages("c", &bob, 2..=2);
    bob.seed_messages("c", &bob, 1..=1);

    alice.remember(&bob);
    bob.announce_to(&alice).await.unwrap();

    bob.wait_message_count("c", 6).await.unwrap();
    alice.wait_message_count("c", 6).await.unwrap();

    for node in [&alice, &bob] {
        let mut keys: Vec<(String, u32)> = node
            .messages("c")
            .into_iter()
            .map(|m| (m.text, m.index))
            .collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ("alice#1".to_string(), 1),
                ("alice#2".to_string(), 2),
                ("alice#3".to_string(), 3),
                ("alice#4".to_string(), 4),
                ("bob#1".to_string(), 1),
                ("bob#2".to_string(), 2),
            ]
        );
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

/// Messages written while a peer was down reach it after it comes back.
#[tokio::test]
async fn test_offline_peer_catches_up() {
    let alice = TestNode::start("alice").await.unwrap();
    let bob = TestNode::start("bob").await.unwrap();
    let bob_uid = bob.uid();

    alice.seed_chat("c", &[&alice, &bob]);
    bob.seed_chat("c", &[&alice, &bob]);
    alice.remember(&bob);
    bob.announce_to(&alice).await.unwrap();
    alice.wait_connected(&bob).await.unwrap();

    alice.send("c", "before").await.unwrap();
    bob.wait_message_count("c", 1).await.unwrap();

    let dir = bob.stop().await;
    alice.wait_disconnected(&bob_uid).await.unwrap();

    alice.send("c", "while away 1").await.unwrap();
    alice.send("c", "while away 2").await.unwrap();
    alice.wait_message_count("c", 3).await.unwrap();

    // Same identity and history, new listener port
    let bob = TestNode::start_in(dir, "bob").await.unwrap();
    assert_eq!(bob.uid(), bob_uid);
    assert_eq!(bob.messages("c").len(), 1);

    bob.announce_to(&alice).await.unwrap();
    bob.wait_message_count("c", 3).await.unwrap();

    let indices: Vec<u32> = bob
        .messages("c")
        .iter()
        .filter(|m| m.uid == alice.uid())
        .map(|m| m.index)
        .collect();
    assert_eq!(indices, vec![1, 2, 3]);

    // Live traffic flows again after the catch-up
    bob.send("c", "back").await.unwrap();
    alice.wait_message_count("c", 4).await.unwrap();

    alice.shutdown().await;
    bob.shutdown().await;
}
