mod common;

use std::collections::HashSet;

use common::{Node, address_of, message, node, text};
use onion_chat::Error;
use onion_chat::common::{ChatEvent, Message, Operation, SyncRequestContent};
use onion_chat::storage::{Storage, StorageError};
use onion_chat::sync::SyncProtocol;

async fn member_node(peer_id: &str) -> Node {
    let node = node(peer_id).await;
    node.storage.peer_joined_chat("userA", "chat1", 1).unwrap();
    node.storage.peer_joined_chat("userB", "chat1", 1).unwrap();
    node
}

fn history_ids(node: &Node) -> HashSet<String> {
    node.storage
        .chat_messages("chat1")
        .unwrap()
        .into_iter()
        .filter(|message| message.operation.is_history())
        .map(|message| message.id)
        .collect()
}

#[tokio::test]
async fn two_peers_converge_after_request_and_follow_up() {
    let mut a = member_node("userA").await;
    let b = member_node("userB").await;

    let m1 = text("userA", "chat1", "from a");
    let m3 = text("userB", "chat1", "from b");
    a.storage.store_message(&m1).unwrap();
    b.storage.store_message(&m3).unwrap();

    // B asks A for what it lacks.
    let request = SyncProtocol::new(b.storage.clone(), b.local.clone())
        .request("chat1", &address_of("userA"))
        .unwrap();
    a.router.route(request).await.unwrap();

    let replies = a.outbox.take();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].operation, Operation::SyncResponse);
    assert_eq!(replies[0].receiver_address, address_of("userB"));
    let follow_up: SyncRequestContent = replies[1].decode_content().unwrap();
    assert_eq!(replies[1].operation, Operation::SyncRequest);
    assert_eq!(follow_up.requested_message_ids, vec![m3.id.clone()]);

    for reply in replies {
        b.router.route(reply).await.unwrap();
    }

    // The follow-up is answered with exactly the requested message and
    // does not trigger another round.
    let answers = b.outbox.take();
    assert_eq!(answers.len(), 1);
    let batch: Vec<Message> = answers[0].decode_content().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, m3.id);

    a.router.route(answers[0].clone()).await.unwrap();
    assert!(a.outbox.take().is_empty());

    let expected: HashSet<String> = [m1.id.clone(), m3.id.clone()].into_iter().collect();
    assert_eq!(history_ids(&a), expected);
    assert_eq!(history_ids(&b), expected);

    let mut synced = Vec::new();
    while let Ok(event) = a.events.try_recv() {
        if let ChatEvent::HistorySynced { merged, .. } = event {
            synced.push(merged);
        }
    }
    assert_eq!(synced, vec![1]);
}

#[tokio::test]
async fn duplicate_top_level_delivery_is_an_error() {
    let b = member_node("userB").await;
    let hello = text("userA", "chat1", "hello");

    b.router.route(hello.clone()).await.unwrap();
    assert!(matches!(
        b.router.route(hello).await,
        Err(Error::Storage(StorageError::DuplicateMessage(_)))
    ));
}

#[tokio::test]
async fn duplicate_inside_a_sync_batch_is_absorbed() {
    let mut b = member_node("userB").await;
    let hello = text("userA", "chat1", "hello");
    b.router.route(hello.clone()).await.unwrap();

    let batch = serde_json::to_string(&vec![hello.clone()]).unwrap();
    let response = message("userA", Operation::SyncResponse, "chat1", batch);
    b.router.route(response).await.unwrap();

    let merged: Vec<usize> = std::iter::from_fn(|| b.events.try_recv().ok())
        .filter_map(|event| match event {
            ChatEvent::HistorySynced { merged, .. } => Some(merged),
            _ => None,
        })
        .collect();
    assert_eq!(merged, vec![0]);
    assert_eq!(history_ids(&b).len(), 1);
}

#[tokio::test]
async fn sync_response_relaying_a_third_party_is_refused() {
    let b = member_node("userB").await;
    let forged = text("userC", "chat1", "I never said this");
    let batch = serde_json::to_string(&vec![forged.clone()]).unwrap();
    let response = message("userA", Operation::SyncResponse, "chat1", batch);

    assert!(matches!(
        b.router.route(response.clone()).await,
        Err(Error::Inadmissible(_))
    ));
    assert!(!b.storage.stored_ids().contains(&response.id));
    assert!(b.storage.retrieve_message(&forged.id).is_err());
}

#[tokio::test]
async fn sync_request_from_a_non_member_is_refused() {
    let a = member_node("userA").await;
    let content = serde_json::to_string(&SyncRequestContent::default()).unwrap();
    let request = message("mallory", Operation::SyncRequest, "chat1", content);

    assert!(matches!(
        a.router.route(request).await,
        Err(Error::Inadmissible(_))
    ));
    assert!(a.outbox.take().is_empty());
}
