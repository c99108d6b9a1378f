use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use onion_chat::Result;
use onion_chat::common::{Message, Operation};
use onion_chat::network::{
    ConnectionPool, NetworkConnection, NetworkObserver, PoolConfig, TcpDialer, TransportAdapter,
    spawn_listener,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Forward(mpsc::UnboundedSender<Message>);

impl NetworkObserver for Forward {
    fn notify(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        let _ = self.0.send(message);
        async { Ok(()) }.boxed()
    }
}

struct Peer {
    address: String,
    pool: Arc<ConnectionPool>,
    adapter: Arc<TransportAdapter>,
    observer: Arc<dyn NetworkObserver>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

async fn peer() -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", listener.local_addr().unwrap());
    let config = PoolConfig {
        read_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(500),
        ..PoolConfig::default()
    };
    let pool = Arc::new(ConnectionPool::new(address.clone(), config, Arc::new(TcpDialer)));
    spawn_listener(listener, pool.clone());

    let adapter = Arc::new(TransportAdapter::new(pool.clone()));
    let (tx, inbox) = mpsc::unbounded_channel();
    let observer: Arc<dyn NetworkObserver> = Arc::new(Forward(tx));
    adapter.subscribe(observer.clone()).await.unwrap();

    Peer {
        address,
        pool,
        adapter,
        observer,
        inbox,
    }
}

async fn next_chat_message(inbox: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    loop {
        let message = timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("no message within deadline")
            .expect("inbox closed");
        if !message.operation.is_local_event() {
            return message;
        }
    }
}

#[tokio::test]
async fn message_crosses_a_loopback_session() {
    let a = peer().await;
    let mut b = peer().await;

    let hello = Message::new(Operation::SendMessage, "chat1", r#"{"message":"hi"}"#)
        .from_peer("userA", a.address.clone())
        .to_peer("userB", b.address.clone());
    a.adapter.send_to_peer(&hello).await.unwrap();

    let received = next_chat_message(&mut b.inbox).await;
    assert_eq!(received, hello);

    // B keys the inbound session by the address A announced.
    assert!(b.pool.contains(&a.address).await);
    assert!(a.pool.contains(&b.address).await);

    a.adapter.unsubscribe(&a.observer).await.unwrap();
    b.adapter.unsubscribe(&b.observer).await.unwrap();
    assert!(a.pool.is_empty().await);
}

#[tokio::test]
async fn unreachable_peer_is_reported_offline() {
    let mut a = peer().await;
    // Bind then drop to get a port nothing listens on.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", closed.local_addr().unwrap());
    drop(closed);

    let hello = Message::new(Operation::SendMessage, "chat1", r#"{"message":"hi"}"#)
        .from_peer("userA", a.address.clone())
        .to_peer("userB", address.clone());
    assert!(a.adapter.send_to_peer(&hello).await.is_err());

    let offline = loop {
        let message = timeout(Duration::from_secs(5), a.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        if message.operation == Operation::UserOffline {
            break message;
        }
    };
    assert_eq!(offline.sender_address, address);
}
