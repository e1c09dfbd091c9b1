use backplane::mailbox::Delivery;
use backplane::network::{NetworkServer, RemoteSink};
use backplane::store::InMemoryStateStore;
use backplane::stream::InMemoryStreams;
use backplane::{Backplane, BackplaneConfig, InvocationMessage};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn registry_fans_out_to_a_peer_node() {
    init_tracing();
    let config = BackplaneConfig::default().with_idle_timeout(None);

    // Node B hosts the connection.
    let host = Backplane::in_memory(config.clone());
    let mut rx = host.connect("chat", "c9").await.unwrap();
    let server = NetworkServer::bind(
        "127.0.0.1:0",
        host.mailboxes().clone(),
        host.streams().clone(),
        config.max_frame_len,
    )
    .await
    .unwrap();

    // Node A owns the group and forwards every delivery to B.
    let remote = RemoteSink::new(server.local_addr().to_string(), config.max_frame_len);
    let owner = Backplane::new(
        config.clone(),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryStreams::new()),
        Arc::new(remote.clone()),
    );
    let room = owner.group("chat", "room").unwrap();
    room.add("c9").await.unwrap();

    let issued = room
        .send(InvocationMessage::new("say", vec![json!({"text": "hello"})]))
        .await
        .unwrap();
    assert_eq!(issued, 1);

    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Delivery::Invocation(m))) => {
            assert_eq!(m.target, "say");
            assert_eq!(m.arguments[0]["text"], "hello");
        }
        other => panic!("expected a forwarded invocation, got {:?}", other),
    }

    // A disconnect published remotely evicts the connection on B.
    assert_eq!(remote.notify_disconnect("c9").await.unwrap(), 1);
    assert_eq!(host.client("chat", "c9").unwrap().count().await.unwrap(), 0);
}
