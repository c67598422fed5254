//! End-to-end scenarios: nodes talking over an in-memory network.

use peer_courier::{
    app::{Node, NodeEvent, NodeHandle},
    connection::ConnectionStatus,
    crypto::{AgreementKeyPair, IdentityKeyPair},
    protocol::{Envelope, EnvelopeCipher, EnvelopeCodec, FileStart},
    storage::{Sender, DELETED_PLACEHOLDER},
    transfer::total_chunks,
    transport::{ChannelId, MemoryNetwork, MemoryTransport, Transport, TransportEvent},
    FileStore, MemoryStore, MessengerConfig, Store, UserProfile,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> MessengerConfig {
    let mut config = MessengerConfig::default();
    config.network.reconnect_interval_secs = 1;
    config.network.identifier_retry_secs = 1;
    config
}

struct TestNode {
    handle: NodeHandle,
    events: broadcast::Receiver<NodeEvent>,
}

fn start(network: &MemoryNetwork, username: &str) -> TestNode {
    start_with_store(network, username, Box::new(MemoryStore::new()))
}

fn start_with_store(network: &MemoryNetwork, username: &str, store: Box<dyn Store>) -> TestNode {
    let (transport, transport_events) = network.endpoint();
    let profile = UserProfile::new(username.to_string(), username.to_uppercase());
    let (node, handle) = Node::new(
        &config(),
        profile,
        transport,
        transport_events,
        store,
    )
    .unwrap();
    let events = handle.subscribe();
    tokio::spawn(node.run());
    TestNode { handle, events }
}

async fn wait_registered(network: &MemoryNetwork, ids: &[&str]) {
    let deadline = Instant::now() + WAIT;
    while !ids.iter().all(|id| network.is_registered(id)) {
        assert!(Instant::now() < deadline, "registration timed out");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until both ends are connected over the same single channel
async fn wait_converged(a: &TestNode, a_id: &str, b: &TestNode, b_id: &str) {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = a.handle.connection(b_id).await.unwrap();
        let right = b.handle.connection(a_id).await.unwrap();
        if let (Some(left), Some(right)) = (left, right) {
            if left.status == ConnectionStatus::Connected
                && right.status == ConnectionStatus::Connected
                && left.standby == 0
                && right.standby == 0
                && left.channel == right.channel
            {
                return;
            }
        }
        assert!(Instant::now() < deadline, "{a_id} and {b_id} never converged");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut wanted: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if wanted(&event) => return event,
            Ok(Ok(_)) => continue,
            other => panic!("expected event never arrived: {other:?}"),
        }
    }
}

/// A bare endpoint that writes frames without running a node
struct RawPeer {
    transport: MemoryTransport,
    _events: mpsc::UnboundedReceiver<TransportEvent>,
    codec: EnvelopeCodec,
    channel: ChannelId,
    target: String,
}

impl RawPeer {
    fn dial(network: &MemoryNetwork, local_id: &str, target: &str) -> Self {
        let (mut transport, events) = network.endpoint();
        assert_ok!(transport.register(local_id));
        let channel = transport.dial(target).unwrap();
        let shared =
            EnvelopeCipher::from_passphrase(&MessengerConfig::default().crypto.shared_passphrase)
                .unwrap();
        Self {
            transport,
            _events: events,
            codec: EnvelopeCodec::new(AgreementKeyPair::generate(), Some(shared)),
            channel,
            target: target.to_string(),
        }
    }

    fn send(&mut self, envelope: &Envelope) {
        let frame = self.codec.encode(&self.target, envelope).unwrap();
        assert_ok!(self.transport.send(self.channel, frame));
    }
}

#[tokio::test]
async fn simultaneous_dials_converge_on_one_channel() {
    let network = MemoryNetwork::new();
    let x = start(&network, "peer-x");
    let y = start(&network, "peer-y");
    wait_registered(&network, &["peer-x", "peer-y"]).await;

    let (from_x, from_y) = tokio::join!(x.handle.connect("peer-y"), y.handle.connect("peer-x"));
    assert_ok!(from_x);
    assert_ok!(from_y);

    wait_converged(&x, "peer-x", &y, "peer-y").await;
    assert_eq!(network.open_channels(), 1);

    // The surviving channel carries traffic both ways
    assert_ok!(x.handle.send_message("peer-y", "ping").await);
    assert_ok!(y.handle.send_message("peer-x", "pong").await);
}

#[tokio::test]
async fn delete_after_message_blanks_receiver_history() {
    let network = MemoryNetwork::new();
    let alice = start(&network, "alice");
    let mut bob = start(&network, "bob");
    wait_registered(&network, &["alice", "bob"]).await;

    assert_ok!(alice.handle.focus(Some("bob")).await);
    wait_converged(&alice, "alice", &bob, "bob").await;

    let sent = alice.handle.send_message("bob", "hi").await.unwrap();
    next_event(&mut bob.events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;

    assert!(alice.handle.delete_message("bob", sent.id).await.unwrap());
    let event = next_event(&mut bob.events, |e| {
        matches!(e, NodeEvent::MessageDeleted { .. })
    })
    .await;
    assert!(matches!(event, NodeEvent::MessageDeleted { message_id, .. } if message_id == sent.id));

    let history = bob.handle.history("alice").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, sent.id);
    assert!(history[0].deleted);
    assert_eq!(history[0].text, "");

    let contacts = bob.handle.contacts().await.unwrap();
    assert_eq!(contacts[0].last_message, DELETED_PLACEHOLDER);

    // Only the author may delete
    assert!(!bob.handle.delete_message("alice", sent.id).await.unwrap());
    assert!(alice.handle.history("bob").await.unwrap()[0].deleted);
}

#[tokio::test]
async fn file_transfer_reassembles_byte_identical_payload() {
    let network = MemoryNetwork::new();
    let alice = start(&network, "alice");
    let mut bob = start(&network, "bob");
    wait_registered(&network, &["alice", "bob"]).await;

    assert_ok!(alice.handle.connect("bob").await);
    wait_converged(&alice, "alice", &bob, "bob").await;

    let payload: Vec<u8> = (0..40 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    assert_eq!(total_chunks(payload.len() as u64, 16 * 1024), 3);

    let file_id = alice
        .handle
        .send_file("bob", "photo.jpg", "image/jpeg", payload.clone())
        .await
        .unwrap();

    let NodeEvent::FileReceived { message, .. } =
        next_event(&mut bob.events, |e| matches!(e, NodeEvent::FileReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(message.id, file_id);
    assert_eq!(message.file_name.as_deref(), Some("photo.jpg"));
    assert_eq!(message.file_type.as_deref(), Some("image/jpeg"));

    let stored = bob.handle.file(message.file_url.as_deref().unwrap()).await.unwrap();
    assert_eq!(stored, Some(payload));
    assert_eq!(bob.handle.stats().await.unwrap().transfers_in_flight, 0);
}

#[tokio::test]
async fn file_with_missing_chunk_fails_instead_of_assembling() {
    let network = MemoryNetwork::new();
    let mut bob = start(&network, "bob");
    wait_registered(&network, &["bob"]).await;

    let mut mallory = RawPeer::dial(&network, "mallory", "bob");
    let file_id = Uuid::new_v4();
    mallory.send(&Envelope::FileStart(FileStart {
        file_id,
        file_name: "broken.bin".to_string(),
        file_size: 40 * 1024,
        file_type: "application/octet-stream".to_string(),
        total_chunks: 3,
        timestamp: chrono::Utc::now(),
    }));
    for index in [0u32, 2] {
        mallory.send(&Envelope::FileChunk {
            file_id,
            chunk_index: index,
            data: vec![index as u8; 16 * 1024],
        });
    }
    mallory.send(&Envelope::FileEnd { file_id });

    let event = next_event(&mut bob.events, |e| {
        matches!(e, NodeEvent::TransferFailed { .. } | NodeEvent::FileReceived { .. })
    })
    .await;
    match event {
        NodeEvent::TransferFailed {
            peer_id,
            file_id: failed,
            reason,
        } => {
            assert_eq!(peer_id, "mallory");
            assert_eq!(failed, Some(file_id));
            assert!(reason.contains("2 of 3"), "{reason}");
        }
        other => panic!("corrupt file was assembled: {other:?}"),
    }
    assert!(bob.handle.history("mallory").await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_transfer_is_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    let mut bob = start_with_store(&network, "bob", Box::new(FileStore::open(dir.path()).unwrap()));
    wait_registered(&network, &["bob"]).await;

    let mut mallory = RawPeer::dial(&network, "mallory", "bob");
    let start = FileStart {
        file_id: Uuid::new_v4(),
        file_name: "again.bin".to_string(),
        file_size: 2048,
        file_type: "application/octet-stream".to_string(),
        total_chunks: 2,
        timestamp: chrono::Utc::now(),
    };
    for _ in 0..2 {
        mallory.send(&Envelope::FileStart(start.clone()));
        for index in 0..2u32 {
            mallory.send(&Envelope::FileChunk {
                file_id: start.file_id,
                chunk_index: index,
                data: vec![index as u8; 1024],
            });
        }
        mallory.send(&Envelope::FileEnd {
            file_id: start.file_id,
        });
    }
    // Frames on one channel arrive in order, so this lands after both copies
    let signer = IdentityKeyPair::generate();
    mallory.send(&Envelope::signed_message(&signer, "done", "10:00"));

    let mut files = 0;
    loop {
        match next_event(&mut bob.events, |e| {
            matches!(e, NodeEvent::FileReceived { .. } | NodeEvent::MessageReceived { .. })
        })
        .await
        {
            NodeEvent::FileReceived { .. } => files += 1,
            _ => break,
        }
    }
    assert_eq!(files, 1);
    assert_eq!(bob.handle.history("mallory").await.unwrap().len(), 2);
    assert_eq!(std::fs::read_dir(dir.path().join("blobs")).unwrap().count(), 1);
}

#[tokio::test]
async fn message_from_unknown_key_is_delivered_unverified() {
    let network = MemoryNetwork::new();
    let mut bob = start(&network, "bob");
    wait_registered(&network, &["bob"]).await;

    // No handshake is sent, so bob has no public key for this sender
    let mut stranger = RawPeer::dial(&network, "stranger-42", "bob");
    let signer = IdentityKeyPair::generate();
    stranger.send(&Envelope::signed_message(&signer, "hello?", "10:00"));

    let NodeEvent::MessageReceived { peer_id, message } =
        next_event(&mut bob.events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(peer_id, "stranger-42");
    assert_eq!(message.text, "hello?");
    assert_eq!(message.sender, Sender::Peer("stranger-42".to_string()));
    assert!(!message.is_verified);

    // Auto-added under a short form of its id
    let contacts = bob.handle.contacts().await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, "stranger-42");
    assert_eq!(contacts[0].name, "strang");
}

#[tokio::test]
async fn focused_peer_is_reconnected_after_restart() {
    let network = MemoryNetwork::new();
    let alice = start(&network, "alice");
    let bob = start(&network, "bob");
    wait_registered(&network, &["alice", "bob"]).await;

    assert_ok!(alice.handle.focus(Some("bob")).await);
    wait_converged(&alice, "alice", &bob, "bob").await;

    bob.handle.shutdown();
    let deadline = Instant::now() + WAIT;
    while network.is_registered("bob") {
        assert!(Instant::now() < deadline, "bob never went away");
        sleep(Duration::from_millis(10)).await;
    }
    assert_err!(alice.handle.send_message("bob", "are you there?").await);

    let bob = start(&network, "bob");
    wait_converged(&alice, "alice", &bob, "bob").await;
    assert_ok!(alice.handle.send_message("bob", "welcome back").await);
}

#[tokio::test]
async fn taken_identifier_is_retried_until_released() {
    let network = MemoryNetwork::new();
    let first = start(&network, "alice");
    wait_registered(&network, &["alice"]).await;

    let mut second = start(&network, "alice");
    let event = next_event(&mut second.events, |e| {
        matches!(e, NodeEvent::RegistrationFailed { .. })
    })
    .await;
    assert!(matches!(event, NodeEvent::RegistrationFailed { retrying: true, .. }));

    first.handle.shutdown();
    let event = next_event(&mut second.events, |e| matches!(e, NodeEvent::Registered { .. })).await;
    assert!(matches!(event, NodeEvent::Registered { local_id } if local_id == "alice"));
}
