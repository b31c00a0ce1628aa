//! Contact persistence and the spawned agent handle

mod common;

use std::time::Duration;

use serial_test::serial;
use tokio::time::timeout;

use common::{init_tracing, settle, TestPeer};
use walkie_core::loopback::{LoopbackBroker, LoopbackCapture, LoopbackOutput, PermissionMode};
use walkie_core::storage::{JsonFileStore, KeyValueStore, MemoryStore};
use walkie_core::{ConnectionState, Contact, Phase, PeerId, Walkie, WalkieConfig, WalkieEvent};

#[tokio::test]
async fn test_add_then_remove_leaves_empty_list() {
    let broker = LoopbackBroker::new();
    let mut peer = TestPeer::new(&broker, "alpha").await;
    peer.drain_events();

    assert!(peer.walkie.add_contact("Bravo", "bravo").unwrap());
    assert_eq!(peer.walkie.contacts(), &[Contact::new("Bravo", "bravo")]);
    assert!(peer.walkie.remove_contact("bravo").unwrap());

    assert!(peer.walkie.contacts().is_empty());
    assert_eq!(peer.store.get("walkie-friends").unwrap().as_deref(), Some("[]"));

    let changes: Vec<usize> = peer
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            WalkieEvent::ContactsChanged { contacts } => Some(contacts.len()),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![1, 0]);
}

#[tokio::test]
async fn test_blank_contact_is_ignored() {
    let broker = LoopbackBroker::new();
    let mut peer = TestPeer::new(&broker, "alpha").await;
    peer.drain_events();

    assert!(!peer.walkie.add_contact("  ", "bravo").unwrap());
    assert!(!peer.walkie.add_contact("Bravo", "   ").unwrap());
    assert!(!peer.walkie.remove_contact("").unwrap());

    assert!(peer.store.get("walkie-friends").unwrap().is_none());
    assert!(peer.drain_events().is_empty());
}

#[tokio::test]
async fn test_calling_a_contact_dials_its_id() {
    let broker = LoopbackBroker::new();
    let mut a = TestPeer::new(&broker, "alpha").await;
    let mut b = TestPeer::new(&broker, "bravo").await;

    assert!(a.walkie.connect_contact("bravo").is_err());
    assert!(a.walkie.session().is_idle());

    a.walkie.add_contact("Bravo", "bravo").unwrap();
    a.walkie.connect_contact("bravo").unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(a.walkie.current_peer(), Some(&PeerId::new("bravo")));
    assert!(b.walkie.session().is_active());
}

#[tokio::test]
async fn test_contacts_reload_from_shared_store() {
    let broker = LoopbackBroker::new();
    let store = MemoryStore::with_entries([("walkie-id", "alpha")]);
    {
        let mut first = TestPeer::build(
            &broker,
            store.clone(),
            WalkieConfig::default(),
            PermissionMode::Grant,
        )
        .await;
        first.walkie.add_contact("Bravo", "bravo").unwrap();
        first.walkie.add_contact("Charlie", "charlie").unwrap();
        first.walkie.add_contact("B", "bravo").unwrap();
    }

    let second =
        TestPeer::build(&broker, store, WalkieConfig::default(), PermissionMode::Grant).await;
    assert_eq!(
        second.walkie.contacts(),
        &[Contact::new("B", "bravo"), Contact::new("Charlie", "charlie")]
    );
}

#[tokio::test]
#[serial]
async fn test_file_store_keeps_identity_and_contacts_across_restart() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("walkie-test-{}", uuid::Uuid::new_v4()));
    let path = dir.join("walkie.json");
    let broker = LoopbackBroker::new();

    let first_id = {
        let mut walkie = Walkie::builder()
            .store(JsonFileStore::open(&path).unwrap())
            .broker(broker.clone())
            .capture(LoopbackCapture::new(PermissionMode::Grant))
            .output(LoopbackOutput::new())
            .build()
            .await
            .unwrap();
        walkie.settle().await;
        walkie.add_contact("Bravo", "bravo").unwrap();
        walkie.local_id().cloned().unwrap()
    };

    let mut walkie = Walkie::builder()
        .store(JsonFileStore::open(&path).unwrap())
        .broker(broker)
        .capture(LoopbackCapture::new(PermissionMode::Grant))
        .output(LoopbackOutput::new())
        .build()
        .await
        .unwrap();
    walkie.settle().await;

    assert_eq!(walkie.local_id(), Some(&first_id));
    assert_eq!(walkie.contacts(), &[Contact::new("Bravo", "bravo")]);

    drop(walkie);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_spawned_agents_talk_through_handles() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let spawn = |id: &str| {
        let broker = broker.clone();
        let store = MemoryStore::with_entries([("walkie-id", id)]);
        async move {
            Walkie::builder()
                .store(store)
                .broker(broker)
                .capture(LoopbackCapture::new(PermissionMode::Grant))
                .output(LoopbackOutput::new())
                .build()
                .await
                .unwrap()
                .spawn()
        }
    };
    let (alpha, alpha_task) = spawn("alpha").await;
    let (bravo, bravo_task) = spawn("bravo").await;
    let mut bravo_events = bravo.subscribe_simple();

    alpha.connect("bravo").unwrap();

    let incoming = timeout(Duration::from_secs(2), async {
        while let Some(event) = bravo_events.next().await {
            if let WalkieEvent::IncomingCall { peer } = event {
                return peer;
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("incoming call");
    assert_eq!(incoming, PeerId::new("alpha"));

    let status = timeout(Duration::from_secs(2), async {
        loop {
            let status = alpha.status().await.unwrap();
            if status.session.phase == Phase::Active {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("alpha should become active");
    assert_eq!(status.connection, ConnectionState::Registered);
    assert_eq!(status.session.remote_id, Some(PeerId::new("bravo")));
    assert!(status.mic_enabled);

    alpha.shutdown().unwrap();
    bravo.shutdown().unwrap();
    alpha_task.await.unwrap();
    bravo_task.await.unwrap();
    assert!(alpha.status().await.is_err());
}
