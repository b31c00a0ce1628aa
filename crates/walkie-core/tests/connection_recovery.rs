//! Registration, identifier collision and reconnect scenarios

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{connected_pair, settle, TestPeer};
use walkie_core::config::ReconnectConfig;
use walkie_core::loopback::{LoopbackBroker, PermissionMode};
use walkie_core::signaling::{PeerId, Registration, SignalingBroker, SignalingErrorKind};
use walkie_core::storage::{KeyValueStore, MemoryStore};
use walkie_core::{ConnectionState, WalkieConfig, WalkieEvent, WalkieResult};

fn fast_reconnect(attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        use_jitter: false,
    }
}

/// Settle until `done` holds, giving background backoff time to run
async fn settle_until(peer: &mut TestPeer, done: impl Fn(&TestPeer) -> bool) -> bool {
    for _ in 0..100 {
        peer.walkie.settle().await;
        if done(peer) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    false
}

fn registered(peer: &TestPeer) -> bool {
    peer.walkie.connection_state() == ConnectionState::Registered
}

/// Broker where somebody else always grabs the requested id first
#[derive(Clone, Default)]
struct CrowdedBroker {
    inner: LoopbackBroker,
    squatters: Arc<Mutex<Vec<Registration>>>,
}

impl SignalingBroker for CrowdedBroker {
    fn register(&self, requested: Option<&PeerId>) -> WalkieResult<Registration> {
        if let Some(id) = requested {
            let squatter = self.inner.register(Some(id))?;
            self.squatters.lock().push(squatter);
        }
        self.inner.register(requested)
    }
}

#[tokio::test]
async fn test_broker_assigned_identity_survives_restart() {
    let broker = LoopbackBroker::new();
    let store = MemoryStore::new();
    let config = WalkieConfig::default().with_broker_assigned_id();

    let mut first =
        TestPeer::build(&broker, store.clone(), config.clone(), PermissionMode::Grant).await;
    assert_eq!(first.walkie.connection_state(), ConnectionState::Registered);
    let assigned = first.id();
    assert_eq!(store.get("walkie-id").unwrap().as_deref(), Some(assigned.as_str()));
    assert!(first
        .drain_events()
        .iter()
        .any(|e| matches!(e, WalkieEvent::Registered { local_id } if local_id == &assigned)));
    drop(first);
    assert!(!broker.is_registered(&assigned));

    let second = TestPeer::build(&broker, store, config, PermissionMode::Grant).await;
    assert_eq!(second.id(), assigned);
}

#[tokio::test]
async fn test_locally_generated_identity_is_persisted_before_registering() {
    let broker = LoopbackBroker::new();
    let store = MemoryStore::new();
    let peer = TestPeer::build(
        &broker,
        store.clone(),
        WalkieConfig::default(),
        PermissionMode::Grant,
    )
    .await;

    let stored = store.get("walkie-id").unwrap().expect("id stored");
    assert_eq!(peer.id().as_str(), stored);
    assert!(broker.is_connected(&peer.id()));
}

#[tokio::test]
async fn test_taken_identity_is_replaced_with_suffix() {
    let broker = LoopbackBroker::new();
    let squatter = TestPeer::new(&broker, "abc").await;
    let mut newcomer = TestPeer::new(&broker, "abc").await;

    assert_eq!(newcomer.walkie.connection_state(), ConnectionState::Registered);
    let id = newcomer.id();
    let suffix = id
        .as_str()
        .strip_prefix("abc-")
        .expect("replacement keeps the base id");
    assert_eq!(suffix.len(), 4);
    assert!(suffix
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));

    assert_eq!(newcomer.store.get("walkie-id").unwrap().as_deref(), Some(id.as_str()));
    assert!(newcomer.drain_events().iter().any(|e| matches!(
        e,
        WalkieEvent::IdentityReplaced { previous, replacement }
            if previous.as_str() == "abc" && replacement == &id
    )));

    // the squatter keeps its registration
    assert_eq!(squatter.id().as_str(), "abc");
    assert!(broker.is_connected(&PeerId::new("abc")));
}

#[tokio::test]
async fn test_second_collision_fails_registration() {
    let broker = CrowdedBroker::default();
    let store = MemoryStore::with_entries([("walkie-id", "abc")]);
    let walkie = walkie_core::Walkie::builder()
        .store(store.clone())
        .broker(broker.clone())
        .capture(walkie_core::loopback::LoopbackCapture::new(PermissionMode::Grant))
        .output(walkie_core::loopback::LoopbackOutput::new())
        .build()
        .await
        .unwrap();
    let mut events = walkie.events().receiver();
    let mut walkie = walkie;
    walkie.settle().await;

    assert_eq!(walkie.connection_state(), ConnectionState::Failed);
    assert!(walkie.local_id().is_none());

    let mut failed = false;
    let mut replaced = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            WalkieEvent::RegistrationFailed { kind } => {
                assert_eq!(kind, SignalingErrorKind::UnavailableId);
                failed = true;
            }
            WalkieEvent::IdentityReplaced { .. } => replaced += 1,
            _ => {}
        }
    }
    assert!(failed);
    assert_eq!(replaced, 1);
    // the first replacement stays persisted
    assert!(store.get("walkie-id").unwrap().unwrap().starts_with("abc-"));
}

#[tokio::test]
async fn test_disconnect_reconnects_automatically() {
    let broker = LoopbackBroker::new();
    let mut peer = TestPeer::build(
        &broker,
        MemoryStore::with_entries([("walkie-id", "alpha")]),
        WalkieConfig::default().with_reconnect(fast_reconnect(3)),
        PermissionMode::Grant,
    )
    .await;
    let id = peer.id();

    broker.drop_signaling(&id);
    assert!(settle_until(&mut peer, registered).await);
    assert_eq!(broker.reconnect_count(&id), 1);
    assert_eq!(peer.walkie.local_id(), Some(&id));

    let events = peer.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        WalkieEvent::ConnectionChanged { current: ConnectionState::Disconnected, .. }
    )));
}

#[tokio::test]
async fn test_failed_reconnect_waits_for_foreground() {
    let broker = LoopbackBroker::new();
    let mut peer = TestPeer::build(
        &broker,
        MemoryStore::with_entries([("walkie-id", "alpha")]),
        WalkieConfig::default().with_reconnect(fast_reconnect(1)),
        PermissionMode::Grant,
    )
    .await;
    let id = peer.id();

    broker.fail_reconnects(&id, 1);
    broker.drop_signaling(&id);
    settle_until(&mut peer, |_| false).await;
    assert_eq!(peer.walkie.connection_state(), ConnectionState::Disconnected);
    assert_eq!(broker.reconnect_count(&id), 0);

    peer.walkie.on_foreground();
    assert!(settle_until(&mut peer, registered).await);
    assert_eq!(broker.reconnect_count(&id), 1);
}

#[tokio::test]
async fn test_manual_reconnect_runs_once() {
    let broker = LoopbackBroker::new();
    let mut peer = TestPeer::build(
        &broker,
        MemoryStore::with_entries([("walkie-id", "alpha")]),
        WalkieConfig::default().with_reconnect(fast_reconnect(3)),
        PermissionMode::Grant,
    )
    .await;
    let id = peer.id();

    peer.walkie.reconnect().unwrap();
    settle_until(&mut peer, |_| false).await;

    assert_eq!(peer.walkie.connection_state(), ConnectionState::Registered);
    assert_eq!(broker.reconnect_count(&id), 1);
}

#[tokio::test]
async fn test_foreground_while_registered_does_nothing() {
    let broker = LoopbackBroker::new();
    let mut peer = TestPeer::new(&broker, "alpha").await;

    peer.walkie.on_foreground();
    peer.walkie.settle().await;

    assert_eq!(peer.walkie.connection_state(), ConnectionState::Registered);
    assert_eq!(broker.reconnect_count(&PeerId::new("alpha")), 0);
}

#[tokio::test]
async fn test_call_survives_signaling_drop() {
    let broker = LoopbackBroker::new();
    let (mut a, mut b) = connected_pair(&broker).await;

    broker.drop_signaling(&PeerId::new("alpha"));
    settle(&mut [&mut a, &mut b]).await;

    assert!(a.walkie.session().is_active());
    assert!(b.walkie.session().is_active());
    assert_eq!(broker.open_calls(&PeerId::new("alpha")), 1);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let broker = LoopbackBroker::new();
    let (mut a, mut b) = connected_pair(&broker).await;

    a.walkie.shutdown();
    a.walkie.shutdown();
    assert!(a.walkie.is_shut_down());
    assert_eq!(a.walkie.connection_state(), ConnectionState::Destroyed);
    assert!(!broker.is_registered(&PeerId::new("alpha")));
    assert!(a.output.is_closed());
    assert!(!a.wake.is_held());

    settle(&mut [&mut a, &mut b]).await;
    assert!(b.walkie.session().is_idle());
}
