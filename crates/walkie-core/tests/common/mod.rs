//! Shared fixtures for walkie integration tests

#![allow(dead_code)]

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use walkie_core::loopback::{
    LoopbackBroker, LoopbackCapture, LoopbackOutput, LoopbackWakeLock, PermissionMode,
};
use walkie_core::storage::MemoryStore;
use walkie_core::{PeerId, Walkie, WalkieConfig, WalkieEvent};

/// Install a test subscriber once; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One party with its loopback platform
pub struct TestPeer {
    pub walkie: Walkie,
    pub store: MemoryStore,
    pub capture: LoopbackCapture,
    pub output: LoopbackOutput,
    pub wake: LoopbackWakeLock,
    pub events: broadcast::Receiver<WalkieEvent>,
}

impl TestPeer {
    /// Party whose stored identity is `id`, with microphone access granted
    pub async fn new(broker: &LoopbackBroker, id: &str) -> Self {
        Self::build(
            broker,
            MemoryStore::with_entries([("walkie-id", id)]),
            WalkieConfig::default(),
            PermissionMode::Grant,
        )
        .await
    }

    pub async fn build(
        broker: &LoopbackBroker,
        store: MemoryStore,
        config: WalkieConfig,
        mode: PermissionMode,
    ) -> Self {
        init_tracing();
        let capture = LoopbackCapture::new(mode);
        let output = LoopbackOutput::new();
        let wake = LoopbackWakeLock::new(true);
        let walkie = Walkie::builder()
            .config(config)
            .store(store.clone())
            .broker(broker.clone())
            .capture(capture.clone())
            .output(output.clone())
            .wake_lock(wake.clone())
            .build()
            .await
            .expect("walkie should build");
        let events = walkie.events().receiver();

        let mut peer = Self {
            walkie,
            store,
            capture,
            output,
            wake,
            events,
        };
        peer.walkie.settle().await;
        peer
    }

    pub fn id(&self) -> PeerId {
        self.walkie.local_id().cloned().expect("peer should be registered")
    }

    /// Everything emitted since the last drain
    pub fn drain_events(&mut self) -> Vec<WalkieEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Let every peer drain its queue, repeatedly, so cross-peer chains finish
pub async fn settle(peers: &mut [&mut TestPeer]) {
    for _ in 0..4 {
        for peer in peers.iter_mut() {
            peer.walkie.settle().await;
        }
    }
}

/// Register `a` and `b` and connect `a` to `b`
pub async fn connected_pair(broker: &LoopbackBroker) -> (TestPeer, TestPeer) {
    let mut a = TestPeer::new(broker, "alpha").await;
    let mut b = TestPeer::new(broker, "bravo").await;
    a.walkie.start_or_reuse_call("bravo").expect("dial");
    settle(&mut [&mut a, &mut b]).await;
    assert!(a.walkie.session().is_active(), "caller should be active");
    assert!(b.walkie.session().is_active(), "callee should be active");
    (a, b)
}
