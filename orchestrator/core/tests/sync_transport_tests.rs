// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for peer replication over loopback.
//!
//! Every node gets a temporary record store, its own event bus and a
//! listener bound to ephemeral ports on 127.0.0.1.

use async_trait::async_trait;
use fleet_core::domain::events::topics;
use fleet_core::domain::node_config::{SyncSettings, TransportPreference};
use fleet_core::domain::peer::{PeerId, PeerInfo, PeerStatus, TransportKind};
use fleet_core::domain::record::PutOptions;
use fleet_core::infrastructure::event_bus::{EventBus, EventBusError};
use fleet_core::infrastructure::record_store::RecordStore;
use fleet_core::infrastructure::sync::wire::{SyncAck, SyncBatch};
use fleet_core::infrastructure::sync::{
    Hello, PeerLink, StreamTransport, SyncListener, SyncTransport, Transport, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestNode {
    store: Arc<RecordStore>,
    bus: EventBus,
    listener: Arc<SyncListener>,
    listener_token: CancellationToken,
    listener_handle: JoinHandle<()>,
}

impl TestNode {
    async fn start(node_id: &str) -> Self {
        let store = Arc::new(RecordStore::temporary(node_id).unwrap());
        let bus = EventBus::new();
        let listener = Arc::new(
            SyncListener::bind("127.0.0.1", 0, 0, Arc::clone(&store), bus.clone())
                .await
                .unwrap(),
        );
        let listener_token = CancellationToken::new();
        let listener_handle = Arc::clone(&listener).start(listener_token.clone());
        Self {
            store,
            bus,
            listener,
            listener_token,
            listener_handle,
        }
    }

    fn peer_info(&self) -> PeerInfo {
        let datagram = self.listener.local_datagram_addr().unwrap();
        let stream = self.listener.local_stream_addr().unwrap();
        PeerInfo::discovered("127.0.0.1", datagram.port()).with_stream_port(stream.port())
    }

    fn transport(&self, settings: SyncSettings) -> SyncTransport {
        SyncTransport::new(Arc::clone(&self.store), self.bus.clone(), settings)
    }

    async fn stop_listener(self) {
        self.listener_token.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.listener_handle)
            .await
            .expect("listener should stop")
            .unwrap();
    }
}

fn fast_settings() -> SyncSettings {
    SyncSettings {
        retry_attempts: 2,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(20),
        handshake_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(1),
        ..SyncSettings::default()
    }
}

/// Fails every handshake, counting the attempts.
struct UnreachableTransport {
    kind: TransportKind,
    attempts: AtomicUsize,
}

impl UnreachableTransport {
    fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for UnreachableTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(
        &self,
        peer: &PeerInfo,
        _hello: &Hello,
        _handshake_timeout: Duration,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::HandshakeTimeout {
            peer: peer.id.clone(),
            transport: self.kind,
        })
    }
}

/// Completes every handshake, then drops the connection on the first batch.
struct DroppingTransport {
    connects: AtomicUsize,
}

impl DroppingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for DroppingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn connect(
        &self,
        peer: &PeerInfo,
        _hello: &Hello,
        _handshake_timeout: Duration,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DroppingLink {
            peer: peer.id.clone(),
        }))
    }
}

struct DroppingLink {
    peer: PeerId,
}

#[async_trait]
impl PeerLink for DroppingLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn remote_node_id(&self) -> &str {
        "node-flaky"
    }

    fn max_payload_bytes(&self) -> usize {
        64 * 1024
    }

    async fn send_batch(
        &mut self,
        _batch: SyncBatch,
        _timeout: Duration,
    ) -> Result<SyncAck, TransportError> {
        Err(TransportError::Connection {
            peer: self.peer.clone(),
            reason: "connection reset by peer".to_string(),
        })
    }

    async fn close(&mut self) {}
}

fn put_versions(store: &RecordStore, key: &str, count: usize) {
    for i in 0..count {
        store
            .put("coordination", key, format!("{}-{}", store.node_id(), i + 1).into_bytes(), PutOptions::public())
            .unwrap();
    }
}

#[tokio::test]
async fn test_two_nodes_converge_on_highest_version() {
    let node_a = TestNode::start("node-a").await;
    let node_b = TestNode::start("node-b").await;

    put_versions(&node_a.store, "shared", 3);
    put_versions(&node_b.store, "shared", 5);

    let a_to_b = node_a.transport(fast_settings());
    let peer_b = a_to_b.add_peer_info(node_b.peer_info()).unwrap();
    assert_eq!(a_to_b.connect(&peer_b).await.unwrap(), TransportKind::Datagram);

    let report = a_to_b.sync_with_peer(&peer_b).await.unwrap();
    assert_eq!(report.entries_sent, 1);
    assert_eq!(report.entries_applied, 0);
    assert_eq!(report.entries_rejected, 1);

    let b_to_a = node_b.transport(fast_settings());
    let peer_a = b_to_a.add_peer_info(node_a.peer_info()).unwrap();
    b_to_a.connect(&peer_a).await.unwrap();
    let report = b_to_a.sync_with_peer(&peer_a).await.unwrap();
    assert_eq!(report.entries_applied, 1);

    let on_a = node_a.store.get("coordination", "shared").unwrap().unwrap();
    let on_b = node_b.store.get("coordination", "shared").unwrap().unwrap();
    assert_eq!(on_a.version, 5);
    assert_eq!(on_a.value, b"node-b-5");
    assert_eq!((on_a.version, &on_a.origin, &on_a.value), (on_b.version, &on_b.origin, &on_b.value));

    a_to_b.shutdown().await;
    b_to_a.shutdown().await;
    node_a.stop_listener().await;
    node_b.stop_listener().await;
}

#[tokio::test]
async fn test_redelivered_changes_leave_receiver_unchanged() {
    let node_a = TestNode::start("node-a").await;
    let node_b = TestNode::start("node-b").await;
    let mut remote_updates = node_b
        .bus
        .subscribe_channel(topics::RECORD_REMOTE_UPDATE, 64)
        .unwrap();

    for key in ["task/1", "task/2", "task/3"] {
        node_a.store.put("coordination", key, b"queued".to_vec(), PutOptions::public()).unwrap();
    }

    let transport = node_a.transport(fast_settings());
    let peer = transport.add_peer_info(node_b.peer_info()).unwrap();
    transport.connect(&peer).await.unwrap();

    let first = transport.sync_with_peer(&peer).await.unwrap();
    assert_eq!(first.entries_applied, 3);

    let nothing_new = transport.sync_with_peer(&peer).await.unwrap();
    assert_eq!(nothing_new.entries_sent, 0);
    assert_eq!(nothing_new.cursor, first.cursor);

    // Re-registering resets the cursor, so everything is sent again.
    transport.remove_peer(&peer).await.unwrap();
    let peer = transport.add_peer_info(node_b.peer_info()).unwrap();
    transport.connect(&peer).await.unwrap();
    let replay = transport.sync_with_peer(&peer).await.unwrap();
    assert_eq!(replay.entries_sent, 3);
    assert_eq!(replay.entries_applied, 0);
    assert_eq!(replay.entries_rejected, 3);

    assert_eq!(node_b.store.stats().unwrap().total_entries, 3);
    for _ in 0..3 {
        remote_updates.recv().await.unwrap();
    }
    assert!(matches!(remote_updates.try_recv(), Err(EventBusError::Empty)));

    transport.shutdown().await;
    node_a.stop_listener().await;
    node_b.stop_listener().await;
}

#[tokio::test]
async fn test_fallback_publishes_exactly_one_event() {
    let node_a = TestNode::start("node-a").await;
    let node_b = TestNode::start("node-b").await;
    let mut fallbacks = node_a
        .bus
        .subscribe_channel(topics::FALLBACK_TRANSPORT, 8)
        .unwrap();

    let primary = UnreachableTransport::new(TransportKind::Datagram);
    let transport = node_a
        .transport(fast_settings())
        .with_transports(primary.clone(), Arc::new(StreamTransport::new()));
    let peer = transport.add_peer_info(node_b.peer_info()).unwrap();

    let settings = fast_settings();
    let budget = settings.retry_policy().max_total_delay()
        + settings.handshake_timeout * 2 * settings.retry_attempts;
    let started = Instant::now();
    assert_eq!(transport.connect(&peer).await.unwrap(), TransportKind::Stream);
    let elapsed = started.elapsed();
    assert!(elapsed <= budget, "fallback took {:?}, budget {:?}", elapsed, budget);
    // Already linked; no new handshake and no second event.
    assert_eq!(transport.connect(&peer).await.unwrap(), TransportKind::Stream);
    assert_eq!(primary.attempts.load(Ordering::SeqCst), 1);

    let event = fallbacks.recv().await.unwrap();
    assert_eq!(event.topic, topics::FALLBACK_TRANSPORT);
    assert!(matches!(fallbacks.try_recv(), Err(EventBusError::Empty)));

    node_a.store.put("coordination", "over-stream", b"ok".to_vec(), PutOptions::public()).unwrap();
    let report = transport.sync_with_peer(&peer).await.unwrap();
    assert_eq!(report.entries_applied, 1);
    assert!(node_b.store.get("coordination", "over-stream").unwrap().is_some());

    let metrics = transport.metrics();
    assert_eq!(metrics.fallback_events, 1);
    assert_eq!(metrics.fallback_connections, 1);
    assert!(transport.is_degraded());

    transport.shutdown().await;
    node_a.stop_listener().await;
    node_b.stop_listener().await;
}

#[tokio::test]
async fn test_unreachable_peer_is_evicted_after_retries() {
    let node_a = TestNode::start("node-a").await;
    let mut disconnects = node_a
        .bus
        .subscribe_channel(topics::PEER_DISCONNECTED, 8)
        .unwrap();

    let primary = UnreachableTransport::new(TransportKind::Datagram);
    let secondary = UnreachableTransport::new(TransportKind::Stream);
    let transport = node_a
        .transport(fast_settings())
        .with_transports(primary.clone(), secondary.clone());
    let peer = transport.add_peer("10.255.255.1", 7400).unwrap();

    let err = transport.connect(&peer).await.unwrap_err();
    assert!(matches!(err, TransportError::Fatal { .. }));
    // Two attempts in total, each trying both transports.
    assert_eq!(primary.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(secondary.attempts.load(Ordering::SeqCst), 2);

    assert!(transport.peer(&peer).is_none());
    assert!(transport.peers().is_empty());
    assert_eq!(transport.metrics().peers_evicted, 1);
    assert!(disconnects.recv().await.is_ok());

    node_a.stop_listener().await;
}

#[tokio::test]
async fn test_peer_that_links_but_never_syncs_is_evicted() {
    let node_a = TestNode::start("node-a").await;
    let primary = DroppingTransport::new();
    let transport = node_a
        .transport(fast_settings())
        .with_transports(primary.clone(), UnreachableTransport::new(TransportKind::Stream));
    let peer = transport.add_peer("10.255.255.2", 7400).unwrap();
    node_a.store.put("coordination", "pending", b"x".to_vec(), PutOptions::public()).unwrap();

    for round in 1..=2u32 {
        transport.connect(&peer).await.unwrap();
        // A fresh link does not clear the failures of earlier syncs.
        assert_eq!(transport.peer(&peer).unwrap().retry_count, round - 1);
        assert!(transport.sync_with_peer(&peer).await.is_err());
        assert_eq!(transport.peer(&peer).unwrap().retry_count, round);
    }

    transport.connect(&peer).await.unwrap();
    assert!(transport.sync_with_peer(&peer).await.is_err());
    assert!(transport.peer(&peer).is_none());
    assert_eq!(transport.metrics().peers_evicted, 1);
    assert_eq!(primary.connects.load(Ordering::SeqCst), 3);

    node_a.stop_listener().await;
}

#[tokio::test]
async fn test_lost_link_marks_peer_disconnected() {
    let node_a = TestNode::start("node-a").await;
    let node_b = TestNode::start("node-b").await;

    let settings = SyncSettings {
        transport_preference: TransportPreference::StreamFirst,
        ..fast_settings()
    };
    let transport = node_a.transport(settings);
    let peer: PeerId = transport.add_peer_info(node_b.peer_info()).unwrap();
    assert_eq!(transport.connect(&peer).await.unwrap(), TransportKind::Stream);

    node_b.stop_listener().await;

    node_a.store.put("coordination", "late", b"x".to_vec(), PutOptions::public()).unwrap();
    let err = transport.sync_with_peer(&peer).await.unwrap_err();
    assert!(!err.keeps_link(), "unexpected error kind: {}", err);

    let info = transport.peer(&peer).unwrap();
    assert_eq!(info.status, PeerStatus::Disconnected);
    assert_eq!(info.retry_count, 1);
    assert_eq!(info.last_sync_sequence, 0);
    assert!(matches!(
        transport.sync_with_peer(&peer).await,
        Err(TransportError::NotConnected(_))
    ));

    transport.shutdown().await;
    node_a.stop_listener().await;
}
