// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sync Transport - outbound replication to peer nodes
//!
//! Tracks every known peer, keeps at most one link per peer and pushes
//! local record changes to it in acknowledged batches.
//!
//! # Peer states
//!
//! ```text
//! discovered -> connecting -> connected <-> syncing
//!                   |             |            |
//!                   v             v            v
//!             (evicted)      disconnected <----+
//! ```
//!
//! A connect attempt tries the preferred transport, then the other one.
//! Reaching a peer only over the secondary transport publishes one
//! `fallback.transport` event. Attempts are spaced by the configured
//! [`RetryPolicy`](crate::domain::retry::RetryPolicy); when the budget is
//! spent the peer is evicted.
//!
//! Every operation on one peer (connect, sync, disconnect) holds that
//! peer's link mutex, so they never interleave. Different peers proceed
//! concurrently.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::datagram::DatagramTransport;
use super::stream::StreamTransport;
use super::sync_metrics::SyncMetrics;
use super::transport::{Hello, PeerLink, Transport, TransportError};
use super::wire::{self, SyncBatch, BATCH_OVERHEAD_BYTES};
use crate::domain::events::PeerEvent;
use crate::domain::node_config::{SyncSettings, TransportPreference};
use crate::domain::peer::{PeerId, PeerInfo, PeerStatus, TransportKind};
use crate::domain::record::ReplicatedEntry;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::record_store::RecordStore;

/// Outcome of one successful `sync_with_peer` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub peer_id: PeerId,
    pub entries_sent: usize,
    pub entries_applied: usize,
    pub entries_rejected: usize,
    pub batches: usize,
    pub duration_ms: u64,
    /// Local sequence the peer has now acknowledged up to.
    pub cursor: u64,
}

struct PeerSlot {
    info: RwLock<PeerInfo>,
    link: tokio::sync::Mutex<Option<Box<dyn PeerLink>>>,
    /// Set once a batch could not fit a datagram.
    stream_only: AtomicBool,
}

impl PeerSlot {
    fn new(info: PeerInfo) -> Self {
        Self {
            info: RwLock::new(info),
            link: tokio::sync::Mutex::new(None),
            stream_only: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> PeerInfo {
        self.info.read().clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut PeerInfo) -> T) -> T {
        f(&mut self.info.write())
    }
}

pub struct SyncTransport {
    node_id: String,
    store: Arc<RecordStore>,
    event_bus: EventBus,
    settings: SyncSettings,
    primary: Arc<dyn Transport>,
    secondary: Arc<dyn Transport>,
    peers: DashMap<PeerId, Arc<PeerSlot>>,
    membership: Mutex<()>,
    metrics: Mutex<SyncMetrics>,
    batch_sequence: AtomicU64,
    shutdown_token: CancellationToken,
}

impl SyncTransport {
    pub fn new(store: Arc<RecordStore>, event_bus: EventBus, settings: SyncSettings) -> Self {
        let datagram: Arc<dyn Transport> = Arc::new(DatagramTransport::new());
        let stream: Arc<dyn Transport> = Arc::new(StreamTransport::new());
        let (primary, secondary) = match settings.transport_preference {
            TransportPreference::DatagramFirst => (datagram, stream),
            TransportPreference::StreamFirst => (stream, datagram),
        };

        Self {
            node_id: store.node_id().to_string(),
            store,
            event_bus,
            settings,
            primary,
            secondary,
            peers: DashMap::new(),
            membership: Mutex::new(()),
            metrics: Mutex::new(SyncMetrics::default()),
            batch_sequence: AtomicU64::new(1),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Replace the transports, preferred one first.
    pub fn with_transports(mut self, primary: Arc<dyn Transport>, secondary: Arc<dyn Transport>) -> Self {
        self.primary = primary;
        self.secondary = secondary;
        self
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn add_peer(&self, address: &str, port: u16) -> Result<PeerId, TransportError> {
        self.add_peer_info(PeerInfo::discovered(address, port))
    }

    pub fn add_peer_info(&self, info: PeerInfo) -> Result<PeerId, TransportError> {
        let _membership = self.membership.lock();
        if self.peers.contains_key(&info.id) {
            return Err(TransportError::DuplicatePeer(info.id));
        }
        if self.peers.len() >= self.settings.max_peers {
            return Err(TransportError::CapacityExceeded {
                max_peers: self.settings.max_peers,
            });
        }

        let id = info.id.clone();
        info!(peer = %id, stream_port = info.stream_port, "Peer added");
        self.peers.insert(id.clone(), Arc::new(PeerSlot::new(info)));
        Ok(id)
    }

    /// Register every configured peer that is not known yet.
    pub fn discover_peers(&self) -> Vec<PeerId> {
        let mut added = Vec::new();
        for address in &self.settings.peers {
            let info = address.to_peer_info();
            if self.peers.contains_key(&info.id) {
                continue;
            }
            match self.add_peer_info(info) {
                Ok(id) => added.push(id),
                Err(e) => warn!(address = %address.address, port = address.port, error = %e, "Skipping configured peer"),
            }
        }
        added
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(peer_id).map(|slot| slot.snapshot())
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.iter().map(|slot| slot.snapshot()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Establish a link to `peer_id`, falling back to the secondary transport.
    ///
    /// Returns the transport the link runs over. Exhausting the retry budget
    /// evicts the peer and returns [`TransportError::Fatal`]. A successful
    /// handshake leaves `retry_count` alone; only a completed sync clears it,
    /// so a peer that accepts links but never takes a batch is still evicted.
    pub async fn connect(&self, peer_id: &PeerId) -> Result<TransportKind, TransportError> {
        let slot = self.slot(peer_id)?;
        let mut link = slot.link.lock().await;
        if let Some(existing) = link.as_ref() {
            return Ok(existing.kind());
        }
        slot.update(|info| info.status = PeerStatus::Connecting);

        let hello = Hello::new(self.node_id.clone());
        let mut backoff = self.settings.retry_policy().backoff();
        let mut attempt = 0u32;

        let last_error = loop {
            attempt += 1;
            let info = slot.snapshot();
            match self.open_link(&slot, &info, &hello).await {
                Ok((established, fallback_reason)) => {
                    let kind = established.kind();
                    let remote_node_id = established.remote_node_id().to_string();
                    *link = Some(established);

                    if let Some(reason) = fallback_reason {
                        self.metrics.lock().fallback_events += 1;
                        metrics::counter!("fleet_sync_fallback_total").increment(1);
                        warn!(
                            peer = %peer_id,
                            from = %self.primary.kind(),
                            to = %kind,
                            reason = %reason,
                            "Peer reachable only over fallback transport"
                        );
                        self.event_bus.publish_domain(PeerEvent::FallbackTransport {
                            peer_id: peer_id.clone(),
                            from: self.primary.kind(),
                            to: kind,
                            reason,
                            at: Utc::now(),
                        });
                    }

                    slot.update(|info| {
                        info.status = PeerStatus::Connected;
                        info.transport = Some(kind);
                        info.remote_node_id = Some(remote_node_id.clone());
                        info.last_error = None;
                    });
                    info!(peer = %peer_id, transport = %kind, remote = %remote_node_id, attempt, "Peer connected");
                    self.event_bus.publish_domain(PeerEvent::Connected {
                        peer_id: peer_id.clone(),
                        transport: kind,
                        remote_node_id,
                        connected_at: Utc::now(),
                    });
                    return Ok(kind);
                }
                Err(e) => {
                    warn!(peer = %peer_id, attempt, error = %e, "Peer connection attempt failed");
                    slot.update(|info| {
                        info.retry_count = info.retry_count.max(attempt);
                        info.last_error = Some(e.to_string());
                    });

                    let Some(delay) = backoff.next() else {
                        break e;
                    };
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = self.shutdown_token.cancelled() => true,
                    };
                    if cancelled {
                        break e;
                    }
                }
            }
        };
        drop(link);

        let reason = format!("gave up after {} attempts: {}", attempt, last_error);
        self.evict(peer_id, &reason).await;
        Err(TransportError::Fatal {
            peer: peer_id.clone(),
            reason,
        })
    }

    /// Push every local change the peer has not acknowledged yet.
    ///
    /// The peer's cursor advances batch by batch, so a failure part-way
    /// keeps the progress of the batches that were acknowledged.
    pub async fn sync_with_peer(&self, peer_id: &PeerId) -> Result<SyncReport, TransportError> {
        let slot = self.slot(peer_id)?;
        let mut link = slot.link.lock().await;
        let Some(active) = link.as_mut() else {
            return Err(TransportError::NotConnected(peer_id.clone()));
        };
        slot.update(|info| info.status = PeerStatus::Syncing);

        let started = Instant::now();
        match self.push_changes(&slot, &mut **active).await {
            Ok(mut report) => {
                let elapsed = started.elapsed();
                report.duration_ms = elapsed.as_millis() as u64;
                slot.update(|info| {
                    info.status = PeerStatus::Connected;
                    info.last_sync_at = Some(Utc::now());
                    info.retry_count = 0;
                    info.last_error = None;
                });
                self.metrics.lock().record_success(elapsed);
                metrics::counter!("fleet_sync_total", "outcome" => "success").increment(1);
                metrics::histogram!("fleet_sync_duration_seconds").record(elapsed.as_secs_f64());

                debug!(
                    peer = %peer_id,
                    entries_sent = report.entries_sent,
                    batches = report.batches,
                    cursor = report.cursor,
                    "Peer sync completed"
                );
                self.event_bus.publish_domain(PeerEvent::SyncCompleted {
                    peer_id: peer_id.clone(),
                    entries_sent: report.entries_sent,
                    entries_rejected: report.entries_rejected,
                    batches: report.batches,
                    duration_ms: report.duration_ms,
                    completed_at: Utc::now(),
                });
                Ok(report)
            }
            Err(e) => {
                self.metrics.lock().record_failure();
                metrics::counter!("fleet_sync_total", "outcome" => "failure").increment(1);

                if e.is_payload_too_large() {
                    slot.stream_only.store(true, Ordering::Release);
                }
                let keep_link = e.keeps_link();
                if !keep_link {
                    if let Some(mut broken) = link.take() {
                        broken.close().await;
                    }
                }
                let retry_count = slot.update(|info| {
                    info.retry_count += 1;
                    info.last_error = Some(e.to_string());
                    info.status = if keep_link {
                        PeerStatus::Connected
                    } else {
                        PeerStatus::Disconnected
                    };
                    info.retry_count
                });
                drop(link);

                warn!(peer = %peer_id, retry_count, error = %e, "Peer sync failed");
                self.event_bus.publish_domain(PeerEvent::SyncFailed {
                    peer_id: peer_id.clone(),
                    error: e.to_string(),
                    failed_at: Utc::now(),
                });
                if !keep_link {
                    self.publish_disconnected(peer_id, &e.to_string());
                }

                if retry_count > self.settings.retry_attempts {
                    self.evict(peer_id, "sync retry budget exhausted").await;
                }
                Err(e)
            }
        }
    }

    /// Sync every connected peer concurrently.
    pub async fn sync_all(&self) -> Vec<(PeerId, Result<SyncReport, TransportError>)> {
        let connected: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|slot| slot.info.read().is_connected())
            .map(|slot| slot.key().clone())
            .collect();

        join_all(connected.into_iter().map(|peer_id| async move {
            let result = self.sync_with_peer(&peer_id).await;
            (peer_id, result)
        }))
        .await
    }

    /// Connect every peer that currently has no link.
    pub async fn connect_idle(&self) -> Vec<(PeerId, Result<TransportKind, TransportError>)> {
        let idle: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|slot| {
                matches!(
                    slot.info.read().status,
                    PeerStatus::Discovered | PeerStatus::Disconnected
                )
            })
            .map(|slot| slot.key().clone())
            .collect();

        join_all(idle.into_iter().map(|peer_id| async move {
            let result = self.connect(&peer_id).await;
            (peer_id, result)
        }))
        .await
    }

    /// Close the link but keep the peer registered.
    pub async fn disconnect_peer(&self, peer_id: &PeerId) -> Result<(), TransportError> {
        let slot = self.slot(peer_id)?;
        let mut link = slot.link.lock().await;
        let had_link = match link.take() {
            Some(mut active) => {
                active.close().await;
                true
            }
            None => false,
        };
        slot.update(|info| info.status = PeerStatus::Disconnected);
        drop(link);

        if had_link {
            info!(peer = %peer_id, "Peer disconnected");
            self.publish_disconnected(peer_id, "disconnect requested");
        }
        Ok(())
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Result<(), TransportError> {
        self.disconnect_peer(peer_id).await?;
        let _membership = self.membership.lock();
        self.peers.remove(peer_id);
        info!(peer = %peer_id, "Peer removed");
        Ok(())
    }

    pub fn metrics(&self) -> SyncMetrics {
        let mut snapshot = self.metrics.lock().clone();
        let preferred = self.primary.kind();
        for slot in self.peers.iter() {
            let info = slot.info.read();
            if info.is_connected() {
                snapshot.active_peers += 1;
                if info.transport.is_some_and(|kind| kind != preferred) {
                    snapshot.fallback_connections += 1;
                }
            }
        }
        metrics::gauge!("fleet_sync_active_peers").set(snapshot.active_peers as f64);
        snapshot
    }

    /// True while any peer is linked over the fallback transport.
    pub fn is_degraded(&self) -> bool {
        self.metrics().fallback_connections > 0
    }

    /// Start the auto-sync background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval = ?self.settings.sync_interval,
            peers = self.peers.len(),
            "Starting auto-sync background task"
        );

        let mut tick = interval(self.settings.sync_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.discover_peers();
                    for (peer_id, result) in self.connect_idle().await {
                        if let Err(e) = result {
                            debug!(peer = %peer_id, error = %e, "Auto-connect failed");
                        }
                    }
                    let results = self.sync_all().await;
                    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                    debug!(synced = results.len() - failed, failed, "Auto-sync cycle completed");
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping auto-sync");
                    break;
                }
            }
        }

        info!("Auto-sync background task stopped");
    }

    /// Stop the auto-sync loop and close every link.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let peer_ids: Vec<PeerId> = self.peers.iter().map(|slot| slot.key().clone()).collect();
        for peer_id in peer_ids {
            if let Err(e) = self.disconnect_peer(&peer_id).await {
                debug!(peer = %peer_id, error = %e, "Peer vanished during shutdown");
            }
        }
        info!("Sync transport shut down");
    }

    async fn open_link(
        &self,
        slot: &PeerSlot,
        info: &PeerInfo,
        hello: &Hello,
    ) -> Result<(Box<dyn PeerLink>, Option<String>), TransportError> {
        let timeout = self.settings.handshake_timeout;

        let skip_primary = self.primary.kind() == TransportKind::Datagram
            && slot.stream_only.load(Ordering::Acquire);
        let primary_failure = if skip_primary {
            "batches exceed the datagram payload limit".to_string()
        } else {
            match self.primary.connect(info, hello, timeout).await {
                Ok(link) => return Ok((link, None)),
                Err(e) => {
                    debug!(peer = %info.id, transport = %self.primary.kind(), error = %e, "Preferred transport failed");
                    e.to_string()
                }
            }
        };

        match self.secondary.connect(info, hello, timeout).await {
            Ok(link) => Ok((link, Some(primary_failure))),
            Err(e) => Err(TransportError::Connection {
                peer: info.id.clone(),
                reason: format!(
                    "{}: {}; {}: {}",
                    self.primary.kind(),
                    primary_failure,
                    self.secondary.kind(),
                    e
                ),
            }),
        }
    }

    async fn push_changes(
        &self,
        slot: &PeerSlot,
        link: &mut dyn PeerLink,
    ) -> Result<SyncReport, TransportError> {
        let info = slot.snapshot();
        let changes: Vec<(u64, ReplicatedEntry)> = self
            .store
            .changes_since(info.last_sync_sequence)?
            .into_iter()
            .map(|record| (record.sequence, record.to_replicated()))
            .collect();

        let mut report = SyncReport {
            peer_id: info.id.clone(),
            entries_sent: 0,
            entries_applied: 0,
            entries_rejected: 0,
            batches: 0,
            duration_ms: 0,
            cursor: info.last_sync_sequence,
        };

        for batch in plan_batches(changes, self.settings.max_batch_entries, link.max_payload_bytes()) {
            let Some(last_sequence) = batch.last().map(|(sequence, _)| *sequence) else {
                continue;
            };
            let batch_sequence = self.batch_sequence.fetch_add(1, Ordering::Relaxed);
            let entries: Vec<ReplicatedEntry> = batch.into_iter().map(|(_, entry)| entry).collect();
            let sent = entries.len();

            let ack = link
                .send_batch(
                    SyncBatch {
                        peer_id: self.node_id.clone(),
                        batch_sequence,
                        entries,
                    },
                    self.settings.request_timeout,
                )
                .await?;
            if ack.batch_sequence != batch_sequence {
                return Err(TransportError::Protocol(format!(
                    "ack for batch {} while waiting for {}",
                    ack.batch_sequence, batch_sequence
                )));
            }

            report.entries_sent += sent;
            report.entries_applied += ack.applied_count;
            report.entries_rejected += ack.rejected_keys.len();
            report.batches += 1;
            report.cursor = last_sequence;
            slot.update(|info| info.last_sync_sequence = last_sequence);
            metrics::counter!("fleet_sync_entries_sent_total").increment(sent as u64);
        }

        Ok(report)
    }

    async fn evict(&self, peer_id: &PeerId, reason: &str) {
        let Some(slot) = self.peers.get(peer_id).map(|slot| Arc::clone(&slot)) else {
            return;
        };
        let mut link = slot.link.lock().await;
        if let Some(mut active) = link.take() {
            active.close().await;
        }
        slot.update(|info| {
            info.status = PeerStatus::Disconnected;
            info.last_error = Some(reason.to_string());
        });
        drop(link);

        {
            let _membership = self.membership.lock();
            self.peers.remove(peer_id);
        }
        self.metrics.lock().peers_evicted += 1;
        metrics::counter!("fleet_sync_peers_evicted_total").increment(1);
        warn!(peer = %peer_id, reason, "Peer evicted");
        self.publish_disconnected(peer_id, reason);
    }

    fn publish_disconnected(&self, peer_id: &PeerId, reason: &str) {
        self.event_bus.publish_domain(PeerEvent::Disconnected {
            peer_id: peer_id.clone(),
            reason: reason.to_string(),
            disconnected_at: Utc::now(),
        });
    }

    fn slot(&self, peer_id: &PeerId) -> Result<Arc<PeerSlot>, TransportError> {
        self.peers
            .get(peer_id)
            .map(|slot| Arc::clone(&slot))
            .ok_or_else(|| TransportError::UnknownPeer(peer_id.clone()))
    }
}

/// Split changes into batches bounded by entry count and encoded size.
/// An entry larger than the budget travels alone.
fn plan_batches(
    changes: Vec<(u64, ReplicatedEntry)>,
    max_entries: usize,
    max_payload_bytes: usize,
) -> Vec<Vec<(u64, ReplicatedEntry)>> {
    let budget = max_payload_bytes.saturating_sub(BATCH_OVERHEAD_BYTES);
    let max_entries = max_entries.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<(u64, ReplicatedEntry)> = Vec::new();
    let mut current_bytes = 0usize;

    for (sequence, entry) in changes {
        let size = wire::entry_size(&entry);
        if !current.is_empty()
            && (current.len() >= max_entries || current_bytes.saturating_add(size) > budget)
        {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes = current_bytes.saturating_add(size);
        current.push((sequence, entry));
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
