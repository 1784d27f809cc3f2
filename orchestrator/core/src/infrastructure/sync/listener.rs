// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Sync Listener - receiving side of peer replication
//!
//! Serves both transports on the node's configured ports: answers
//! handshakes, merges incoming batches into the local record store and
//! re-publishes every accepted entry on the local event bus as
//! `record.remote-update`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Inbound half of the sync transport

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::stream::frame_codec;
use super::transport::TransportError;
use super::wire::{
    self, Envelope, SyncAck, SyncBatch, WireMessage, MAX_DATAGRAM_BYTES, MAX_FRAME_BYTES,
    PROTOCOL_VERSION,
};
use crate::domain::events::RecordEvent;
use crate::domain::record::ApplyOutcome;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::record_store::RecordStore;

pub struct SyncListener {
    node_id: String,
    store: Arc<RecordStore>,
    event_bus: EventBus,
    socket: UdpSocket,
    listener: TcpListener,
    connections: TaskTracker,
}

impl SyncListener {
    /// Bind both ports. Port 0 picks a free port; see the `local_*_addr` methods.
    pub async fn bind(
        bind_address: &str,
        datagram_port: u16,
        stream_port: u16,
        store: Arc<RecordStore>,
        event_bus: EventBus,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((bind_address, datagram_port)).await?;
        let listener = TcpListener::bind((bind_address, stream_port)).await?;

        info!(
            datagram = %socket.local_addr()?,
            stream = %listener.local_addr()?,
            "Sync listener bound"
        );

        Ok(Self {
            node_id: store.node_id().to_string(),
            store,
            event_bus,
            socket,
            listener,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_datagram_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn local_stream_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, from)) => self.serve_datagram(&buffer[..len], from).await,
                        // ICMP errors from earlier replies surface here; keep serving.
                        Err(e) => debug!(error = %e, "Datagram receive failed"),
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, from)) => {
                            let listener = Arc::clone(&self);
                            let shutdown = shutdown.child_token();
                            self.connections.spawn(async move {
                                listener.serve_stream(stream, from, shutdown).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept sync connection"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping sync listener");
                    break;
                }
            }
        }

        self.connections.close();
        self.connections.wait().await;
        info!("Sync listener stopped");
    }

    async fn serve_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let envelope = match wire::decode(bytes, MAX_DATAGRAM_BYTES) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%from, error = %e, "Discarding undecodable datagram");
                return;
            }
        };

        let reply = Envelope {
            request_id: envelope.request_id,
            message: self.handle(envelope.message),
        };
        match wire::encode(&reply, MAX_DATAGRAM_BYTES) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, from).await {
                    debug!(%from, error = %e, "Failed to send datagram reply");
                }
            }
            Err(e) => warn!(%from, error = %e, "Failed to encode datagram reply"),
        }
    }

    async fn serve_stream(&self, stream: TcpStream, from: SocketAddr, shutdown: CancellationToken) {
        debug!(%from, "Sync connection accepted");
        let mut framed = Framed::new(stream, frame_codec());

        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                _ = shutdown.cancelled() => break,
            };
            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    debug!(%from, error = %e, "Sync connection read failed");
                    break;
                }
                None => break,
            };

            let envelope = match wire::decode(&bytes, MAX_FRAME_BYTES) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%from, error = %e, "Closing sync connection after undecodable frame");
                    break;
                }
            };
            let reply = Envelope {
                request_id: envelope.request_id,
                message: self.handle(envelope.message),
            };
            let encoded = match wire::encode(&reply, MAX_FRAME_BYTES) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(%from, error = %e, "Failed to encode sync reply");
                    break;
                }
            };
            if let Err(e) = framed.send(Bytes::from(encoded)).await {
                debug!(%from, error = %e, "Sync connection write failed");
                break;
            }
        }
        debug!(%from, "Sync connection closed");
    }

    fn handle(&self, message: WireMessage) -> WireMessage {
        match message {
            WireMessage::Hello {
                node_id,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        remote = %node_id,
                        protocol_version,
                        "Rejecting handshake with unsupported protocol version"
                    );
                    return WireMessage::Error {
                        message: format!(
                            "unsupported protocol version {}, expected {}",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    };
                }
                debug!(remote = %node_id, "Handshake accepted");
                WireMessage::HelloAck {
                    node_id: self.node_id.clone(),
                    protocol_version: PROTOCOL_VERSION,
                }
            }
            WireMessage::Sync(batch) => WireMessage::Ack(self.apply_batch(batch)),
            other => WireMessage::Error {
                message: format!("unexpected message: {:?}", other),
            },
        }
    }

    /// Entries are applied in `(partition, key, version)` order so that
    /// several versions of one key inside a batch land oldest first.
    pub fn apply_batch(&self, mut batch: SyncBatch) -> SyncAck {
        batch.entries.sort_by(|a, b| {
            (&a.partition, &a.key, a.version).cmp(&(&b.partition, &b.key, b.version))
        });

        let mut applied_count = 0;
        let mut rejected_keys = Vec::new();

        for entry in &batch.entries {
            match self.store.apply_replicated(entry) {
                Ok(ApplyOutcome::Applied { version }) => {
                    applied_count += 1;
                    self.event_bus.publish_domain(RecordEvent::RemoteUpdate {
                        partition: entry.partition.clone(),
                        key: entry.key.clone(),
                        version,
                        origin: entry.origin.clone(),
                        applied_at: Utc::now(),
                    });
                }
                Ok(ApplyOutcome::Stale { .. }) => rejected_keys.push(entry.address()),
                Ok(ApplyOutcome::Expired) => {}
                Err(e) => {
                    warn!(
                        from = %batch.peer_id,
                        entry = %entry.address(),
                        error = %e,
                        "Failed to apply replicated entry"
                    );
                    rejected_keys.push(entry.address());
                }
            }
        }

        debug!(
            from = %batch.peer_id,
            batch_sequence = batch.batch_sequence,
            applied_count,
            rejected = rejected_keys.len(),
            "Sync batch applied"
        );
        metrics::counter!("fleet_sync_entries_received_total").increment(batch.entries.len() as u64);

        SyncAck {
            batch_sequence: batch.batch_sequence,
            applied_count,
            rejected_keys,
        }
    }
}
