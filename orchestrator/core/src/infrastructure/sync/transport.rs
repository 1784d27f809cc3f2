// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use super::wire::{SyncAck, SyncBatch, WireError, PROTOCOL_VERSION};
use crate::domain::peer::{PeerId, PeerInfo, TransportKind};
use crate::domain::record::StoreError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {peer} failed: {reason}")]
    Connection { peer: PeerId, reason: String },

    #[error("{transport} handshake with {peer} timed out")]
    HandshakeTimeout { peer: PeerId, transport: TransportKind },

    #[error("request to {peer} timed out after {timeout:?}")]
    RequestTimeout { peer: PeerId, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer {peer} is unreachable: {reason}")]
    Fatal { peer: PeerId, reason: String },

    #[error("peer limit of {max_peers} reached")]
    CapacityExceeded { max_peers: usize },

    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors worth another attempt within the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. }
                | TransportError::HandshakeTimeout { .. }
                | TransportError::RequestTimeout { .. }
                | TransportError::Io(_)
        )
    }

    /// Errors after which the link can still carry the next request.
    pub fn keeps_link(&self) -> bool {
        matches!(self, TransportError::RequestTimeout { .. } | TransportError::Store(_))
    }

    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, TransportError::Wire(WireError::TooLarge { .. }))
    }
}

/// Greeting sent by the connecting side.
#[derive(Debug, Clone)]
pub struct Hello {
    pub node_id: String,
    pub protocol_version: u16,
}

impl Hello {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// A way of reaching a peer's sync listener.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open a link and complete the handshake within `handshake_timeout`.
    async fn connect(
        &self,
        peer: &PeerInfo,
        hello: &Hello,
        handshake_timeout: Duration,
    ) -> Result<Box<dyn PeerLink>, TransportError>;
}

/// An established, handshaken connection to one peer.
///
/// Requests on a link are strictly sequential.
#[async_trait]
pub trait PeerLink: Send {
    fn kind(&self) -> TransportKind;

    fn remote_node_id(&self) -> &str;

    /// Largest encoded batch this link can carry.
    fn max_payload_bytes(&self) -> usize;

    async fn send_batch(
        &mut self,
        batch: SyncBatch,
        timeout: Duration,
    ) -> Result<SyncAck, TransportError>;

    async fn close(&mut self);
}

pub(crate) async fn resolve(peer: &PeerInfo, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((peer.address.as_str(), port))
        .await
        .map_err(|e| TransportError::Connection {
            peer: peer.id.clone(),
            reason: format!("cannot resolve {}: {}", peer.address, e),
        })?;
    addrs.next().ok_or_else(|| TransportError::Connection {
        peer: peer.id.clone(),
        reason: format!("no address for {}", peer.address),
    })
}

pub(crate) fn check_hello_ack(
    peer: &PeerInfo,
    node_id: String,
    protocol_version: u16,
) -> Result<String, TransportError> {
    if protocol_version != PROTOCOL_VERSION {
        return Err(TransportError::Protocol(format!(
            "peer {} speaks protocol {}, expected {}",
            peer.id, protocol_version, PROTOCOL_VERSION
        )));
    }
    Ok(node_id)
}
