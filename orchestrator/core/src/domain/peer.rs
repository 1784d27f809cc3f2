// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Peer identity and connection state for the sync transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Peer identifier, always `address:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(address: &str, port: u16) -> Self {
        Self(format!("{}:{}", address, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Discovered,
    Connecting,
    Connected,
    Syncing,
    Disconnected,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Discovered => "discovered",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Syncing => "syncing",
            PeerStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Datagram,
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Datagram => f.write_str("datagram"),
            TransportKind::Stream => f.write_str("stream"),
        }
    }
}

/// Snapshot of a remote fleet member as tracked by the sync transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: String,
    /// Datagram port; the peer id is built from it.
    pub port: u16,
    pub stream_port: u16,
    pub status: PeerStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Highest local write sequence confirmed by the peer.
    pub last_sync_sequence: u64,
    pub retry_count: u32,
    pub transport: Option<TransportKind>,
    pub remote_node_id: Option<String>,
    pub last_error: Option<String>,
}

impl PeerInfo {
    /// The stream port defaults to the datagram port plus one.
    pub fn discovered(address: &str, port: u16) -> Self {
        Self {
            id: PeerId::new(address, port),
            address: address.to_string(),
            port,
            stream_port: port.saturating_add(1),
            status: PeerStatus::Discovered,
            last_sync_at: None,
            last_sync_sequence: 0,
            retry_count: 0,
            transport: None,
            remote_node_id: None,
            last_error: None,
        }
    }

    pub fn with_stream_port(mut self, stream_port: u16) -> Self {
        self.stream_port = stream_port;
        self
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status, PeerStatus::Connected | PeerStatus::Syncing)
    }
}
