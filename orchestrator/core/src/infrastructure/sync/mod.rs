// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Peer Sync
//!
//! Replication of public records between fleet nodes.
//!
//! | Module            | Role                                                   |
//! |-------------------|--------------------------------------------------------|
//! | `wire`            | envelope and batch encoding shared by both transports  |
//! | `transport`       | `Transport` / `PeerLink` traits and `TransportError`   |
//! | `datagram`        | UDP transport (preferred by default)                   |
//! | `stream`          | TCP transport with length-delimited frames (fallback)  |
//! | `listener`        | inbound side: handshakes and batch application         |
//! | `sync_transport`  | outbound side: peer table, connect, batched push       |
//! | `sync_metrics`    | counters and moving averages for health reporting      |

pub mod datagram;
pub mod listener;
pub mod stream;
pub mod sync_metrics;
pub mod sync_transport;
pub mod transport;
pub mod wire;

pub use datagram::DatagramTransport;
pub use listener::SyncListener;
pub use stream::StreamTransport;
pub use sync_metrics::SyncMetrics;
pub use sync_transport::{SyncReport, SyncTransport};
pub use transport::{Hello, PeerLink, Transport, TransportError};
