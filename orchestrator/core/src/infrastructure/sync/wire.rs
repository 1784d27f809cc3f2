// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Peer wire protocol.
//!
//! Both transports carry the same [`Envelope`], encoded with bincode under a
//! hard size limit. On the datagram transport one envelope is one datagram;
//! on the stream transport one envelope is one length-delimited frame.
//!
//! ```text
//! client                          listener
//!   | Hello { node_id, version }    |
//!   |------------------------------>|
//!   | HelloAck { node_id, version } |
//!   |<------------------------------|
//!   | Sync(SyncBatch)               |
//!   |------------------------------>|  apply_replicated per entry
//!   | Ack(SyncAck)                  |
//!   |<------------------------------|
//! ```

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::record::ReplicatedEntry;

pub const PROTOCOL_VERSION: u16 = 1;

/// Largest stream frame either side will accept.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Largest encoded envelope sent as a single UDP datagram.
pub const MAX_DATAGRAM_BYTES: usize = 60 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Node id of the sender.
    pub peer_id: String,
    pub batch_sequence: u64,
    pub entries: Vec<ReplicatedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub batch_sequence: u64,
    pub applied_count: usize,
    /// `partition/key` of entries the receiver already held a newer version of.
    pub rejected_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Hello { node_id: String, protocol_version: u16 },
    HelloAck { node_id: String, protocol_version: u16 },
    Sync(SyncBatch),
    Ack(SyncAck),
    Error { message: String },
}

/// Request/response correlation wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: u64,
    pub message: WireMessage,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("message too large: max {max_bytes} got {got_bytes}")]
    TooLarge { max_bytes: usize, got_bytes: usize },
}

fn options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit as u64)
}

pub fn encode(envelope: &Envelope, limit: usize) -> Result<Vec<u8>, WireError> {
    let size = bincode::DefaultOptions::new()
        .serialized_size(envelope)
        .map_err(|e| WireError::Encode(e.to_string()))?;
    if size as usize > limit {
        return Err(WireError::TooLarge {
            max_bytes: limit,
            got_bytes: size as usize,
        });
    }
    options(limit)
        .serialize(envelope)
        .map_err(|e| WireError::Encode(e.to_string()))
}

pub fn decode(bytes: &[u8], limit: usize) -> Result<Envelope, WireError> {
    if bytes.len() > limit {
        return Err(WireError::TooLarge {
            max_bytes: limit,
            got_bytes: bytes.len(),
        });
    }
    options(limit)
        .deserialize(bytes)
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Encoded size of one entry, used to pack batches under a payload budget.
pub fn entry_size(entry: &ReplicatedEntry) -> usize {
    bincode::DefaultOptions::new()
        .serialized_size(entry)
        .map_or(usize::MAX, |size| size as usize)
}

/// Fixed cost of an empty batch envelope, with room for varint growth.
pub const BATCH_OVERHEAD_BYTES: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value_len: usize) -> ReplicatedEntry {
        ReplicatedEntry {
            partition: "coordination".to_string(),
            key: key.to_string(),
            value: vec![7; value_len],
            version: 3,
            expires_at_ms: Some(1_700_000_000_000),
            origin: "node-a".to_string(),
        }
    }

    #[test]
    fn test_sync_envelope_decodes() {
        let envelope = Envelope {
            request_id: 42,
            message: WireMessage::Sync(SyncBatch {
                peer_id: "node-a".to_string(),
                batch_sequence: 9,
                entries: vec![entry("k", 16)],
            }),
        };
        let bytes = encode(&envelope, MAX_DATAGRAM_BYTES).unwrap();
        assert_eq!(decode(&bytes, MAX_DATAGRAM_BYTES).unwrap(), envelope);
    }

    #[test]
    fn test_limit_is_enforced_both_ways() {
        let envelope = Envelope {
            request_id: 1,
            message: WireMessage::Sync(SyncBatch {
                peer_id: "node-a".to_string(),
                batch_sequence: 1,
                entries: vec![entry("big", 4096)],
            }),
        };
        assert!(matches!(
            encode(&envelope, 1024),
            Err(WireError::TooLarge { max_bytes: 1024, .. })
        ));

        let bytes = encode(&envelope, MAX_FRAME_BYTES).unwrap();
        assert!(decode(&bytes, 1024).is_err());
        assert!(decode(&bytes[..bytes.len() / 2], MAX_FRAME_BYTES).is_err());
    }

    #[test]
    fn test_entry_size_tracks_payload() {
        let small = entry_size(&entry("k", 10));
        let large = entry_size(&entry("k", 1010));
        assert!(large >= small + 1000);
        assert!(small < BATCH_OVERHEAD_BYTES);
    }
}
