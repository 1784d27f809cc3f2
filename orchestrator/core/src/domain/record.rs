// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Record Domain Types
//!
//! A [`Record`] is the atomic unit of shared fleet state. Records live in a
//! named partition and are addressed by `(partition, key)`. Values are opaque
//! bytes; callers own the encoding (see [`crate::domain::typed_records`]).
//!
//! ## Conflict Resolution
//!
//! Every accepted write carries a per-key `version` and the `origin` node id
//! that produced it. A write replaces the stored record only if
//! `(version, origin)` is strictly greater, so replaying the same set of
//! writes in any order converges on the same value.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::agent::AgentId;

/// Well-known partition names.
pub mod partitions {
    pub const COORDINATION: &str = "coordination";
    pub const EVENTS: &str = "events";
    pub const PATTERNS: &str = "patterns";
    pub const METRICS: &str = "metrics";
}

const MAX_PARTITION_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessScope {
    /// Visible only to the owning agent instance; never replicated.
    Private,
    /// Visible fleet-wide and eligible for replication.
    Public,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: String,
    pub key: String,
    pub value: Vec<u8>,
    pub access_scope: AccessScope,
    pub owner: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub origin: String,
    /// Store-wide write sequence; the replication cursor.
    pub sequence: u64,
}

impl Record {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_visible_to(&self, agent_id: AgentId) -> bool {
        match self.access_scope {
            AccessScope::Public => true,
            AccessScope::Private => self.owner == Some(agent_id),
        }
    }

    pub fn to_replicated(&self) -> ReplicatedEntry {
        ReplicatedEntry {
            partition: self.partition.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            expires_at_ms: self.expires_at.map(|at| at.timestamp_millis()),
            origin: self.origin.clone(),
        }
    }
}

/// Returns true when `(version, origin)` beats the currently stored pair.
pub fn supersedes(version: u64, origin: &str, current_version: u64, current_origin: &str) -> bool {
    (version, origin) > (current_version, current_origin)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutOptions {
    /// Falls back to the partition's default TTL when `None`.
    pub ttl: Option<Duration>,
    pub access_scope: AccessScope,
    pub owner: Option<AgentId>,
}

impl PutOptions {
    pub fn public() -> Self {
        Self {
            ttl: None,
            access_scope: AccessScope::Public,
            owner: None,
        }
    }

    pub fn private(owner: AgentId) -> Self {
        Self {
            ttl: None,
            access_scope: AccessScope::Private,
            owner: Some(owner),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl Default for PutOptions {
    fn default() -> Self {
        Self::public()
    }
}

/// A record version as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    pub partition: String,
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
    /// Absolute expiry as unix milliseconds.
    pub expires_at_ms: Option<i64>,
    pub origin: String,
}

impl ReplicatedEntry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// `partition/key`, the form used in sync acknowledgements.
    pub fn address(&self) -> String {
        format!("{}/{}", self.partition, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { version: u64 },
    /// The local record is as new or newer.
    Stale { current_version: u64 },
    /// The entry had already expired on arrival.
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub entries_per_partition: BTreeMap<String, usize>,
    pub total_entries: usize,
    pub estimated_size_bytes: u64,
    pub write_failures: u64,
}

/// Store errors. An absent or expired key is not an error; reads return `None`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("write rejected for {partition}/{key}: {reason}")]
    WriteRejected {
        partition: String,
        key: String,
        reason: String,
    },

    #[error("invalid partition name '{0}'")]
    InvalidPartition(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid key pattern: {0}")]
    InvalidPattern(String),

    #[error("corrupt record {partition}/{key}: {reason}")]
    Corrupt {
        partition: String,
        key: String,
        reason: String,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub fn validate_partition(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid_head || !valid_tail || name.len() > MAX_PARTITION_LEN {
        return Err(StoreError::InvalidPartition(name.to_string()));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_names() {
        assert!(validate_partition(partitions::COORDINATION).is_ok());
        assert!(validate_partition("agent-state_v2.1").is_ok());
        assert!(validate_partition("").is_err());
        assert!(validate_partition("__sled__default").is_err());
        assert!(validate_partition("has space").is_err());
        assert!(validate_partition(&"p".repeat(129)).is_err());
    }

    #[test]
    fn test_supersedes_breaks_ties_by_origin() {
        assert!(supersedes(5, "a", 3, "z"));
        assert!(!supersedes(3, "z", 5, "a"));
        assert!(supersedes(4, "node-b", 4, "node-a"));
        assert!(!supersedes(4, "node-a", 4, "node-b"));
        assert!(!supersedes(4, "node-a", 4, "node-a"));
    }

    #[test]
    fn test_private_visibility() {
        let owner = AgentId::new();
        let record = Record {
            partition: partitions::COORDINATION.to_string(),
            key: "k".to_string(),
            value: vec![],
            access_scope: AccessScope::Private,
            owner: Some(owner),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
            version: 1,
            origin: "node".to_string(),
            sequence: 1,
        };
        assert!(record.is_visible_to(owner));
        assert!(!record.is_visible_to(AgentId::new()));
    }
}
