// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Record Store
//!
//! Persistent, partitioned key-value store backing all shared fleet state.
//!
//! ## Layout
//!
//! | sled tree            | key                    | value                         |
//! |----------------------|------------------------|-------------------------------|
//! | `<partition>`        | record key (UTF-8)     | bincode [`StoredRecord`]      |
//! | `~sequence-index`    | sequence (u64, BE)     | bincode `(partition, key)`    |
//! | `~version-floor`     | bincode `(partition, key)` | bincode `(version, origin)` |
//!
//! Every accepted write (local or replicated) takes a fresh store-wide
//! sequence from `Db::generate_id`, and the record and its index entry are
//! committed in one multi-tree transaction. The sync transport reads the
//! index through [`RecordStore::changes_since`].
//!
//! Removing a record (delete, expiry, sweep or purge) leaves its last
//! `(version, origin)` in `~version-floor`. A later local write continues
//! from `floor + 1` and a replicated entry that does not beat the floor is
//! stale, so peers that still hold the old version accept the rewrite.
//!
//! ## Concurrency
//!
//! Writers to the same `(partition, key)` serialize on one of
//! [`LOCK_STRIPES`] mutexes; writers to different keys proceed in parallel.
//! Readers never lock. Writers hold the commit gate shared while they take
//! a sequence and commit it. `changes_since` takes the gate exclusively only
//! to read the committed high-water sequence, then scans the index up to
//! that mark without blocking writers, so it never observes a later
//! sequence before an earlier one has committed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::node_config::StoreSettings;
use crate::domain::pattern::KeyPattern;
use crate::domain::record::{
    supersedes, validate_key, validate_partition, AccessScope, ApplyOutcome, PutOptions, Record,
    ReplicatedEntry, StoreError, StoreStats,
};
use crate::domain::typed_records::TypedRecord;

pub const LOCK_STRIPES: usize = 64;

const SEQUENCE_INDEX_TREE: &str = "~sequence-index";
const VERSION_FLOOR_TREE: &str = "~version-floor";

/// Last `(version, origin)` of a removed record.
type VersionFloor = (u64, String);

/// On-disk envelope. Partition and key live in the tree name and sled key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    value: Vec<u8>,
    access_scope: AccessScope,
    owner: Option<AgentId>,
    created_at_ms: i64,
    updated_at_ms: i64,
    expires_at_ms: Option<i64>,
    version: u64,
    origin: String,
    sequence: u64,
}

impl StoredRecord {
    fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn into_record(self, partition: &str, key: &str) -> Record {
        Record {
            partition: partition.to_string(),
            key: key.to_string(),
            value: self.value,
            access_scope: self.access_scope,
            owner: self.owner,
            created_at: from_millis(self.created_at_ms),
            updated_at: from_millis(self.updated_at_ms),
            expires_at: self.expires_at_ms.map(from_millis),
            version: self.version,
            origin: self.origin,
            sequence: self.sequence,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn decode_stored(partition: &str, key: &str, bytes: &[u8]) -> Result<StoredRecord, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Corrupt {
        partition: partition.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_sequence(raw: &[u8]) -> Result<u64, StoreError> {
    raw.try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StoreError::Backend("malformed sequence index key".to_string()))
}

fn encode_address(partition: &str, key: &str) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(&(partition, key))
        .map_err(|e| StoreError::Backend(format!("cannot encode record address: {}", e)))
}

fn encode_floor(stored: &StoredRecord) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(&(stored.version, &stored.origin))
        .map_err(|e| StoreError::Backend(format!("cannot encode version floor: {}", e)))
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<TransactionError<()>> for StoreError {
    fn from(err: TransactionError<()>) -> Self {
        match err {
            TransactionError::Storage(e) => e.into(),
            TransactionError::Abort(()) => StoreError::Backend("transaction aborted".to_string()),
        }
    }
}

pub struct RecordStore {
    db: sled::Db,
    node_id: String,
    trees: DashMap<String, sled::Tree>,
    sequence_index: sled::Tree,
    version_floors: sled::Tree,
    stripes: Vec<Mutex<()>>,
    commit_gate: RwLock<()>,
    /// Highest sequence handed to a commit.
    high_water: AtomicU64,
    settings: StoreSettings,
    write_failures: AtomicU64,
}

impl RecordStore {
    /// Open (or create) the store described by `settings`.
    pub fn open(settings: &StoreSettings, node_id: impl Into<String>) -> Result<Self, StoreError> {
        for partition in settings.partition_ttls.keys() {
            validate_partition(partition)?;
        }

        let config = if settings.temporary {
            sled::Config::new().temporary(true)
        } else {
            sled::Config::new().path(&settings.path)
        };
        let db = config.open()?;
        let sequence_index = db.open_tree(SEQUENCE_INDEX_TREE)?;
        let version_floors = db.open_tree(VERSION_FLOOR_TREE)?;
        let high_water = match sequence_index.last()? {
            Some((raw_sequence, _)) => decode_sequence(&raw_sequence)?,
            None => 0,
        };
        let node_id = node_id.into();

        info!(
            node_id = %node_id,
            path = ?settings.path,
            temporary = settings.temporary,
            recovered = db.was_recovered(),
            "Record store opened"
        );

        Ok(Self {
            db,
            node_id,
            trees: DashMap::new(),
            sequence_index,
            version_floors,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            commit_gate: RwLock::new(()),
            high_water: AtomicU64::new(high_water),
            settings: settings.clone(),
            write_failures: AtomicU64::new(0),
        })
    }

    /// Throwaway store, removed when dropped.
    pub fn temporary(node_id: impl Into<String>) -> Result<Self, StoreError> {
        Self::open(&StoreSettings::temporary(), node_id)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write `value` under `(partition, key)` and return the new version.
    pub fn put(
        &self,
        partition: &str,
        key: &str,
        value: Vec<u8>,
        opts: PutOptions,
    ) -> Result<u64, StoreError> {
        validate_partition(partition)?;
        validate_key(key)?;
        if value.len() > self.settings.max_value_bytes {
            return Err(self.reject(
                partition,
                key,
                format!(
                    "value is {} bytes, limit is {}",
                    value.len(),
                    self.settings.max_value_bytes
                ),
            ));
        }
        if opts.access_scope == AccessScope::Private && opts.owner.is_none() {
            return Err(self.reject(partition, key, "private record without owner".to_string()));
        }

        let tree = self.tree(partition)?;
        let ttl = opts.ttl.or_else(|| self.settings.partition_ttl(partition));

        let _stripe = self.stripe(partition, key).lock();
        let _gate = self.commit_gate.read();

        let now_ms = Utc::now().timestamp_millis();
        let current = self.read_stored(&tree, partition, key)?;

        let (version, created_at_ms, previous_sequence) = match &current {
            Some(existing) if !existing.is_expired_at(now_ms) => (
                existing.version + 1,
                existing.created_at_ms,
                Some(existing.sequence),
            ),
            // An expired record is replaced, but its version keeps counting up.
            Some(existing) => (existing.version + 1, now_ms, Some(existing.sequence)),
            None => {
                let floor = self.read_floor(partition, key)?;
                (floor.map_or(1, |(version, _)| version + 1), now_ms, None)
            }
        };

        let stored = StoredRecord {
            value,
            access_scope: opts.access_scope,
            owner: opts.owner,
            created_at_ms,
            updated_at_ms: now_ms,
            expires_at_ms: ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as i64)),
            version,
            origin: self.node_id.clone(),
            sequence: 0,
        };

        self.commit(&tree, partition, key, previous_sequence, stored)?;
        metrics::counter!("fleet_store_writes_total", "partition" => partition.to_string())
            .increment(1);
        debug!(partition, key, version, "Record written");
        Ok(version)
    }

    pub fn put_typed<T: TypedRecord>(&self, record: &T, opts: PutOptions) -> Result<u64, StoreError> {
        self.put(T::PARTITION, &record.key(), record.encode()?, opts)
    }

    /// Live record at `(partition, key)`; expired records read as absent.
    pub fn get(&self, partition: &str, key: &str) -> Result<Option<Record>, StoreError> {
        validate_partition(partition)?;
        validate_key(key)?;
        let Some(tree) = self.existing_tree(partition)? else {
            return Ok(None);
        };

        let Some(stored) = self.read_stored(&tree, partition, key)? else {
            return Ok(None);
        };
        if stored.is_expired_at(Utc::now().timestamp_millis()) {
            self.remove_if_expired(&tree, partition, key)?;
            return Ok(None);
        }
        Ok(Some(stored.into_record(partition, key)))
    }

    pub fn get_typed<T: TypedRecord>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(T::PARTITION, key)? {
            Some(record) => Ok(Some(T::decode(key, &record.value)?)),
            None => Ok(None),
        }
    }

    /// Lazy scan ordered by key. An empty pattern selects every key, a
    /// pattern containing `*` or `?` is a glob, anything else is a prefix.
    pub fn query(&self, partition: &str, pattern: &str) -> Result<RecordIter, StoreError> {
        let pattern =
            KeyPattern::parse(pattern).map_err(|e| StoreError::InvalidPattern(e.to_string()))?;
        self.query_pattern(partition, pattern)
    }

    pub fn query_pattern(
        &self,
        partition: &str,
        pattern: KeyPattern,
    ) -> Result<RecordIter, StoreError> {
        self.scan(partition, pattern, None)
    }

    /// Remove the record; returns whether one existed.
    pub fn delete(&self, partition: &str, key: &str) -> Result<bool, StoreError> {
        validate_partition(partition)?;
        validate_key(key)?;
        let Some(tree) = self.existing_tree(partition)? else {
            return Ok(false);
        };

        let _stripe = self.stripe(partition, key).lock();
        let _gate = self.commit_gate.read();
        let Some(current) = self.read_stored(&tree, partition, key)? else {
            return Ok(false);
        };
        self.remove_committed(&tree, partition, key, &current)?;
        debug!(partition, key, "Record deleted");
        Ok(true)
    }

    /// Reclaim every expired record. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut removed = 0;

        for partition in self.partition_names()? {
            let tree = self.tree(&partition)?;
            let mut expired = Vec::new();
            for entry in tree.iter() {
                let (raw_key, raw_value) = entry?;
                let key = String::from_utf8_lossy(&raw_key).into_owned();
                match decode_stored(&partition, &key, &raw_value) {
                    Ok(stored) if stored.is_expired_at(now_ms) => expired.push(key),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Skipping undecodable record during sweep"),
                }
            }
            for key in expired {
                if self.remove_if_expired(&tree, &partition, &key)? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            metrics::counter!("fleet_store_expired_total").increment(removed as u64);
            debug!(removed, "Expired records swept");
        }
        Ok(removed)
    }

    /// Remove every record in `partition`. Returns the number removed.
    pub fn purge_partition(&self, partition: &str) -> Result<usize, StoreError> {
        validate_partition(partition)?;
        let Some(tree) = self.existing_tree(partition)? else {
            return Ok(0);
        };

        let _stripes: Vec<_> = self.stripes.iter().map(|stripe| stripe.lock()).collect();
        let _gate = self.commit_gate.read();

        let mut removed = 0;
        for entry in tree.iter() {
            let (raw_key, raw_value) = entry?;
            let key = String::from_utf8_lossy(&raw_key);
            if let Ok(stored) = decode_stored(partition, &key, &raw_value) {
                let floor = encode_floor(&stored)?;
                self.version_floors
                    .insert(encode_address(partition, &key)?, floor)?;
                self.sequence_index.remove(stored.sequence.to_be_bytes())?;
            }
            removed += 1;
        }
        tree.clear()?;

        info!(partition, removed, "Partition purged");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stats = StoreStats {
            estimated_size_bytes: self.db.size_on_disk()?,
            write_failures: self.write_failures(),
            ..StoreStats::default()
        };

        for partition in self.partition_names()? {
            let tree = self.tree(&partition)?;
            let mut live = 0;
            for entry in tree.iter() {
                let (raw_key, raw_value) = entry?;
                let key = String::from_utf8_lossy(&raw_key);
                if decode_stored(&partition, &key, &raw_value)
                    .is_ok_and(|stored| !stored.is_expired_at(now_ms))
                {
                    live += 1;
                }
            }
            stats.total_entries += live;
            stats.entries_per_partition.insert(partition, live);
        }
        Ok(stats)
    }

    /// Live public records written after `cursor`, in sequence order.
    pub fn changes_since(&self, cursor: u64) -> Result<Vec<Record>, StoreError> {
        // Every sequence at or below the mark has committed or failed.
        let watermark = {
            let _gate = self.commit_gate.write();
            self.high_water.load(Ordering::Acquire)
        };
        if cursor >= watermark {
            return Ok(Vec::new());
        }

        let start = cursor.saturating_add(1).to_be_bytes();
        let end = watermark.to_be_bytes();
        let mut pending: Vec<(u64, String, String)> = Vec::new();
        for entry in self.sequence_index.range(start..=end) {
            let (raw_sequence, raw_address) = entry?;
            let sequence = decode_sequence(&raw_sequence)?;
            let (partition, key): (String, String) = bincode::deserialize(&raw_address)
                .map_err(|e| StoreError::Backend(format!("malformed sequence index: {}", e)))?;
            pending.push((sequence, partition, key));
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut records = Vec::with_capacity(pending.len());
        for (sequence, partition, key) in pending {
            let tree = self.tree(&partition)?;
            let Some(stored) = self.read_stored(&tree, &partition, &key)? else {
                continue;
            };
            // Rewritten since the scan; it shows up again under its new sequence.
            if stored.sequence != sequence {
                continue;
            }
            if stored.access_scope == AccessScope::Public && !stored.is_expired_at(now_ms) {
                records.push(stored.into_record(&partition, &key));
            }
        }
        Ok(records)
    }

    /// Merge a record version received from a peer.
    ///
    /// The entry is written only when its `(version, origin)` is strictly
    /// greater than the stored pair (or the version floor of a removed
    /// record), so applying the same entry twice is a no-op the second time.
    pub fn apply_replicated(&self, entry: &ReplicatedEntry) -> Result<ApplyOutcome, StoreError> {
        validate_partition(&entry.partition)?;
        validate_key(&entry.key)?;

        let now_ms = Utc::now().timestamp_millis();
        if entry.expires_at_ms.is_some_and(|at| at <= now_ms) {
            return Ok(ApplyOutcome::Expired);
        }
        if entry.value.len() > self.settings.max_value_bytes {
            return Err(self.reject(
                &entry.partition,
                &entry.key,
                format!("replicated value is {} bytes", entry.value.len()),
            ));
        }

        let tree = self.tree(&entry.partition)?;
        let _stripe = self.stripe(&entry.partition, &entry.key).lock();
        let _gate = self.commit_gate.read();

        let current = self.read_stored(&tree, &entry.partition, &entry.key)?;
        let (current_version, current_origin) = match &current {
            Some(existing) => (existing.version, existing.origin.clone()),
            None => self
                .read_floor(&entry.partition, &entry.key)?
                .unwrap_or((0, String::new())),
        };
        if current_version > 0
            && !supersedes(entry.version, &entry.origin, current_version, &current_origin)
        {
            return Ok(ApplyOutcome::Stale { current_version });
        }

        let stored = StoredRecord {
            value: entry.value.clone(),
            access_scope: AccessScope::Public,
            owner: None,
            created_at_ms: current
                .as_ref()
                .filter(|existing| !existing.is_expired_at(now_ms))
                .map_or(now_ms, |existing| existing.created_at_ms),
            updated_at_ms: now_ms,
            expires_at_ms: entry.expires_at_ms,
            version: entry.version,
            origin: entry.origin.clone(),
            sequence: 0,
        };
        let previous_sequence = current.map(|existing| existing.sequence);
        self.commit(&tree, &entry.partition, &entry.key, previous_sequence, stored)?;

        metrics::counter!("fleet_store_replicated_total", "partition" => entry.partition.clone())
            .increment(1);
        Ok(ApplyOutcome::Applied {
            version: entry.version,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub async fn flush_async(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Per-agent view that hides other agents' private records.
    pub fn agent_view(self: &Arc<Self>, agent_id: AgentId) -> AgentStoreView {
        AgentStoreView {
            store: Arc::clone(self),
            agent_id,
        }
    }

    fn scan(
        &self,
        partition: &str,
        pattern: KeyPattern,
        viewer: Option<AgentId>,
    ) -> Result<RecordIter, StoreError> {
        validate_partition(partition)?;
        let inner = self
            .existing_tree(partition)?
            .map(|tree| tree.scan_prefix(pattern.scan_prefix().as_bytes()));
        Ok(RecordIter {
            partition: partition.to_string(),
            inner,
            pattern,
            viewer,
            now_ms: Utc::now().timestamp_millis(),
        })
    }

    /// Caller holds the key's stripe lock and the commit gate.
    fn commit(
        &self,
        tree: &sled::Tree,
        partition: &str,
        key: &str,
        previous_sequence: Option<u64>,
        mut stored: StoredRecord,
    ) -> Result<(), StoreError> {
        stored.sequence = self.db.generate_id()?;
        let encoded = bincode::serialize(&stored).map_err(|e| {
            self.reject(partition, key, format!("encoding failed: {}", e))
        })?;
        let address = bincode::serialize(&(partition, key)).map_err(|e| {
            self.reject(partition, key, format!("encoding failed: {}", e))
        })?;
        let sequence = stored.sequence.to_be_bytes();
        self.high_water.fetch_max(stored.sequence, Ordering::AcqRel);

        (tree, &self.sequence_index, &self.version_floors)
            .transaction(|(records, index, floors)| {
                if let Some(previous) = previous_sequence {
                    index.remove(&previous.to_be_bytes()[..])?;
                }
                index.insert(&sequence[..], address.as_slice())?;
                records.insert(key.as_bytes(), encoded.as_slice())?;
                floors.remove(address.as_slice())?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| {
                self.reject(partition, key, StoreError::from(e).to_string())
            })
    }

    /// Caller holds the key's stripe lock and the commit gate.
    fn remove_committed(
        &self,
        tree: &sled::Tree,
        partition: &str,
        key: &str,
        current: &StoredRecord,
    ) -> Result<(), StoreError> {
        let address = encode_address(partition, key)?;
        let floor = encode_floor(current)?;
        let sequence = current.sequence.to_be_bytes();
        (tree, &self.sequence_index, &self.version_floors).transaction(
            |(records, index, floors)| {
                index.remove(&sequence[..])?;
                records.remove(key.as_bytes())?;
                floors.insert(address.as_slice(), floor.as_slice())?;
                Ok::<_, ConflictableTransactionError<()>>(())
            },
        )?;
        Ok(())
    }

    fn read_floor(&self, partition: &str, key: &str) -> Result<Option<VersionFloor>, StoreError> {
        let Some(bytes) = self.version_floors.get(encode_address(partition, key)?)? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes).map(Some).map_err(|e| StoreError::Corrupt {
            partition: partition.to_string(),
            key: key.to_string(),
            reason: format!("malformed version floor: {}", e),
        })
    }

    /// Re-checks expiry under the stripe lock so a concurrent rewrite wins.
    fn remove_if_expired(&self, tree: &sled::Tree, partition: &str, key: &str) -> Result<bool, StoreError> {
        let _stripe = self.stripe(partition, key).lock();
        let _gate = self.commit_gate.read();
        match self.read_stored(tree, partition, key)? {
            Some(stored) if stored.is_expired_at(Utc::now().timestamp_millis()) => {
                self.remove_committed(tree, partition, key, &stored)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read_stored(
        &self,
        tree: &sled::Tree,
        partition: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode_stored(partition, key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn reject(&self, partition: &str, key: &str, reason: String) -> StoreError {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fleet_store_write_failures_total").increment(1);
        warn!(partition, key, reason = %reason, "Record write rejected");
        StoreError::WriteRejected {
            partition: partition.to_string(),
            key: key.to_string(),
            reason,
        }
    }

    fn stripe(&self, partition: &str, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        partition.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    fn tree(&self, partition: &str) -> Result<sled::Tree, StoreError> {
        if let Some(tree) = self.trees.get(partition) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(partition)?;
        self.trees.insert(partition.to_string(), tree.clone());
        Ok(tree)
    }

    /// Like `tree`, without creating the partition as a side effect.
    fn existing_tree(&self, partition: &str) -> Result<Option<sled::Tree>, StoreError> {
        if let Some(tree) = self.trees.get(partition) {
            return Ok(Some(tree.clone()));
        }
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == partition.as_bytes());
        if exists {
            Ok(Some(self.tree(partition)?))
        } else {
            Ok(None)
        }
    }

    fn partition_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|name| String::from_utf8(name.to_vec()).ok())
            .filter(|name| validate_partition(name).is_ok())
            .collect())
    }
}

/// Lazy, finite, key-ordered scan over one partition.
///
/// Holds a sled iterator, so it observes a consistent view per key but
/// may or may not see writes made after it was created.
pub struct RecordIter {
    partition: String,
    inner: Option<sled::Iter>,
    pattern: KeyPattern,
    viewer: Option<AgentId>,
    now_ms: i64,
}

impl Iterator for RecordIter {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        loop {
            let (raw_key, raw_value) = match inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let key = String::from_utf8_lossy(&raw_key);
            if !self.pattern.matches(&key) {
                continue;
            }
            let stored = match decode_stored(&self.partition, &key, &raw_value) {
                Ok(stored) => stored,
                Err(e) => return Some(Err(e)),
            };
            if stored.is_expired_at(self.now_ms) {
                continue;
            }
            let record = stored.into_record(&self.partition, &key);
            if let Some(viewer) = self.viewer {
                if !record.is_visible_to(viewer) {
                    continue;
                }
            }
            return Some(Ok(record));
        }
    }
}

/// Store access as seen by a single agent instance.
#[derive(Clone)]
pub struct AgentStoreView {
    store: Arc<RecordStore>,
    agent_id: AgentId,
}

impl AgentStoreView {
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn get(&self, partition: &str, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self
            .store
            .get(partition, key)?
            .filter(|record| record.is_visible_to(self.agent_id)))
    }

    pub fn query(&self, partition: &str, pattern: &str) -> Result<RecordIter, StoreError> {
        let pattern =
            KeyPattern::parse(pattern).map_err(|e| StoreError::InvalidPattern(e.to_string()))?;
        self.store.scan(partition, pattern, Some(self.agent_id))
    }

    pub fn put(
        &self,
        partition: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let opts = PutOptions {
            ttl,
            ..PutOptions::public()
        };
        self.store.put(partition, key, value, opts)
    }

    pub fn put_private(
        &self,
        partition: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let opts = PutOptions {
            ttl,
            ..PutOptions::private(self.agent_id)
        };
        self.store.put(partition, key, value, opts)
    }

    /// Deletes only records this agent can see.
    pub fn delete(&self, partition: &str, key: &str) -> Result<bool, StoreError> {
        if self.get(partition, key)?.is_none() {
            return Ok(false);
        }
        self.store.delete(partition, key)
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::partitions;

    fn store() -> RecordStore {
        RecordStore::temporary("node-a").unwrap()
    }

    fn keys(iter: RecordIter) -> Vec<String> {
        iter.map(|r| r.unwrap().key).collect()
    }

    #[test]
    fn test_put_bumps_version() {
        let store = store();
        let v1 = store.put("coordination", "k", b"one".to_vec(), PutOptions::public()).unwrap();
        let v2 = store.put("coordination", "k", b"two".to_vec(), PutOptions::public()).unwrap();
        assert_eq!((v1, v2), (1, 2));

        let record = store.get("coordination", "k").unwrap().unwrap();
        assert_eq!(record.value, b"two");
        assert_eq!(record.version, 2);
        assert_eq!(record.origin, "node-a");
        assert!(record.sequence > 0);
    }

    #[test]
    fn test_oversized_write_is_rejected_and_prior_value_kept() {
        let settings = StoreSettings {
            max_value_bytes: 8,
            ..StoreSettings::temporary()
        };
        let store = RecordStore::open(&settings, "node-a").unwrap();
        store.put("coordination", "k", b"small".to_vec(), PutOptions::public()).unwrap();

        let err = store
            .put("coordination", "k", vec![0u8; 64], PutOptions::public())
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected { .. }));
        assert_eq!(store.write_failures(), 1);

        let record = store.get("coordination", "k").unwrap().unwrap();
        assert_eq!(record.value, b"small");
        assert_eq!(record.version, 1);
    }

    #[test]
    fn test_query_orders_by_key_and_filters() {
        let store = store();
        for key in ["task/3", "agent/2/state", "task/1", "agent/1/state", "agent/1/result"] {
            store.put("coordination", key, vec![], PutOptions::public()).unwrap();
        }

        assert_eq!(
            keys(store.query("coordination", "task/").unwrap()),
            vec!["task/1", "task/3"]
        );
        assert_eq!(
            keys(store.query("coordination", "agent/*/state").unwrap()),
            vec!["agent/1/state", "agent/2/state"]
        );
        assert_eq!(keys(store.query("coordination", "").unwrap()).len(), 5);
    }

    #[test]
    fn test_query_missing_partition_is_empty() {
        let store = store();
        assert_eq!(store.query("nowhere", "").unwrap().count(), 0);
        assert!(store.get("nowhere", "k").unwrap().is_none());
        assert!(!store.partition_names().unwrap().contains(&"nowhere".to_string()));
    }

    #[test]
    fn test_invalid_partition_and_pattern() {
        let store = store();
        assert!(matches!(
            store.put("bad partition", "k", vec![], PutOptions::public()),
            Err(StoreError::InvalidPartition(_))
        ));
        assert!(matches!(
            store.put("coordination", "", vec![], PutOptions::public()),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_apply_replicated_last_writer_wins() {
        let store = store();
        store.put("coordination", "k", b"local".to_vec(), PutOptions::public()).unwrap();

        let mut entry = ReplicatedEntry {
            partition: "coordination".to_string(),
            key: "k".to_string(),
            value: b"remote".to_vec(),
            version: 1,
            expires_at_ms: None,
            origin: "node-0".to_string(),
        };
        // Same version, smaller origin: local copy stays.
        assert_eq!(
            store.apply_replicated(&entry).unwrap(),
            ApplyOutcome::Stale { current_version: 1 }
        );

        entry.origin = "node-z".to_string();
        assert_eq!(
            store.apply_replicated(&entry).unwrap(),
            ApplyOutcome::Applied { version: 1 }
        );
        assert_eq!(
            store.apply_replicated(&entry).unwrap(),
            ApplyOutcome::Stale { current_version: 1 }
        );

        let record = store.get("coordination", "k").unwrap().unwrap();
        assert_eq!(record.value, b"remote");
        assert_eq!(record.origin, "node-z");

        // Local rewrite continues from the replicated version.
        assert_eq!(
            store.put("coordination", "k", b"next".to_vec(), PutOptions::public()).unwrap(),
            2
        );
    }

    #[test]
    fn test_apply_replicated_drops_expired_entries() {
        let store = store();
        let entry = ReplicatedEntry {
            partition: "events".to_string(),
            key: "old".to_string(),
            value: vec![],
            version: 4,
            expires_at_ms: Some(Utc::now().timestamp_millis() - 1_000),
            origin: "node-b".to_string(),
        };
        assert_eq!(store.apply_replicated(&entry).unwrap(), ApplyOutcome::Expired);
        assert!(store.get("events", "old").unwrap().is_none());
    }

    #[test]
    fn test_changes_since_skips_private_and_rewritten() {
        let store = store();
        let owner = AgentId::new();
        store.put("coordination", "a", vec![1], PutOptions::public()).unwrap();
        store.put("coordination", "secret", vec![2], PutOptions::private(owner)).unwrap();
        store.put("patterns", "b", vec![3], PutOptions::public()).unwrap();
        store.put("coordination", "a", vec![4], PutOptions::public()).unwrap();

        let changes = store.changes_since(0).unwrap();
        let addresses: Vec<_> = changes
            .iter()
            .map(|r| format!("{}/{}", r.partition, r.key))
            .collect();
        assert_eq!(addresses, vec!["patterns/b", "coordination/a"]);
        assert!(changes.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let cursor = changes.last().unwrap().sequence;
        assert!(store.changes_since(cursor).unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_purge() {
        let store = store();
        store.put("metrics", "m/1", vec![], PutOptions::public()).unwrap();
        store.put("metrics", "m/2", vec![], PutOptions::public()).unwrap();
        store.put("patterns", "p/1", vec![], PutOptions::public()).unwrap();

        assert!(store.delete("metrics", "m/1").unwrap());
        assert!(!store.delete("metrics", "m/1").unwrap());
        assert_eq!(store.purge_partition("metrics").unwrap(), 1);
        assert_eq!(store.query("metrics", "").unwrap().count(), 0);
        assert!(store.get("patterns", "p/1").unwrap().is_some());

        let changes = store.changes_since(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].partition, "patterns");
    }

    #[test]
    fn test_sweep_and_partition_default_ttl() {
        let settings =
            StoreSettings::temporary().with_partition_ttl(partitions::EVENTS, Duration::from_millis(5));
        let store = RecordStore::open(&settings, "node-a").unwrap();
        store.put(partitions::EVENTS, "e/1", vec![], PutOptions::public()).unwrap();
        store.put(partitions::EVENTS, "e/2", vec![], PutOptions::public()).unwrap();
        store.put(partitions::COORDINATION, "keep", vec![], PutOptions::public()).unwrap();

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.sweep_expired().unwrap(), 2);
        assert_eq!(store.sweep_expired().unwrap(), 0);
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.entries_per_partition.get(partitions::EVENTS), Some(&0));
    }

    #[test]
    fn test_flush_async_keeps_records_readable() {
        let store = store();
        store.put("coordination", "k", b"v".to_vec(), PutOptions::public()).unwrap();
        tokio_test::block_on(store.flush_async()).unwrap();
        assert_eq!(store.get("coordination", "k").unwrap().unwrap().value, b"v");
    }

    #[test]
    fn test_changes_since_past_high_water_is_empty() {
        let store = store();
        store.put("coordination", "a", vec![], PutOptions::public()).unwrap();
        let sequence = store.get("coordination", "a").unwrap().unwrap().sequence;
        assert_eq!(store.high_water.load(Ordering::Acquire), sequence);
        assert!(store.changes_since(sequence).unwrap().is_empty());
        assert!(store.changes_since(u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_agent_view_hides_foreign_private_records() {
        let store = Arc::new(store());
        let alice = store.agent_view(AgentId::new());
        let bob = store.agent_view(AgentId::new());

        alice.put_private("coordination", "scratch/a", b"mine".to_vec(), None).unwrap();
        alice.put("coordination", "shared/a", b"ours".to_vec(), None).unwrap();

        assert!(alice.get("coordination", "scratch/a").unwrap().is_some());
        assert!(bob.get("coordination", "scratch/a").unwrap().is_none());
        assert!(!bob.delete("coordination", "scratch/a").unwrap());
        assert_eq!(bob.query("coordination", "").unwrap().count(), 1);
        assert_eq!(alice.query("coordination", "").unwrap().count(), 2);
    }

    #[test]
    fn test_typed_round_trip() {
        use crate::domain::agent::AgentState;
        use crate::domain::typed_records::AgentStateRecord;

        let store = store();
        let record = AgentStateRecord {
            agent_id: AgentId::new(),
            agent_type: "test-generator".to_string(),
            state: AgentState::Ready,
            task_queue_depth: 0,
            updated_at: Utc::now(),
        };
        store.put_typed(&record, PutOptions::public()).unwrap();

        let loaded: AgentStateRecord = store
            .get_typed(&AgentStateRecord::key_for(record.agent_id))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
    }
}
