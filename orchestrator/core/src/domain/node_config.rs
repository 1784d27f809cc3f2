// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Fleet Node Configuration
//
// Defines the configuration schema for a fleet coordination node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and replication listener ports
// - Record store location, sweep cadence and per-partition TTL defaults
// - Peer list, retry budget and transport preference for the sync layer
// - Agent pool limits

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::peer::PeerInfo;
use crate::domain::record::validate_partition;
use crate::domain::retry::RetryPolicy;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "FleetConfig";
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG_PATH";

/// Top-level Kubernetes-style fleet configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "FleetConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: FleetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub fleet: PoolSettings,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilitySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Stable node identifier; also the tie-breaker origin for record versions
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Address the replication listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// UDP port for the low-latency transport (0 picks a free port)
    #[serde(default = "default_datagram_port")]
    pub datagram_port: u16,

    /// TCP port for the stream fallback transport (0 picks a free port)
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Directory of the embedded database
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Use a throwaway database that is deleted on drop
    #[serde(default)]
    pub temporary: bool,

    /// How often expired records are reclaimed
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Largest accepted value in bytes
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,

    /// Default TTL applied to writes that do not carry one, per partition
    #[serde(default)]
    pub partition_ttls: HashMap<String, humantime_serde::Serde<Duration>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub address: String,
    /// Datagram port
    pub port: u16,
    /// Stream port; defaults to `port + 1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_port: Option<u16>,
}

impl PeerAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            stream_port: None,
        }
    }

    pub fn with_stream_port(mut self, stream_port: u16) -> Self {
        self.stream_port = Some(stream_port);
        self
    }

    pub fn to_peer_info(&self) -> PeerInfo {
        let info = PeerInfo::discovered(&self.address, self.port);
        match self.stream_port {
            Some(stream_port) => info.with_stream_port(stream_port),
            None => info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportPreference {
    DatagramFirst,
    StreamFirst,
}

impl Default for TransportPreference {
    fn default() -> Self {
        Self::DatagramFirst
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Statically configured peers, added on start-up
    #[serde(default)]
    pub peers: Vec<PeerAddress>,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Connection attempts before a peer is given up on
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay between attempts
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Cap for the exponential backoff
    #[serde(default = "default_max_retry_delay", with = "humantime_serde")]
    pub max_retry_delay: Duration,

    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Auto-sync cadence
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,

    #[serde(default)]
    pub transport_preference: TransportPreference,

    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_delay, self.max_retry_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    /// Tasks held while every agent is busy; beyond this tasks are rejected
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus scrape port; metrics are not exported when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

// Default value functions
fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("fleet-{}", uuid::Uuid::new_v4()))
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_datagram_port() -> u16 {
    7400
}

fn default_stream_port() -> u16 {
    7401
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./fleet-store")
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_value_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_peers() -> usize {
    16
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_batch_entries() -> usize {
    256
}

fn default_max_agents() -> usize {
    5
}

fn default_task_queue_capacity() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            bind_address: default_bind_address(),
            datagram_port: default_datagram_port(),
            stream_port: default_stream_port(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            temporary: false,
            sweep_interval: default_sweep_interval(),
            max_value_bytes: default_max_value_bytes(),
            partition_ttls: HashMap::new(),
        }
    }
}

impl StoreSettings {
    pub fn partition_ttl(&self, partition: &str) -> Option<Duration> {
        self.partition_ttls.get(partition).map(|ttl| **ttl)
    }

    pub fn with_partition_ttl(mut self, partition: &str, ttl: Duration) -> Self {
        self.partition_ttls.insert(partition.to_string(), ttl.into());
        self
    }

    /// In-memory style store for tests and ephemeral nodes.
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            peers: vec![],
            max_peers: default_max_peers(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
            handshake_timeout: default_handshake_timeout(),
            request_timeout: default_request_timeout(),
            sync_interval: default_sync_interval(),
            transport_preference: TransportPreference::default(),
            max_batch_entries: default_max_batch_entries(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            task_queue_capacity: default_task_queue_capacity(),
        }
    }
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

impl Default for FleetConfigManifest {
    fn default() -> Self {
        let spec = FleetConfig::default();
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: spec.node.id.clone(),
                labels: None,
            },
            spec,
        }
    }
}

impl FleetConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. FLEET_CONFIG_PATH environment variable
    /// 2. ./fleet-config.yaml (working directory)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./fleet-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<&Path>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FLEET_NODE_ID") {
            if !val.is_empty() {
                tracing::info!("Environment override: FLEET_NODE_ID={}", val);
                self.spec.node.id = val;
            }
        }

        if let Ok(val) = std::env::var("FLEET_STORE_PATH") {
            tracing::info!("Environment override: FLEET_STORE_PATH={}", val);
            self.spec.store.path = PathBuf::from(val);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        self.spec.validate()
    }
}

impl FleetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        if self.node.datagram_port != 0 && self.node.datagram_port == self.node.stream_port {
            anyhow::bail!(
                "spec.node.datagram_port and spec.node.stream_port must differ (both {})",
                self.node.stream_port
            );
        }

        if self.store.sweep_interval.is_zero() {
            anyhow::bail!("spec.store.sweep_interval must be greater than zero");
        }

        for partition in self.store.partition_ttls.keys() {
            if validate_partition(partition).is_err() {
                anyhow::bail!("Invalid partition name in spec.store.partition_ttls: '{}'", partition);
            }
        }

        if self.sync.max_peers == 0 {
            anyhow::bail!("spec.sync.max_peers must be at least 1");
        }

        if self.sync.retry_attempts == 0 {
            anyhow::bail!("spec.sync.retry_attempts must be at least 1");
        }

        if self.sync.peers.len() > self.sync.max_peers {
            anyhow::bail!(
                "spec.sync.peers lists {} peers but max_peers is {}",
                self.sync.peers.len(),
                self.sync.max_peers
            );
        }

        if self.sync.max_batch_entries == 0 {
            anyhow::bail!("spec.sync.max_batch_entries must be at least 1");
        }

        if self.sync.handshake_timeout.is_zero() || self.sync.request_timeout.is_zero() {
            anyhow::bail!("spec.sync timeouts must be greater than zero");
        }

        if self.fleet.max_agents == 0 {
            anyhow::bail!("spec.fleet.max_agents must be at least 1");
        }

        Ok(())
    }
}
