// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Node - composition root
//!
//! Builds one node's record store, event bus, sync listener and transport,
//! record sweeper, lifecycle manager and orchestrator from a [`FleetConfig`],
//! and owns their background tasks.
//!
//! Start-up order: listener, initial peer connects, auto-sync loop, sweeper.
//! Shutdown runs the other way round and flushes the store last.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleet_core::application::RecordSweeper;
use fleet_core::domain::node_config::FleetConfig;
use fleet_core::infrastructure::event_bus::EventBus;
use fleet_core::infrastructure::record_store::RecordStore;
use fleet_core::infrastructure::sync::{SyncListener, SyncTransport};

use super::lifecycle::AgentLifecycleManager;
use super::orchestrator::FleetOrchestrator;
use crate::domain::behavior::BehaviorRegistry;
use crate::domain::health::FleetHealth;

pub struct FleetNode {
    config: FleetConfig,
    store: Arc<RecordStore>,
    event_bus: EventBus,
    listener: Arc<SyncListener>,
    sync: Arc<SyncTransport>,
    sweeper: Arc<RecordSweeper>,
    orchestrator: Arc<FleetOrchestrator>,
    listener_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetNode {
    pub async fn build(config: FleetConfig, behaviors: BehaviorRegistry) -> Result<Self> {
        config.validate().context("Invalid fleet configuration")?;

        let store = Arc::new(
            RecordStore::open(&config.store, config.node.id.clone())
                .with_context(|| format!("Failed to open record store at {:?}", config.store.path))?,
        );
        let event_bus = EventBus::new();

        let listener = Arc::new(
            SyncListener::bind(
                &config.node.bind_address,
                config.node.datagram_port,
                config.node.stream_port,
                Arc::clone(&store),
                event_bus.clone(),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to bind sync listener on {} (datagram {}, stream {})",
                    config.node.bind_address, config.node.datagram_port, config.node.stream_port
                )
            })?,
        );

        let sync = Arc::new(SyncTransport::new(
            Arc::clone(&store),
            event_bus.clone(),
            config.sync.clone(),
        ));
        let sweeper = Arc::new(RecordSweeper::new(
            Arc::clone(&store),
            config.store.sweep_interval,
        ));
        let lifecycle = Arc::new(AgentLifecycleManager::new(
            Arc::clone(&store),
            event_bus.clone(),
            behaviors,
            config.fleet.max_agents,
        ));
        let orchestrator = Arc::new(
            FleetOrchestrator::new(
                lifecycle,
                Arc::clone(&store),
                event_bus.clone(),
                config.fleet.clone(),
            )
            .with_sync(Arc::clone(&sync)),
        );

        info!(
            node_id = %config.node.id,
            agent_types = ?orchestrator.lifecycle().behaviors().agent_types(),
            "Fleet node built"
        );

        Ok(Self {
            config,
            store,
            event_bus,
            listener,
            sync,
            sweeper,
            orchestrator,
            listener_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start serving peers and the background loops. Unreachable configured
    /// peers are logged, not fatal; auto-sync keeps retrying them.
    pub async fn start(&self) -> Result<()> {
        let listener_handle = Arc::clone(&self.listener).start(self.listener_token.clone());

        let added = self.sync.discover_peers();
        for (peer_id, result) in self.sync.connect_idle().await {
            match result {
                Ok(transport) => info!(peer = %peer_id, %transport, "Connected to configured peer"),
                Err(e) => warn!(peer = %peer_id, error = %e, "Configured peer unreachable at start-up"),
            }
        }

        let sync_handle = Arc::clone(&self.sync).start();
        let sweeper_handle = Arc::clone(&self.sweeper).start();
        self.background
            .lock()
            .extend([listener_handle, sync_handle, sweeper_handle]);

        info!(
            node_id = %self.config.node.id,
            datagram = %self.local_datagram_addr()?,
            stream = %self.local_stream_addr()?,
            peers = added.len(),
            "Fleet node started"
        );
        Ok(())
    }

    /// Retire all agents, stop the loops, disconnect peers and flush the store.
    pub async fn shutdown(&self) -> Result<()> {
        info!(node_id = %self.config.node.id, "Shutting down fleet node");

        self.orchestrator.shutdown().await;
        self.sync.shutdown().await;
        self.sweeper.shutdown_token().cancel();
        self.listener_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.store
            .flush_async()
            .await
            .context("Failed to flush record store")?;
        info!(node_id = %self.config.node.id, "Fleet node stopped");
        Ok(())
    }

    pub fn health(&self) -> FleetHealth {
        self.orchestrator.health()
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn sync(&self) -> &Arc<SyncTransport> {
        &self.sync
    }

    pub fn orchestrator(&self) -> &Arc<FleetOrchestrator> {
        &self.orchestrator
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        self.orchestrator.lifecycle()
    }

    pub fn local_datagram_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_datagram_addr()?)
    }

    pub fn local_stream_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_stream_addr()?)
    }
}
