// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node runner
//!
//! Runs a [`FleetNode`] in the foreground until SIGINT/SIGTERM, logging
//! fleet health on a fixed cadence and exporting Prometheus metrics when a
//! scrape port is configured.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use fleet_core::domain::node_config::FleetConfigManifest;
use fleet_swarm::{BehaviorRegistry, FleetNode, HealthStatus};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Run a node until the process receives SIGINT or SIGTERM.
pub async fn run_node(manifest: FleetConfigManifest, behaviors: BehaviorRegistry) -> Result<()> {
    run_node_until(manifest, behaviors, shutdown_signal()).await
}

/// Run a node until `shutdown` resolves, then retire its agents and flush.
pub async fn run_node_until<F>(
    manifest: FleetConfigManifest,
    behaviors: BehaviorRegistry,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    manifest
        .validate()
        .context("Configuration validation failed")?;

    if let Some(port) = manifest
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics_port)
    {
        install_metrics_exporter(port)?;
    }

    if behaviors.agent_types().is_empty() {
        warn!("No agent behaviors registered; this node only stores and replicates records");
    }

    let node = FleetNode::build(manifest.spec, behaviors).await?;
    node.start().await?;

    tokio::pin!(shutdown);
    let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_tick.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = health_tick.tick() => {
                let health = node.health();
                let summary = serde_json::to_string(&health).unwrap_or_default();
                match health.status {
                    HealthStatus::Healthy => info!(health = %summary, "Fleet health"),
                    _ => warn!(health = %summary, "Fleet health"),
                }
            }
        }
    }

    info!("Shutdown signal received");
    node.shutdown().await
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics exporter on {}", addr))?;
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn local_manifest() -> FleetConfigManifest {
        let mut manifest = FleetConfigManifest::default();
        manifest.spec.node.id = "node-cli".to_string();
        manifest.spec.node.bind_address = "127.0.0.1".to_string();
        manifest.spec.node.datagram_port = 0;
        manifest.spec.node.stream_port = 0;
        manifest.spec.store.temporary = true;
        manifest
    }

    #[tokio::test]
    async fn test_node_runs_until_shutdown() {
        let (tx, rx) = oneshot::channel::<()>();
        let runner = tokio::spawn(run_node_until(
            local_manifest(),
            BehaviorRegistry::new(),
            async move {
                let _ = rx.await;
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!runner.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("node should stop after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_manifest_fails_before_binding() {
        let mut manifest = local_manifest();
        manifest.spec.sync.retry_attempts = 0;

        let err = run_node_until(manifest, BehaviorRegistry::new(), std::future::pending())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("retry_attempts"));
    }
}
