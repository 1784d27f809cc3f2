// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `fleet run` - start a node in the foreground
//!
//! Flags override the loaded manifest, which in turn has had its
//! environment overrides applied.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use fleet_core::domain::node_config::{FleetConfigManifest, PeerAddress};
use fleet_swarm::BehaviorRegistry;

use crate::daemon;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Node identifier (overrides spec.node.id)
    #[arg(long, env = "FLEET_NODE_ID")]
    pub node_id: Option<String>,

    /// Address the sync listener binds to
    #[arg(long)]
    pub bind: Option<String>,

    /// UDP port for the datagram transport
    #[arg(long)]
    pub datagram_port: Option<u16>,

    /// TCP port for the stream transport
    #[arg(long)]
    pub stream_port: Option<u16>,

    /// Additional peer as HOST:PORT or HOST:PORT:STREAM_PORT (repeatable)
    #[arg(long = "peer", value_name = "PEER", value_parser = parse_peer)]
    pub peers: Vec<PeerAddress>,

    /// Record store directory
    #[arg(long, value_name = "DIR")]
    pub store_path: Option<PathBuf>,

    /// Use a throwaway record store
    #[arg(long)]
    pub temporary: bool,

    /// Prometheus scrape port
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

impl RunArgs {
    pub fn apply(&self, manifest: &mut FleetConfigManifest) {
        let spec = &mut manifest.spec;
        if let Some(id) = &self.node_id {
            spec.node.id = id.clone();
        }
        if let Some(bind) = &self.bind {
            spec.node.bind_address = bind.clone();
        }
        if let Some(port) = self.datagram_port {
            spec.node.datagram_port = port;
        }
        if let Some(port) = self.stream_port {
            spec.node.stream_port = port;
        }
        for peer in &self.peers {
            if !spec.sync.peers.contains(peer) {
                spec.sync.peers.push(peer.clone());
            }
        }
        if let Some(path) = &self.store_path {
            spec.store.path = path.clone();
        }
        if self.temporary {
            spec.store.temporary = true;
        }
        if let Some(port) = self.metrics_port {
            spec.observability
                .get_or_insert_with(Default::default)
                .metrics_port = Some(port);
        }
    }
}

pub async fn execute(args: RunArgs, config_override: Option<PathBuf>) -> Result<()> {
    let mut manifest = FleetConfigManifest::load_or_default(config_override.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut manifest);

    daemon::run_node(manifest, BehaviorRegistry::new()).await
}

/// Parse `HOST:PORT` or `HOST:PORT:STREAM_PORT`.
pub fn parse_peer(raw: &str) -> Result<PeerAddress, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let port = |s: &str| {
        s.parse::<u16>()
            .map_err(|e| format!("invalid port '{}' in peer '{}': {}", s, raw, e))
    };

    match parts.as_slice() {
        [host, datagram] if !host.is_empty() => Ok(PeerAddress::new(*host, port(datagram)?)),
        [host, datagram, stream] if !host.is_empty() => {
            Ok(PeerAddress::new(*host, port(datagram)?).with_stream_port(port(stream)?))
        }
        _ => Err(format!(
            "invalid peer '{}': expected HOST:PORT or HOST:PORT:STREAM_PORT",
            raw
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_forms() {
        assert_eq!(parse_peer("10.0.0.2:7400").unwrap(), PeerAddress::new("10.0.0.2", 7400));
        assert_eq!(
            parse_peer("node-b:7400:9000").unwrap(),
            PeerAddress::new("node-b", 7400).with_stream_port(9000)
        );
        assert!(parse_peer("node-b").is_err());
        assert!(parse_peer(":7400").is_err());
        assert!(parse_peer("node-b:http").is_err());
        assert!(parse_peer("node-b:70000").is_err());
    }

    #[test]
    fn test_flags_override_manifest() {
        let mut manifest = FleetConfigManifest::default();
        manifest.spec.sync.peers.push(PeerAddress::new("10.0.0.2", 7400));

        let args = RunArgs {
            node_id: Some("node-x".to_string()),
            datagram_port: Some(0),
            stream_port: Some(0),
            peers: vec![
                PeerAddress::new("10.0.0.2", 7400),
                PeerAddress::new("10.0.0.3", 7400),
            ],
            temporary: true,
            metrics_port: Some(9100),
            ..Default::default()
        };
        args.apply(&mut manifest);

        let spec = &manifest.spec;
        assert_eq!(spec.node.id, "node-x");
        assert_eq!(spec.node.datagram_port, 0);
        assert_eq!(spec.sync.peers.len(), 2);
        assert!(spec.store.temporary);
        assert_eq!(spec.observability.as_ref().unwrap().metrics_port, Some(9100));
        // Untouched settings keep their manifest values
        assert_eq!(spec.node.bind_address, "0.0.0.0");
    }
}
