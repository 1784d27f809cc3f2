// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Low-latency UDP transport.
//!
//! One envelope per datagram. Responses are matched to requests by
//! `request_id`; late responses to timed-out requests are discarded. There
//! is no retransmission: a lost datagram surfaces as a request timeout and
//! the batch is resent on the next sync, which is safe because applying a
//! batch is idempotent.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

use super::transport::{check_hello_ack, resolve, Hello, PeerLink, Transport, TransportError};
use super::wire::{self, Envelope, SyncAck, SyncBatch, WireMessage, MAX_DATAGRAM_BYTES};
use crate::domain::peer::{PeerId, PeerInfo, TransportKind};

#[derive(Debug, Default, Clone)]
pub struct DatagramTransport;

impl DatagramTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn connect(
        &self,
        peer: &PeerInfo,
        hello: &Hello,
        handshake_timeout: Duration,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        let remote = resolve(peer, peer.port).await?;
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;

        let mut link = DatagramLink {
            socket,
            peer: peer.id.clone(),
            remote_node_id: String::new(),
            next_request_id: 1,
            buffer: vec![0u8; MAX_DATAGRAM_BYTES],
        };

        let response = link
            .request(
                WireMessage::Hello {
                    node_id: hello.node_id.clone(),
                    protocol_version: hello.protocol_version,
                },
                handshake_timeout,
            )
            .await
            .map_err(|e| match e {
                TransportError::RequestTimeout { peer, .. } => TransportError::HandshakeTimeout {
                    peer,
                    transport: TransportKind::Datagram,
                },
                other => other,
            })?;

        match response {
            WireMessage::HelloAck {
                node_id,
                protocol_version,
            } => {
                link.remote_node_id = check_hello_ack(peer, node_id, protocol_version)?;
                debug!(peer = %peer.id, remote = %link.remote_node_id, "Datagram link established");
                Ok(Box::new(link))
            }
            WireMessage::Error { message } => Err(TransportError::Protocol(message)),
            other => Err(TransportError::Protocol(format!(
                "expected HelloAck, got {:?}",
                other
            ))),
        }
    }
}

pub struct DatagramLink {
    socket: UdpSocket,
    peer: PeerId,
    remote_node_id: String,
    next_request_id: u64,
    buffer: Vec<u8>,
}

impl DatagramLink {
    async fn request(
        &mut self,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage, TransportError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let bytes = wire::encode(
            &Envelope {
                request_id,
                message,
            },
            MAX_DATAGRAM_BYTES,
        )?;
        self.socket.send(&bytes).await.map_err(|e| self.connection_error(e))?;

        let deadline = Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv(&mut self.buffer))
                .await
                .map_err(|_| TransportError::RequestTimeout {
                    peer: self.peer.clone(),
                    timeout,
                })?;
            let len = received.map_err(|e| self.connection_error(e))?;

            let envelope = match wire::decode(&self.buffer[..len], MAX_DATAGRAM_BYTES) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Discarding undecodable datagram");
                    continue;
                }
            };
            if envelope.request_id == request_id {
                return Ok(envelope.message);
            }
            debug!(
                peer = %self.peer,
                expected = request_id,
                got = envelope.request_id,
                "Discarding stale datagram response"
            );
        }
    }

    fn connection_error(&self, err: std::io::Error) -> TransportError {
        TransportError::Connection {
            peer: self.peer.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl PeerLink for DatagramLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn remote_node_id(&self) -> &str {
        &self.remote_node_id
    }

    fn max_payload_bytes(&self) -> usize {
        MAX_DATAGRAM_BYTES
    }

    async fn send_batch(
        &mut self,
        batch: SyncBatch,
        timeout: Duration,
    ) -> Result<SyncAck, TransportError> {
        match self.request(WireMessage::Sync(batch), timeout).await? {
            WireMessage::Ack(ack) => Ok(ack),
            WireMessage::Error { message } => Err(TransportError::Protocol(message)),
            other => Err(TransportError::Protocol(format!("expected Ack, got {:?}", other))),
        }
    }

    async fn close(&mut self) {
        debug!(peer = %self.peer, "Datagram link closed");
    }
}
