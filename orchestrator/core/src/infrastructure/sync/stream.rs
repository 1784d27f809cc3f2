// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reliable TCP fallback transport, one envelope per length-delimited frame.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::transport::{check_hello_ack, resolve, Hello, PeerLink, Transport, TransportError};
use super::wire::{self, Envelope, SyncAck, SyncBatch, WireMessage, MAX_FRAME_BYTES};
use crate::domain::peer::{PeerId, PeerInfo, TransportKind};

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

#[derive(Debug, Default, Clone)]
pub struct StreamTransport;

impl StreamTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn connect(
        &self,
        peer: &PeerInfo,
        hello: &Hello,
        handshake_timeout: Duration,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        let remote = resolve(peer, peer.stream_port).await?;
        let handshake_timed_out = || TransportError::HandshakeTimeout {
            peer: peer.id.clone(),
            transport: TransportKind::Stream,
        };
        let deadline = Instant::now() + handshake_timeout;

        let stream = tokio::time::timeout_at(deadline, TcpStream::connect(remote))
            .await
            .map_err(|_| handshake_timed_out())?
            .map_err(|e| TransportError::Connection {
                peer: peer.id.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let mut link = StreamLink {
            framed: Framed::new(stream, frame_codec()),
            peer: peer.id.clone(),
            remote_node_id: String::new(),
            next_request_id: 1,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = link
            .request(
                WireMessage::Hello {
                    node_id: hello.node_id.clone(),
                    protocol_version: hello.protocol_version,
                },
                remaining,
            )
            .await
            .map_err(|e| match e {
                TransportError::RequestTimeout { .. } => handshake_timed_out(),
                other => other,
            })?;

        match response {
            WireMessage::HelloAck {
                node_id,
                protocol_version,
            } => {
                link.remote_node_id = check_hello_ack(peer, node_id, protocol_version)?;
                debug!(peer = %peer.id, remote = %link.remote_node_id, "Stream link established");
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

pub struct StreamLink {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: PeerId,
    remote_node_id: String,
    next_request_id: u64,
}

impl StreamLink {
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
            MAX_FRAME_BYTES,
        )?;

        let deadline = Instant::now() + timeout;
        let timed_out = |peer: &PeerId| TransportError::RequestTimeout {
            peer: peer.clone(),
            timeout,
        };

        tokio::time::timeout_at(deadline, self.framed.send(Bytes::from(bytes)))
            .await
            .map_err(|_| timed_out(&self.peer))?
            .map_err(|e| self.connection_error(e.to_string()))?;

        loop {
            let frame = tokio::time::timeout_at(deadline, self.framed.next())
                .await
                .map_err(|_| timed_out(&self.peer))?;
            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(self.connection_error(e.to_string())),
                None => return Err(self.connection_error("connection closed by peer".to_string())),
            };

            let envelope = wire::decode(&bytes, MAX_FRAME_BYTES)?;
            // Older ids are answers to requests that already timed out.
            if envelope.request_id == request_id {
                return Ok(envelope.message);
            }
            if envelope.request_id > request_id {
                return Err(TransportError::Protocol(format!(
                    "response id {} ahead of request id {}",
                    envelope.request_id, request_id
                )));
            }
        }
    }

    fn connection_error(&self, reason: String) -> TransportError {
        TransportError::Connection {
            peer: self.peer.clone(),
            reason,
        }
    }
}

#[async_trait]
impl PeerLink for StreamLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn remote_node_id(&self) -> &str {
        &self.remote_node_id
    }

    fn max_payload_bytes(&self) -> usize {
        MAX_FRAME_BYTES
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
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            debug!(peer = %self.peer, error = %e, "Error closing stream link");
        }
    }
}
