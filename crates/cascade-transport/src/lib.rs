//! Transport port for the cascade engine.
//!
//! # Purpose
//! Carries framed protocol requests/events between the engine and a
//! server over one of four flavors: WebSocket or HTTP, streaming or
//! polling. The engine never touches sockets; it talks to a
//! [`Connection`] made of a request sender and an event receiver, each
//! backed by a single-writer background task.
//!
//! # Design notes
//! Each connection spawns one writer and one reader task communicating
//! over bounded queues, so a slow socket never blocks the engine loop.
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use cascade_wire::{ClientRequest, Frame, FrameHeader, ProtocolEvent, TransportKind};
use std::time::Duration;
use tokio::sync::mpsc;

pub mod http;
pub mod mock;
pub mod ws;

pub(crate) const REQUEST_QUEUE_DEPTH: usize = 256;
pub(crate) const EVENT_QUEUE_DEPTH: usize = 1024;

/// Hard safety cap for any single inbound frame. A buggy or malicious
/// peer can otherwise advertise an enormous length and trigger OOM.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Transport-level configuration defaults.
///
/// ```
/// use cascade_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Where to reach the server, plus the extra headers the caller asked to
/// attach to transport requests.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub server_address: String,
    pub extra_headers: Vec<(String, String)>,
}

/// What the reader half yields to the engine.
#[derive(Debug)]
pub enum TransportEvent {
    Event(ProtocolEvent),
    // The connection is gone; no further events will arrive.
    Closed { reason: String },
}

/// Engine-side sender half of a live connection. Dropping it shuts the
/// writer task down, which closes the underlying socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    kind: TransportKind,
    request_tx: mpsc::Sender<ClientRequest>,
}

impl ConnectionHandle {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Enqueue a request for the writer task. Fails once the connection
    /// is closed.
    pub async fn send(&self, request: ClientRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("transport writer closed"))
    }
}

/// A live connection: the sender half plus the event receiver.
#[derive(Debug)]
pub struct Connection {
    pub(crate) kind: TransportKind,
    pub(crate) request_tx: mpsc::Sender<ClientRequest>,
    pub(crate) event_rx: mpsc::Receiver<TransportEvent>,
}

impl Connection {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Split into the engine-facing halves.
    pub fn split(self) -> (ConnectionHandle, mpsc::Receiver<TransportEvent>) {
        (
            ConnectionHandle {
                kind: self.kind,
                request_tx: self.request_tx,
            },
            self.event_rx,
        )
    }
}

/// Factory for opening connections of the flavors it supports, in
/// preference order.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn supported(&self) -> Vec<TransportKind>;

    async fn connect(
        &self,
        kind: TransportKind,
        endpoint: &Endpoint,
        config: &TransportConfig,
    ) -> Result<Connection>;
}

/// Default factory: WebSocket flavors via tokio-tungstenite, HTTP
/// flavors via reqwest.
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    fn supported(&self) -> Vec<TransportKind> {
        vec![
            TransportKind::WsStreaming,
            TransportKind::HttpStreaming,
            TransportKind::WsPolling,
            TransportKind::HttpPolling,
        ]
    }

    async fn connect(
        &self,
        kind: TransportKind,
        endpoint: &Endpoint,
        config: &TransportConfig,
    ) -> Result<Connection> {
        match kind {
            TransportKind::WsStreaming | TransportKind::WsPolling => {
                ws::connect(kind, endpoint, config).await
            }
            TransportKind::HttpStreaming | TransportKind::HttpPolling => {
                http::connect(kind, endpoint, config).await
            }
        }
    }
}

/// Incremental frame assembly from arbitrary byte chunks, for transports
/// without native message boundaries (HTTP streaming bodies).
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_bytes,
        }
    }

    /// Feed one chunk and drain every complete frame it finished.
    pub fn push(&mut self, chunk: &[u8]) -> cascade_wire::Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < FrameHeader::LEN {
                return Ok(frames);
            }
            let header =
                FrameHeader::decode(bytes::Bytes::copy_from_slice(&self.buf[..FrameHeader::LEN]))?;
            let length = header.length as usize;
            if length > self.max_frame_bytes {
                return Err(cascade_wire::Error::FrameTooLarge);
            }
            if self.buf.len() < FrameHeader::LEN + length {
                return Ok(frames);
            }
            let full = self.buf.split_to(FrameHeader::LEN + length).freeze();
            frames.push(Frame::decode(full)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_handles_split_frames() {
        let event = ProtocolEvent::Sync { age_ms: 5 };
        let encoded = event.encode().expect("encode").encode();
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES);

        // Deliver the frame one byte at a time; only the last byte
        // completes it.
        for byte in &encoded[..encoded.len() - 1] {
            assert!(assembler.push(&[*byte]).expect("push").is_empty());
        }
        let frames = assembler
            .push(&encoded[encoded.len() - 1..])
            .expect("final push");
        assert_eq!(frames.len(), 1);
        assert_eq!(ProtocolEvent::decode(frames[0].clone()).expect("decode"), event);
    }

    #[test]
    fn assembler_drains_back_to_back_frames() {
        let first = ProtocolEvent::Sync { age_ms: 1 }.encode().expect("encode").encode();
        let second = ProtocolEvent::Sync { age_ms: 2 }.encode().expect("encode").encode();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&first);
        chunk.extend_from_slice(&second);

        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_BYTES);
        let frames = assembler.push(&chunk).expect("push");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn assembler_rejects_oversized_frame() {
        let mut assembler = FrameAssembler::new(8);
        let header = FrameHeader::new(0, 1024);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let err = assembler.push(&buf).expect_err("too large");
        assert!(matches!(err, cascade_wire::Error::FrameTooLarge));
    }

    #[test]
    fn connection_split_preserves_kind() {
        let (request_tx, _request_rx) = mpsc::channel(1);
        let (_event_tx, event_rx) = mpsc::channel::<TransportEvent>(1);
        let connection = Connection {
            kind: TransportKind::WsStreaming,
            request_tx,
            event_rx,
        };
        let (handle, _events) = connection.split();
        assert_eq!(handle.kind(), TransportKind::WsStreaming);
    }
}
