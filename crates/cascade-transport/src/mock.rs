// In-process transport pair for tests: the engine talks to a scripted
// server over plain channels, no sockets involved.
use anyhow::Result;
use async_trait::async_trait;
use cascade_wire::{ClientRequest, ProtocolEvent, TransportKind};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    Connection, Endpoint, TransportConfig, TransportEvent, TransportFactory, EVENT_QUEUE_DEPTH,
    REQUEST_QUEUE_DEPTH,
};

/// Build a connected (engine, server) pair of the given flavor.
pub fn pair(kind: TransportKind) -> (Connection, MockServer) {
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (
        Connection {
            kind,
            request_tx,
            event_rx,
        },
        MockServer {
            kind,
            request_rx,
            event_tx,
        },
    )
}

/// Test-side half of a mock connection.
pub struct MockServer {
    kind: TransportKind,
    request_rx: mpsc::Receiver<ClientRequest>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl MockServer {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Next request the engine sent, or panic after a grace period.
    pub async fn recv_request(&mut self) -> ClientRequest {
        tokio::time::timeout(Duration::from_secs(5), self.request_rx.recv())
            .await
            .expect("timed out waiting for a client request")
            .expect("engine side closed")
    }

    /// Next request if one arrives in time; None on timeout.
    pub async fn try_recv_request(&mut self, wait: Duration) -> Option<ClientRequest> {
        tokio::time::timeout(wait, self.request_rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn push(&self, event: ProtocolEvent) {
        let _ = self.event_tx.send(TransportEvent::Event(event)).await;
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .event_tx
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// True once the engine has dropped its sender half.
    pub fn engine_gone(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Factory that hands each new connection's server half to the test.
pub struct MockFactory {
    supported: Vec<TransportKind>,
    servers_tx: mpsc::UnboundedSender<MockServer>,
    failing: Mutex<HashSet<TransportKind>>,
}

impl MockFactory {
    pub fn new(
        supported: Vec<TransportKind>,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                supported,
                servers_tx,
                failing: Mutex::new(HashSet::new()),
            }),
            servers_rx,
        )
    }

    /// Make connect attempts for a flavor fail until cleared.
    pub fn set_failing(&self, kind: TransportKind, failing: bool) {
        let mut set = self.failing.lock().expect("failing set poisoned");
        if failing {
            set.insert(kind);
        } else {
            set.remove(&kind);
        }
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    fn supported(&self) -> Vec<TransportKind> {
        self.supported.clone()
    }

    async fn connect(
        &self,
        kind: TransportKind,
        _endpoint: &Endpoint,
        _config: &TransportConfig,
    ) -> Result<Connection> {
        if self.failing.lock().expect("failing set poisoned").contains(&kind) {
            return Err(anyhow::anyhow!("mock connect refused for {kind:?}"));
        }
        let (connection, server) = pair(kind);
        self.servers_tx
            .send(server)
            .map_err(|_| anyhow::anyhow!("mock server receiver dropped"))?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_requests_and_events() {
        let (connection, mut server) = pair(TransportKind::WsStreaming);
        let (handle, mut events) = connection.split();

        handle
            .send(ClientRequest::Heartbeat)
            .await
            .expect("send heartbeat");
        assert_eq!(server.recv_request().await, ClientRequest::Heartbeat);

        server.push(ProtocolEvent::Sync { age_ms: 0 }).await;
        match events.recv().await {
            Some(TransportEvent::Event(ProtocolEvent::Sync { age_ms: 0 })) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn factory_fails_configured_kinds() {
        let (factory, mut servers) = MockFactory::new(vec![TransportKind::WsStreaming]);
        factory.set_failing(TransportKind::WsStreaming, true);
        let err = factory
            .connect(
                TransportKind::WsStreaming,
                &Endpoint::default(),
                &TransportConfig::default(),
            )
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("refused"));

        factory.set_failing(TransportKind::WsStreaming, false);
        factory
            .connect(
                TransportKind::WsStreaming,
                &Endpoint::default(),
                &TransportConfig::default(),
            )
            .await
            .expect("connect");
        assert!(servers.recv().await.is_some());
    }
}
