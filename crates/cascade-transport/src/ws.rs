// WebSocket transport flavor over tokio-tungstenite.
use anyhow::{Context, Result};
use bytes::Bytes;
use cascade_wire::{ClientRequest, Frame, ProtocolEvent, TransportKind};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::{Connection, Endpoint, TransportConfig, TransportEvent, EVENT_QUEUE_DEPTH, REQUEST_QUEUE_DEPTH};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WS_PATH: &str = "/cascade/ws";

enum WriterCmd {
    Request(ClientRequest),
    Pong(Bytes),
}

/// Map the configured server address onto the WebSocket endpoint URL.
pub fn resolve_ws_url(server_address: &str) -> Result<String> {
    let trimmed = server_address.trim_end_matches('/');
    let url = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}{WS_PATH}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}{WS_PATH}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        format!("{trimmed}{WS_PATH}")
    } else {
        return Err(anyhow::anyhow!(
            "unsupported server address scheme: {server_address}"
        ));
    };
    Ok(url)
}

pub async fn connect(
    kind: TransportKind,
    endpoint: &Endpoint,
    config: &TransportConfig,
) -> Result<Connection> {
    let url = resolve_ws_url(&endpoint.server_address)?;
    let mut request = url
        .clone()
        .into_client_request()
        .context("build websocket request")?;
    for (name, value) in &endpoint.extra_headers {
        let name: tokio_tungstenite::tungstenite::http::HeaderName =
            name.parse().context("extra header name")?;
        request
            .headers_mut()
            .insert(name, value.parse().context("extra header value")?);
    }

    let (stream, _response) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| anyhow::anyhow!("websocket connect timeout: {url}"))?
    .context("websocket connect")?;
    debug!(%url, ?kind, "websocket transport attached");

    let (sink, source) = stream.split();
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (writer_tx, writer_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

    tokio::spawn(run_request_bridge(request_rx, writer_tx.clone()));
    tokio::spawn(run_writer(sink, writer_rx));
    tokio::spawn(run_reader(source, event_tx, writer_tx));

    Ok(Connection {
        kind,
        request_tx,
        event_rx,
    })
}

// Forwards engine requests into the writer queue, so the reader can share
// the same queue for pongs without exposing it to the engine.
async fn run_request_bridge(
    mut request_rx: mpsc::Receiver<ClientRequest>,
    writer_tx: mpsc::Sender<WriterCmd>,
) {
    while let Some(request) = request_rx.recv().await {
        if writer_tx.send(WriterCmd::Request(request)).await.is_err() {
            break;
        }
    }
}

async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut writer_rx: mpsc::Receiver<WriterCmd>,
) {
    while let Some(cmd) = writer_rx.recv().await {
        let message = match cmd {
            WriterCmd::Request(request) => match request.to_json() {
                Ok(text) => Message::Text(text.into()),
                Err(err) => {
                    debug!(error = %err, "dropping unencodable request");
                    continue;
                }
            },
            WriterCmd::Pong(payload) => Message::Pong(payload),
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
    // Engine dropped its handle (or the socket died): orderly close.
    let _ = sink.send(Message::Close(None)).await;
}

async fn run_reader(
    mut source: futures_util::stream::SplitStream<WsStream>,
    event_tx: mpsc::Sender<TransportEvent>,
    writer_tx: mpsc::Sender<WriterCmd>,
) {
    loop {
        let Some(frame) = source.next().await else {
            let _ = event_tx
                .send(TransportEvent::Closed {
                    reason: "websocket stream ended".to_string(),
                })
                .await;
            return;
        };
        match frame {
            Ok(Message::Text(text)) => match ProtocolEvent::from_json(text.as_str()) {
                Ok(event) => {
                    if event_tx.send(TransportEvent::Event(event)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "undecodable websocket event");
                }
            },
            Ok(Message::Binary(data)) => {
                // Binary frames carry one framed event each.
                let decoded = Frame::decode(data).and_then(ProtocolEvent::decode);
                match decoded {
                    Ok(event) => {
                        if event_tx.send(TransportEvent::Event(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "undecodable binary websocket event");
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = writer_tx.send(WriterCmd::Pong(payload)).await;
            }
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(close)) => {
                let reason = close
                    .map(|frame| frame.reason.to_string())
                    .unwrap_or_else(|| "server closed connection".to_string());
                let _ = event_tx.send(TransportEvent::Closed { reason }).await;
                return;
            }
            Err(err) => {
                let _ = event_tx
                    .send(TransportEvent::Closed {
                        reason: format!("websocket error: {err}"),
                    })
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_from_http_schemes() {
        assert_eq!(
            resolve_ws_url("http://push.example.com:8080").expect("url"),
            "ws://push.example.com:8080/cascade/ws"
        );
        assert_eq!(
            resolve_ws_url("https://push.example.com/").expect("url"),
            "wss://push.example.com/cascade/ws"
        );
        assert_eq!(
            resolve_ws_url("wss://push.example.com").expect("url"),
            "wss://push.example.com/cascade/ws"
        );
    }

    #[test]
    fn ws_url_rejects_unknown_scheme() {
        assert!(resolve_ws_url("ftp://push.example.com").is_err());
    }
}
