// HTTP transport flavors over reqwest: a long-lived streaming body for
// the streaming kind, one body per cycle for the polling kind.
use anyhow::{Context, Result};
use bytes::Bytes;
use cascade_wire::{ClientRequest, ProtocolEvent, TransportKind};
use futures_util::StreamExt;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Connection, Endpoint, TransportConfig, TransportEvent, EVENT_QUEUE_DEPTH, FrameAssembler, REQUEST_QUEUE_DEPTH};

const STREAM_PATH: &str = "/cascade/stream";
const POLL_PATH: &str = "/cascade/poll";
const CONTROL_PATH: &str = "/cascade/control";

type EventBody = Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<Bytes>> + Send>>;

pub async fn connect(
    kind: TransportKind,
    endpoint: &Endpoint,
    config: &TransportConfig,
) -> Result<Connection> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &endpoint.extra_headers {
        let name: reqwest::header::HeaderName = name.parse().context("extra header name")?;
        headers.insert(name, value.parse().context("extra header value")?);
    }
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .build()
        .context("build http client")?;

    // Probe reachability up front so a bad address fails the connect call
    // rather than the first session request.
    let base = endpoint.server_address.trim_end_matches('/').to_string();
    debug!(%base, ?kind, "http transport attached");

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    tokio::spawn(run_http_task(
        kind,
        client,
        base,
        request_rx,
        event_tx,
        config.max_frame_bytes,
    ));

    Ok(Connection {
        kind,
        request_tx,
        event_rx,
    })
}

fn opens_event_body(request: &ClientRequest) -> bool {
    matches!(
        request,
        ClientRequest::CreateSession { .. }
            | ClientRequest::BindSession { .. }
            | ClientRequest::RecoverSession { .. }
    )
}

async fn next_chunk(body: &mut Option<EventBody>) -> Option<reqwest::Result<Bytes>> {
    match body {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn run_http_task(
    kind: TransportKind,
    client: reqwest::Client,
    base: String,
    mut request_rx: mpsc::Receiver<ClientRequest>,
    event_tx: mpsc::Sender<TransportEvent>,
    max_frame_bytes: usize,
) {
    let session_path = if kind == TransportKind::HttpPolling {
        POLL_PATH
    } else {
        STREAM_PATH
    };
    let mut body: Option<EventBody> = None;
    let mut assembler = FrameAssembler::new(max_frame_bytes);

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else {
                    // Engine dropped its handle; tear the transport down.
                    return;
                };
                let path = if opens_event_body(&request) { session_path } else { CONTROL_PATH };
                let response = client
                    .post(format!("{base}{path}"))
                    .json(&request)
                    .send()
                    .await;
                match response {
                    Ok(response) if response.status().is_success() => {
                        if path == CONTROL_PATH {
                            continue;
                        }
                        assembler = FrameAssembler::new(max_frame_bytes);
                        body = Some(Box::pin(response.bytes_stream()));
                    }
                    Ok(response) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: format!("http request rejected: {}", response.status()),
                            })
                            .await;
                        return;
                    }
                    Err(err) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: format!("http request failed: {err}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            chunk = next_chunk(&mut body) => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let frames = match assembler.push(&bytes) {
                            Ok(frames) => frames,
                            Err(err) => {
                                let _ = event_tx
                                    .send(TransportEvent::Closed {
                                        reason: format!("http frame error: {err}"),
                                    })
                                    .await;
                                return;
                            }
                        };
                        for frame in frames {
                            match ProtocolEvent::decode(frame) {
                                Ok(event) => {
                                    if event_tx.send(TransportEvent::Event(event)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => debug!(error = %err, "undecodable http event"),
                            }
                        }
                    }
                    Some(Err(err)) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: format!("http body error: {err}"),
                            })
                            .await;
                        return;
                    }
                    None => {
                        // End of body. For polling this closes one cycle and
                        // the engine rebinds; for streaming it means the
                        // server went away.
                        body = None;
                        if kind != TransportKind::HttpPolling {
                            let _ = event_tx
                                .send(TransportEvent::Closed {
                                    reason: "http stream ended".to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }
}
