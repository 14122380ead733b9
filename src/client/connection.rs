use super::state::{ConnectionState, transition};
use crate::error::LiveError;
use crate::types::{BidiGenerateContentSetup, ClientMessagePayload, ServerEvent, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct ConnectionParams {
    pub(crate) url: Url,
    pub(crate) setup: BidiGenerateContentSetup,
    pub(crate) setup_timeout: Duration,
}

pub(crate) struct ConnectionChannels {
    pub(crate) state: Arc<watch::Sender<ConnectionState>>,
    pub(crate) ready_tx: oneshot::Sender<Result<(), LiveError>>,
    pub(crate) shutdown_rx: oneshot::Receiver<()>,
    pub(crate) outgoing_rx: mpsc::Receiver<ClientMessagePayload>,
    pub(crate) event_tx: mpsc::Sender<ServerEvent>,
}

fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("[Connection] A rustls crypto provider was already installed.");
        }
    });
}

/// The endpoint without its query string, which carries the API key.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

fn describe_close(frame: Option<CloseFrame>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
        None => (None, String::new()),
    }
}

/// `None` for control frames that carry no JSON.
fn parse_frame(message: Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match message {
        Message::Text(text) => Some(serde_json::from_str(&text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(&bytes)),
        _ => None,
    }
}

pub(crate) fn spawn_connection_task(
    params: ConnectionParams,
    channels: ConnectionChannels,
) -> JoinHandle<()> {
    tokio::spawn(run_connection(params, channels))
}

async fn run_connection(params: ConnectionParams, channels: ConnectionChannels) {
    let ConnectionChannels {
        state,
        ready_tx,
        shutdown_rx,
        outgoing_rx,
        event_tx,
    } = channels;

    if let Err(e) = transition(&state, ConnectionState::Connecting) {
        let _ = ready_tx.send(Err(LiveError::Connection(e.to_string())));
        return;
    }

    let established = tokio::time::timeout(params.setup_timeout, establish(&params)).await;
    let mut ws = match established {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            error!("[Connection] Failed to establish live session: {}", e);
            let _ = transition(&state, ConnectionState::Errored);
            let _ = ready_tx.send(Err(e));
            return;
        }
        Err(_) => {
            error!(
                "[Connection] Timed out after {:?} waiting for setupComplete.",
                params.setup_timeout
            );
            let _ = transition(&state, ConnectionState::Errored);
            let _ = ready_tx.send(Err(LiveError::Connection(format!(
                "Timed out after {:?} waiting for setupComplete",
                params.setup_timeout
            ))));
            return;
        }
    };

    if transition(&state, ConnectionState::Open).is_err() {
        info!("[Connection] Session was closed while connecting.");
        let _ = ws.close(None).await;
        let _ = transition(&state, ConnectionState::Closed);
        let _ = ready_tx.send(Err(LiveError::Connection(
            "Session closed before it was established".into(),
        )));
        return;
    }
    if ready_tx.send(Ok(())).is_err() {
        info!("[Connection] Nobody is waiting for the session anymore. Closing.");
        let _ = ws.close(None).await;
        let _ = transition(&state, ConnectionState::Closing);
        let _ = transition(&state, ConnectionState::Closed);
        return;
    }

    process_messages(ws, &state, shutdown_rx, outgoing_rx, event_tx).await;
    debug!("[Connection] Connection task finished.");
}

async fn establish(params: &ConnectionParams) -> Result<WsStream, LiveError> {
    ensure_crypto_provider();
    info!("[Connection] Connecting to {}", redacted(&params.url));

    let (mut ws, _response) = connect_async(params.url.as_str())
        .await
        .map_err(|e| LiveError::Connection(format!("Failed to connect: {}", e)))?;

    let setup_json = serde_json::to_string(&ClientMessagePayload::Setup(params.setup.clone()))?;
    debug!("[Connection] Sending setup for model {}.", params.setup.model);
    ws.send(Message::Text(setup_json.into()))
        .await
        .map_err(|e| LiveError::Connection(format!("Failed to send setup message: {}", e)))?;

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Close(frame)) => {
                let (code, reason) = describe_close(frame);
                return Err(LiveError::Connection(format!(
                    "Connection closed before setupComplete (code {:?}): {}",
                    code, reason
                )));
            }
            Ok(message) => match parse_frame(message) {
                Some(Ok(server_message)) if server_message.setup_complete.is_some() => {
                    info!("[Connection] Setup complete. Session is open.");
                    return Ok(ws);
                }
                Some(Ok(other)) => debug!("[Connection] Ignoring pre-setup message: {:?}", other),
                Some(Err(e)) => warn!("[Connection] Unparseable frame during setup: {}", e),
                None => {}
            },
            Err(e) => {
                return Err(LiveError::Connection(format!(
                    "WebSocket error before setupComplete: {}",
                    e
                )));
            }
        }
    }
    Err(LiveError::Connection(
        "Stream ended before setupComplete".into(),
    ))
}

fn finish(state: &watch::Sender<ConnectionState>, errored: bool) {
    let current = *state.borrow();
    if errored && current.can_transition_to(ConnectionState::Errored) {
        let _ = transition(state, ConnectionState::Errored);
    } else if current.can_transition_to(ConnectionState::Closed) {
        let _ = transition(state, ConnectionState::Closed);
    }
}

async fn process_messages(
    ws: WsStream,
    state: &watch::Sender<ConnectionState>,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut outgoing_rx: mpsc::Receiver<ClientMessagePayload>,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    let (mut ws_sink, mut ws_stream) = ws.split();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("[Connection] Shutdown requested. Closing socket.");
                let _ = ws_sink.send(Message::Close(None)).await;
                let _ = ws_sink.close().await;
                finish(state, false);
                break;
            }
            outgoing = outgoing_rx.recv() => match outgoing {
                Some(payload) => {
                    let json = match serde_json::to_string(&payload) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("[Connection] Failed to serialize outgoing message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                        error!("[Connection] WebSocket send failed: {}", e);
                        let _ = event_tx.send(ServerEvent::Error(e.to_string())).await;
                        finish(state, true);
                        break;
                    }
                }
                None => {
                    info!("[Connection] All senders dropped. Closing socket.");
                    let _ = ws_sink.close().await;
                    finish(state, false);
                    break;
                }
            },
            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = describe_close(frame);
                    info!("[Connection] Server closed the session (code {:?}): {}", code, reason);
                    let _ = event_tx.send(ServerEvent::Closed { code, reason }).await;
                    finish(state, false);
                    break;
                }
                Some(Ok(message)) => match parse_frame(message) {
                    Some(Ok(server_message)) => {
                        let mut receiver_gone = false;
                        for event in server_message.into_events() {
                            if event == ServerEvent::SetupComplete {
                                continue;
                            }
                            if event_tx.send(event).await.is_err() {
                                receiver_gone = true;
                                break;
                            }
                        }
                        if receiver_gone {
                            debug!("[Connection] Event receiver dropped. Closing socket.");
                            let _ = ws_sink.close().await;
                            finish(state, false);
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("[Connection] Skipping unparseable server frame: {}", e),
                    None => {}
                },
                Some(Err(e)) => {
                    error!("[Connection] WebSocket error: {}", e);
                    let _ = event_tx.send(ServerEvent::Error(e.to_string())).await;
                    finish(state, true);
                    break;
                }
                None => {
                    warn!("[Connection] Server stream ended without a close frame.");
                    let _ = event_tx
                        .send(ServerEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        })
                        .await;
                    finish(state, false);
                    break;
                }
            }
        }
    }
}
