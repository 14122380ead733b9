use crate::audio::CapturedChunk;
use crate::error::LiveError;
use crate::types::{
    BidiGenerateContentClientContent, BidiGenerateContentRealtimeInput,
    BidiGenerateContentToolResponse, Blob, ClientMessagePayload, Content, FunctionResponse, Part,
    Role,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::state::{ConnectionState, transition};

/// Handle to an established live session.
///
/// Everything sent through the handle goes to the connection task over a
/// channel; the task owns the socket.
pub struct LiveClient {
    pub(crate) shutdown_tx: Option<oneshot::Sender<()>>,
    pub(crate) outgoing_sender: Option<mpsc::Sender<ClientMessagePayload>>,
    pub(crate) state: Arc<watch::Sender<ConnectionState>>,
}

impl LiveClient {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Tears the connection down. Calling it again does nothing.
    pub fn close(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        info!("[ClientHandle] Close requested.");
        if !self.state().is_terminal() {
            let _ = transition(&self.state, ConnectionState::Closing);
        }
        if tx.send(()).is_err() {
            info!("[ClientHandle] Shutdown signal failed: connection task already gone.");
            if !self.state().is_terminal() {
                let _ = transition(&self.state, ConnectionState::Closed);
            }
        } else {
            info!("[ClientHandle] Shutdown signal sent to connection task.");
        }
        self.outgoing_sender.take();
    }

    async fn send_message(&self, payload: ClientMessagePayload) -> Result<(), LiveError> {
        match self.state() {
            ConnectionState::Open => {}
            ConnectionState::Idle | ConnectionState::Connecting => return Err(LiveError::NotReady),
            _ => return Err(LiveError::ClosedSession),
        }
        let Some(sender) = &self.outgoing_sender else {
            debug!("[ClientHandle] Cannot send message: client is closed.");
            return Err(LiveError::ClosedSession);
        };
        sender.send(payload).await.map_err(|_| {
            debug!("[ClientHandle] Failed to send message: connection task is gone.");
            LiveError::ClosedSession
        })
    }

    pub async fn send_audio_chunk(&self, chunk: &CapturedChunk) -> Result<(), LiveError> {
        if chunk.samples.is_empty() {
            return Ok(());
        }
        let realtime_input = BidiGenerateContentRealtimeInput {
            audio: Some(Blob {
                mime_type: chunk.mime_type(),
                data: chunk.to_base64(),
            }),
            ..Default::default()
        };
        self.send_message(ClientMessagePayload::RealtimeInput(realtime_input))
            .await
    }

    pub async fn send_tool_response(
        &self,
        responses: Vec<FunctionResponse>,
    ) -> Result<(), LiveError> {
        if responses.is_empty() {
            return Ok(());
        }
        self.send_message(ClientMessagePayload::ToolResponse(
            BidiGenerateContentToolResponse {
                function_responses: responses,
            },
        ))
        .await
    }

    pub async fn send_text_turn(&self, text: String, end_of_turn: bool) -> Result<(), LiveError> {
        let content = Content {
            parts: vec![Part {
                text: Some(text),
                ..Default::default()
            }],
            role: Some(Role::User),
        };
        let client_content_msg = BidiGenerateContentClientContent {
            turns: Some(vec![content]),
            turn_complete: Some(end_of_turn),
        };
        self.send_message(ClientMessagePayload::ClientContent(client_content_msg))
            .await
    }

    /// Tells the server the microphone stream has ended.
    pub async fn send_audio_stream_end(&self) -> Result<(), LiveError> {
        info!("[ClientHandle] Sending audio stream end signal.");
        let end_stream_msg = BidiGenerateContentRealtimeInput {
            audio_stream_end: Some(true),
            ..Default::default()
        };
        self.send_message(ClientMessagePayload::RealtimeInput(end_stream_msg))
            .await
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            warn!("[ClientHandle] Dropped without explicit close(). Signalling shutdown.");
            self.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::sync::Once;
    use tracing::Level;
    use tracing_subscriber::EnvFilter;

    pub(crate) fn init_test_logger() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::builder()
                        .with_default_directive(Level::INFO.into())
                        .from_env_lossy(),
                )
                .with_test_writer()
                .try_init();
        });
    }

    pub(crate) struct DetachedClient {
        pub client: LiveClient,
        pub outgoing_rx: mpsc::Receiver<ClientMessagePayload>,
        pub shutdown_rx: oneshot::Receiver<()>,
    }

    /// An open client with no socket behind it.
    pub(crate) fn detached_client(capacity: usize) -> DetachedClient {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state, _) = watch::channel(ConnectionState::Open);
        DetachedClient {
            client: LiveClient {
                shutdown_tx: Some(shutdown_tx),
                outgoing_sender: Some(outgoing_tx),
                state: Arc::new(state),
            },
            outgoing_rx,
            shutdown_rx,
        }
    }
}
