//! The live conversation controller.
//!
//! [`LiveConversation`] owns one session at a time together with its
//! microphone, speaker, transcripts and tool tasks. Every source of work
//! (connection setup, server events, captured chunks, finished playback,
//! finished tool calls) is awaited in [`LiveConversation::poll_once`] and
//! handled there, one wakeup at a time, so the state is only ever touched
//! from one place.

use crate::audio::{
    AudioDevices, CapturePipeline, CapturedChunk, PlaybackChunk, PlaybackScheduler, SourceId,
};
use crate::client::{LiveClient, LiveClientBuilder, PendingSession};
use crate::config::LiveSessionSettings;
use crate::credentials::{CredentialGate, ensure_api_key};
use crate::error::LiveError;
use crate::tools::{ToolOutcome, ToolRegistry};
use crate::transcription::{ChatMessage, Speaker, TranscriptionReconciler};
use crate::types::{FunctionCall, FunctionResponse, ServerEvent};
use futures_util::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Inactive,
    Connecting,
    Active,
}

/// Opens the transport for a session.
pub trait SessionConnector: Send + Sync {
    fn open(&self, request: LiveClientBuilder) -> Result<PendingSession, LiveError>;
}

/// Connects to the endpoint named in the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl SessionConnector for WebSocketConnector {
    fn open(&self, request: LiveClientBuilder) -> Result<PendingSession, LiveError> {
        request.open()
    }
}

type Established = Result<(LiveClient, mpsc::Receiver<ServerEvent>), LiveError>;

enum Wakeup {
    Established(Established),
    Event(Option<ServerEvent>),
    ToolDone(Result<ToolOutcome, JoinError>),
    SourceEnded(Option<SourceId>),
    Chunk(Option<CapturedChunk>),
}

async fn next_established(pending: &mut Option<PendingSession>) -> Established {
    match pending {
        Some(pending) => pending.established().await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ServerEvent>>) -> Option<ServerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_ended(ended: &mut Option<mpsc::UnboundedReceiver<SourceId>>) -> Option<SourceId> {
    match ended {
        Some(ended) => ended.recv().await,
        None => std::future::pending().await,
    }
}

struct ActiveSession {
    pending: Option<PendingSession>,
    client: Option<LiveClient>,
    events: Option<mpsc::Receiver<ServerEvent>>,
    capture: CapturePipeline,
    chunk_tx: mpsc::Sender<CapturedChunk>,
    chunk_rx: mpsc::Receiver<CapturedChunk>,
    playback: PlaybackScheduler,
    ended_rx: Option<mpsc::UnboundedReceiver<SourceId>>,
    tool_tasks: JoinSet<ToolOutcome>,
}

impl ActiveSession {
    async fn next_wakeup(&mut self) -> Wakeup {
        let has_tool_tasks = !self.tool_tasks.is_empty();
        tokio::select! {
            biased;
            result = next_established(&mut self.pending) => Wakeup::Established(result),
            event = next_event(&mut self.events) => Wakeup::Event(event),
            Some(done) = self.tool_tasks.join_next(), if has_tool_tasks => Wakeup::ToolDone(done),
            id = next_ended(&mut self.ended_rx) => Wakeup::SourceEnded(id),
            chunk = self.chunk_rx.recv() => Wakeup::Chunk(chunk),
        }
    }

    fn spawn_tool(&mut self, tools: &ToolRegistry, call: FunctionCall) {
        let id = call.id.clone();
        let name = call.name.clone();
        let dispatch = tools.dispatch(call);
        self.tool_tasks.spawn(async move {
            match AssertUnwindSafe(dispatch).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let text = format!("Function {} failed: handler panicked", name);
                    ToolOutcome {
                        response: FunctionResponse {
                            id,
                            name,
                            response: json!({ "result": text }),
                        },
                        status: text,
                    }
                }
            }
        });
    }

    /// Releases everything the session holds. Each step runs even if an
    /// earlier one failed.
    fn teardown(&mut self) {
        if self.pending.take().is_some() {
            debug!("[Conversation] Aborted pending connection.");
        }
        if !self.tool_tasks.is_empty() {
            debug!(
                "[Conversation] Aborting {} pending tool calls.",
                self.tool_tasks.len()
            );
            self.tool_tasks.abort_all();
        }
        if let Err(e) = self.capture.stop() {
            warn!("[Conversation] Failed to stop capture: {}", e);
        }
        if let Err(e) = self.playback.shutdown() {
            warn!("[Conversation] Failed to close audio output: {}", e);
        }
        if let Some(mut client) = self.client.take() {
            client.close();
        }
        self.events.take();
        self.ended_rx.take();
    }
}

/// A live audio conversation with one remote model.
pub struct LiveConversation {
    settings: LiveSessionSettings,
    devices: Arc<dyn AudioDevices>,
    credentials: Arc<dyn CredentialGate>,
    connector: Arc<dyn SessionConnector>,
    tools: ToolRegistry,
    status: SessionStatus,
    error: Option<String>,
    tool_status: Option<String>,
    transcripts: TranscriptionReconciler,
    session: Option<ActiveSession>,
}

impl LiveConversation {
    pub fn new(
        settings: LiveSessionSettings,
        devices: Arc<dyn AudioDevices>,
        credentials: Arc<dyn CredentialGate>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            settings,
            devices,
            credentials,
            connector: Arc::new(WebSocketConnector),
            tools,
            status: SessionStatus::Inactive,
            error: None,
            tool_status: None,
            transcripts: TranscriptionReconciler::new(),
            session: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn settings(&self) -> &LiveSessionSettings {
        &self.settings
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Last user-visible error.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Last function-call status line.
    pub fn tool_status(&self) -> Option<&str> {
        self.tool_status.as_deref()
    }

    pub fn live_messages(&self) -> &[ChatMessage] {
        self.transcripts.live_messages()
    }

    pub fn history(&self) -> &[ChatMessage] {
        self.transcripts.history()
    }

    /// Starts a session. Credential and device failures are reported before
    /// any network activity and leave the conversation inactive.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), LiveError> {
        if self.status != SessionStatus::Inactive {
            return Err(LiveError::AlreadyActive);
        }
        self.transcripts.reset();
        self.error = None;
        self.tool_status = None;

        match self.open_session() {
            Ok(session) => {
                info!("[Conversation] Live session connecting.");
                self.session = Some(session);
                self.status = SessionStatus::Connecting;
                Ok(())
            }
            Err(e) => {
                error!("[Conversation] Failed to start live session: {}", e);
                self.error = Some(format!("Failed to start live session: {}", e));
                self.status = SessionStatus::Inactive;
                Err(e)
            }
        }
    }

    fn open_session(&self) -> Result<ActiveSession, LiveError> {
        let api_key = ensure_api_key(self.credentials.as_ref())?;

        let mut capture = CapturePipeline::new(
            self.devices.open_capture()?,
            self.settings.capture_chunk_frames,
        );
        capture.acquire()?;

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let playback = PlaybackScheduler::new(self.devices.open_output(ended_tx)?);

        let pending = self
            .connector
            .open(self.settings.client_builder(api_key, &self.tools))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(self.settings.capture_queue_capacity.max(1));
        Ok(ActiveSession {
            pending: Some(pending),
            client: None,
            events: None,
            capture,
            chunk_tx,
            chunk_rx,
            playback,
            ended_rx: Some(ended_rx),
            tool_tasks: JoinSet::new(),
        })
    }

    /// Waits for and handles the next piece of work. Returns `false` once the
    /// conversation is inactive.
    pub async fn poll_once(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let wakeup = session.next_wakeup().await;
        self.handle_wakeup(wakeup).await;
        self.session.is_some()
    }

    /// Runs until the session ends.
    pub async fn run(&mut self) {
        while self.poll_once().await {}
    }

    /// Tears the session down. Safe to call in any state and more than once.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("[Conversation] Stopping live session.");
            session.teardown();
        }
        self.status = SessionStatus::Inactive;
    }

    fn fail(&mut self, message: String) {
        error!("[Conversation] {}", message);
        self.error = Some(message);
        self.stop();
    }

    async fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Established(Ok((client, events))) => self.on_established(client, events),
            Wakeup::Established(Err(e)) => {
                self.fail(format!("Failed to establish live session: {}", e));
            }
            Wakeup::Event(Some(event)) => self.handle_event(event).await,
            Wakeup::Event(None) => {
                self.handle_event(ServerEvent::Closed {
                    code: None,
                    reason: "event stream ended".into(),
                })
                .await
            }
            Wakeup::ToolDone(Ok(outcome)) => self.on_tool_done(outcome).await,
            Wakeup::ToolDone(Err(e)) => {
                if e.is_cancelled() {
                    debug!("[Conversation] Tool task cancelled.");
                } else {
                    error!("[Conversation] Tool task failed: {}", e);
                }
            }
            Wakeup::SourceEnded(Some(id)) => {
                if let Some(session) = self.session.as_mut() {
                    session.playback.on_source_ended(id);
                }
            }
            Wakeup::SourceEnded(None) => {
                if let Some(session) = self.session.as_mut() {
                    session.ended_rx = None;
                }
            }
            Wakeup::Chunk(Some(chunk)) => self.send_chunk(chunk).await,
            Wakeup::Chunk(None) => {}
        }
    }

    fn on_established(&mut self, client: LiveClient, events: mpsc::Receiver<ServerEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.pending = None;
        session.client = Some(client);
        session.events = Some(events);
        let chunk_tx = session.chunk_tx.clone();
        match session.capture.start(chunk_tx) {
            Ok(()) => {
                info!("[Conversation] Live session opened.");
                self.status = SessionStatus::Active;
            }
            Err(e) => self.fail(format!("Failed to start live session: {}", e)),
        }
    }

    async fn send_chunk(&mut self, chunk: CapturedChunk) {
        let Some(client) = self.session.as_ref().and_then(|s| s.client.as_ref()) else {
            return;
        };
        match client.send_audio_chunk(&chunk).await {
            Ok(()) => trace!("[Conversation] Sent {} frames.", chunk.samples.len()),
            Err(e) if e.is_benign() => debug!("[Conversation] Dropped chunk: {}", e),
            Err(e) => warn!("[Conversation] Failed to send audio chunk: {}", e),
        }
    }

    async fn on_tool_done(&mut self, outcome: ToolOutcome) {
        self.tool_status = Some(outcome.status);
        let Some(client) = self.session.as_ref().and_then(|s| s.client.as_ref()) else {
            return;
        };
        match client.send_tool_response(vec![outcome.response]).await {
            Ok(()) => debug!("[Conversation] Tool response sent."),
            Err(e) if e.is_benign() => debug!("[Conversation] Tool response dropped: {}", e),
            Err(e) => warn!("[Conversation] Failed to send tool response: {}", e),
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        if event.is_terminal() {
            self.fail(terminal_message(event));
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            ServerEvent::SetupComplete => {}
            ServerEvent::Audio(blob) => match PlaybackChunk::from_blob(&blob) {
                Ok(chunk) => {
                    if let Err(e) = session.playback.enqueue(&chunk) {
                        warn!("[Conversation] Could not schedule audio: {}", e);
                    }
                }
                Err(e) => {
                    error!("[Conversation] Error decoding audio: {}", e);
                    self.error = Some("Error playing audio response.".into());
                }
            },
            ServerEvent::InputTranscription(text) => {
                self.transcripts.on_fragment(Speaker::User, &text);
            }
            ServerEvent::OutputTranscription(text) => {
                self.transcripts.on_fragment(Speaker::Model, &text);
            }
            ServerEvent::TurnComplete => {
                let completed = self.transcripts.on_turn_complete();
                debug!("[Conversation] Turn complete ({} new turns).", completed.len());
            }
            ServerEvent::GenerationComplete => debug!("[Conversation] Generation complete."),
            ServerEvent::Interrupted => {
                info!("[Conversation] Model response interrupted.");
                session.playback.interrupt();
            }
            ServerEvent::ToolCall(calls) => {
                self.tool_status = Some("Function call received...".into());
                for call in calls {
                    debug!("[Conversation] Function call: {:?}", call);
                    session.spawn_tool(&self.tools, call);
                }
            }
            ServerEvent::ToolCallCancellation(ids) => {
                debug!(
                    "[Conversation] Server cancelled tool calls {:?}; results will still be sent.",
                    ids
                );
            }
            ServerEvent::UsageMetadata(usage) => debug!("[Conversation] Usage: {:?}", usage),
            ServerEvent::GoAway(time_left) => {
                warn!(
                    "[Conversation] Server will close the session soon (time left: {:?}).",
                    time_left
                );
            }
            ServerEvent::Error(_) | ServerEvent::Closed { .. } => {}
        }
    }
}

/// User-visible message for an event that ends the session.
fn terminal_message(event: ServerEvent) -> String {
    match event {
        ServerEvent::Error(message) => format!("Live session error: {}", message),
        ServerEvent::Closed { code, reason } => {
            debug!("[Conversation] Live session closed: {:?} {}", code, reason);
            let code = code.map_or_else(|| "Unknown".to_string(), |c| c.to_string());
            format!("Live session closed unexpectedly: Code {}", code)
        }
        other => format!("Live session ended: {:?}", other),
    }
}

impl Drop for LiveConversation {
    fn drop(&mut self) {
        self.stop();
    }
}
