use super::connection::{ConnectionChannels, ConnectionParams, spawn_connection_task};
use super::handle::LiveClient;
use super::state::ConnectionState;
use super::LIVE_API_ENDPOINT;
use crate::error::LiveError;
use crate::types::*;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_EVENT_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 100;

pub struct LiveClientBuilder {
    pub(crate) api_key: SecretString,
    pub(crate) endpoint: String,
    pub(crate) initial_setup: BidiGenerateContentSetup,
    pub(crate) setup_timeout: Duration,
    pub(crate) event_capacity: usize,
}

impl LiveClientBuilder {
    /// `model` may be given with or without the `models/` prefix.
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        let model = model.into();
        let model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{}", model)
        };
        Self {
            api_key,
            endpoint: LIVE_API_ENDPOINT.to_string(),
            initial_setup: BidiGenerateContentSetup {
                model,
                ..Default::default()
            },
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn generation_config(mut self, config: GenerationConfig) -> Self {
        self.initial_setup.generation_config = Some(config);
        self
    }

    /// Requests spoken audio responses in the given prebuilt voice.
    pub fn voice(mut self, voice_name: impl Into<String>) -> Self {
        let config = self
            .initial_setup
            .generation_config
            .get_or_insert_with(GenerationConfig::default);
        config.response_modalities = Some(vec![ResponseModality::Audio]);
        config.speech_config = Some(SpeechConfig::prebuilt(voice_name));
        self
    }

    pub fn response_modalities(mut self, modalities: Vec<ResponseModality>) -> Self {
        self.initial_setup
            .generation_config
            .get_or_insert_with(GenerationConfig::default)
            .response_modalities = Some(modalities);
        self
    }

    pub fn system_instruction(mut self, instruction: Content) -> Self {
        self.initial_setup.system_instruction = Some(instruction);
        self
    }

    pub fn input_audio_transcription(mut self, enabled: bool) -> Self {
        self.initial_setup.input_audio_transcription =
            enabled.then(AudioTranscriptionConfig::default);
        self
    }

    pub fn output_audio_transcription(mut self, enabled: bool) -> Self {
        self.initial_setup.output_audio_transcription =
            enabled.then(AudioTranscriptionConfig::default);
        self
    }

    pub fn add_tool_declaration(mut self, declaration: FunctionDeclaration) -> Self {
        let tools_vec = self.initial_setup.tools.get_or_insert_with(Vec::new);
        if let Some(tool_struct) = tools_vec.first_mut() {
            tool_struct.function_declarations.push(declaration);
        } else {
            tools_vec.push(Tool {
                function_declarations: vec![declaration],
            });
        }
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn setup(&self) -> &BidiGenerateContentSetup {
        &self.initial_setup
    }

    /// Starts connecting in the background. Must be called inside a tokio
    /// runtime.
    pub fn open(self) -> Result<PendingSession, LiveError> {
        let url = Url::parse_with_params(&self.endpoint, &[("key", self.api_key.expose_secret())])?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (outgoing_sender, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(self.event_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let state = Arc::new(state_tx);

        info!(
            "[ClientHandle] Opening live session for {}.",
            self.initial_setup.model
        );
        let task = spawn_connection_task(
            ConnectionParams {
                url,
                setup: self.initial_setup,
                setup_timeout: self.setup_timeout,
            },
            ConnectionChannels {
                state: state.clone(),
                ready_tx,
                shutdown_rx,
                outgoing_rx,
                event_tx,
            },
        );

        Ok(PendingSession {
            ready_rx,
            resolved: false,
            task: Some(task),
            parts: Some((
                LiveClient {
                    shutdown_tx: Some(shutdown_tx),
                    outgoing_sender: Some(outgoing_sender),
                    state,
                },
                event_rx,
            )),
        })
    }

    /// Opens the session and waits for the server's acknowledgement.
    pub async fn connect(self) -> Result<(LiveClient, mpsc::Receiver<ServerEvent>), LiveError> {
        let mut pending = self.open()?;
        pending.established().await
    }
}

/// A connection attempt that has not been acknowledged yet.
///
/// Dropping it before [`PendingSession::established`] resolves aborts the
/// attempt.
pub struct PendingSession {
    ready_rx: oneshot::Receiver<Result<(), LiveError>>,
    resolved: bool,
    task: Option<JoinHandle<()>>,
    parts: Option<(LiveClient, mpsc::Receiver<ServerEvent>)>,
}

impl PendingSession {
    pub fn state(&self) -> ConnectionState {
        self.parts
            .as_ref()
            .map(|(client, _)| client.state())
            .unwrap_or(ConnectionState::Closed)
    }

    /// Resolves once the server sends `setupComplete`.
    ///
    /// Cancel-safe: if the future is dropped early it can be awaited again.
    /// After it has resolved once, later calls return `ClosedSession`.
    pub async fn established(
        &mut self,
    ) -> Result<(LiveClient, mpsc::Receiver<ServerEvent>), LiveError> {
        if self.resolved {
            return Err(LiveError::ClosedSession);
        }
        let outcome = (&mut self.ready_rx).await;
        self.resolved = true;
        // From here on the connection task belongs to the client.
        self.task.take();

        match outcome {
            Ok(Ok(())) => {
                debug!("[ClientHandle] Session established.");
                self.parts.take().ok_or(LiveError::ClosedSession)
            }
            Ok(Err(e)) => {
                self.parts.take();
                Err(e)
            }
            Err(_) => {
                self.parts.take();
                Err(LiveError::Connection(
                    "Connection task ended before the session was acknowledged".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
impl PendingSession {
    /// A pending session with no connection task; the test resolves it
    /// through `ready_rx`'s sender.
    pub(crate) fn detached(
        ready_rx: oneshot::Receiver<Result<(), LiveError>>,
        client: LiveClient,
        events: mpsc::Receiver<ServerEvent>,
    ) -> Self {
        Self {
            ready_rx,
            resolved: false,
            task: None,
            parts: Some((client, events)),
        }
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("[ClientHandle] Aborting unresolved connection attempt.");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> LiveClientBuilder {
        LiveClientBuilder::new(SecretString::from("test-key".to_string()), "gemini-test")
    }

    #[test]
    fn test_model_gets_models_prefix_once() {
        assert_eq!(builder().setup().model, "models/gemini-test");
        let prefixed =
            LiveClientBuilder::new(SecretString::from("k".to_string()), "models/gemini-test");
        assert_eq!(prefixed.setup().model, "models/gemini-test");
    }

    #[test]
    fn test_voice_requests_audio_modality() {
        let b = builder()
            .voice("Zephyr")
            .input_audio_transcription(true)
            .output_audio_transcription(false);
        let config = b.setup().generation_config.as_ref().unwrap();
        assert_eq!(
            config.response_modalities,
            Some(vec![ResponseModality::Audio])
        );
        assert_eq!(config.speech_config, Some(SpeechConfig::prebuilt("Zephyr")));
        assert!(b.setup().input_audio_transcription.is_some());
        assert!(b.setup().output_audio_transcription.is_none());
    }

    #[test]
    fn test_tool_declarations_share_one_tool_entry() {
        let decl = |name: &str| FunctionDeclaration {
            name: name.into(),
            description: "d".into(),
            parameters: None,
        };
        let b = builder()
            .add_tool_declaration(decl("a"))
            .add_tool_declaration(decl("b"));
        let tools = b.setup().tools.as_ref().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function_declarations.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_fails_synchronously() {
        let result = builder().endpoint("not a url").open();
        assert!(matches!(result, Err(LiveError::Url(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_establishment() {
        // Nothing listens on port 1.
        let mut pending = builder()
            .endpoint("ws://127.0.0.1:1/ws")
            .setup_timeout(Duration::from_secs(5))
            .open()
            .unwrap();
        let result = pending.established().await;
        assert!(matches!(result, Err(LiveError::Connection(_))));
        assert!(matches!(
            pending.established().await,
            Err(LiveError::ClosedSession)
        ));
    }
}
