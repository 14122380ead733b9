use crate::client::{LIVE_API_ENDPOINT, LiveClientBuilder};
use crate::tools::ToolRegistry;
use crate::types::Content;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly and helpful conversational AI assistant specializing in media analysis and enhancement.";
/// 4096 frames at 16 kHz, about 256 ms per chunk.
pub const DEFAULT_CAPTURE_CHUNK_FRAMES: usize = 4096;

/// Static configuration of a live conversation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LiveSessionSettings {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub endpoint: String,
    pub setup_timeout_secs: u64,
    pub capture_chunk_frames: usize,
    pub event_capacity: usize,
    /// Captured chunks waiting to be sent. Chunks beyond this are dropped.
    pub capture_queue_capacity: usize,
}

impl Default for LiveSessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_transcription: true,
            output_transcription: true,
            endpoint: LIVE_API_ENDPOINT.to_string(),
            setup_timeout_secs: 15,
            capture_chunk_frames: DEFAULT_CAPTURE_CHUNK_FRAMES,
            event_capacity: 256,
            capture_queue_capacity: 32,
        }
    }
}

impl LiveSessionSettings {
    /// Defaults overlaid with `GEMINI_LIVE_MODEL`, `GEMINI_LIVE_VOICE` and
    /// `GEMINI_LIVE_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(model) = read("GEMINI_LIVE_MODEL") {
            debug!("[Conversation] Model overridden from environment: {}", model);
            settings.model = model;
        }
        if let Some(voice) = read("GEMINI_LIVE_VOICE") {
            settings.voice = voice;
        }
        if let Some(endpoint) = read("GEMINI_LIVE_ENDPOINT") {
            settings.endpoint = endpoint;
        }
        settings
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    /// The open request for one session.
    pub fn client_builder(&self, api_key: SecretString, tools: &ToolRegistry) -> LiveClientBuilder {
        let mut builder = LiveClientBuilder::new(api_key, self.model.clone())
            .voice(self.voice.clone())
            .system_instruction(Content::text(self.system_instruction.clone()))
            .input_audio_transcription(self.input_transcription)
            .output_audio_transcription(self.output_transcription)
            .endpoint(self.endpoint.clone())
            .setup_timeout(self.setup_timeout())
            .event_capacity(self.event_capacity);
        for declaration in tools.declarations() {
            builder = builder.add_tool_declaration(declaration.clone());
        }
        builder
    }
}
