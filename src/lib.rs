//! Live, bidirectional voice conversations with the Gemini Live API.
//!
//! [`LiveConversation`] wires a microphone, a speaker and local function
//! tools to one BidiGenerateContent session. The lower layers are usable on
//! their own: [`client`] speaks the WebSocket protocol, [`audio`] converts and
//! schedules PCM, and [`transcription`] folds streamed transcripts into turns.

pub mod audio;
pub mod client;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod grounding;
pub mod tools;
pub mod transcription;
pub mod types;

pub use client::{ConnectionState, LiveClient, LiveClientBuilder, PendingSession};
pub use config::LiveSessionSettings;
pub use conversation::{LiveConversation, SessionConnector, SessionStatus, WebSocketConnector};
pub use credentials::{CredentialGate, EnvCredentials, StaticCredentials};
pub use error::LiveError;
pub use tools::{ToolHandler, ToolOutcome, ToolRegistry, default_registry};
pub use transcription::{ChatMessage, Speaker, TranscriptionReconciler};
pub use types::*;

#[cfg(feature = "device-audio")]
pub use audio::device::SystemAudio;
