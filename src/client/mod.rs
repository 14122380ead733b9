pub mod builder;
pub mod handle;
pub mod state;

mod connection;

pub use builder::{LiveClientBuilder, PendingSession};
pub use handle::LiveClient;
pub use state::ConnectionState;

/// Default BidiGenerateContent WebSocket endpoint.
pub const LIVE_API_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Sample rate (16kHz) the Live API accepts for audio sent to it.
pub const LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT: u32 = 16000;
/// Number of audio channels (mono) the Live API accepts for audio sent to it.
pub const LIVE_AUDIO_CHANNELS_INPUT: u16 = 1;
/// Sample rate (24kHz) of audio the Live API sends back.
pub const LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT: u32 = 24000;
/// Number of audio channels (mono) of audio the Live API sends back.
pub const LIVE_AUDIO_CHANNELS_OUTPUT: u16 = 1;
