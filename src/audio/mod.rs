pub mod capture;
pub mod codec;
pub mod playback;

#[cfg(feature = "device-audio")]
pub mod device;

#[cfg(feature = "audio-resampling")]
pub(crate) mod resample;

pub use capture::{CapturePipeline, CaptureSource, CapturedChunk, ChunkAccumulator, FrameSink};
pub use playback::{AudioOutput, PlaybackChunk, PlaybackScheduler, ScheduledSource, SourceId};

use crate::error::LiveError;
use tokio::sync::mpsc;

/// Opens the per-session microphone and speaker.
pub trait AudioDevices: Send + Sync {
    fn open_capture(&self) -> Result<Box<dyn CaptureSource>, LiveError>;

    /// `ended` receives the id of every source that finishes on its own.
    fn open_output(
        &self,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, LiveError>;
}
