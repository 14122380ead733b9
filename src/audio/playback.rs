use super::codec::{decode_bytes, pcm16_to_float, sample_rate_from_mime};
use crate::client::{LIVE_AUDIO_CHANNELS_OUTPUT, LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT};
use crate::error::LiveError;
use crate::types::Blob;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub type SourceId = u64;

/// Decoded inbound audio, one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl PlaybackChunk {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Decodes an inbound audio blob. The rate comes from the mime type and
    /// falls back to 24 kHz.
    pub fn from_blob(blob: &Blob) -> Result<Self, LiveError> {
        let sample_rate =
            sample_rate_from_mime(&blob.mime_type).unwrap_or(LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT);
        let bytes = decode_bytes(&blob.data)?;
        let channels = pcm16_to_float(&bytes, LIVE_AUDIO_CHANNELS_OUTPUT)?;
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// Audio output with its own clock, in seconds.
///
/// Implementations report natural completion of a source by sending its id on
/// the channel they were opened with; see [`crate::audio::AudioDevices`].
pub trait AudioOutput: Send {
    fn current_time(&self) -> f64;
    fn start(&mut self, id: SourceId, chunk: &PlaybackChunk, at: f64) -> Result<(), LiveError>;
    fn stop(&mut self, id: SourceId) -> Result<(), LiveError>;
    fn close(&mut self) -> Result<(), LiveError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

/// Schedules chunks back to back on an [`AudioOutput`].
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    active: BTreeSet<SourceId>,
    next_id: SourceId,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: BTreeSet::new(),
            next_id: 1,
            closed: false,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains(&id)
    }

    pub fn enqueue(&mut self, chunk: &PlaybackChunk) -> Result<ScheduledSource, LiveError> {
        if self.closed {
            return Err(LiveError::ClosedSession);
        }
        let now = self.output.current_time();
        self.next_start_time = self.next_start_time.max(now);

        let id = self.next_id;
        self.next_id += 1;
        let start = self.next_start_time;
        let duration = chunk.duration();
        self.output.start(id, chunk, start)?;

        self.next_start_time += duration;
        self.active.insert(id);
        debug!(
            "[Playback] Scheduled source {} at {:.3}s for {:.3}s ({} active).",
            id,
            start,
            duration,
            self.active.len()
        );
        Ok(ScheduledSource {
            id,
            start,
            duration,
        })
    }

    /// Natural completion reported by the output.
    pub fn on_source_ended(&mut self, id: SourceId) {
        if self.active.remove(&id) {
            debug!("[Playback] Source {} finished.", id);
        }
    }

    /// Stops everything that is scheduled or playing and rewinds the cursor.
    pub fn interrupt(&mut self) {
        if !self.active.is_empty() {
            debug!("[Playback] Interrupting {} sources.", self.active.len());
        }
        for id in std::mem::take(&mut self.active) {
            if let Err(e) = self.output.stop(id) {
                warn!("[Playback] Failed to stop source {}: {}", id, e);
            }
        }
        self.next_start_time = 0.0;
    }

    /// Interrupts and releases the output device. Later calls do nothing.
    pub fn shutdown(&mut self) -> Result<(), LiveError> {
        self.interrupt();
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.output.close()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("[Playback] Output close failed on drop: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub(crate) struct ManualOutputLog {
        pub now: f64,
        pub started: Vec<(SourceId, f64, f64)>,
        pub stopped: Vec<SourceId>,
        pub close_calls: usize,
        pub fail_close: bool,
    }

    /// In-memory output whose clock the test moves by hand.
    pub(crate) struct ManualOutput {
        pub log: Arc<Mutex<ManualOutputLog>>,
    }

    impl ManualOutput {
        pub(crate) fn new() -> (Self, Arc<Mutex<ManualOutputLog>>) {
            let log = Arc::new(Mutex::new(ManualOutputLog::default()));
            (Self { log: log.clone() }, log)
        }
    }

    impl AudioOutput for ManualOutput {
        fn current_time(&self) -> f64 {
            self.log.lock().unwrap().now
        }

        fn start(&mut self, id: SourceId, chunk: &PlaybackChunk, at: f64) -> Result<(), LiveError> {
            self.log
                .lock()
                .unwrap()
                .started
                .push((id, at, chunk.duration()));
            Ok(())
        }

        fn stop(&mut self, id: SourceId) -> Result<(), LiveError> {
            self.log.lock().unwrap().stopped.push(id);
            Ok(())
        }

        fn close(&mut self) -> Result<(), LiveError> {
            let mut log = self.log.lock().unwrap();
            log.close_calls += 1;
            if log.fail_close {
                return Err(LiveError::DeviceUnavailable("output already gone".into()));
            }
            Ok(())
        }
    }
}
