use super::codec::{encode_bytes, float_to_pcm16};
use crate::client::LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT;
use crate::error::LiveError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Receives 16 kHz mono frames on the device callback. Must not block.
pub type FrameSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A microphone that delivers 16 kHz mono `f32` frames.
pub trait CaptureSource: Send {
    /// Checks permission and opens the device without delivering audio.
    fn acquire(&mut self) -> Result<(), LiveError>;
    fn start(&mut self, sink: FrameSink) -> Result<(), LiveError>;
    /// Stops delivery and releases the device. Safe to call repeatedly.
    fn stop(&mut self) -> Result<(), LiveError>;
}

/// One fixed-size slice of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedChunk {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl CapturedChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT,
        }
    }

    pub fn to_pcm16(&self) -> Vec<u8> {
        float_to_pcm16(&self.samples)
    }

    pub fn to_base64(&self) -> String {
        encode_bytes(&self.to_pcm16())
    }

    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Cuts an arbitrary frame stream into chunks of exactly `chunk_frames`.
#[derive(Debug)]
pub struct ChunkAccumulator {
    chunk_frames: usize,
    buffer: Vec<f32>,
}

impl ChunkAccumulator {
    pub fn new(chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(1);
        Self {
            chunk_frames,
            buffer: Vec::with_capacity(chunk_frames),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, frames: &[f32]) -> Vec<CapturedChunk> {
        let mut ready = Vec::new();
        let mut rest = frames;
        while !rest.is_empty() {
            let take = (self.chunk_frames - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.chunk_frames {
                let next = Vec::with_capacity(self.chunk_frames);
                let full = std::mem::replace(&mut self.buffer, next);
                ready.push(CapturedChunk::new(full));
            }
        }
        ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Idle,
    Acquired,
    Running,
}

/// Owns the microphone and the fixed-size chunk tap.
pub struct CapturePipeline {
    source: Box<dyn CaptureSource>,
    chunk_frames: usize,
    state: CaptureState,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn CaptureSource>, chunk_frames: usize) -> Self {
        Self {
            source,
            chunk_frames,
            state: CaptureState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == CaptureState::Running
    }

    pub fn acquire(&mut self) -> Result<(), LiveError> {
        if self.state != CaptureState::Idle {
            return Ok(());
        }
        self.source.acquire()?;
        self.state = CaptureState::Acquired;
        info!("[Capture] Microphone acquired.");
        Ok(())
    }

    /// Installs the tap. Every full chunk is handed to `on_chunk` with
    /// `try_send`; a full channel drops the chunk.
    pub fn start(&mut self, on_chunk: mpsc::Sender<CapturedChunk>) -> Result<(), LiveError> {
        match self.state {
            CaptureState::Running => return Ok(()),
            CaptureState::Idle => self.acquire()?,
            CaptureState::Acquired => {}
        }

        let mut accumulator = ChunkAccumulator::new(self.chunk_frames);
        let sink: FrameSink = Box::new(move |frames: &[f32]| {
            for chunk in accumulator.push(frames) {
                match on_chunk.try_send(chunk) {
                    Ok(()) => trace!("[Capture] Chunk handed off."),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("[Capture] Chunk channel full, dropping captured chunk.")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!("[Capture] Chunk receiver gone, dropping captured chunk.")
                    }
                }
            }
        });
        self.source.start(sink)?;
        self.state = CaptureState::Running;
        info!(
            "[Capture] Tap installed ({} frames per chunk).",
            self.chunk_frames
        );
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), LiveError> {
        if self.state == CaptureState::Idle {
            return Ok(());
        }
        self.state = CaptureState::Idle;
        debug!("[Capture] Stopping microphone.");
        self.source.stop()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("[Capture] Stop failed on drop: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct ScriptedSourceLog {
        pub sink: Option<FrameSink>,
        pub acquire_calls: usize,
        pub stop_calls: usize,
    }

    /// Capture source the test feeds by calling [`ScriptedSource::feed`].
    pub(crate) struct ScriptedSource {
        pub log: Arc<Mutex<ScriptedSourceLog>>,
        pub acquire_error: Option<fn() -> LiveError>,
    }

    impl ScriptedSource {
        pub(crate) fn new() -> (Self, Arc<Mutex<ScriptedSourceLog>>) {
            let log = Arc::new(Mutex::new(ScriptedSourceLog::default()));
            (
                Self {
                    log: log.clone(),
                    acquire_error: None,
                },
                log,
            )
        }

        pub(crate) fn feed(log: &Arc<Mutex<ScriptedSourceLog>>, frames: &[f32]) {
            let mut log = log.lock().unwrap();
            if let Some(sink) = log.sink.as_mut() {
                sink(frames);
            }
        }
    }

    impl CaptureSource for ScriptedSource {
        fn acquire(&mut self) -> Result<(), LiveError> {
            self.log.lock().unwrap().acquire_calls += 1;
            match self.acquire_error {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        fn start(&mut self, sink: FrameSink) -> Result<(), LiveError> {
            self.log.lock().unwrap().sink = Some(sink);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), LiveError> {
            let mut log = self.log.lock().unwrap();
            log.sink = None;
            log.stop_calls += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;

    #[test]
    fn test_accumulator_emits_exact_chunks() {
        let mut acc = ChunkAccumulator::new(4);
        assert!(acc.push(&[0.1, 0.2, 0.3]).is_empty());
        let chunks = acc.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&*chunks[0].samples, &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(&*chunks[1].samples, &[0.5, 0.6, 0.7, 0.8]);
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_captured_chunk_encoding() {
        let chunk = CapturedChunk::new(vec![0.5, -0.5]);
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(chunk.to_pcm16(), vec![0x00, 0x40, 0x00, 0xC0]);
        assert_eq!(chunk.to_base64(), "AEAAwA==");
    }

    #[tokio::test]
    async fn test_pipeline_forwards_full_chunks_only() {
        let (source, log) = ScriptedSource::new();
        let mut pipeline = CapturePipeline::new(Box::new(source), 4096);
        let (tx, mut rx) = mpsc::channel(8);
        pipeline.start(tx).unwrap();
        assert!(pipeline.is_running());

        ScriptedSource::feed(&log, &vec![0.25; 4000]);
        assert!(rx.try_recv().is_err());
        ScriptedSource::feed(&log, &vec![0.25; 200]);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.samples.len(), 4096);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (source, log) = ScriptedSource::new();
        let mut pipeline = CapturePipeline::new(Box::new(source), 2);
        let (tx, mut rx) = mpsc::channel(1);
        pipeline.start(tx).unwrap();
        ScriptedSource::feed(&log, &[0.0; 6]);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_is_idempotent_and_safe_before_start() {
        let (source, log) = ScriptedSource::new();
        let mut pipeline = CapturePipeline::new(Box::new(source), 16);
        pipeline.stop().unwrap();
        assert_eq!(log.lock().unwrap().stop_calls, 0);

        pipeline.acquire().unwrap();
        pipeline.acquire().unwrap();
        assert_eq!(log.lock().unwrap().acquire_calls, 1);
        pipeline.stop().unwrap();
        pipeline.stop().unwrap();
        drop(pipeline);
        assert_eq!(log.lock().unwrap().stop_calls, 1);
    }

    #[test]
    fn test_acquire_failure_is_reported() {
        let (mut source, _log) = ScriptedSource::new();
        source.acquire_error = Some(|| LiveError::PermissionDenied("user said no".into()));
        let mut pipeline = CapturePipeline::new(Box::new(source), 16);
        let err = pipeline.acquire().unwrap_err();
        assert!(err.is_device_error());
        assert!(!pipeline.is_running());
    }
}
