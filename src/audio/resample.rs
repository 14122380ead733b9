use crate::client::LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT;
use crate::error::LiveError;
use audioadapter::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};
use tracing::{debug, info, trace};

const RESAMPLER_INPUT_CHUNK_FRAMES: usize = 1024;
const RESAMPLER_SUB_CHUNKS: usize = 2;
const MONO: usize = 1;

/// Mono FFT rate converter fed one fixed-size block at a time.
struct MonoFft {
    resampler: Fft<f32>,
    output_buffer: Vec<Vec<f32>>,
}

impl MonoFft {
    fn new(input_rate: u32, output_rate: u32) -> Result<Self, LiveError> {
        let resampler = Fft::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            RESAMPLER_INPUT_CHUNK_FRAMES,
            RESAMPLER_SUB_CHUNKS,
            MONO,
            FixedSync::Input,
        )
        .map_err(|e| {
            LiveError::AudioResampling(format!("Failed to create Fft resampler: {}", e))
        })?;

        let max_output_frames = resampler.output_frames_max().max(1);
        Ok(Self {
            resampler,
            output_buffer: vec![vec![0.0f32; max_output_frames]; MONO],
        })
    }

    fn block_frames(&self) -> usize {
        self.resampler.input_frames_next()
    }

    /// Converts exactly one block of `block_frames()` samples and appends the
    /// result to `produced`.
    fn process_block(
        &mut self,
        block: Vec<f32>,
        produced: &mut Vec<f32>,
    ) -> Result<(), LiveError> {
        let frames = block.len();
        let input = vec![block];
        let input_adapter = SequentialSliceOfVecs::new(&input, MONO, frames)
            .map_err(|e| LiveError::AudioResampling(format!("Input adapter error: {}", e)))?;

        let output_frames = self.resampler.output_frames_next().max(1);
        self.output_buffer[0].resize(output_frames, 0.0);
        let mut output_adapter =
            SequentialSliceOfVecs::new_mut(&mut self.output_buffer, MONO, output_frames)
                .map_err(|e| LiveError::AudioResampling(format!("Output adapter error: {}", e)))?;

        let (_consumed, written) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, None)
            .map_err(|e| LiveError::AudioResampling(e.to_string()))?;
        produced.extend_from_slice(&self.output_buffer[0][..written]);
        Ok(())
    }
}

/// Converts mono microphone frames at the device rate to 16 kHz mono.
///
/// Input is buffered until the resampler has a full block; whatever is left
/// over when capture stops is discarded.
pub(crate) struct CaptureResampler {
    inner: MonoFft,
    input_rate: u32,
    pending: Vec<f32>,
}

impl std::fmt::Debug for CaptureResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureResampler")
            .field("input_rate", &self.input_rate)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CaptureResampler {
    pub(crate) fn new(input_rate: u32) -> Result<Self, LiveError> {
        info!(
            "[Capture] Resampling microphone {}Hz -> {}Hz mono.",
            input_rate, LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT
        );
        Ok(Self {
            inner: MonoFft::new(input_rate, LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT)?,
            input_rate,
            pending: Vec::with_capacity(RESAMPLER_INPUT_CHUNK_FRAMES * 2),
        })
    }

    /// Appends `mono` and returns every resampled frame that is ready.
    pub(crate) fn process(&mut self, mono: &[f32]) -> Result<Vec<f32>, LiveError> {
        self.pending.extend_from_slice(mono);
        let mut produced = Vec::new();

        loop {
            let required = self.inner.block_frames();
            if required == 0 || self.pending.len() < required {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..required).collect();
            self.inner.process_block(block, &mut produced)?;
        }

        trace!(
            "[Capture] Resampled {} frames, {} pending.",
            produced.len(),
            self.pending.len()
        );
        Ok(produced)
    }
}

/// Converts whole mono playback chunks from the model's rate to the output
/// device's rate.
///
/// Each chunk is converted on its own: the result is aligned to the chunk's
/// first sample and holds exactly `len * output_rate / input_rate` frames
/// (rounded), so scheduled start times and durations stay exact.
pub(crate) struct PlaybackResampler {
    inner: MonoFft,
    input_rate: u32,
    output_rate: u32,
}

impl std::fmt::Debug for PlaybackResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackResampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .finish()
    }
}

impl PlaybackResampler {
    pub(crate) fn new(input_rate: u32, output_rate: u32) -> Result<Self, LiveError> {
        info!(
            "[Playback] Resampling model audio {}Hz -> {}Hz mono.",
            input_rate, output_rate
        );
        Ok(Self {
            inner: MonoFft::new(input_rate, output_rate)?,
            input_rate,
            output_rate,
        })
    }

    pub(crate) fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub(crate) fn output_frames_for(&self, input_frames: usize) -> usize {
        (input_frames as f64 * self.output_rate as f64 / self.input_rate as f64).round() as usize
    }

    pub(crate) fn process_chunk(&mut self, samples: &[f32]) -> Result<Vec<f32>, LiveError> {
        let expected = self.output_frames_for(samples.len());
        if expected == 0 {
            return Ok(Vec::new());
        }

        self.inner.resampler.reset();
        let delay = self.inner.resampler.output_delay();
        let wanted = delay + expected;
        let mut produced = Vec::with_capacity(wanted + RESAMPLER_INPUT_CHUNK_FRAMES);
        let mut offset = 0;

        // The tail is padded with silence until the delayed output covers the
        // whole chunk.
        while produced.len() < wanted {
            let required = self.inner.block_frames();
            if required == 0 {
                return Err(LiveError::AudioResampling(
                    "Resampler requested an empty block".into(),
                ));
            }
            let end = (offset + required).min(samples.len());
            let mut block = Vec::with_capacity(required);
            block.extend_from_slice(&samples[offset..end]);
            block.resize(required, 0.0);
            offset = end;
            self.inner.process_block(block, &mut produced)?;
        }

        debug!(
            "[Playback] Resampled chunk of {} frames to {} frames.",
            samples.len(),
            expected
        );
        Ok(produced[delay..wanted].to_vec())
    }
}
