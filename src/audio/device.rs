//! Microphone and speaker backed by the default cpal host.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own thread for as long as it is needed and is dropped there.

use super::capture::{CaptureSource, FrameSink};
use super::playback::{AudioOutput, PlaybackChunk, SourceId};
use super::AudioDevices;
#[cfg(feature = "audio-resampling")]
use super::resample::PlaybackResampler;
use crate::client::{LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT, LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT};
use crate::error::LiveError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    FromSample, SampleFormat, SampleRate, SizedSample, StreamConfig, SupportedStreamConfig,
};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The default input and output devices of the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAudio;

impl SystemAudio {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDevices for SystemAudio {
    fn open_capture(&self) -> Result<Box<dyn CaptureSource>, LiveError> {
        Ok(Box::new(CpalCapture::default()))
    }

    fn open_output(
        &self,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, LiveError> {
        Ok(Box::new(CpalOutput::open(ended)?))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Picks the supported config closest to `target_rate`, preferring f32 and
/// then i16 samples. Falls back to the device default.
fn find_supported_config<F, I>(
    mut configs: F,
    default_config: SupportedStreamConfig,
    target_rate: u32,
) -> SupportedStreamConfig
where
    F: FnMut() -> Result<I, cpal::SupportedStreamConfigsError>,
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    let Ok(ranges) = configs() else {
        return default_config;
    };
    let mut best: Option<(u32, SupportedStreamConfig)> = None;
    for range in ranges {
        if !matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16) {
            continue;
        }
        let rate = target_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
        let diff = rate.abs_diff(target_rate);
        let better = match &best {
            None => true,
            Some((best_diff, best_config)) => {
                diff < *best_diff
                    || (diff == *best_diff
                        && range.sample_format() == SampleFormat::F32
                        && best_config.sample_format() != SampleFormat::F32)
            }
        };
        if better {
            best = Some((diff, range.with_sample_rate(SampleRate(rate))));
        }
    }
    best.map(|(_, config)| config).unwrap_or(default_config)
}

fn device_error(context: &str, err: impl std::fmt::Display) -> LiveError {
    let message = format!("{}: {}", context, err);
    if message.to_lowercase().contains("permission") {
        LiveError::PermissionDenied(message)
    } else {
        LiveError::DeviceUnavailable(message)
    }
}

/// Averages interleaved frames down to one channel.
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    /// Runs `build` on a new thread and keeps the stream it returns alive
    /// until [`StreamThread::stop`].
    fn spawn<B>(name: &str, build: B) -> Result<Self, LiveError>
    where
        B: FnOnce() -> Result<cpal::Stream, LiveError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(device_error("Failed to start stream", e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                LiveError::DeviceUnavailable(format!("Failed to spawn audio thread: {}", e))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop_tx, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(LiveError::DeviceUnavailable("Audio thread exited during setup".into()))
            }
        }
    }

    fn stop(self) -> Result<(), LiveError> {
        let _ = self.stop_tx.send(());
        self.handle
            .join()
            .map_err(|_| LiveError::DeviceUnavailable("Audio thread panicked".into()))
    }
}

/// Default microphone, downmixed to mono and delivered at 16 kHz.
#[derive(Default)]
pub struct CpalCapture {
    config: Option<SupportedStreamConfig>,
    thread: Option<StreamThread>,
}

impl CpalCapture {
    fn input_device() -> Result<cpal::Device, LiveError> {
        cpal::default_host()
            .default_input_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("No input device available".into()))
    }
}

impl CaptureSource for CpalCapture {
    fn acquire(&mut self) -> Result<(), LiveError> {
        if self.config.is_some() {
            return Ok(());
        }
        let device = Self::input_device()?;
        let default_config = device
            .default_input_config()
            .map_err(|e| device_error("No usable input config", e))?;
        let config = find_supported_config(
            || device.supported_input_configs(),
            default_config,
            LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT,
        );
        info!(
            "[Capture] Using input {} at {} Hz, {} ch, {:?}.",
            device.name().unwrap_or_else(|_| "<unnamed>".into()),
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );

        #[cfg(not(feature = "audio-resampling"))]
        if config.sample_rate().0 != LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT {
            return Err(LiveError::DeviceUnavailable(format!(
                "Input device runs at {} Hz; enable audio-resampling to convert to {} Hz",
                config.sample_rate().0,
                LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT
            )));
        }

        self.config = Some(config);
        Ok(())
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), LiveError> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.acquire()?;
        let Some(supported) = self.config.clone() else {
            return Err(LiveError::DeviceUnavailable("Input device not acquired".into()));
        };

        let thread = StreamThread::spawn("live-capture", move || {
            let device = Self::input_device()?;
            let format = supported.sample_format();
            let config: StreamConfig = supported.into();
            match format {
                SampleFormat::F32 => build_input_stream::<f32>(&device, &config, sink),
                SampleFormat::I16 => build_input_stream::<i16>(&device, &config, sink),
                other => Err(LiveError::DeviceUnavailable(format!(
                    "Unsupported input sample format {:?}",
                    other
                ))),
            }
        })?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), LiveError> {
        self.config = None;
        match self.thread.take() {
            Some(thread) => {
                debug!("[Capture] Releasing input stream.");
                thread.stop()
            }
            None => Ok(()),
        }
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut sink: FrameSink,
) -> Result<cpal::Stream, LiveError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;

    #[cfg(feature = "audio-resampling")]
    let mut resampler = if config.sample_rate.0 != LIVE_AUDIO_SAMPLE_RATE_HZ_INPUT {
        Some(super::resample::CaptureResampler::new(config.sample_rate.0)?)
    } else {
        None
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if data.is_empty() {
                    return;
                }
                let mono = downmix(data, channels);

                #[cfg(feature = "audio-resampling")]
                let mono = match resampler.as_mut() {
                    Some(resampler) => match resampler.process(&mono) {
                        Ok(resampled) => resampled,
                        Err(e) => {
                            error!("[Capture] Resampling failed: {}", e);
                            return;
                        }
                    },
                    None => mono,
                };

                if !mono.is_empty() {
                    sink(&mono);
                }
            },
            |err| error!("[Capture] CPAL error: {}", err),
            None,
        )
        .map_err(|e| device_error("Failed to build input stream", e))
}

struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled voices against a frame counter that only advances as the
/// device consumes audio.
pub(crate) struct Mixer {
    sample_rate: u32,
    frames_played: u64,
    voices: Vec<Voice>,
    ended: mpsc::UnboundedSender<SourceId>,
}

impl Mixer {
    pub(crate) fn new(sample_rate: u32, ended: mpsc::UnboundedSender<SourceId>) -> Self {
        Self {
            sample_rate,
            frames_played: 0,
            voices: Vec::new(),
            ended,
        }
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.frames_played as f64 / self.sample_rate as f64
    }

    /// Queues `samples`, already at the mixer's rate, to start at `at` seconds.
    pub(crate) fn schedule(&mut self, id: SourceId, samples: Vec<f32>, at: f64) {
        let start_frame = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.voices.push(Voice {
            id,
            start_frame: start_frame.max(self.frames_played),
            samples,
        });
    }

    pub(crate) fn remove(&mut self, id: SourceId) {
        self.voices.retain(|voice| voice.id != id);
    }

    /// Fills `out` with `channels`-interleaved frames and reports every voice
    /// that ran out.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let t = self.frames_played + i as u64;
            let mut value = 0.0f32;
            for voice in &self.voices {
                if t >= voice.start_frame && t < voice.end_frame() {
                    value += voice.samples[(t - voice.start_frame) as usize];
                }
            }
            let value = value.clamp(-1.0, 1.0);
            frame.iter_mut().for_each(|s| *s = value);
        }
        self.frames_played += frames as u64;

        let now = self.frames_played;
        let ended = &self.ended;
        self.voices.retain(|voice| {
            if voice.end_frame() <= now {
                let _ = ended.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

fn downmix_channels(channels: &[Vec<f32>]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.clone(),
        many => {
            let frames = many.iter().map(Vec::len).min().unwrap_or(0);
            (0..frames)
                .map(|i| many.iter().map(|c| c[i]).sum::<f32>() / many.len() as f32)
                .collect()
        }
    }
}

/// Default speaker. Mixing happens on the device callback.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    #[cfg(feature = "audio-resampling")]
    resampler: Option<PlaybackResampler>,
    thread: Option<StreamThread>,
}

impl CpalOutput {
    pub fn open(ended: mpsc::UnboundedSender<SourceId>) -> Result<Self, LiveError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("No output device available".into()))?;
        let default_config = device
            .default_output_config()
            .map_err(|e| device_error("No usable output config", e))?;
        let supported = find_supported_config(
            || device.supported_output_configs(),
            default_config,
            LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT,
        );
        let sample_rate = supported.sample_rate().0;
        info!(
            "[Playback] Using output {} at {} Hz, {} ch, {:?}.",
            device.name().unwrap_or_else(|_| "<unnamed>".into()),
            sample_rate,
            supported.channels(),
            supported.sample_format()
        );

        #[cfg(not(feature = "audio-resampling"))]
        if sample_rate != LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT {
            return Err(LiveError::DeviceUnavailable(format!(
                "Output device runs at {} Hz; enable the audio-resampling feature to play {} Hz",
                sample_rate, LIVE_AUDIO_SAMPLE_RATE_HZ_OUTPUT
            )));
        }

        let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate, ended)));
        let stream_mixer = mixer.clone();
        let thread = StreamThread::spawn("live-playback", move || {
            let format = supported.sample_format();
            let config: StreamConfig = supported.into();
            match format {
                SampleFormat::F32 => build_output_stream::<f32>(&device, &config, stream_mixer),
                SampleFormat::I16 => build_output_stream::<i16>(&device, &config, stream_mixer),
                other => Err(LiveError::DeviceUnavailable(format!(
                    "Unsupported output sample format {:?}",
                    other
                ))),
            }
        })?;

        Ok(Self {
            mixer,
            sample_rate,
            #[cfg(feature = "audio-resampling")]
            resampler: None,
            thread: Some(thread),
        })
    }

    /// Brings mono model audio to the device rate.
    #[cfg(feature = "audio-resampling")]
    fn to_device_rate(&mut self, mono: Vec<f32>, rate: u32) -> Result<Vec<f32>, LiveError> {
        if rate == self.sample_rate {
            return Ok(mono);
        }
        if self.resampler.as_ref().map(PlaybackResampler::input_rate) != Some(rate) {
            self.resampler = Some(PlaybackResampler::new(rate, self.sample_rate)?);
        }
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process_chunk(&mono),
            None => Err(LiveError::AudioResampling("Playback resampler missing".into())),
        }
    }

    #[cfg(not(feature = "audio-resampling"))]
    fn to_device_rate(&mut self, mono: Vec<f32>, rate: u32) -> Result<Vec<f32>, LiveError> {
        if rate == self.sample_rate {
            Ok(mono)
        } else {
            Err(LiveError::DeviceUnavailable(format!(
                "Cannot play {} Hz audio on a {} Hz device without audio-resampling",
                rate, self.sample_rate
            )))
        }
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, LiveError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                lock(&mixer).render(&mut scratch, channels);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
            },
            |err| error!("[Playback] CPAL error: {}", err),
            None,
        )
        .map_err(|e| device_error("Failed to build output stream", e))
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        lock(&self.mixer).current_time()
    }

    fn start(&mut self, id: SourceId, chunk: &PlaybackChunk, at: f64) -> Result<(), LiveError> {
        if self.thread.is_none() {
            return Err(LiveError::ClosedSession);
        }
        let mono = downmix_channels(&chunk.channels);
        let samples = self.to_device_rate(mono, chunk.sample_rate)?;
        lock(&self.mixer).schedule(id, samples, at);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) -> Result<(), LiveError> {
        lock(&self.mixer).remove(id);
        Ok(())
    }

    fn close(&mut self) -> Result<(), LiveError> {
        match self.thread.take() {
            Some(thread) => {
                debug!("[Playback] Releasing output stream.");
                thread.stop()
            }
            None => Ok(()),
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("[Playback] Close failed on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_plays_voices_back_to_back_and_reports_endings() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10, tx);
        mixer.schedule(1, vec![0.1; 5], 0.0);
        mixer.schedule(2, vec![0.2; 5], 0.5);

        let mut out = vec![0.0; 6];
        mixer.render(&mut out, 1);
        assert_eq!(&out[..5], &[0.1; 5]);
        assert!((out[5] - 0.2).abs() < 1e-6);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert!((mixer.current_time() - 0.6).abs() < 1e-9);

        // Five stereo frames: four of voice 2, then silence.
        let mut out = vec![0.0; 10];
        mixer.render(&mut out, 2);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!((out[6] - 0.2).abs() < 1e-6);
        assert!((out[7] - 0.2).abs() < 1e-6);
        assert_eq!(out[8], 0.0);
    }

    #[test]
    fn test_removed_voice_is_silent_and_not_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10, tx);
        mixer.schedule(7, vec![0.3; 4], 0.0);
        mixer.remove(7);
        let mut out = vec![1.0; 4];
        mixer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stereo_chunks_are_averaged_to_mono() {
        let mono = downmix_channels(&[vec![0.5, 1.0, 0.2], vec![-0.5, 0.0]]);
        assert_eq!(mono, vec![0.0, 0.5]);
        assert!(downmix_channels(&[]).is_empty());
    }

    #[test]
    fn test_downmix_averages_interleaved_frames() {
        let mono = downmix(&[0.5f32, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }
}
