//! Audio playback to speakers
//!
//! Playback runs on its own thread holding the output stream. Callers get a
//! [`PlaybackHandle`]: a control for cancellation and a completion future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;

use super::encoder::{AudioBlob, decode_audio};
use crate::{Error, Result};

/// How often the playback thread checks for completion or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tail allowed after the last sample before the stream is dropped
const DRAIN_DELAY: Duration = Duration::from_millis(100);

/// Sink for response audio
pub trait Player {
    /// Start playing `audio`
    ///
    /// Failures after playback has started, decoding included, arrive
    /// through the handle's completion.
    ///
    /// # Errors
    ///
    /// Returns error if playback cannot be started
    fn play(&mut self, audio: AudioBlob) -> Result<PlaybackHandle>;
}

/// Cancels a running playback
#[derive(Debug, Clone, Default)]
pub struct PlaybackControl {
    cancelled: Arc<AtomicBool>,
}

impl PlaybackControl {
    /// Request the playback to stop early
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Resolves when playback finishes, fails, or is cancelled
#[derive(Debug)]
pub struct PlaybackCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for PlaybackCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::Playback("playback ended without reporting".to_string()))
            })
        })
    }
}

/// Producer side of a playback, held by whatever drives the output
#[derive(Debug)]
pub struct PlaybackReporter {
    control: PlaybackControl,
    tx: oneshot::Sender<Result<()>>,
}

impl PlaybackReporter {
    /// Whether the consumer asked to stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Report the outcome; a dropped consumer is ignored
    pub fn finish(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}

/// Consumer side of a playback
#[derive(Debug)]
pub struct PlaybackHandle {
    /// Cancellation control
    pub control: PlaybackControl,
    /// Completion future
    pub completion: PlaybackCompletion,
}

impl PlaybackHandle {
    /// Create a connected handle and reporter
    #[must_use]
    pub fn pair() -> (Self, PlaybackReporter) {
        let (tx, rx) = oneshot::channel();
        let control = PlaybackControl::default();
        (
            Self {
                control: control.clone(),
                completion: PlaybackCompletion { rx },
            },
            PlaybackReporter { control, tx },
        )
    }
}

/// Plays audio to the default output device
#[derive(Debug, Clone)]
pub struct AudioPlayback {
    config: StreamConfig,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        let config = device
            .default_output_config()
            .map_err(|e| Error::Playback(e.to_string()))?
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }
}

impl Player for AudioPlayback {
    fn play(&mut self, audio: AudioBlob) -> Result<PlaybackHandle> {
        let (handle, reporter) = PlaybackHandle::pair();
        let config = self.config.clone();

        std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let result = prepare(&audio, config.sample_rate.0)
                    .and_then(|samples| play_blocking(&config, samples, &reporter));
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "playback failed");
                }
                reporter.finish(result);
            })?;

        Ok(handle)
    }
}

/// Decode to mono at the output rate
fn prepare(audio: &AudioBlob, output_rate: u32) -> Result<Vec<f32>> {
    let decoded = decode_audio(audio).map_err(|e| Error::Playback(e.to_string()))?;
    let source_rate = decoded.sample_rate;
    let mono = decoded.into_mono();
    resample_audio(&mono, source_rate, output_rate)
}

/// Play samples on the calling thread until done or cancelled
fn play_blocking(config: &StreamConfig, samples: Vec<f32>, reporter: &PlaybackReporter) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device".to_string()))?;

    let channels = usize::from(config.channels.max(1));
    let total = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));

    let stream_samples = Arc::clone(&samples);
    let stream_position = Arc::clone(&position);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = stream_position.load(Ordering::Relaxed);
                for frame in data.chunks_mut(channels) {
                    let sample = stream_samples.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if pos < stream_samples.len() {
                        pos += 1;
                    }
                }
                stream_position.store(pos, Ordering::Relaxed);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    // Bound the wait by the clip length plus slack in case the device stalls
    let expected = Duration::from_millis(
        (total as u64 * 1000) / u64::from(config.sample_rate.0.max(1)) + 500,
    );
    let start = std::time::Instant::now();

    while position.load(Ordering::Relaxed) < total {
        if reporter.is_cancelled() {
            tracing::debug!("playback cancelled");
            return Ok(());
        }
        if start.elapsed() > expected {
            tracing::warn!(samples = total, "playback timed out");
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    std::thread::sleep(DRAIN_DELAY);
    drop(stream);
    tracing::debug!(samples = total, "playback complete");

    Ok(())
}

/// Resample mono audio using rubato
///
/// The final partial chunk is zero-padded, the resampler is flushed past its
/// output delay, and the output trimmed to the expected length.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Playback(format!("resampler init failed: {e}")))?;

    let mut output = Vec::new();

    for chunk in samples.chunks(chunk_size) {
        let mut block: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        block.resize(chunk_size, 0.0);
        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Playback(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    let expected = (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let delay = resampler.output_delay();
    while output.len() < delay + expected {
        let result = resampler
            .process_partial(None::<&[Vec<f64>]>, None)
            .map_err(|e| Error::Playback(format!("resample flush failed: {e}")))?;
        if result[0].is_empty() {
            break;
        }
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_reports_result() {
        let (handle, reporter) = PlaybackHandle::pair();
        reporter.finish(Ok(()));
        assert!(handle.completion.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_visible_to_reporter() {
        let (handle, reporter) = PlaybackHandle::pair();
        handle.control.cancel();
        assert!(reporter.is_cancelled());
        reporter.finish(Ok(()));
        assert!(handle.completion.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_reporter_is_playback_error() {
        let (handle, reporter) = PlaybackHandle::pair();
        drop(reporter);
        assert!(matches!(handle.completion.await, Err(Error::Playback(_))));
    }

    #[test]
    fn test_resample_keeps_the_tail() {
        let samples = vec![0.25f32; 24000];
        let out = resample_audio(&samples, 24000, 48000).unwrap();
        assert_eq!(out.len(), 48000);
        // Tail of the clip still carries signal
        assert!((out[46000] - 0.25).abs() < 0.02);
    }

    #[test]
    fn test_resample_same_rate_is_copy() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample_audio(&samples, 16000, 16000).unwrap(), samples);
    }

    #[tokio::test]
    async fn test_decode_failure_arrives_on_completion() {
        let mut playback = AudioPlayback {
            config: StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(16000),
                buffer_size: cpal::BufferSize::Default,
            },
        };

        let handle = playback
            .play(AudioBlob::new(vec![1, 2, 3], "audio/ogg"))
            .unwrap();
        assert!(matches!(handle.completion.await, Err(Error::Playback(_))));
    }
}
