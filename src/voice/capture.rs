//! Audio capture from microphone

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Upper bound on undrained samples held for a session (10 s at 16kHz)
const MAX_BUFFERED_SAMPLES: usize = SAMPLE_RATE as usize * 10;

/// Requested properties of the microphone stream
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    /// Preferred sample rate
    pub sample_rate: u32,
    /// Preferred channel count (mono for transcription)
    pub channels: u16,
    /// Request echo cancellation
    pub echo_cancellation: bool,
    /// Request noise suppression
    pub noise_suppression: bool,
    /// Request automatic gain control
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A live input track that can be stopped
pub trait DeviceTrack {
    /// Stop the track and release the underlying device
    fn stop(&mut self);
}

/// Source of microphone sessions
pub trait AudioDevice {
    /// Acquire the microphone with the given constraints
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the microphone is unavailable or denied
    fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<AudioSession>;
}

/// Sample buffer shared between a device callback and its session
#[derive(Clone, Default)]
pub struct SampleBuffer {
    inner: Arc<Mutex<Vec<f32>>>,
}

impl SampleBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples, dropping the oldest when the bound is exceeded
    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut buf) = self.inner.lock() {
            buf.extend_from_slice(samples);
            if buf.len() > MAX_BUFFERED_SAMPLES {
                let excess = buf.len() - MAX_BUFFERED_SAMPLES;
                buf.drain(..excess);
            }
        }
    }

    /// Take all buffered samples, leaving the buffer empty
    #[must_use]
    pub fn take(&self) -> Vec<f32> {
        self.inner
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Number of buffered samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|buf| buf.len()).unwrap_or_default()
    }

    /// Whether no samples are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One acquisition of the microphone
///
/// Owned exclusively by the turn-taking controller. The device track is
/// stopped on [`AudioSession::release`] or drop.
pub struct AudioSession {
    sample_rate: u32,
    channels: u16,
    acquired_at: DateTime<Utc>,
    buffer: SampleBuffer,
    track: Option<Box<dyn DeviceTrack>>,
}

impl AudioSession {
    /// Wrap a started device track
    #[must_use]
    pub fn new(
        sample_rate: u32,
        channels: u16,
        buffer: SampleBuffer,
        track: Box<dyn DeviceTrack>,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            acquired_at: Utc::now(),
            buffer,
            track: Some(track),
        }
    }

    /// Drain interleaved samples captured since the last call
    #[must_use]
    pub fn take_samples(&self) -> Vec<f32> {
        self.buffer.take()
    }

    /// Stop the device track; further calls are no-ops
    pub fn release(&mut self) {
        if let Some(mut track) = self.track.take() {
            track.stop();
            tracing::debug!(
                held_secs = (Utc::now() - self.acquired_at).num_seconds(),
                "microphone released"
            );
        }
    }

    /// Whether the device track is still running
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.track.is_some()
    }

    /// Negotiated sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Negotiated channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// When the device was acquired
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Host microphone via `cpal`
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    /// Create a microphone source for the default input device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Pick a stream config honouring the constraints where the device allows
    fn negotiate(device: &cpal::Device, constraints: &CaptureConstraints) -> Result<StreamConfig> {
        let wanted = SampleRate(constraints.sample_rate);
        let supported: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .collect();

        let exact = supported.iter().find(|c| {
            c.channels() == constraints.channels
                && c.min_sample_rate() <= wanted
                && c.max_sample_rate() >= wanted
        });
        let any_channels = supported
            .iter()
            .find(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted);

        if let Some(range) = exact.or(any_channels) {
            return Ok(range.clone().with_sample_rate(wanted).config());
        }

        // Fall back to whatever the device prefers; downstream resamples
        device
            .default_input_config()
            .map(|c| c.config())
            .map_err(|e| Error::Device(e.to_string()))
    }
}

impl AudioDevice for CpalMicrophone {
    fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<AudioSession> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;

        let config = Self::negotiate(&device, constraints)?;
        let buffer = SampleBuffer::new();
        let sink = buffer.clone();
        let mut conditioner = Conditioner::new(constraints, config.channels);

        if constraints.echo_cancellation {
            tracing::debug!("echo cancellation not provided by host input, relying on turn policy");
        }

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mut block = data.to_vec();
                    conditioner.process(&mut block);
                    sink.push(&block);
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "microphone acquired"
        );

        Ok(AudioSession::new(
            config.sample_rate.0,
            config.channels,
            buffer,
            Box::new(CpalTrack {
                stream: Some(stream),
            }),
        ))
    }
}

/// Running `cpal` input stream
struct CpalTrack {
    stream: Option<Stream>,
}

impl DeviceTrack for CpalTrack {
    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

/// Target RMS level for automatic gain control
const AGC_TARGET_RMS: f32 = 0.1;

/// Maximum gain applied by automatic gain control
const AGC_MAX_GAIN: f32 = 8.0;

/// Pole of the DC-blocking filter used for noise suppression
const DC_BLOCK_POLE: f32 = 0.995;

/// Software acoustic conditioning applied in the capture callback
///
/// Noise suppression is a DC-blocking high-pass that removes rumble and
/// offset; gain control follows a slow RMS envelope and only ever boosts.
struct Conditioner {
    noise_suppression: bool,
    auto_gain_control: bool,
    channels: usize,
    prev_in: Vec<f32>,
    prev_out: Vec<f32>,
    envelope: f32,
}

impl Conditioner {
    fn new(constraints: &CaptureConstraints, channels: u16) -> Self {
        let channels = usize::from(channels.max(1));
        Self {
            noise_suppression: constraints.noise_suppression,
            auto_gain_control: constraints.auto_gain_control,
            channels,
            prev_in: vec![0.0; channels],
            prev_out: vec![0.0; channels],
            envelope: AGC_TARGET_RMS,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn process(&mut self, block: &mut [f32]) {
        if block.is_empty() {
            return;
        }

        if self.noise_suppression {
            for (i, sample) in block.iter_mut().enumerate() {
                let ch = i % self.channels;
                let out = *sample - self.prev_in[ch] + DC_BLOCK_POLE * self.prev_out[ch];
                self.prev_in[ch] = *sample;
                self.prev_out[ch] = out;
                *sample = out;
            }
        }

        if self.auto_gain_control {
            let rms = (block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32).sqrt();
            self.envelope = self.envelope.mul_add(0.95, rms * 0.05).max(1e-4);
            let gain = (AGC_TARGET_RMS / self.envelope).clamp(1.0, AGC_MAX_GAIN);
            for sample in block.iter_mut() {
                *sample = (*sample * gain).clamp(-1.0, 1.0);
            }
        }
    }
}
