//! Energy analysis of the live input stream
//!
//! Produces one loudness scalar per analysis tick on a 0-255 byte scale:
//! the windowed spectrum is converted to decibels and mapped linearly from
//! [`MIN_DECIBELS`, `MAX_DECIBELS`] onto 0..=255, with exponential smoothing
//! between frames.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

/// Analysis frame length in samples
pub const FFT_SIZE: usize = 256;

/// Spectrum level mapped to loudness 0
pub const MIN_DECIBELS: f32 = -100.0;

/// Spectrum level mapped to loudness 255
pub const MAX_DECIBELS: f32 = -30.0;

/// Default smoothing between successive spectra
pub const DEFAULT_SMOOTHING: f32 = 0.8;

/// Lower edge of the speech band in Hz
const SPEECH_BAND_LOW_HZ: f32 = 300.0;

/// Upper edge of the speech band in Hz
const SPEECH_BAND_HIGH_HZ: f32 = 3000.0;

/// How loudness is derived from the spectrum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoudnessStrategy {
    /// Mean magnitude across every bin
    Broadband,
    /// Energy restricted to roughly 300-3000 Hz
    #[default]
    SpeechBand,
}

impl fmt::Display for LoudnessStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadband => write!(f, "broadband"),
            Self::SpeechBand => write!(f, "speech-band"),
        }
    }
}

/// One analysis tick's output
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurement {
    /// Loudness on the 0-255 scale
    pub loudness: f32,
    /// Fraction of adjacent sample pairs that change sign
    pub zero_crossing_rate: f32,
}

impl Measurement {
    /// Measurement with a loudness value and no zero-crossing information
    #[must_use]
    pub const fn from_loudness(loudness: f32) -> Self {
        Self {
            loudness,
            zero_crossing_rate: 0.0,
        }
    }
}

/// Spectral loudness meter over the most recent [`FFT_SIZE`] samples
pub struct EnergyAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    smoothing: f32,
    strategy: LoudnessStrategy,
    sample_rate: u32,
    recent: VecDeque<f32>,
}

impl fmt::Debug for EnergyAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyAnalyzer")
            .field("strategy", &self.strategy)
            .field("sample_rate", &self.sample_rate)
            .field("smoothing", &self.smoothing)
            .finish_non_exhaustive()
    }
}

impl EnergyAnalyzer {
    /// Create an analyzer for a mono stream at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32, strategy: LoudnessStrategy, smoothing: f32) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            window: blackman_window(FFT_SIZE),
            smoothed: vec![0.0; FFT_SIZE / 2],
            smoothing: smoothing.clamp(0.0, 0.99),
            strategy,
            sample_rate: sample_rate.max(1),
            recent: VecDeque::with_capacity(FFT_SIZE),
        }
    }

    /// Feed mono samples; only the newest [`FFT_SIZE`] are retained
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(FFT_SIZE);
        for &s in &samples[skip..] {
            if self.recent.len() == FFT_SIZE {
                self.recent.pop_front();
            }
            self.recent.push_back(s);
        }
    }

    /// Measure the current frame
    #[must_use]
    pub fn measure(&mut self) -> Measurement {
        let bytes = self.byte_spectrum();
        let loudness = match self.strategy {
            LoudnessStrategy::Broadband => mean(&bytes),
            LoudnessStrategy::SpeechBand => {
                let (lo, hi) = self.speech_bins();
                rms(&bytes[lo..=hi])
            }
        };
        let frame: Vec<f32> = self.recent.iter().copied().collect();

        Measurement {
            loudness,
            zero_crossing_rate: zero_crossing_rate(&frame),
        }
    }

    /// Inclusive bin range covering the speech band
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn speech_bins(&self) -> (usize, usize) {
        let bin_hz = self.sample_rate as f32 / FFT_SIZE as f32;
        let last = FFT_SIZE / 2 - 1;
        let lo = ((SPEECH_BAND_LOW_HZ / bin_hz).ceil() as usize).clamp(1, last);
        let hi = ((SPEECH_BAND_HIGH_HZ / bin_hz).floor() as usize).clamp(lo, last);
        (lo, hi)
    }

    /// Windowed, smoothed magnitude spectrum mapped to 0-255
    #[allow(clippy::cast_precision_loss)]
    fn byte_spectrum(&mut self) -> Vec<f32> {
        let pad = FFT_SIZE - self.recent.len();
        let mut buffer: Vec<Complex<f32>> = std::iter::repeat_n(0.0, pad)
            .chain(self.recent.iter().copied())
            .zip(&self.window)
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let scale = 1.0 / FFT_SIZE as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        self.smoothed
            .iter_mut()
            .zip(&buffer)
            .map(|(prev, bin)| {
                let magnitude = bin.norm() * scale;
                *prev = self.smoothing.mul_add(*prev, (1.0 - self.smoothing) * magnitude);
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    MIN_DECIBELS
                };
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0)
            })
            .collect()
    }
}

/// Fraction of adjacent sample pairs whose sign differs
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

#[allow(clippy::cast_precision_loss)]
fn blackman_window(len: usize) -> Vec<f32> {
    let n = len as f32;
    (0..len)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n;
            0.08f32.mul_add((2.0 * x).cos(), 0.5f32.mul_add(-x.cos(), 0.42))
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[allow(clippy::cast_precision_loss)]
fn rms(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32).sqrt()
}
