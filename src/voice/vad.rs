//! Voice activity detection
//!
//! Classifies per-tick loudness measurements into speech and silence and
//! emits one-shot "start recording" / "stop recording" edges.
//!
//! Two fidelity levels share one detector:
//!
//! - [`VadMode::Basic`]: fixed threshold, fixed silence timeout.
//! - [`VadMode::Adaptive`]: a calibration phase estimates the noise floor,
//!   the threshold then tracks the lower quartile of recent loudness, a
//!   zero-crossing cue catches energy-weak fricatives, and the silence
//!   timeout lengthens after long continuous speech.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::analyzer::{DEFAULT_SMOOTHING, LoudnessStrategy, Measurement};

/// Detector fidelity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadMode {
    /// Fixed threshold comparison
    Basic,
    /// Calibrated, self-adjusting threshold
    #[default]
    Adaptive,
}

impl fmt::Display for VadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for VadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "simple" => Ok(Self::Basic),
            "adaptive" | "advanced" => Ok(Self::Adaptive),
            other => Err(format!("unknown VAD mode: {other}")),
        }
    }
}

/// Detector configuration, injected once at construction
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Fidelity level
    pub mode: VadMode,
    /// Loudness threshold (adaptive mode: lower bound of the threshold)
    pub threshold: f32,
    /// Silence needed after speech to end an utterance
    pub silence_timeout: Duration,
    /// Silence timeout once an utterance has run past `long_utterance`
    pub extended_silence_timeout: Duration,
    /// Continuous speech length after which the extended timeout applies
    pub long_utterance: Duration,
    /// Speech needed before a recording starts
    pub min_speech: Duration,
    /// Analysis tick period
    pub check_interval: Duration,
    /// Length of the calibration phase
    pub calibration: Duration,
    /// Margin added to the noise floor to form the threshold
    pub calibration_margin: f32,
    /// Rolling loudness history length
    pub history_len: usize,
    /// Weight of the new lower-quartile estimate per tick
    pub adaptation_rate: f32,
    /// Spectral smoothing for the analyzer
    pub smoothing: f32,
    /// Zero-crossing rate above which moderate energy counts as speech
    pub zcr_threshold: f32,
    /// Fraction of the threshold that counts as moderate energy
    pub zcr_energy_ratio: f32,
    /// How the analyzer measures loudness
    pub strategy: LoudnessStrategy,
    /// Whether silence ends a recording
    pub auto_stop: bool,
}

impl VadConfig {
    /// Fixed-threshold configuration
    #[must_use]
    pub const fn basic() -> Self {
        Self {
            mode: VadMode::Basic,
            threshold: 30.0,
            silence_timeout: Duration::from_millis(1500),
            extended_silence_timeout: Duration::from_millis(1500),
            long_utterance: Duration::from_secs(5),
            min_speech: Duration::from_millis(300),
            check_interval: Duration::from_millis(100),
            calibration: Duration::ZERO,
            calibration_margin: 10.0,
            history_len: 30,
            adaptation_rate: 0.05,
            smoothing: DEFAULT_SMOOTHING,
            zcr_threshold: 0.25,
            zcr_energy_ratio: 0.6,
            strategy: LoudnessStrategy::Broadband,
            auto_stop: true,
        }
    }

    /// Calibrated, self-adjusting configuration
    #[must_use]
    pub const fn adaptive() -> Self {
        Self {
            mode: VadMode::Adaptive,
            threshold: 30.0,
            silence_timeout: Duration::from_millis(1000),
            extended_silence_timeout: Duration::from_millis(1500),
            long_utterance: Duration::from_secs(5),
            min_speech: Duration::from_millis(300),
            check_interval: Duration::from_millis(100),
            calibration: Duration::from_secs(2),
            calibration_margin: 10.0,
            history_len: 30,
            adaptation_rate: 0.05,
            smoothing: DEFAULT_SMOOTHING,
            zcr_threshold: 0.25,
            zcr_energy_ratio: 0.6,
            strategy: LoudnessStrategy::SpeechBand,
            auto_stop: true,
        }
    }

    /// Defaults for the given mode
    #[must_use]
    pub const fn for_mode(mode: VadMode) -> Self {
        match mode {
            VadMode::Basic => Self::basic(),
            VadMode::Adaptive => Self::adaptive(),
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::adaptive()
    }
}

/// Current classification of the stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Classification {
    /// Last tick was speech
    Speech,
    /// Last tick was silence
    #[default]
    Silence,
}

/// Per-tick detector output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadDecision {
    /// This tick classified as speech
    pub is_speaking: bool,
    /// Speech has lasted long enough to start recording (one-shot)
    pub should_start_recording: bool,
    /// Silence has lasted long enough to end the utterance (one-shot)
    pub should_stop_recording: bool,
}

/// Stateful voice activity detector
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    classification: Classification,
    threshold: f32,
    noise_floor: Option<f32>,
    history: VecDeque<f32>,
    calibration_samples: Vec<f32>,
    calibration_started_at: Option<Duration>,
    speech_started_at: Option<Duration>,
    silence_started_at: Option<Duration>,
    last_speech_at: Option<Duration>,
    last_run: Duration,
    recording: bool,
}

impl VoiceActivityDetector {
    /// Create a detector; adaptive detectors start in calibration
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            history: VecDeque::with_capacity(config.history_len),
            config,
            classification: Classification::Silence,
            noise_floor: None,
            calibration_samples: Vec::new(),
            calibration_started_at: None,
            speech_started_at: None,
            silence_started_at: None,
            last_speech_at: None,
            last_run: Duration::ZERO,
            recording: false,
        }
    }

    /// Process one measurement taken at `now` (time since session start)
    pub fn process(&mut self, measurement: Measurement, now: Duration) -> VadDecision {
        if self.is_calibrating() {
            self.calibrate(measurement.loudness, now);
            return VadDecision::default();
        }

        if self.config.mode == VadMode::Adaptive {
            self.adapt(measurement.loudness);
        }

        let is_speech = self.classify(measurement);
        let mut decision = VadDecision {
            is_speaking: is_speech,
            ..VadDecision::default()
        };

        if is_speech {
            self.silence_started_at = None;
            self.last_speech_at = Some(now);
            let started = *self.speech_started_at.get_or_insert(now);
            self.classification = Classification::Speech;

            if !self.recording && now.saturating_sub(started) >= self.config.min_speech {
                self.recording = true;
                decision.should_start_recording = true;
                tracing::debug!(
                    speech_ms = now.saturating_sub(started).as_millis(),
                    threshold = self.threshold,
                    "speech onset"
                );
            }
        } else {
            if self.classification == Classification::Speech {
                if let (Some(start), Some(last)) = (self.speech_started_at, self.last_speech_at) {
                    self.last_run = last.saturating_sub(start);
                }
                self.speech_started_at = None;
                self.silence_started_at = self.last_speech_at.or(Some(now));
                self.classification = Classification::Silence;
            }

            if self.recording
                && self.config.auto_stop
                && let Some(silence_start) = self.silence_started_at
            {
                let timeout = self.silence_timeout();
                if now.saturating_sub(silence_start) >= timeout {
                    decision.should_stop_recording = true;
                    tracing::debug!(timeout_ms = timeout.as_millis(), "utterance end");
                    self.end_utterance();
                }
            }
        }

        decision
    }

    /// Clear utterance state, keeping calibration and threshold
    pub fn end_utterance(&mut self) {
        self.recording = false;
        self.classification = Classification::Silence;
        self.speech_started_at = None;
        self.silence_started_at = None;
        self.last_speech_at = None;
        self.last_run = Duration::ZERO;
    }

    /// Full reset, including calibration
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Whether the detector is still collecting calibration samples
    #[must_use]
    pub fn is_calibrating(&self) -> bool {
        self.config.mode == VadMode::Adaptive
            && !self.config.calibration.is_zero()
            && self.noise_floor.is_none()
    }

    /// Whether an utterance is being tracked
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    /// Current loudness threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Estimated noise floor (adaptive mode, after calibration)
    #[must_use]
    pub const fn noise_floor(&self) -> Option<f32> {
        self.noise_floor
    }

    /// Current classification
    #[must_use]
    pub const fn classification(&self) -> Classification {
        self.classification
    }

    /// Start times of the speech and silence timers
    #[must_use]
    pub const fn timers(&self) -> (Option<Duration>, Option<Duration>) {
        (self.speech_started_at, self.silence_started_at)
    }

    /// Injected configuration
    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    fn calibrate(&mut self, loudness: f32, now: Duration) {
        let started = *self.calibration_started_at.get_or_insert(now);
        self.calibration_samples.push(loudness);

        if now.saturating_sub(started) < self.config.calibration {
            return;
        }

        let floor = percentile(&self.calibration_samples, 0.10);
        self.noise_floor = Some(floor);
        self.threshold = (floor + self.config.calibration_margin).max(self.config.threshold);
        let skip = self
            .calibration_samples
            .len()
            .saturating_sub(self.config.history_len);
        self.history
            .extend(self.calibration_samples.iter().skip(skip).copied());
        self.calibration_samples.clear();

        tracing::info!(
            noise_floor = floor,
            threshold = self.threshold,
            "VAD calibrated"
        );
    }

    fn adapt(&mut self, loudness: f32) {
        if self.history.len() >= self.config.history_len.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(loudness);

        // Hold the floor during a speech run so long utterances can't drag it up
        if self.classification == Classification::Speech {
            return;
        }

        let samples: Vec<f32> = self.history.iter().copied().collect();
        let lower_quartile = percentile(&samples, 0.25);
        let rate = self.config.adaptation_rate.clamp(0.0, 1.0);
        let floor = self
            .noise_floor
            .map_or(lower_quartile, |old| old.mul_add(1.0 - rate, lower_quartile * rate));

        self.noise_floor = Some(floor);
        self.threshold = (floor + self.config.calibration_margin).max(self.config.threshold);
    }

    fn classify(&self, measurement: Measurement) -> bool {
        if measurement.loudness > self.threshold {
            return true;
        }
        self.config.mode == VadMode::Adaptive
            && measurement.loudness > self.threshold * self.config.zcr_energy_ratio
            && measurement.zero_crossing_rate > self.config.zcr_threshold
    }

    fn silence_timeout(&self) -> Duration {
        if self.config.mode == VadMode::Adaptive && self.last_run > self.config.long_utterance {
            self.config.extended_silence_timeout
        } else {
            self.config.silence_timeout
        }
    }
}

/// Nearest-rank percentile of unsorted values (`p` in 0..=1)
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let idx = ((sorted.len() - 1) as f32 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}
