//! Configuration management for the voice interface
//!
//! Precedence: environment variables > TOML file > built-in defaults. The
//! persisted [`Settings`] are applied last for the values the user edits at
//! runtime (webhook, sensitivity, auto-stop), with the environment still
//! winning for the webhook.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::controller::{PlaybackPolicy, TurnConfig};
use crate::settings::Settings;
use crate::voice::{CaptureConstraints, LoudnessStrategy, VadConfig, VadMode};
use crate::{Error, Result};

pub use file::{
    VoiceConfigFile, config_file_path, load_config_file, load_config_file_from, save_config_file,
};

/// Default backend origin
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Transcription/TTS server origin
    pub server_url: String,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Microphone constraints
    pub capture: CaptureConstraints,

    /// Voice activity detection
    pub vad: VadConfig,

    /// Turn-taking
    pub turn: TurnConfig,

    /// Data directory (settings)
    pub data_dir: PathBuf,

    /// Webhook set through the environment, overriding settings
    webhook_override: Option<String>,
}

impl Config {
    /// Build from a parsed config file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for invalid values
    pub fn from_sources(fc: VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let server_url = env("N8N_VOICE_SERVER_URL")
            .or(fc.server.base_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let request_timeout = Duration::from_secs(
            fc.server
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );

        let defaults = CaptureConstraints::default();
        let capture = CaptureConstraints {
            sample_rate: fc.capture.sample_rate.unwrap_or(defaults.sample_rate),
            channels: fc.capture.channels.unwrap_or(defaults.channels).max(1),
            echo_cancellation: fc
                .capture
                .echo_cancellation
                .unwrap_or(defaults.echo_cancellation),
            noise_suppression: fc
                .capture
                .noise_suppression
                .unwrap_or(defaults.noise_suppression),
            auto_gain_control: fc
                .capture
                .auto_gain_control
                .unwrap_or(defaults.auto_gain_control),
        };

        let mode = env("N8N_VOICE_VAD_MODE")
            .or(fc.vad.mode.clone())
            .map(|m| m.parse::<VadMode>().map_err(Error::Configuration))
            .transpose()?
            .unwrap_or_default();
        let vad = vad_config(mode, &fc.vad)?;

        let policy = env("N8N_VOICE_POLICY")
            .or(fc.turn.policy.clone())
            .map(|p| p.parse::<PlaybackPolicy>().map_err(Error::Configuration))
            .transpose()?
            .unwrap_or_default();

        let turn_defaults = TurnConfig::default();
        let t = &fc.turn;
        let turn = TurnConfig {
            policy,
            webhook_url: None,
            processing_timeout: t
                .processing_timeout_secs
                .map_or(turn_defaults.processing_timeout, Duration::from_secs),
            max_recording: t
                .max_recording_secs
                .map_or(turn_defaults.max_recording, Duration::from_secs),
            min_recording_bytes: t
                .min_recording_bytes
                .unwrap_or(turn_defaults.min_recording_bytes),
            max_entries: t.max_entries.unwrap_or(turn_defaults.max_entries).max(1),
            fallback_response: t
                .fallback_response
                .clone()
                .filter(|f| !f.trim().is_empty())
                .unwrap_or(turn_defaults.fallback_response),
            encode_wav: t.encode_wav.unwrap_or(turn_defaults.encode_wav),
            target_sample_rate: t
                .target_sample_rate
                .unwrap_or(turn_defaults.target_sample_rate),
            pre_roll: t
                .pre_roll_ms
                .map_or(turn_defaults.pre_roll, Duration::from_millis),
        };

        Ok(Self {
            server_url,
            request_timeout,
            capture,
            vad,
            turn,
            data_dir: default_data_dir(),
            webhook_override: env("N8N_VOICE_WEBHOOK_URL"),
        })
    }

    /// Apply persisted user settings
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.turn.webhook_url = self
            .webhook_override
            .clone()
            .or_else(|| settings.webhook().map(str::to_string));

        if let Some(sensitivity) = settings.sensitivity() {
            self.vad.threshold = sensitivity;
        }
        self.vad.auto_stop = settings.auto_stop_enabled;
    }

    /// Settings file in the data directory
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}

fn vad_config(mode: VadMode, f: &file::VadFileConfig) -> Result<VadConfig> {
    let d = VadConfig::for_mode(mode);
    let ms = |v: Option<u64>, default: Duration| v.map_or(default, Duration::from_millis);

    let strategy = f
        .strategy
        .as_deref()
        .map(|s| match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "broadband" => Ok(LoudnessStrategy::Broadband),
            "speech-band" | "speech" => Ok(LoudnessStrategy::SpeechBand),
            other => Err(Error::Configuration(format!("unknown loudness strategy: {other}"))),
        })
        .transpose()?
        .unwrap_or(d.strategy);

    let config = VadConfig {
        mode,
        threshold: f.threshold.unwrap_or(d.threshold),
        silence_timeout: ms(f.silence_timeout_ms, d.silence_timeout),
        extended_silence_timeout: ms(f.extended_silence_timeout_ms, d.extended_silence_timeout),
        long_utterance: ms(f.long_utterance_ms, d.long_utterance),
        min_speech: ms(f.min_speech_ms, d.min_speech),
        check_interval: ms(f.check_interval_ms, d.check_interval),
        calibration: ms(f.calibration_ms, d.calibration),
        calibration_margin: f.calibration_margin.unwrap_or(d.calibration_margin),
        history_len: f.history_len.unwrap_or(d.history_len).max(1),
        adaptation_rate: f.adaptation_rate.unwrap_or(d.adaptation_rate),
        smoothing: f.smoothing.unwrap_or(d.smoothing),
        zcr_threshold: f.zcr_threshold.unwrap_or(d.zcr_threshold),
        zcr_energy_ratio: d.zcr_energy_ratio,
        strategy,
        auto_stop: d.auto_stop,
    };

    if config.check_interval.is_zero() {
        return Err(Error::Configuration(
            "vad.check_interval_ms must be greater than zero".to_string(),
        ));
    }
    Ok(config)
}

/// Return the data directory: `~/.local/share/n8n-voice`
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".n8n-voice"),
        |d| d.data_dir().join("n8n-voice"),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(VoiceConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.vad.mode, VadMode::Adaptive);
        assert_eq!(config.turn.policy, PlaybackPolicy::MicMute);
        assert_eq!(config.capture.sample_rate, 16000);
        assert_eq!(config.turn.pre_roll, Duration::from_millis(300));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut fc = VoiceConfigFile::default();
        fc.server.base_url = Some("http://file:1".to_string());
        fc.vad.mode = Some("adaptive".to_string());
        fc.vad.silence_timeout_ms = Some(900);

        let config = Config::from_sources(
            fc,
            env_of(&[
                ("N8N_VOICE_SERVER_URL", "http://env:2"),
                ("N8N_VOICE_VAD_MODE", "basic"),
                ("N8N_VOICE_POLICY", "barge-in"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server_url, "http://env:2");
        assert_eq!(config.vad.mode, VadMode::Basic);
        assert_eq!(config.vad.silence_timeout, Duration::from_millis(900));
        assert_eq!(config.turn.policy, PlaybackPolicy::BargeIn);
    }

    #[test]
    fn test_invalid_policy_is_error() {
        let result = Config::from_sources(
            VoiceConfigFile::default(),
            env_of(&[("N8N_VOICE_POLICY", "sometimes")]),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_settings_override_threshold_and_auto_stop() {
        let mut config = Config::from_sources(VoiceConfigFile::default(), env_of(&[])).unwrap();
        config.apply_settings(&Settings {
            webhook_url: Some("https://n8n/webhook/1".to_string()),
            mic_sensitivity: Some(22.0),
            auto_stop_enabled: false,
            ..Settings::default()
        });

        assert!((config.vad.threshold - 22.0).abs() < f32::EPSILON);
        assert!(!config.vad.auto_stop);
        assert_eq!(config.turn.webhook_url.as_deref(), Some("https://n8n/webhook/1"));
    }

    #[test]
    fn test_env_webhook_wins_over_settings() {
        let mut config = Config::from_sources(
            VoiceConfigFile::default(),
            env_of(&[("N8N_VOICE_WEBHOOK_URL", "https://env/webhook")]),
        )
        .unwrap();
        config.apply_settings(&Settings {
            webhook_url: Some("https://settings/webhook".to_string()),
            ..Settings::default()
        });
        assert_eq!(config.turn.webhook_url.as_deref(), Some("https://env/webhook"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut fc = VoiceConfigFile::default();
        fc.vad.check_interval_ms = Some(0);
        assert!(Config::from_sources(fc, env_of(&[])).is_err());
    }
}
