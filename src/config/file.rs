//! TOML configuration file loading
//!
//! Supports `~/.config/n8n-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct VoiceConfigFile {
    /// Backend server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Microphone capture configuration
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Voice activity detection configuration
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Turn-taking configuration
    #[serde(default)]
    pub turn: TurnFileConfig,
}

/// Backend server configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerFileConfig {
    /// Transcription/TTS server origin (e.g. "http://localhost:8080")
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Microphone capture configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureFileConfig {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub auto_gain_control: Option<bool>,
}

/// Voice activity detection configuration
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct VadFileConfig {
    /// "basic" or "adaptive"
    pub mode: Option<String>,
    /// Loudness threshold on the 0-255 scale
    pub threshold: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
    pub extended_silence_timeout_ms: Option<u64>,
    pub long_utterance_ms: Option<u64>,
    pub min_speech_ms: Option<u64>,
    pub check_interval_ms: Option<u64>,
    pub calibration_ms: Option<u64>,
    pub calibration_margin: Option<f32>,
    pub history_len: Option<usize>,
    pub adaptation_rate: Option<f32>,
    /// Spectral smoothing (0.0-0.99)
    pub smoothing: Option<f32>,
    pub zcr_threshold: Option<f32>,
    /// "broadband" or "speech-band"
    pub strategy: Option<String>,
}

/// Turn-taking configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TurnFileConfig {
    /// "mic-mute" or "barge-in"
    pub policy: Option<String>,
    pub processing_timeout_secs: Option<u64>,
    pub max_recording_secs: Option<u64>,
    pub min_recording_bytes: Option<usize>,
    pub max_entries: Option<usize>,
    /// Spoken when the workflow produces no reply
    pub fallback_response: Option<String>,
    /// Re-encode recordings as mono 16-bit WAV before upload
    pub encode_wav: Option<bool>,
    pub target_sample_rate: Option<u32>,
    pub pre_roll_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    config_file_path().map_or_else(VoiceConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_file_from(path: &Path) -> VoiceConfigFile {
    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Write `config` to `path`, creating parent directories
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn save_config_file(config: &VoiceConfigFile, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| crate::Error::Configuration(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "saved config file");
    Ok(())
}

/// Return the config file path: `~/.config/n8n-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("n8n-voice").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let fc: VoiceConfigFile = toml::from_str(
            r#"
            [server]
            base_url = "http://voice.local:9000"

            [vad]
            mode = "basic"
            threshold = 22.5
            "#,
        )
        .unwrap();

        assert_eq!(fc.server.base_url.as_deref(), Some("http://voice.local:9000"));
        assert_eq!(fc.vad.mode.as_deref(), Some("basic"));
        assert_eq!(fc.vad.threshold, Some(22.5));
        assert_eq!(fc.turn, TurnFileConfig::default());
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nbase_url = ").unwrap();
        assert_eq!(load_config_file_from(&path), VoiceConfigFile::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut fc = VoiceConfigFile::default();
        fc.turn.policy = Some("barge-in".to_string());

        save_config_file(&fc, &path).unwrap();
        assert_eq!(load_config_file_from(&path), fc);
    }
}
