//! Persisted user settings
//!
//! A small key/value store kept as camelCase JSON in
//! `<data_dir>/settings.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Lowest accepted microphone sensitivity
pub const MIN_SENSITIVITY: f32 = 15.0;

/// Highest accepted microphone sensitivity
pub const MAX_SENSITIVITY: f32 = 50.0;

/// Greeting spoken on first start
pub const DEFAULT_GREETING: &str =
    "Hello. I'm your voice assistant. How can I help you today?";

/// User settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// n8n webhook that receives transcripts
    pub webhook_url: Option<String>,
    /// Loudness threshold override
    pub mic_sensitivity: Option<f32>,
    /// Whether silence ends a recording
    pub auto_stop_enabled: bool,
    /// Greeting text
    pub greeting_text: String,
    /// Whether the greeting has been spoken
    pub greeting_played: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            mic_sensitivity: None,
            auto_stop_enabled: true,
            greeting_text: DEFAULT_GREETING.to_string(),
            greeting_played: false,
        }
    }
}

impl Settings {
    /// Sensitivity clamped to the accepted range
    #[must_use]
    pub fn sensitivity(&self) -> Option<f32> {
        self.mic_sensitivity
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY))
    }

    /// Configured webhook, ignoring blank values
    #[must_use]
    pub fn webhook(&self) -> Option<&str> {
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
    }
}

/// File-backed settings store
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store backed by `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in the default data directory
    #[must_use]
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("settings.json"))
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings; a missing or corrupt file yields defaults
    #[must_use]
    pub fn load(&self) -> Settings {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read settings");
                return Settings::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to parse settings, using defaults"
            );
            Settings::default()
        })
    }

    /// Persist settings
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    /// Load, modify and persist
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut settings = self.load();
        f(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_data_dir(dir.path());
        let settings = store.load();
        assert_eq!(settings, Settings::default());
        assert!(settings.auto_stop_enabled);
        assert!(!settings.greeting_played);
    }

    #[test]
    fn test_camel_case_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_data_dir(dir.path());
        store
            .update(|s| {
                s.webhook_url = Some("https://n8n.local/webhook/abc".to_string());
                s.greeting_played = true;
            })
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"webhookUrl\""));
        assert!(raw.contains("\"greetingPlayed\": true"));
        assert_eq!(store.load().webhook(), Some("https://n8n.local/webhook/abc"));
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_data_dir(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load(), Settings::default());
    }

    #[test]
    fn test_sensitivity_is_clamped() {
        let mut settings = Settings {
            mic_sensitivity: Some(80.0),
            ..Settings::default()
        };
        assert_eq!(settings.sensitivity(), Some(MAX_SENSITIVITY));
        settings.mic_sensitivity = Some(3.0);
        assert_eq!(settings.sensitivity(), Some(MIN_SENSITIVITY));
        settings.mic_sensitivity = None;
        assert_eq!(settings.sensitivity(), None);
    }

    #[test]
    fn test_blank_webhook_is_none() {
        let settings = Settings {
            webhook_url: Some("   ".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.webhook(), None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"micSensitivity": 20}"#).unwrap();
        assert_eq!(settings.mic_sensitivity, Some(20.0));
        assert_eq!(settings.greeting_text, DEFAULT_GREETING);
    }
}
