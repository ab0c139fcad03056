//! n8n Voice - hands-free voice front end for n8n workflows
//!
//! This library provides the core functionality for the voice interface:
//! - Microphone capture and spectral energy analysis
//! - Voice activity detection (basic and adaptive)
//! - Turn-taking between the user and the assistant
//! - Transcription upload and speech synthesis via the voice backend
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      CLI                             │
//! │   run  │  test-mic  │  test-tts  │  settings  │ ... │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Turn Controller                       │
//! │   Capture  │  Analyzer  │  VAD  │  Recorder  │ Play │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Voice Backend (HTTP)                    │
//! │   /transcribe  │  /speak  │  /last-response         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod settings;
pub mod setup;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use controller::{
    Collaborators, Command, ControllerEvent, PlaybackPolicy, TurnConfig, TurnController, TurnState,
    VoiceLoop,
};
pub use conversation::{ConversationEntry, ConversationLog};
pub use error::{Error, Result};
pub use settings::{Settings, SettingsStore};
pub use transport::{HttpTransport, Transport};
