//! Turn-taking controller
//!
//! A synchronous state machine that gates microphone capture against
//! response playback:
//!
//! ```text
//!  Idle ──start──▶ Listening ──onset──▶ Recording ──stop edge──▶ Processing
//!   ▲                 ▲  ▲                  │ too short             │
//!   │                 │  └──────────────────┘                       │ reply
//!   │                 └──────────── playback ended ◀── Playing ◀────┘
//!   └──────────────────────────── stop (any state)
//! ```
//!
//! Asynchronous work (the backend exchange and playback completion) is handed
//! back to the caller as a [`Pending`] value and fed back in through
//! [`TurnController::complete`], so the analysis tick never blocks.

pub mod driver;
pub mod exchange;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use driver::{Command, VoiceLoop};
pub use exchange::{
    DEFAULT_FALLBACK_RESPONSE, Exchange, ExchangeRequest, Reply, ReplySource, run_exchange,
};

use crate::conversation::{ConversationEntry, ConversationLog, DEFAULT_MAX_ENTRIES};
use crate::transport::Transport;
use crate::voice::{
    AudioDevice, AudioSession, CanonicalEncoder, CaptureConstraints, EnergyAnalyzer,
    MIN_RECORDING_BYTES, PlaybackCompletion, PlaybackControl, Player, Recorder, RecordingHandle,
    SAMPLE_RATE, VadConfig, VoiceActivityDetector, downmix_to_mono,
};
use crate::{Error, Result};

/// Controller state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnState {
    /// Microphone released, nothing running
    #[default]
    Idle,
    /// Microphone open, VAD armed, not recording
    Listening,
    /// Utterance capture active
    Recording,
    /// Utterance sent, awaiting the reply
    Processing,
    /// Assistant audio playing
    Playing,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Recording => "recording",
            Self::Processing => "processing",
            Self::Playing => "speaking",
        };
        write!(f, "{s}")
    }
}

/// How capture coexists with response playback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackPolicy {
    /// Release the microphone while processing and playing
    #[default]
    MicMute,
    /// Keep listening during playback; speech interrupts the assistant
    BargeIn,
}

impl fmt::Display for PlaybackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MicMute => write!(f, "mic-mute"),
            Self::BargeIn => write!(f, "barge-in"),
        }
    }
}

impl std::str::FromStr for PlaybackPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "mic-mute" | "mute" => Ok(Self::MicMute),
            "barge-in" | "bargein" => Ok(Self::BargeIn),
            other => Err(format!("unknown playback policy: {other}")),
        }
    }
}

/// Turn-taking configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnConfig {
    /// Playback interaction policy
    pub policy: PlaybackPolicy,
    /// n8n webhook forwarded with each upload
    pub webhook_url: Option<String>,
    /// Bound on the `Processing` state
    pub processing_timeout: Duration,
    /// Recordings are sealed after this long
    pub max_recording: Duration,
    /// Smaller recordings are dropped
    pub min_recording_bytes: usize,
    /// Conversation entries retained
    pub max_entries: usize,
    /// Spoken when the workflow produces no reply
    pub fallback_response: String,
    /// Re-encode recordings as mono 16-bit WAV before upload
    pub encode_wav: bool,
    /// Sample rate of re-encoded recordings
    pub target_sample_rate: u32,
    /// Lead-in kept from before the first speech tick
    ///
    /// The speech that confirmed the onset is always kept on top of this.
    pub pre_roll: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            policy: PlaybackPolicy::default(),
            webhook_url: None,
            processing_timeout: Duration::from_secs(60),
            max_recording: Duration::from_secs(30),
            min_recording_bytes: MIN_RECORDING_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            fallback_response: DEFAULT_FALLBACK_RESPONSE.to_string(),
            encode_wav: true,
            target_sample_rate: SAMPLE_RATE,
            pre_roll: Duration::from_millis(300),
        }
    }
}

/// Observable controller activity
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// State transition
    StateChanged {
        /// Previous state
        from: TurnState,
        /// New state
        to: TurnState,
    },
    /// Loudness of the last tick, for metering
    Level {
        /// Measured loudness
        loudness: f32,
        /// Current VAD threshold
        threshold: f32,
    },
    /// A recording was opened
    RecordingStarted {
        /// Recording id
        recording_id: u64,
    },
    /// A recording was too short and dropped
    RecordingDiscarded {
        /// Recording id
        recording_id: u64,
        /// Packaged size
        bytes: usize,
    },
    /// Transcript received
    Transcript {
        /// Conversation entry id
        entry_id: String,
        /// Transcript text
        text: String,
    },
    /// Reply about to be played
    Reply {
        /// Conversation entry id
        entry_id: String,
        /// Reply text
        text: String,
        /// Reply audio location
        audio_url: String,
        /// Origin of the reply
        source: ReplySource,
    },
    /// Greeting about to be played
    Greeting {
        /// Greeting text
        text: String,
    },
    /// Error caught at the controller boundary
    Error {
        /// User-facing message
        message: String,
        /// Whether retrying can help
        retryable: bool,
    },
}

/// Async work the controller is waiting on
pub enum Pending {
    /// Backend exchange for a sealed recording
    Exchange(BoxFuture<'static, Exchange>),
    /// Response playback
    Playback {
        /// Playback id
        id: u64,
        /// Completion future
        completion: PlaybackCompletion,
    },
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exchange(_) => f.write_str("Pending::Exchange"),
            Self::Playback { id, .. } => write!(f, "Pending::Playback({id})"),
        }
    }
}

impl Pending {
    /// Wait for the work to finish
    pub async fn resolve(&mut self) -> Completion {
        match self {
            Self::Exchange(future) => Completion::Exchange(future.await),
            Self::Playback { id, completion } => Completion::Playback {
                id: *id,
                result: completion.await,
            },
        }
    }
}

/// Finished async work, fed back through [`TurnController::complete`]
#[derive(Debug)]
pub enum Completion {
    /// Backend exchange finished
    Exchange(Exchange),
    /// Playback finished, failed, or was cancelled
    Playback {
        /// Playback id
        id: u64,
        /// Outcome
        result: Result<()>,
    },
}

/// Collaborators the controller drives
pub struct Collaborators {
    /// Microphone source
    pub device: Box<dyn AudioDevice>,
    /// Response audio sink
    pub player: Box<dyn Player>,
    /// Backend client
    pub transport: Arc<dyn Transport>,
}

struct ActiveRecording {
    handle: RecordingHandle,
    started: Instant,
}

struct ActivePlayback {
    id: u64,
    control: PlaybackControl,
}

/// Mutable per-session state owned by the controller
pub struct ControllerContext {
    session: Option<AudioSession>,
    analyzer: Option<EnergyAnalyzer>,
    vad: VoiceActivityDetector,
    recorder: Recorder,
    active: Option<ActiveRecording>,
    pre_roll: VecDeque<f32>,
    epoch: Option<Instant>,
    playback: Option<ActivePlayback>,
    greeting: Option<PlaybackControl>,
    next_playback_id: u64,
    processing: Option<u64>,
    log: ConversationLog,
}

impl ControllerContext {
    fn new(vad: &VadConfig, max_entries: usize) -> Self {
        Self {
            session: None,
            analyzer: None,
            vad: VoiceActivityDetector::new(vad.clone()),
            recorder: Recorder::new(),
            active: None,
            pre_roll: VecDeque::new(),
            epoch: None,
            playback: None,
            greeting: None,
            next_playback_id: 0,
            processing: None,
            log: ConversationLog::new(max_entries),
        }
    }
}

/// The turn-taking state machine
pub struct TurnController {
    state: TurnState,
    config: TurnConfig,
    vad_config: VadConfig,
    constraints: CaptureConstraints,
    encoder: CanonicalEncoder,
    device: Box<dyn AudioDevice>,
    player: Box<dyn Player>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    ctx: ControllerContext,
}

impl TurnController {
    /// Create a controller and the receiver for its events
    #[must_use]
    pub fn new(
        config: TurnConfig,
        vad_config: VadConfig,
        constraints: CaptureConstraints,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = ControllerContext::new(&vad_config, config.max_entries);
        let controller = Self {
            state: TurnState::Idle,
            encoder: CanonicalEncoder::new(config.target_sample_rate),
            config,
            vad_config,
            constraints,
            device: collaborators.device,
            player: collaborators.player,
            transport: collaborators.transport,
            events,
            ctx,
        };
        (controller, rx)
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Turn configuration
    #[must_use]
    pub const fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Analysis tick period
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        self.vad_config.check_interval
    }

    /// Conversation history
    #[must_use]
    pub const fn conversation(&self) -> &ConversationLog {
        &self.ctx.log
    }

    /// Voice activity detector state
    #[must_use]
    pub const fn vad(&self) -> &VoiceActivityDetector {
        &self.ctx.vad
    }

    /// Whether a microphone session is held
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.ctx.session.as_ref().is_some_and(AudioSession::is_live)
    }

    /// Replace the webhook used for future uploads
    pub fn set_webhook_url(&mut self, webhook_url: Option<String>) {
        self.config.webhook_url = webhook_url;
    }

    /// `Idle -> Listening`: acquire the microphone and arm the VAD
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the microphone cannot be acquired; the
    /// controller stays `Idle`.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != TurnState::Idle {
            return Ok(());
        }

        let session = match self.device.acquire(&self.constraints) {
            Ok(session) => session,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };

        self.ctx.vad.reset();
        self.ctx.epoch = Some(now);
        self.install_session(session);
        self.transition(TurnState::Listening);
        Ok(())
    }

    /// Any state `-> Idle`: release everything
    ///
    /// Any outstanding [`Pending`] work becomes stale and should be dropped.
    pub fn stop(&mut self) {
        if self.state == TurnState::Idle {
            return;
        }

        if let Some(playback) = self.ctx.playback.take() {
            playback.control.cancel();
        }
        self.ctx.processing = None;
        if self.ctx.active.take().is_some() {
            self.ctx.recorder.discard();
        }
        self.release_session();
        self.ctx.vad.reset();
        self.ctx.epoch = None;
        self.transition(TurnState::Idle);
    }

    /// Run one analysis tick
    ///
    /// No-op outside `Listening`, `Recording` and (barge-in) `Playing`.
    pub fn tick(&mut self, now: Instant) -> Option<Pending> {
        if !matches!(
            self.state,
            TurnState::Listening | TurnState::Recording | TurnState::Playing
        ) {
            // Keep the capture buffer drained while a barge-in session idles
            if let Some(session) = &self.ctx.session {
                let _ = session.take_samples();
            }
            return None;
        }

        let session = self.ctx.session.as_ref()?;
        let channels = session.channels();
        let samples = session.take_samples();
        let mono = downmix_to_mono(&samples, channels);

        let analyzer = self.ctx.analyzer.as_mut()?;
        analyzer.push(&mono);
        let measurement = analyzer.measure();

        let elapsed = now.saturating_duration_since(self.ctx.epoch.unwrap_or(now));
        let decision = self.ctx.vad.process(measurement, elapsed);
        self.emit(ControllerEvent::Level {
            loudness: measurement.loudness,
            threshold: self.ctx.vad.threshold(),
        });

        match self.state {
            TurnState::Listening => {
                self.buffer_pre_roll(samples);
                if decision.should_start_recording {
                    self.begin_recording(now);
                }
                None
            }
            TurnState::Recording => {
                if let Some(active) = &self.ctx.active {
                    self.ctx.recorder.append(active.handle, samples);
                }
                let over_length = self
                    .ctx
                    .active
                    .as_ref()
                    .is_some_and(|a| now.saturating_duration_since(a.started) >= self.config.max_recording);
                if over_length {
                    tracing::info!(
                        max_secs = self.config.max_recording.as_secs(),
                        "maximum recording length reached"
                    );
                }
                if decision.should_stop_recording || over_length {
                    return self.finish_recording();
                }
                None
            }
            TurnState::Playing => {
                self.buffer_pre_roll(samples);
                if decision.should_start_recording {
                    tracing::info!("speech during playback, interrupting");
                    if let Some(playback) = self.ctx.playback.take() {
                        playback.control.cancel();
                    }
                    self.transition(TurnState::Listening);
                    self.begin_recording(now);
                }
                None
            }
            TurnState::Idle | TurnState::Processing => None,
        }
    }

    /// `Recording -> Processing` on a user-initiated stop
    pub fn force_stop_recording(&mut self) -> Option<Pending> {
        if self.state != TurnState::Recording {
            return None;
        }
        tracing::debug!("recording stopped by user");
        self.finish_recording()
    }

    /// Feed back finished async work
    pub fn complete(&mut self, completion: Completion) -> Option<Pending> {
        match completion {
            Completion::Exchange(exchange) => self.complete_exchange(exchange),
            Completion::Playback { id, result } => {
                if self.ctx.playback.as_ref().map(|p| p.id) != Some(id) {
                    tracing::debug!(id, "ignoring stale playback completion");
                    return None;
                }
                self.ctx.playback = None;

                if let Err(e) = result {
                    self.report(&e);
                }
                if self.state == TurnState::Playing {
                    self.resume_listening();
                }
                None
            }
        }
    }

    /// Synthesize and play `text` outside the turn cycle
    ///
    /// # Errors
    ///
    /// Returns error if synthesis, download or playback fails
    pub async fn play_greeting(&mut self, text: &str) -> Result<()> {
        let result = self.speak_greeting(text).await;
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    async fn speak_greeting(&mut self, text: &str) -> Result<()> {
        let reply = exchange::synthesize(self.transport.as_ref(), text, ReplySource::Greeting).await?;
        self.emit(ControllerEvent::Greeting {
            text: reply.text.clone(),
        });
        let handle = self.player.play(reply.audio)?;
        self.ctx.greeting = Some(handle.control);
        let result = handle.completion.await;
        self.ctx.greeting = None;
        result
    }

    /// Stop a greeting whose [`Self::play_greeting`] future was dropped
    pub fn cancel_greeting(&mut self) {
        if let Some(control) = self.ctx.greeting.take() {
            tracing::debug!("greeting cancelled");
            control.cancel();
        }
    }

    fn complete_exchange(&mut self, exchange: Exchange) -> Option<Pending> {
        if self.state != TurnState::Processing || self.ctx.processing != Some(exchange.recording_id)
        {
            tracing::debug!(
                recording_id = exchange.recording_id,
                "ignoring stale exchange"
            );
            return None;
        }
        self.ctx.processing = None;

        if let Some(text) = &exchange.transcript {
            if let Some(entry) = self.ctx.log.get_mut(&exchange.entry_id) {
                entry.transcript = Some(text.clone());
            }
            self.emit(ControllerEvent::Transcript {
                entry_id: exchange.entry_id.clone(),
                text: text.clone(),
            });
        }

        let reply = match exchange.result {
            Ok(reply) => reply,
            Err(e) => {
                if let Some(entry) = self.ctx.log.get_mut(&exchange.entry_id) {
                    entry.error = Some(e.user_message());
                }
                self.report(&e);
                self.resume_listening();
                return None;
            }
        };

        if let Some(entry) = self.ctx.log.get_mut(&exchange.entry_id) {
            entry.response = Some(reply.text.clone());
            entry.audio_url = Some(reply.audio_url.clone());
        }
        self.emit(ControllerEvent::Reply {
            entry_id: exchange.entry_id.clone(),
            text: reply.text.clone(),
            audio_url: reply.audio_url.clone(),
            source: reply.source,
        });

        match self.player.play(reply.audio) {
            Ok(handle) => {
                self.ctx.next_playback_id += 1;
                let id = self.ctx.next_playback_id;
                self.ctx.playback = Some(ActivePlayback {
                    id,
                    control: handle.control,
                });
                if self.config.policy == PlaybackPolicy::BargeIn {
                    self.ctx.vad.end_utterance();
                }
                self.transition(TurnState::Playing);
                Some(Pending::Playback {
                    id,
                    completion: handle.completion,
                })
            }
            Err(e) => {
                if let Some(entry) = self.ctx.log.get_mut(&exchange.entry_id) {
                    entry.error = Some(e.user_message());
                }
                self.report(&e);
                self.resume_listening();
                None
            }
        }
    }

    fn begin_recording(&mut self, now: Instant) {
        let Some(session) = &self.ctx.session else {
            return;
        };
        let handle = self.ctx.recorder.start_recording(session);
        let pre_roll: Vec<f32> = self.ctx.pre_roll.drain(..).collect();
        self.ctx.recorder.append(handle, pre_roll);
        self.ctx.active = Some(ActiveRecording {
            handle,
            started: now,
        });
        self.transition(TurnState::Recording);
        self.emit(ControllerEvent::RecordingStarted {
            recording_id: handle.id(),
        });
    }

    /// Seal the open recording and start the exchange
    fn finish_recording(&mut self) -> Option<Pending> {
        let active = self.ctx.active.take()?;
        self.ctx.vad.end_utterance();

        let recording = match self.ctx.recorder.stop(active.handle) {
            Ok(Some(recording)) => recording,
            Ok(None) => {
                self.transition(TurnState::Listening);
                return None;
            }
            Err(e) => {
                self.report(&e);
                self.transition(TurnState::Listening);
                return None;
            }
        };

        if recording.is_too_short(self.config.min_recording_bytes) {
            tracing::debug!(
                recording_id = recording.id,
                bytes = recording.byte_size(),
                min_bytes = self.config.min_recording_bytes,
                "recording too short, discarding"
            );
            self.emit(ControllerEvent::RecordingDiscarded {
                recording_id: recording.id,
                bytes: recording.byte_size(),
            });
            self.transition(TurnState::Listening);
            return None;
        }

        let Some(webhook_url) = self
            .config
            .webhook_url
            .clone()
            .filter(|w| !w.trim().is_empty())
        else {
            self.report(&Error::Configuration(
                "Please configure the n8n webhook URL in settings".to_string(),
            ));
            self.transition(TurnState::Listening);
            return None;
        };

        let audio = if self.config.encode_wav {
            self.encoder.encode_or_passthrough(recording.audio)
        } else {
            recording.audio
        };

        let entry = ConversationEntry::new(recording.id);
        let entry_id = entry.id.clone();
        self.ctx.log.push(entry);
        self.ctx.processing = Some(recording.id);

        if self.config.policy == PlaybackPolicy::MicMute {
            self.release_session();
        }
        self.transition(TurnState::Processing);

        tracing::info!(
            recording_id = recording.id,
            bytes = audio.len(),
            mime = %audio.mime_type,
            "utterance sealed, processing"
        );

        let request = ExchangeRequest {
            recording_id: recording.id,
            entry_id,
            audio,
            webhook_url,
            fallback_response: self.config.fallback_response.clone(),
            timeout: self.config.processing_timeout,
        };
        Some(Pending::Exchange(Box::pin(run_exchange(
            Arc::clone(&self.transport),
            request,
        ))))
    }

    /// Return to `Listening`, reacquiring the microphone if it was released
    fn resume_listening(&mut self) {
        if self.ctx.session.is_none() {
            match self.device.acquire(&self.constraints) {
                Ok(session) => self.install_session(session),
                Err(e) => {
                    self.report(&e);
                    self.stop();
                    return;
                }
            }
        }
        self.ctx.vad.end_utterance();
        self.transition(TurnState::Listening);
    }

    fn install_session(&mut self, session: AudioSession) {
        self.ctx.analyzer = Some(EnergyAnalyzer::new(
            session.sample_rate(),
            self.vad_config.strategy,
            self.vad_config.smoothing,
        ));
        self.ctx.pre_roll.clear();
        self.ctx.session = Some(session);
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.ctx.session.take() {
            session.release();
        }
        self.ctx.analyzer = None;
        self.ctx.pre_roll.clear();
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn buffer_pre_roll(&mut self, samples: Vec<f32>) {
        let Some(session) = &self.ctx.session else {
            return;
        };
        // Lead-in, plus every speech tick up to and including the onset tick
        let window =
            self.config.pre_roll + self.vad_config.min_speech + self.vad_config.check_interval;
        let capacity = (window.as_secs_f64()
            * f64::from(session.sample_rate())
            * f64::from(session.channels())) as usize;
        if capacity == 0 {
            return;
        }

        self.ctx.pre_roll.extend(samples);
        let excess = self.ctx.pre_roll.len().saturating_sub(capacity);
        self.ctx.pre_roll.drain(..excess);
    }

    fn transition(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::debug!(%from, %to, "state changed");
        self.emit(ControllerEvent::StateChanged { from, to });
    }

    fn report(&self, error: &Error) {
        match error {
            Error::Configuration(_) => tracing::warn!(error = %error, "configuration error"),
            _ => tracing::error!(error = %error, "voice error"),
        }
        self.emit(ControllerEvent::Error {
            message: error.user_message(),
            retryable: error.is_retryable(),
        });
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("mic-mute".parse::<PlaybackPolicy>().unwrap(), PlaybackPolicy::MicMute);
        assert_eq!("Barge_In".parse::<PlaybackPolicy>().unwrap(), PlaybackPolicy::BargeIn);
        assert!("shout".parse::<PlaybackPolicy>().is_err());
        assert_eq!(PlaybackPolicy::default(), PlaybackPolicy::MicMute);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TurnState::Playing.to_string(), "speaking");
        assert_eq!(TurnState::Listening.to_string(), "listening");
    }

    #[test]
    fn test_defaults() {
        let config = TurnConfig::default();
        assert_eq!(config.min_recording_bytes, 1000);
        assert_eq!(config.processing_timeout, Duration::from_secs(60));
        assert_eq!(config.max_entries, 20);
        assert!(config.webhook_url.is_none());
    }
}
