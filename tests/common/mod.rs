//! Shared test utilities
//!
//! Fakes for the controller's seams: a scripted microphone, an in-memory
//! backend and a player whose completions the test drives by hand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use n8n_voice::controller::Pending;
use n8n_voice::transport::{SpeechResponse, TranscribeResponse, WorkflowReply};
use n8n_voice::voice::{
    AudioBlob, AudioDevice, AudioSession, CaptureConstraints, DeviceTrack, LoudnessStrategy,
    PlaybackHandle, PlaybackReporter, Player, SAMPLE_RATE, SampleBuffer, VadConfig,
};
use n8n_voice::{
    Collaborators, ControllerEvent, Error, Result, Transport, TurnConfig, TurnController, TurnState,
};

/// Webhook used by test configurations
pub const WEBHOOK: &str = "https://n8n.example.com/webhook/voice";

/// Samples per 100 ms tick at 16kHz
pub const CHUNK: usize = SAMPLE_RATE as usize / 10;

/// Tick period used by test configurations
pub const TICK: Duration = Duration::from_millis(100);

/// 1kHz tone, loud in the speech band
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn tone(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 * (std::f32::consts::TAU * 1000.0 * i as f32 / SAMPLE_RATE as f32).sin())
        .collect()
}

/// One tick of speech
#[must_use]
pub fn tone_chunk() -> Vec<f32> {
    tone(CHUNK)
}

/// One tick of silence
#[must_use]
pub fn silence_chunk() -> Vec<f32> {
    vec![0.0; CHUNK]
}

/// Fixed-threshold VAD with no smoothing, so each tick reflects its own chunk
#[must_use]
pub fn vad_config() -> VadConfig {
    VadConfig {
        threshold: 15.0,
        smoothing: 0.0,
        strategy: LoudnessStrategy::SpeechBand,
        check_interval: TICK,
        ..VadConfig::basic()
    }
}

/// Turn configuration with a webhook set
#[must_use]
pub fn turn_config() -> TurnConfig {
    TurnConfig {
        webhook_url: Some(WEBHOOK.to_string()),
        ..TurnConfig::default()
    }
}

// --- Microphone ---

#[derive(Default)]
struct DeviceState {
    acquisitions: Vec<CaptureConstraints>,
    fail: bool,
}

/// Microphone that hands out sessions over one shared sample buffer
pub struct FakeDevice {
    buffer: SampleBuffer,
    state: Arc<Mutex<DeviceState>>,
    stops: Arc<AtomicUsize>,
}

/// Test-side view of a [`FakeDevice`]
#[derive(Clone)]
pub struct DeviceProbe {
    buffer: SampleBuffer,
    state: Arc<Mutex<DeviceState>>,
    stops: Arc<AtomicUsize>,
}

impl FakeDevice {
    /// Create a device and its probe
    #[must_use]
    pub fn new() -> (Self, DeviceProbe) {
        let buffer = SampleBuffer::new();
        let state = Arc::new(Mutex::new(DeviceState::default()));
        let stops = Arc::new(AtomicUsize::new(0));
        let probe = DeviceProbe {
            buffer: buffer.clone(),
            state: Arc::clone(&state),
            stops: Arc::clone(&stops),
        };
        (
            Self {
                buffer,
                state,
                stops,
            },
            probe,
        )
    }
}

impl AudioDevice for FakeDevice {
    fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<AudioSession> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(Error::Device("Permission denied".to_string()));
        }
        state.acquisitions.push(constraints.clone());
        Ok(AudioSession::new(
            constraints.sample_rate,
            constraints.channels,
            self.buffer.clone(),
            Box::new(FakeTrack {
                stops: Arc::clone(&self.stops),
            }),
        ))
    }
}

struct FakeTrack {
    stops: Arc<AtomicUsize>,
}

impl DeviceTrack for FakeTrack {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl DeviceProbe {
    /// Queue captured samples for the next tick
    pub fn push(&self, samples: &[f32]) {
        self.buffer.push(samples);
    }

    /// Make further acquisitions fail
    pub fn set_failing(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Constraints of every successful acquisition
    #[must_use]
    pub fn acquisitions(&self) -> Vec<CaptureConstraints> {
        self.state.lock().unwrap().acquisitions.clone()
    }

    /// Number of device tracks stopped
    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

// --- Backend ---

/// A call received by [`FakeTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Transcribe {
        recording_id: u64,
        webhook_url: String,
        mime_type: String,
        bytes: usize,
    },
    Speak(String),
    FetchLastResponse,
    FetchAudio(String),
}

/// In-memory backend
#[derive(Default)]
pub struct FakeTransport {
    transcript: String,
    inline_reply: Option<String>,
    transcription_error: Option<String>,
    last_response: Option<SpeechResponse>,
    transcribe_delay: Option<Duration>,
    calls: Mutex<Vec<Call>>,
    audio_served: AtomicUsize,
}

impl FakeTransport {
    /// Backend that transcribes `transcript` and optionally replies inline
    #[must_use]
    pub fn replying(transcript: &str, inline_reply: Option<&str>) -> Self {
        Self {
            transcript: transcript.to_string(),
            inline_reply: inline_reply.map(str::to_string),
            ..Self::default()
        }
    }

    /// Backend whose transcription always fails with `detail`
    #[must_use]
    pub fn failing(detail: &str) -> Self {
        Self {
            transcription_error: Some(detail.to_string()),
            ..Self::default()
        }
    }

    /// Serve a stored reply from the last-response endpoint
    #[must_use]
    pub fn with_last_response(mut self, text: &str, audio_url: &str) -> Self {
        self.last_response = Some(SpeechResponse {
            text: text.to_string(),
            audio_url: audio_url.to_string(),
        });
        self
    }

    /// Delay transcription responses
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.transcribe_delay = Some(delay);
        self
    }

    /// Every call received, in order
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Texts passed to `speak`
    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Speak(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn transcribe(
        &self,
        audio: &AudioBlob,
        recording_id: u64,
        webhook_url: &str,
    ) -> Result<TranscribeResponse> {
        self.record(Call::Transcribe {
            recording_id,
            webhook_url: webhook_url.to_string(),
            mime_type: audio.mime_type.clone(),
            bytes: audio.len(),
        });

        if let Some(delay) = self.transcribe_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(detail) = &self.transcription_error {
            return Err(Error::Transcription(detail.clone()));
        }

        Ok(TranscribeResponse {
            text: self.transcript.clone(),
            n8n_response: self.inline_reply.clone().map(|text| WorkflowReply { text: Some(text) }),
        })
    }

    async fn speak(&self, text: &str) -> Result<SpeechResponse> {
        self.record(Call::Speak(text.to_string()));
        let n = self.audio_served.fetch_add(1, Ordering::SeqCst);
        Ok(SpeechResponse {
            text: text.to_string(),
            audio_url: format!("/audio/speech-{n}.mp3"),
        })
    }

    async fn fetch_last_response(&self) -> Result<Option<SpeechResponse>> {
        self.record(Call::FetchLastResponse);
        Ok(self.last_response.clone())
    }

    async fn fetch_audio(&self, audio_url: &str) -> Result<AudioBlob> {
        self.record(Call::FetchAudio(audio_url.to_string()));
        Ok(AudioBlob::new(vec![0xFF, 0xFB, 0x90, 0x00], "audio/mpeg"))
    }
}

// --- Speaker ---

#[derive(Default)]
struct PlayerState {
    played: Vec<AudioBlob>,
    reporters: VecDeque<PlaybackReporter>,
    fail: bool,
    auto_finish: bool,
}

/// Player whose playbacks finish only when the test says so
pub struct FakePlayer {
    state: Arc<Mutex<PlayerState>>,
}

/// Test-side view of a [`FakePlayer`]
#[derive(Clone)]
pub struct PlayerProbe {
    state: Arc<Mutex<PlayerState>>,
}

impl FakePlayer {
    /// Create a player and its probe
    #[must_use]
    pub fn new() -> (Self, PlayerProbe) {
        let state = Arc::new(Mutex::new(PlayerState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            PlayerProbe { state },
        )
    }
}

impl Player for FakePlayer {
    fn play(&mut self, audio: AudioBlob) -> Result<PlaybackHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(Error::Playback("output device unavailable".to_string()));
        }
        state.played.push(audio);

        let (handle, reporter) = PlaybackHandle::pair();
        if state.auto_finish {
            reporter.finish(Ok(()));
        } else {
            state.reporters.push_back(reporter);
        }
        Ok(handle)
    }
}

impl PlayerProbe {
    /// Number of blobs handed to the player
    #[must_use]
    pub fn played(&self) -> usize {
        self.state.lock().unwrap().played.len()
    }

    /// Make `play` fail
    pub fn set_failing(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Finish every playback as soon as it starts
    pub fn set_auto_finish(&self, auto: bool) {
        self.state.lock().unwrap().auto_finish = auto;
    }

    /// Whether the oldest unfinished playback was cancelled
    #[must_use]
    pub fn oldest_cancelled(&self) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .reporters
            .front()
            .map(PlaybackReporter::is_cancelled)
    }

    /// Report the oldest unfinished playback as done
    pub fn finish_oldest(&self, result: Result<()>) {
        let reporter = self.state.lock().unwrap().reporters.pop_front();
        if let Some(reporter) = reporter {
            reporter.finish(result);
        }
    }
}

// --- Harness ---

/// A controller wired to fakes, with a manual clock
pub struct Harness {
    pub controller: TurnController,
    pub events: mpsc::UnboundedReceiver<ControllerEvent>,
    pub device: DeviceProbe,
    pub player: PlayerProbe,
    pub transport: Arc<FakeTransport>,
    pub t0: Instant,
    pub ticks: u32,
}

impl Harness {
    /// Build with the default test VAD
    #[must_use]
    pub fn new(turn: TurnConfig, transport: FakeTransport) -> Self {
        Self::with_vad(turn, vad_config(), transport)
    }

    /// Build with an explicit VAD configuration
    #[must_use]
    pub fn with_vad(turn: TurnConfig, vad: VadConfig, transport: FakeTransport) -> Self {
        let (device, device_probe) = FakeDevice::new();
        let (player, player_probe) = FakePlayer::new();
        let transport = Arc::new(transport);
        let (controller, events) = TurnController::new(
            turn,
            vad,
            CaptureConstraints::default(),
            Collaborators {
                device: Box::new(device),
                player: Box::new(player),
                transport: Arc::clone(&transport) as Arc<dyn Transport>,
            },
        );
        Self {
            controller,
            events,
            device: device_probe,
            player: player_probe,
            transport,
            t0: Instant::now(),
            ticks: 0,
        }
    }

    /// Start listening at the harness epoch
    pub fn start(&mut self) -> Result<()> {
        self.controller.start(self.t0)
    }

    /// Capture `chunk` and run the next tick
    pub fn feed(&mut self, chunk: &[f32]) -> Option<Pending> {
        self.device.push(chunk);
        let now = self.t0 + TICK * self.ticks;
        self.ticks += 1;
        self.controller.tick(now)
    }

    /// Feed speech until a recording opens
    pub fn speak_until_recording(&mut self) {
        for _ in 0..20 {
            assert!(self.feed(&tone_chunk()).is_none());
            if self.controller.state() == TurnState::Recording {
                return;
            }
        }
        panic!("recording never started");
    }

    /// Record an utterance and seal it, returning the exchange
    pub fn utterance(&mut self) -> Pending {
        self.speak_until_recording();
        self.feed(&tone_chunk());
        self.controller
            .force_stop_recording()
            .expect("recording should produce an exchange")
    }

    /// Resolve pending work and feed it back
    pub async fn settle(&mut self, mut pending: Pending) -> Option<Pending> {
        let done = pending.resolve().await;
        self.controller.complete(done)
    }

    /// Run a full turn, finishing playback successfully
    pub async fn full_turn(&mut self) {
        let exchange = self.utterance();
        let playback = self
            .settle(exchange)
            .await
            .expect("reply should start playback");
        self.player.finish_oldest(Ok(()));
        assert!(self.settle(playback).await.is_none());
        assert_eq!(self.controller.state(), TurnState::Listening);
    }

    /// Everything emitted so far
    pub fn drain_events(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Error events emitted so far
    pub fn errors(&mut self) -> Vec<(String, bool)> {
        self.drain_events()
            .into_iter()
            .filter_map(|e| match e {
                ControllerEvent::Error { message, retryable } => Some((message, retryable)),
                _ => None,
            })
            .collect()
    }
}
