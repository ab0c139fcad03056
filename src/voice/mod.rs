//! Voice processing module
//!
//! Handles microphone capture, energy analysis, voice activity detection,
//! utterance recording, audio encoding, and playback.

mod analyzer;
mod capture;
mod encoder;
mod playback;
mod recorder;
mod vad;

pub use analyzer::{
    DEFAULT_SMOOTHING, EnergyAnalyzer, FFT_SIZE, LoudnessStrategy, Measurement, zero_crossing_rate,
};
pub use capture::{
    AudioDevice, AudioSession, CaptureConstraints, CpalMicrophone, DeviceTrack, SAMPLE_RATE,
    SampleBuffer,
};
pub use encoder::{
    AudioBlob, CanonicalEncoder, DecodedAudio, WAV_HEADER_LEN, WavHeader, decode_audio,
    downmix_to_mono, resample_linear, samples_to_wav,
};
pub use playback::{
    AudioPlayback, PlaybackCompletion, PlaybackControl, PlaybackHandle, PlaybackReporter, Player,
    resample_audio,
};
pub use recorder::{
    MIN_RECORDING_BYTES, RECORDER_MIME_TYPE, Recorder, RecorderFormat, RecordingHandle,
    UtteranceRecording,
};
pub use vad::{Classification, VadConfig, VadDecision, VadMode, VoiceActivityDetector};
