//! Utterance recorder
//!
//! Buffers raw audio chunks for one utterance and packages them into a WAV
//! payload tagged with the format the session actually negotiated.

use chrono::{DateTime, Utc};

use super::capture::AudioSession;
use super::encoder::{AudioBlob, samples_to_wav};
use crate::Result;

/// Recordings smaller than this are treated as spurious
pub const MIN_RECORDING_BYTES: usize = 1000;

/// MIME type produced by the recorder
pub const RECORDER_MIME_TYPE: &str = "audio/wav";

/// Format negotiated for recordings from one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderFormat {
    /// MIME type of packaged recordings
    pub mime_type: String,
    /// Sample rate reported by the session
    pub sample_rate: u32,
    /// Channel count reported by the session
    pub channels: u16,
}

impl RecorderFormat {
    /// Query the negotiated format from a live session
    #[must_use]
    pub fn for_session(session: &AudioSession) -> Self {
        Self {
            mime_type: RECORDER_MIME_TYPE.to_string(),
            sample_rate: session.sample_rate(),
            channels: session.channels(),
        }
    }
}

/// Opaque reference to an open recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordingHandle {
    id: u64,
}

impl RecordingHandle {
    /// Sequence id of the recording
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// A sealed utterance
#[derive(Debug, Clone)]
pub struct UtteranceRecording {
    /// Monotonic sequence id
    pub id: u64,
    /// When capture began
    pub started_at: DateTime<Utc>,
    /// When capture was sealed
    pub stopped_at: DateTime<Utc>,
    /// Number of chunks appended
    pub chunk_count: usize,
    /// Packaged audio
    pub audio: AudioBlob,
}

impl UtteranceRecording {
    /// Packaged size in bytes
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.audio.len()
    }

    /// MIME type of the packaged audio
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.audio.mime_type
    }

    /// Whether the recording is too small to be meaningful speech
    #[must_use]
    pub fn is_too_short(&self, min_bytes: usize) -> bool {
        self.byte_size() < min_bytes
    }
}

struct OpenRecording {
    id: u64,
    started_at: DateTime<Utc>,
    format: RecorderFormat,
    chunks: Vec<Vec<f32>>,
}

/// Records at most one utterance at a time
#[derive(Default)]
pub struct Recorder {
    next_id: u64,
    open: Option<OpenRecording>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("next_id", &self.next_id)
            .field("open", &self.open.as_ref().map(|r| r.id))
            .finish()
    }
}

impl Recorder {
    /// Create an idle recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a recording on `session`
    ///
    /// If a recording is already open its handle is returned unchanged.
    pub fn start_recording(&mut self, session: &AudioSession) -> RecordingHandle {
        if let Some(open) = &self.open {
            tracing::debug!(id = open.id, "recording already open");
            return RecordingHandle { id: open.id };
        }

        self.next_id += 1;
        let format = RecorderFormat::for_session(session);
        tracing::debug!(
            id = self.next_id,
            mime = %format.mime_type,
            sample_rate = format.sample_rate,
            channels = format.channels,
            "recording started"
        );

        self.open = Some(OpenRecording {
            id: self.next_id,
            started_at: Utc::now(),
            format,
            chunks: Vec::new(),
        });
        RecordingHandle { id: self.next_id }
    }

    /// Append a chunk of interleaved samples; returns false if `handle` is not open
    pub fn append(&mut self, handle: RecordingHandle, samples: Vec<f32>) -> bool {
        match &mut self.open {
            Some(open) if open.id == handle.id => {
                if !samples.is_empty() {
                    open.chunks.push(samples);
                }
                true
            }
            _ => false,
        }
    }

    /// Seal the recording and package it
    ///
    /// Returns `Ok(None)` if `handle` was already stopped or discarded.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Encoding`] if packaging fails
    pub fn stop(&mut self, handle: RecordingHandle) -> Result<Option<UtteranceRecording>> {
        let Some(open) = self.open.take_if(|open| open.id == handle.id) else {
            return Ok(None);
        };

        let chunk_count = open.chunks.len();
        let samples = open.chunks.concat();
        let bytes = samples_to_wav(&samples, open.format.sample_rate, open.format.channels)?;

        tracing::debug!(
            id = open.id,
            chunks = chunk_count,
            bytes = bytes.len(),
            "recording sealed"
        );

        Ok(Some(UtteranceRecording {
            id: open.id,
            started_at: open.started_at,
            stopped_at: Utc::now(),
            chunk_count,
            audio: AudioBlob::new(bytes, open.format.mime_type),
        }))
    }

    /// Drop the open recording without packaging it
    pub fn discard(&mut self) -> bool {
        self.open.take().is_some_and(|open| {
            tracing::debug!(id = open.id, chunks = open.chunks.len(), "recording discarded");
            true
        })
    }

    /// Whether a recording is open
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.open.is_some()
    }

    /// Handle of the open recording
    #[must_use]
    pub fn current(&self) -> Option<RecordingHandle> {
        self.open.as_ref().map(|open| RecordingHandle { id: open.id })
    }
}
