//! The network exchange run while the controller is `Processing`
//!
//! transcribe -> inline reply, else last stored reply, else the fallback
//! response -> synthesized audio. The whole exchange is bounded by a
//! timeout; on expiry the fallback response is synthesized instead.

use std::sync::Arc;
use std::time::Duration;

use crate::transport::Transport;
use crate::voice::AudioBlob;
use crate::{Error, Result};

/// Spoken when the workflow produces no reply
pub const DEFAULT_FALLBACK_RESPONSE: &str = "Sorry, I don't have a response for that yet.";

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// Returned inline with the transcript
    Inline,
    /// Fetched from the last-response endpoint
    LastResponse,
    /// Configured fallback response
    Fallback,
    /// First-run greeting
    Greeting,
}

/// Assistant reply ready for playback
#[derive(Debug, Clone)]
pub struct Reply {
    /// Reply text
    pub text: String,
    /// Audio location as returned by the backend
    pub audio_url: String,
    /// Downloaded audio
    pub audio: AudioBlob,
    /// Origin of the reply
    pub source: ReplySource,
}

/// Input to one exchange
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// Recording being processed
    pub recording_id: u64,
    /// Conversation entry to fill in
    pub entry_id: String,
    /// Audio to upload
    pub audio: AudioBlob,
    /// Webhook forwarded to the backend
    pub webhook_url: String,
    /// Spoken when no reply is available
    pub fallback_response: String,
    /// Bound on the whole exchange
    pub timeout: Duration,
}

/// Outcome of one exchange
#[derive(Debug)]
pub struct Exchange {
    /// Recording that was processed
    pub recording_id: u64,
    /// Conversation entry for this turn
    pub entry_id: String,
    /// Transcript, if transcription succeeded
    pub transcript: Option<String>,
    /// Reply to play, or the error that ended the exchange
    pub result: Result<Reply>,
}

/// Run one exchange against the backend
pub async fn run_exchange(transport: Arc<dyn Transport>, request: ExchangeRequest) -> Exchange {
    let mut transcript = None;

    let outcome = tokio::time::timeout(
        request.timeout,
        converse(transport.as_ref(), &request, &mut transcript),
    )
    .await;

    let result = match outcome {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                recording_id = request.recording_id,
                timeout_secs = request.timeout.as_secs(),
                "processing timed out, using fallback response"
            );
            tokio::time::timeout(
                request.timeout,
                synthesize(
                    transport.as_ref(),
                    &request.fallback_response,
                    ReplySource::Fallback,
                ),
            )
            .await
            .unwrap_or_else(|_| Err(Error::Synthesis("Speech synthesis timed out".to_string())))
        }
    };

    Exchange {
        recording_id: request.recording_id,
        entry_id: request.entry_id,
        transcript,
        result,
    }
}

async fn converse(
    transport: &dyn Transport,
    request: &ExchangeRequest,
    transcript: &mut Option<String>,
) -> Result<Reply> {
    let response = transport
        .transcribe(&request.audio, request.recording_id, &request.webhook_url)
        .await?;
    *transcript = Some(response.text.clone());

    if let Some(reply) = response.reply_text() {
        return synthesize(transport, reply, ReplySource::Inline).await;
    }

    // The workflow may answer after the upload returns
    match transport.fetch_last_response().await {
        Ok(Some(last)) => {
            let audio = transport.fetch_audio(&last.audio_url).await?;
            return Ok(Reply {
                text: last.text,
                audio_url: last.audio_url,
                audio,
                source: ReplySource::LastResponse,
            });
        }
        Ok(None) => {
            tracing::debug!(recording_id = request.recording_id, "no workflow reply");
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch last response");
        }
    }

    synthesize(transport, &request.fallback_response, ReplySource::Fallback).await
}

/// Synthesize `text` and download the resulting audio
///
/// # Errors
///
/// Returns error if synthesis or the audio download fails
pub async fn synthesize(transport: &dyn Transport, text: &str, source: ReplySource) -> Result<Reply> {
    let speech = transport.speak(text).await?;
    let audio = transport.fetch_audio(&speech.audio_url).await?;
    Ok(Reply {
        text: speech.text,
        audio_url: speech.audio_url,
        audio,
        source,
    })
}
