//! HTTP client for the transcription and speech backend
//!
//! Three fixed endpoints relative to the server origin:
//!
//! - `POST /api/transcribe`: multipart upload of one utterance
//! - `POST /api/speak`: synthesize reply text
//! - `GET /api/last-response-tts`: latest workflow reply, if any
//!
//! None of the calls retry on their own.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::voice::AudioBlob;
use crate::{Error, Result};

/// MIME type assumed for fetched audio without a `Content-Type`
const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// Reply produced by the workflow alongside a transcript
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReply {
    /// Reply text, when the workflow produced one
    #[serde(default)]
    pub text: Option<String>,
}

/// Successful `POST /api/transcribe` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribeResponse {
    /// Transcript of the utterance
    #[serde(default)]
    pub text: String,
    /// Inline workflow reply
    #[serde(default, rename = "n8nResponse", skip_serializing_if = "Option::is_none")]
    pub n8n_response: Option<WorkflowReply>,
}

impl TranscribeResponse {
    /// Inline reply text, if present and non-blank
    #[must_use]
    pub fn reply_text(&self) -> Option<&str> {
        self.n8n_response
            .as_ref()
            .and_then(|r| r.text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Synthesized speech reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechResponse {
    /// Text that was spoken
    pub text: String,
    /// Absolute or origin-relative audio location
    pub audio_url: String,
}

#[derive(Deserialize)]
struct LastResponseBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    audio_url: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
}

/// Backend calls used by the turn-taking controller
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload one utterance for transcription
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transcription`] with the backend detail on a non-success response
    async fn transcribe(
        &self,
        audio: &AudioBlob,
        recording_id: u64,
        webhook_url: &str,
    ) -> Result<TranscribeResponse>;

    /// Synthesize speech for `text`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Synthesis`] with the backend detail on a non-success response
    async fn speak(&self, text: &str) -> Result<SpeechResponse>;

    /// Latest workflow reply, or `None` when nothing usable is available
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    async fn fetch_last_response(&self) -> Result<Option<SpeechResponse>>;

    /// Download audio from an absolute or origin-relative URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the audio cannot be fetched
    async fn fetch_audio(&self, audio_url: &str) -> Result<AudioBlob>;
}

/// File extension for an upload of the given MIME type
#[must_use]
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let mime = mime_type.to_ascii_lowercase();
    if mime.contains("wav") {
        "wav"
    } else if mime.contains("webm") {
        "webm"
    } else if mime.contains("ogg") {
        "ogg"
    } else if mime.contains("mp4") || mime.contains("m4a") {
        "m4a"
    } else {
        "mp3"
    }
}

/// Upload filename for a recording
#[must_use]
pub fn upload_filename(recording_id: u64, mime_type: &str) -> String {
    format!("recording-{recording_id}.{}", extension_for_mime(mime_type))
}

/// `reqwest` implementation of [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the URL is invalid
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Configuration(format!("invalid server URL {base_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base })
    }

    /// Server origin all relative URLs resolve against
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve an absolute or relative URL against the server
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the URL cannot be resolved
    pub fn resolve(&self, url: &str) -> Result<Url> {
        self.base
            .join(url)
            .map_err(|e| Error::Playback(format!("invalid audio URL {url}: {e}")))
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Configuration(format!("invalid endpoint {path}: {e}")))
    }
}

/// Extract the `detail` message from an error body, if any
fn error_detail(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.detail? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn transcribe(
        &self,
        audio: &AudioBlob,
        recording_id: u64,
        webhook_url: &str,
    ) -> Result<TranscribeResponse> {
        let filename = upload_filename(recording_id, audio.base_mime_type());
        tracing::debug!(
            bytes = audio.len(),
            mime = %audio.mime_type,
            filename = %filename,
            "uploading utterance"
        );

        let part = reqwest::multipart::Part::bytes(audio.bytes.clone())
            .file_name(filename)
            .mime_str(audio.base_mime_type())
            .map_err(|e| Error::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("audio", part)
            .text("webhook_url", webhook_url.to_string());

        let response = self
            .client
            .post(self.endpoint("api/transcribe")?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "transcribe request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription failed");
            return Err(Error::Transcription(error_detail(&body).unwrap_or_else(
                || format!("Transcription failed with status {status}"),
            )));
        }

        let result: TranscribeResponse = response.json().await?;
        tracing::info!(
            transcript = %result.text,
            inline_reply = result.reply_text().is_some(),
            "transcription complete"
        );
        Ok(result)
    }

    async fn speak(&self, text: &str) -> Result<SpeechResponse> {
        tracing::debug!(chars = text.len(), "requesting speech synthesis");

        let response = self
            .client
            .post(self.endpoint("api/speak")?)
            .json(&SpeakRequest { text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "speech synthesis failed");
            return Err(Error::Synthesis(error_detail(&body).unwrap_or_else(
                || format!("Speech synthesis failed with status {status}"),
            )));
        }

        let result: SpeechResponse = response.json().await?;
        tracing::debug!(audio_url = %result.audio_url, "speech synthesized");
        Ok(result)
    }

    async fn fetch_last_response(&self) -> Result<Option<SpeechResponse>> {
        let response = self
            .client
            .get(self.endpoint("api/last-response-tts")?)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("no last response available");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(error_detail(&body).unwrap_or_else(
                || format!("Fetching last response failed with status {status}"),
            )));
        }

        let body: LastResponseBody = response.json().await?;
        let usable = match (body.text, body.audio_url) {
            (Some(text), Some(audio_url)) if !text.trim().is_empty() && !audio_url.is_empty() => {
                Some(SpeechResponse { text, audio_url })
            }
            _ => None,
        };

        tracing::debug!(usable = usable.is_some(), "fetched last response");
        Ok(usable)
    }

    async fn fetch_audio(&self, audio_url: &str) -> Result<AudioBlob> {
        let url = self.resolve(audio_url)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Playback(format!("audio fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Playback(format!(
                "audio fetch from {url} failed with status {status}"
            )));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_AUDIO_MIME)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Playback(format!("audio download failed: {e}")))?;

        tracing::debug!(url = %url, bytes = bytes.len(), mime = %mime_type, "fetched audio");
        Ok(AudioBlob::new(bytes.to_vec(), mime_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for_mime("audio/wav"), "wav");
        assert_eq!(extension_for_mime("audio/x-wav"), "wav");
        assert_eq!(extension_for_mime("audio/webm;codecs=opus"), "webm");
        assert_eq!(extension_for_mime("audio/ogg"), "ogg");
        assert_eq!(extension_for_mime("audio/mp4"), "m4a");
        assert_eq!(extension_for_mime("audio/mpeg"), "mp3");
        assert_eq!(extension_for_mime("application/octet-stream"), "mp3");
        assert_eq!(upload_filename(7, "audio/wav"), "recording-7.wav");
    }

    #[test]
    fn test_relative_and_absolute_urls() {
        let transport =
            HttpTransport::new("http://localhost:8000", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.resolve("/audio/reply.mp3").unwrap().as_str(),
            "http://localhost:8000/audio/reply.mp3"
        );
        assert_eq!(
            transport.resolve("https://cdn.example.com/a.mp3").unwrap().as_str(),
            "https://cdn.example.com/a.mp3"
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let transport =
            HttpTransport::new("http://localhost:8000/voice", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.endpoint("api/speak").unwrap().as_str(),
            "http://localhost:8000/voice/api/speak"
        );
    }

    #[test]
    fn test_invalid_base_is_configuration_error() {
        let err = HttpTransport::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_error_detail_parsing() {
        assert_eq!(
            error_detail(r#"{"detail":"Audio file is too short"}"#).as_deref(),
            Some("Audio file is too short")
        );
        assert_eq!(error_detail("<html>oops</html>"), None);
        assert_eq!(error_detail(r#"{"detail":null}"#), None);
    }

    #[test]
    fn test_reply_text_ignores_blank() {
        let response: TranscribeResponse =
            serde_json::from_str(r#"{"text":"hello","n8nResponse":{"text":"  "}}"#).unwrap();
        assert_eq!(response.reply_text(), None);

        let response: TranscribeResponse =
            serde_json::from_str(r#"{"text":"hello","n8nResponse":{"text":"hi there"}}"#).unwrap();
        assert_eq!(response.reply_text(), Some("hi there"));
    }
}
