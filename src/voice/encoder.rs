//! Audio container handling
//!
//! Decodes captured or synthesized audio into PCM, downmixes to mono,
//! resamples, and writes the canonical mono 16-bit PCM WAV container.

use std::io::Cursor;

use crate::{Error, Result};

/// Length of the RIFF/WAVE header `hound` writes for 16-bit PCM
pub const WAV_HEADER_LEN: usize = 44;

/// Bits per sample in the canonical container
const BITS_PER_SAMPLE: u16 = 16;

/// Encoded audio payload tagged with its MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    /// Encoded bytes
    pub bytes: Vec<u8>,
    /// MIME type of `bytes` (e.g. "audio/wav")
    pub mime_type: String,
}

impl AudioBlob {
    /// Create a new blob
    #[must_use]
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the blob carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// MIME type without codec parameters (`audio/webm;codecs=opus` -> `audio/webm`)
    #[must_use]
    pub fn base_mime_type(&self) -> &str {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
    }
}

/// Decoded PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

impl DecodedAudio {
    /// Collapse to mono by averaging channels
    #[must_use]
    pub fn into_mono(self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples;
        }
        downmix_to_mono(&self.samples, self.channels)
    }
}

/// Format fields of a WAV container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    /// 1 for integer PCM, 3 for IEEE float
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Length of the `data` chunk in bytes
    pub data_size: u32,
}

impl WavHeader {
    /// Read the format of a WAV payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the bytes are not a readable WAV container
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Encoding(e.to_string()))?;
        let spec = reader.spec();
        let bytes_per_sample = spec.bits_per_sample.div_ceil(8);
        let block_align = spec.channels * bytes_per_sample;

        Ok(Self {
            format_tag: match spec.sample_format {
                hound::SampleFormat::Int => 1,
                hound::SampleFormat::Float => 3,
            },
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            byte_rate: spec.sample_rate * u32::from(block_align),
            block_align,
            bits_per_sample: spec.bits_per_sample,
            data_size: reader.len() * u32::from(bytes_per_sample),
        })
    }

    /// Number of samples across all channels in the data chunk
    #[must_use]
    pub const fn sample_count(&self) -> u32 {
        let bytes_per_sample = self.bits_per_sample as u32 / 8;
        if bytes_per_sample == 0 {
            return 0;
        }
        self.data_size / bytes_per_sample
    }
}

/// Write interleaved samples as a 16-bit PCM WAV container
///
/// # Errors
///
/// Returns [`Error::Encoding`] if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: channels.max(1),
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Encoding(e.to_string()))?;

        for &sample in samples {
            // Same scale as `decode_wav`, so decode then encode is lossless
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Encoding(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::Encoding(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Average interleaved channels into a mono signal
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample by linear interpolation between neighbouring samples
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let new_len = (samples.len() as f64 / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let left = (pos.floor() as usize).min(last);
            let right = pos.ceil() as usize;
            if right > last {
                return samples[left];
            }
            let weight = (pos - left as f64) as f32;
            samples[left].mul_add(1.0 - weight, samples[right] * weight)
        })
        .collect()
}

/// Decode an audio payload to PCM based on its MIME type
///
/// # Errors
///
/// Returns [`Error::Encoding`] for unsupported or malformed input
pub fn decode_audio(blob: &AudioBlob) -> Result<DecodedAudio> {
    let mime = blob.base_mime_type();
    if mime.contains("wav") || mime.contains("wave") || blob.bytes.starts_with(b"RIFF") {
        decode_wav(&blob.bytes)
    } else if mime.contains("mpeg") || mime.contains("mp3") {
        decode_mp3(&blob.bytes)
    } else {
        Err(Error::Encoding(format!("unsupported audio type: {mime}")))
    }
}

/// Decode WAV bytes (integer or float PCM)
///
/// # Errors
///
/// Returns error if the container cannot be read
#[allow(clippy::cast_precision_loss)]
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Encoding(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Encoding(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Encoding(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Decode MP3 bytes to interleaved f32 samples
///
/// # Errors
///
/// Returns error if a frame fails to decode or no frames are found
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;
    let mut channels = 0u16;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = frame.sample_rate as u32;
                    channels = frame.channels as u16;
                }
                samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Encoding(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Encoding("no MP3 frames found".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Re-encodes captured audio into the canonical WAV container
#[derive(Debug, Clone, Copy)]
pub struct CanonicalEncoder {
    target_sample_rate: u32,
}

impl CanonicalEncoder {
    /// Create an encoder targeting the given sample rate
    #[must_use]
    pub const fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    /// Decode, downmix, resample and re-encode as mono 16-bit WAV
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the input cannot be decoded
    pub fn encode(&self, blob: &AudioBlob) -> Result<AudioBlob> {
        let decoded = decode_audio(blob)?;
        let source_rate = decoded.sample_rate;
        let mono = decoded.into_mono();
        let resampled = resample_linear(&mono, source_rate, self.target_sample_rate);

        tracing::debug!(
            source_rate,
            target_rate = self.target_sample_rate,
            samples = resampled.len(),
            "encoded canonical wav"
        );

        Ok(AudioBlob::new(
            samples_to_wav(&resampled, self.target_sample_rate, 1)?,
            "audio/wav",
        ))
    }

    /// Encode, falling back to the original blob on failure
    #[must_use]
    pub fn encode_or_passthrough(&self, blob: AudioBlob) -> AudioBlob {
        match self.encode(&blob) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    mime = %blob.mime_type,
                    "canonical encoding failed, forwarding original audio"
                );
                blob
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], 16000, 1).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 36 + 6);

        let header = WavHeader::parse(&wav).unwrap();
        assert_eq!(header.format_tag, 1);
        assert_eq!(header.channels, 1);
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.byte_rate, 32000);
        assert_eq!(header.block_align, 2);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(header.data_size, 6);
    }

    #[test]
    fn test_pcm_scaling_is_clamped() {
        let wav = samples_to_wav(&[1.0, -1.0, 2.0, -2.0, 0.0], 16000, 1).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![32767, -32768, 32767, -32768, 0]);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix_to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 32000, 16000);
        assert_eq!(out.len(), 50);
        assert!((out[10] - 20.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_resample_interpolates_between_samples() {
        let out = resample_linear(&[0.0, 1.0], 1, 2);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
        // Past the last source sample the left neighbour is held
        assert!((out[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WavHeader::parse(b"not a wav").is_err());
        let mut wav = samples_to_wav(&[0.0], 8000, 1).unwrap();
        wav[0] = b'X';
        assert!(WavHeader::parse(&wav).is_err());
    }

    #[test]
    fn test_unsupported_mime_falls_back_to_original() {
        let blob = AudioBlob::new(vec![1, 2, 3], "audio/webm;codecs=opus");
        assert_eq!(blob.base_mime_type(), "audio/webm");

        let encoder = CanonicalEncoder::new(16000);
        assert!(matches!(encoder.encode(&blob), Err(Error::Encoding(_))));
        assert_eq!(encoder.encode_or_passthrough(blob.clone()), blob);
    }
}
