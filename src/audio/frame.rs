//! # Audio Frames and Chunks
//!
//! Data types that flow through the session. Audio is mono throughout.
//!
//! ## Representations:
//! - **AudioFrame**: floating-point samples in `-1.0..=1.0`, the device-native form
//! - **Pcm16Buffer**: 16-bit little-endian PCM bytes, the wire form
//! - **EncodedChunk**: a PCM buffer tagged with its media type (`audio/pcm;rate=16000`)
//!
//! Capture and playback intentionally run at different rates: the microphone is
//! sampled at 16kHz, while the remote agent synthesizes speech at 24kHz.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SessionError;

/// Capture-direction sample rate expected by the remote agent.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Playback-direction sample rate produced by the remote agent.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured frame.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// An immutable buffer of mono floating-point samples.
///
/// Samples are held behind an `Arc<[f32]>`, so cloning a frame (for example to hand
/// it to the playback timeline) never copies audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Create a mono frame from samples at the given rate.
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always 1: the whole session is mono.
    pub fn channels(&self) -> u16 {
        1
    }

    /// Number of sample frames (equal to the sample count for mono audio).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in sample frames at this frame's own rate.
    pub fn duration_frames(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Wall-clock duration of the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// 16-bit little-endian PCM bytes at a known rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcm16Buffer {
    bytes: Vec<u8>,
    sample_rate: u32,
}

impl Pcm16Buffer {
    pub fn new(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self { bytes, sample_rate }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of whole samples in the buffer.
    pub fn sample_count(&self) -> usize {
        self.bytes.len() / 2
    }
}

/// Mime-style tag describing a PCM stream, e.g. `audio/pcm;rate=16000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaType {
    pub sample_rate: u32,
}

impl MediaType {
    pub fn pcm(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audio/pcm;rate={}", self.sample_rate)
    }
}

impl FromStr for MediaType {
    type Err = SessionError;

    /// Parse `audio/pcm;rate=<hz>`. Parameter order and whitespace are tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default();
        if !essence.eq_ignore_ascii_case("audio/pcm") {
            return Err(SessionError::MalformedAudio(format!(
                "unsupported media type: {}",
                s
            )));
        }

        let rate = parts
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
            .map(|(_, value)| value.trim().parse::<u32>())
            .transpose()
            .map_err(|e| SessionError::MalformedAudio(format!("bad rate in {}: {}", s, e)))?
            .ok_or_else(|| SessionError::MalformedAudio(format!("missing rate in {}", s)))?;

        if rate == 0 {
            return Err(SessionError::MalformedAudio(format!("zero rate in {}", s)));
        }
        Ok(MediaType::pcm(rate))
    }
}

/// A PCM buffer paired with its media type.
///
/// Created per captured or received frame and consumed immediately by the codec
/// or the transport; never retained past that single use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub media_type: MediaType,
    pub pcm: Vec<u8>,
}

impl EncodedChunk {
    pub fn new(pcm: Pcm16Buffer) -> Self {
        let media_type = MediaType::pcm(pcm.sample_rate());
        Self {
            media_type,
            pcm: pcm.into_bytes(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.media_type.sample_rate
    }

    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}
