//! # Sample Codec
//!
//! Pure, stateless conversions between the device representation and the wire
//! representation of audio.
//!
//! ## Conversions:
//! - **float -> PCM16**: clamp to `-1.0..=1.0`, scale by 32767, little-endian bytes (lossy)
//! - **PCM16 -> float**: scale by 1/32768 (exact)
//! - **bytes <-> text**: standard base64, the transport-safe encoding
//!
//! Only the inverse directions can fail, and they fail with `MalformedAudio`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::audio::frame::{AudioFrame, EncodedChunk, Pcm16Buffer};
use crate::error::{SessionError, SessionResult};

/// Convert floating-point samples to 16-bit little-endian PCM bytes.
///
/// Out-of-range samples are clamped; NaN quantizes to silence.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(scaled);
    }
    bytes
}

/// Convert 16-bit little-endian PCM bytes to a floating-point frame.
///
/// Fails with `MalformedAudio` when the byte count is odd.
pub fn pcm16_to_audio_frame(bytes: &[u8], sample_rate: u32) -> SessionResult<AudioFrame> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::MalformedAudio(format!(
            "PCM16 length must be even, got {} bytes",
            bytes.len()
        )));
    }

    let mut pcm = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut pcm);

    let samples: Vec<f32> = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
    Ok(AudioFrame::new(samples, sample_rate))
}

/// Encode binary audio as transport-safe text.
pub fn encode_for_transport(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport-safe text back to bytes.
pub fn decode_from_transport(text: &str) -> SessionResult<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| SessionError::MalformedAudio(format!("invalid transport encoding: {}", e)))
}

/// Float frame -> tagged PCM chunk, ready for the transport.
pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    EncodedChunk::new(Pcm16Buffer::new(
        float_to_pcm16(frame.samples()),
        frame.sample_rate(),
    ))
}

/// Tagged PCM chunk -> float frame at the chunk's declared rate.
pub fn decode_chunk(chunk: &EncodedChunk) -> SessionResult<AudioFrame> {
    pcm16_to_audio_frame(&chunk.pcm, chunk.sample_rate())
}
