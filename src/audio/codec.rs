//! PCM16 conversions shared by the capture and playback paths.

use base64::Engine;

use super::backend::RawAudio;
use crate::error::{DecodeError, DeviceError};

/// Serialize samples as little-endian PCM16 bytes
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse little-endian PCM16 bytes
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode_base64(samples: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16_to_bytes(samples))
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
}

/// Map PCM16 to [-1.0, 1.0)
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Whether device audio in this format can be brought to `target_rate` mono
///
/// Mono or stereo, at `target_rate` or an integer multiple of it.
pub fn check_format(sample_rate: u32, channels: u16, target_rate: u32) -> Result<(), DeviceError> {
    let rate_ok = sample_rate >= target_rate && sample_rate % target_rate == 0;
    if matches!(channels, 1 | 2) && rate_ok {
        Ok(())
    } else {
        Err(DeviceError::UnsupportedFormat {
            sample_rate,
            channels,
        })
    }
}

/// Bring device audio to `target_rate` mono
///
/// Stereo is averaged down to mono, then integer-ratio rates are decimated.
/// Anything [`check_format`] rejects is an error.
pub fn normalize(raw: RawAudio, target_rate: u32) -> Result<Vec<i16>, DeviceError> {
    check_format(raw.sample_rate, raw.channels, target_rate)?;

    let mono = match raw.channels {
        2 => stereo_to_mono(&raw.samples),
        _ => raw.samples,
    };

    // Decimate: take every Nth sample
    let ratio = (raw.sample_rate / target_rate) as usize;
    if ratio == 1 {
        return Ok(mono);
    }
    Ok(mono.into_iter().step_by(ratio).collect())
}

fn stereo_to_mono(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks_exact(2)
        .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
        .collect()
}
