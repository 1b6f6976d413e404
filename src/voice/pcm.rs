//! PCM16 sample conversion
//!
//! Float samples are clamped to `[-1.0, 1.0]` and scaled asymmetrically so
//! both ends of the `i16` range are reachable: positive values by `0x7FFF`,
//! negative values by `0x8000`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const POS_SCALE: f32 = 32_767.0;
const NEG_SCALE: f32 = 32_768.0;

/// Convert one float sample to PCM16
///
/// `NaN` maps to silence.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEG_SCALE) as i16
    } else {
        (s * POS_SCALE) as i16
    }
}

/// Convert one PCM16 sample back to float
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        f32::from(sample) / NEG_SCALE
    } else {
        f32::from(sample) / POS_SCALE
    }
}

/// Encode float samples as little-endian PCM16 bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        out.put_i16_le(f32_to_i16(s));
    }
    out.freeze()
}

/// Decode little-endian PCM16 bytes into float samples
///
/// # Errors
///
/// Returns `Error::Protocol` if the byte count is odd
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "pcm16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}
