//! Audio codec kit
//!
//! Pure signal-path building blocks shared by the transport and provider
//! layers: G.711 companding, rational resampling between telephony rates,
//! a DC-blocking high-pass, fixed-duration reframing, and a lightweight
//! energy VAD used for gating and barge-in.
//!
//! Everything here operates on byte buffers or `i16` sample slices; the
//! only per-stream state lives in [`DcBlocker`], [`Reframer`] and
//! [`EnergyVad`] instances.

pub mod dcblock;
pub mod g711;
pub mod reframe;
pub mod resample;
pub mod vad;

pub use dcblock::DcBlocker;
pub use g711::{alaw_decode, alaw_encode, mulaw_decode, mulaw_encode};
pub use reframe::Reframer;
pub use resample::{is_supported_rate_pair, resample_pcm16, SUPPORTED_RATES};
pub use vad::{EnergyVad, VadAggressiveness, VadConfig};

/// Codec-layer errors. These indicate bugs at the call site (mis-sized
/// buffers, unimplemented rate pairs) and are never propagated to a
/// provider; callers log and drop the offending frame.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unsupported rate pair: {src} -> {dst} Hz")]
    UnsupportedRate { src: u32, dst: u32 },
}

/// Interpret a little-endian PCM16 byte buffer as samples.
/// Fails on odd-length input.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Result<Vec<i16>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::InvalidFrame(format!(
            "pcm16 buffer has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// RMS energy of an int16 sample slice, in raw int16 units.
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_round_trip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN, 12345];
        let bytes = pcm16_to_bytes(&samples);
        assert_eq!(pcm16_from_bytes(&bytes).unwrap(), samples);
    }

    #[test]
    fn odd_length_pcm16_is_invalid() {
        assert!(matches!(
            pcm16_from_bytes(&[0u8, 1, 2]),
            Err(AudioError::InvalidFrame(_))
        ));
    }

    #[test]
    fn rms_of_dc_signal() {
        let samples = vec![1000i16; 160];
        assert!((rms_i16(&samples) - 1000.0).abs() < 0.5);
    }
}
