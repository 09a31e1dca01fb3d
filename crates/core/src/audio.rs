//! Audio format and profile types
//!
//! The wire format (what Asterisk sends and expects back) and the provider
//! formats (what the speech provider consumes and emits) are declared per
//! audio profile in configuration. The caller's own codec never reaches the
//! provider; the wire format is authoritative for the whole call.

use serde::{Deserialize, Serialize};

/// All egress pacing and reframing is done in 20 ms frames.
pub const FRAME_MS: u32 = 20;

/// Supported audio encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// μ-law companded 8-bit (telephony)
    Mulaw,
    /// A-law companded 8-bit (telephony)
    Alaw,
    /// 16-bit signed PCM, little-endian
    #[default]
    Pcm16le,
}

impl AudioEncoding {
    /// Bytes per sample on the wire
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::Mulaw | AudioEncoding::Alaw => 1,
            AudioEncoding::Pcm16le => 2,
        }
    }

    /// True for companded (logarithmic 8-bit) encodings
    pub fn is_companded(&self) -> bool {
        matches!(self, AudioEncoding::Mulaw | AudioEncoding::Alaw)
    }
}

impl std::fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioEncoding::Mulaw => write!(f, "mulaw"),
            AudioEncoding::Alaw => write!(f, "alaw"),
            AudioEncoding::Pcm16le => write!(f, "pcm16le"),
        }
    }
}

/// A concrete audio format: encoding + rate. Always mono.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate_hz: u32,
}

impl AudioFormat {
    pub const fn new(encoding: AudioEncoding, sample_rate_hz: u32) -> Self {
        Self {
            encoding,
            sample_rate_hz,
        }
    }

    /// μ-law at 8 kHz, the default telephony wire format
    pub const fn mulaw_8k() -> Self {
        Self::new(AudioEncoding::Mulaw, 8000)
    }

    /// PCM16 little-endian at the given rate
    pub const fn pcm16(sample_rate_hz: u32) -> Self {
        Self::new(AudioEncoding::Pcm16le, sample_rate_hz)
    }

    /// Samples in one 20 ms frame at this rate
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate_hz as usize * FRAME_MS as usize) / 1000
    }

    /// Bytes in one 20 ms frame in this encoding
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.encoding.bytes_per_sample()
    }

    /// Bytes per millisecond of audio in this format
    pub fn bytes_per_ms(&self) -> usize {
        (self.sample_rate_hz as usize / 1000) * self.encoding.bytes_per_sample()
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.encoding, self.sample_rate_hz)
    }
}

/// Per-call audio profile, declared by configuration and enforced at call
/// start. `wire` is what flows to/from Asterisk; the provider formats are
/// what the speech provider consumes and emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProfile {
    pub wire: AudioFormat,
    pub provider_input: AudioFormat,
    pub provider_output: AudioFormat,
}

impl AudioProfile {
    /// Classic telephony profile: μ-law wire, 16 kHz PCM into the provider,
    /// 24 kHz PCM out of it.
    pub const fn telephony_mulaw_8k() -> Self {
        Self {
            wire: AudioFormat::mulaw_8k(),
            provider_input: AudioFormat::pcm16(16000),
            provider_output: AudioFormat::pcm16(24000),
        }
    }
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self::telephony_mulaw_8k()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizing_matches_rates() {
        assert_eq!(AudioFormat::mulaw_8k().samples_per_frame(), 160);
        assert_eq!(AudioFormat::mulaw_8k().frame_bytes(), 160);
        assert_eq!(AudioFormat::pcm16(16000).samples_per_frame(), 320);
        assert_eq!(AudioFormat::pcm16(16000).frame_bytes(), 640);
        assert_eq!(AudioFormat::pcm16(24000).frame_bytes(), 960);
    }

    #[test]
    fn format_equality_is_by_fields() {
        assert_eq!(AudioFormat::mulaw_8k(), AudioFormat::new(AudioEncoding::Mulaw, 8000));
        assert_ne!(AudioFormat::pcm16(8000), AudioFormat::pcm16(16000));
    }
}
