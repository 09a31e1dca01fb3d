//! Audio profile configuration
//!
//! Profiles declare the wire format and the provider input/output formats
//! for a call. The wire format is authoritative for the whole call; the
//! caller's own codec is never forwarded to a provider.

use phone_agent_core::{AudioEncoding, AudioFormat, AudioProfile};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Serializable audio format, e.g. `{ encoding = "mulaw", sample_rate_hz = 8000 }`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FormatConfig {
    pub encoding: AudioEncoding,
    pub sample_rate_hz: u32,
}

impl From<FormatConfig> for AudioFormat {
    fn from(value: FormatConfig) -> Self {
        AudioFormat::new(value.encoding, value.sample_rate_hz)
    }
}

impl From<AudioFormat> for FormatConfig {
    fn from(value: AudioFormat) -> Self {
        Self {
            encoding: value.encoding,
            sample_rate_hz: value.sample_rate_hz,
        }
    }
}

/// Which media adapter carries the wire audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaTransportKind {
    #[default]
    Audiosocket,
    Rtp,
}

/// One named audio profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioProfileConfig {
    pub wire: FormatConfig,
    pub provider_input: FormatConfig,
    pub provider_output: FormatConfig,
    #[serde(default)]
    pub transport: MediaTransportKind,
}

/// Wire formats the media adapters implement.
const WIRE_RATES: [u32; 3] = [8000, 16000, 24000];

impl AudioProfileConfig {
    pub fn to_profile(&self) -> AudioProfile {
        AudioProfile {
            wire: self.wire.into(),
            provider_input: self.provider_input.into(),
            provider_output: self.provider_output.into(),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let wire: AudioFormat = self.wire.into();
        match wire.encoding {
            AudioEncoding::Mulaw | AudioEncoding::Alaw if wire.sample_rate_hz != 8000 => {
                return Err(ConfigError::InvalidProfile {
                    profile: name.to_string(),
                    reason: format!("companded wire audio is 8 kHz only, got {}", wire),
                });
            }
            _ => {}
        }
        for (label, format) in [
            ("wire", wire),
            ("provider_input", self.provider_input.into()),
            ("provider_output", self.provider_output.into()),
        ] {
            if !WIRE_RATES.contains(&format.sample_rate_hz) {
                return Err(ConfigError::InvalidProfile {
                    profile: name.to_string(),
                    reason: format!("{label} rate {} Hz is not supported", format.sample_rate_hz),
                });
            }
        }
        Ok(())
    }
}

impl Default for AudioProfileConfig {
    fn default() -> Self {
        let profile = AudioProfile::telephony_mulaw_8k();
        Self {
            wire: profile.wire.into(),
            provider_input: profile.provider_input.into(),
            provider_output: profile.provider_output.into(),
            transport: MediaTransportKind::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_valid_telephony() {
        let config = AudioProfileConfig::default();
        config.validate("telephony_ulaw_8k").unwrap();
        let profile = config.to_profile();
        assert_eq!(profile.wire, AudioFormat::mulaw_8k());
        assert_eq!(profile.provider_input.sample_rate_hz, 16000);
    }

    #[test]
    fn companded_wire_requires_8k() {
        let mut config = AudioProfileConfig::default();
        config.wire.sample_rate_hz = 16000;
        assert!(config.validate("bad").is_err());
    }

    #[test]
    fn profile_parses_from_yaml() {
        let yaml = r#"
wire: { encoding: mulaw, sample_rate_hz: 8000 }
provider_input: { encoding: pcm16le, sample_rate_hz: 16000 }
provider_output: { encoding: pcm16le, sample_rate_hz: 24000 }
"#;
        let config: AudioProfileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.to_profile(), phone_agent_core::AudioProfile::telephony_mulaw_8k());
    }
}
