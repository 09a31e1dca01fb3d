//! Transport orchestration
//!
//! Resolves the audio profile for a call against the provider's declared
//! capabilities and derives the conversion chain each direction needs. The
//! caller's own codec is never part of this: the wire format comes from
//! configuration alone, which is what keeps a G.722 caller from garbling a
//! μ-law provider leg.

use phone_agent_audio::{
    alaw_decode, alaw_encode, is_supported_rate_pair, mulaw_decode, mulaw_encode, pcm16_from_bytes,
    pcm16_to_bytes, resample_pcm16,
};
use phone_agent_core::{
    AppliedSettings, AudioEncoding, AudioFormat, AudioProfile, ProviderCapabilities,
};

use crate::TransportError;

/// One step in a conversion chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStep {
    /// Companded bytes -> PCM16
    Decompand(AudioEncoding),
    /// PCM16 -> companded bytes
    Compand(AudioEncoding),
    Resample { from_hz: u32, to_hz: u32 },
}

/// Per-call record of formats and required conversions
#[derive(Debug, Clone)]
pub struct TransportPlan {
    pub profile_name: String,
    pub wire: AudioFormat,
    pub provider_input: AudioFormat,
    pub provider_output: AudioFormat,
    /// wire -> provider_input
    pub ingress: Vec<ConversionStep>,
    /// provider_output -> wire
    pub egress: Vec<ConversionStep>,
}

impl TransportPlan {
    /// Build a plan for `profile` against what the provider declares.
    pub fn plan(
        profile_name: &str,
        profile: &AudioProfile,
        caps: &ProviderCapabilities,
    ) -> Result<Self, TransportError> {
        if !caps.supports_input(profile.provider_input) {
            return Err(TransportError::ProfileIncompatible(format!(
                "provider '{}' does not accept input {}",
                caps.name, profile.provider_input
            )));
        }
        if !caps.supports_output(profile.provider_output) {
            return Err(TransportError::ProfileIncompatible(format!(
                "provider '{}' does not emit output {}",
                caps.name, profile.provider_output
            )));
        }

        let ingress = derive_chain(profile.wire, profile.provider_input)?;
        let egress = derive_chain(profile.provider_output, profile.wire)?;

        Ok(Self {
            profile_name: profile_name.to_string(),
            wire: profile.wire,
            provider_input: profile.provider_input,
            provider_output: profile.provider_output,
            ingress,
            egress,
        })
    }

    /// Compare the provider's post-handshake settings against the plan.
    /// A mismatch never aborts the call: the provider's actual formats win
    /// and the chains are rebuilt around them.
    pub fn negotiate(self, applied: &AppliedSettings) -> Result<Self, TransportError> {
        if applied.input == self.provider_input && applied.output == self.provider_output {
            return Ok(self);
        }

        tracing::warn!(
            profile = %self.profile_name,
            planned_input = %self.provider_input,
            planned_output = %self.provider_output,
            applied_input = %applied.input,
            applied_output = %applied.output,
            "provider applied different formats than planned; continuing with the provider's. \
             Align the audio profile with the provider's supported formats to avoid the rebuild."
        );

        let ingress = derive_chain(self.wire, applied.input)?;
        let egress = derive_chain(applied.output, self.wire)?;
        Ok(Self {
            provider_input: applied.input,
            provider_output: applied.output,
            ingress,
            egress,
            ..self
        })
    }

    /// Bytes in one 20 ms wire frame.
    pub fn wire_frame_bytes(&self) -> usize {
        self.wire.frame_bytes()
    }

    pub fn ingress_converter(&self) -> AudioConverter {
        AudioConverter::new(self.ingress.clone())
    }

    pub fn egress_converter(&self) -> AudioConverter {
        AudioConverter::new(self.egress.clone())
    }
}

/// Derive the step sequence converting `from` into `to`.
fn derive_chain(from: AudioFormat, to: AudioFormat) -> Result<Vec<ConversionStep>, TransportError> {
    if from == to {
        return Ok(Vec::new());
    }

    let mut steps = Vec::new();

    if from.encoding.is_companded() {
        steps.push(ConversionStep::Decompand(from.encoding));
    }
    if from.sample_rate_hz != to.sample_rate_hz {
        if !is_supported_rate_pair(from.sample_rate_hz, to.sample_rate_hz) {
            return Err(TransportError::ProfileIncompatible(format!(
                "no resampler for {} -> {} Hz",
                from.sample_rate_hz, to.sample_rate_hz
            )));
        }
        steps.push(ConversionStep::Resample {
            from_hz: from.sample_rate_hz,
            to_hz: to.sample_rate_hz,
        });
    }
    if to.encoding.is_companded() {
        steps.push(ConversionStep::Compand(to.encoding));
    }

    Ok(steps)
}

/// Executes a conversion chain over byte buffers.
#[derive(Debug, Clone)]
pub struct AudioConverter {
    steps: Vec<ConversionStep>,
}

impl AudioConverter {
    pub fn new(steps: Vec<ConversionStep>) -> Self {
        Self { steps }
    }

    pub fn is_passthrough(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run one buffer through the chain.
    pub fn convert(&self, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.steps.is_empty() {
            return Ok(input.to_vec());
        }

        enum Stage {
            Bytes(Vec<u8>),
            Samples(Vec<i16>),
        }

        let mut stage = Stage::Bytes(input.to_vec());
        for step in &self.steps {
            stage = match (step, stage) {
                (ConversionStep::Decompand(encoding), Stage::Bytes(bytes)) => {
                    let samples = match encoding {
                        AudioEncoding::Mulaw => mulaw_decode(&bytes),
                        AudioEncoding::Alaw => alaw_decode(&bytes),
                        AudioEncoding::Pcm16le => pcm16_from_bytes(&bytes)?,
                    };
                    Stage::Samples(samples)
                }
                (ConversionStep::Resample { from_hz, to_hz }, stage) => {
                    let samples = match stage {
                        Stage::Samples(samples) => samples,
                        Stage::Bytes(bytes) => pcm16_from_bytes(&bytes)?,
                    };
                    Stage::Samples(resample_pcm16(&samples, *from_hz, *to_hz)?)
                }
                (ConversionStep::Compand(encoding), stage) => {
                    let samples = match stage {
                        Stage::Samples(samples) => samples,
                        Stage::Bytes(bytes) => pcm16_from_bytes(&bytes)?,
                    };
                    let bytes = match encoding {
                        AudioEncoding::Mulaw => mulaw_encode(&samples),
                        AudioEncoding::Alaw => alaw_encode(&samples),
                        AudioEncoding::Pcm16le => pcm16_to_bytes(&samples),
                    };
                    Stage::Bytes(bytes)
                }
                (ConversionStep::Decompand(_), Stage::Samples(_)) => {
                    return Err(TransportError::Protocol(
                        "decompand after pcm stage in conversion chain".into(),
                    ));
                }
            };
        }

        Ok(match stage {
            Stage::Bytes(bytes) => bytes,
            Stage::Samples(samples) => pcm16_to_bytes(&samples),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_core::GatePolicy;

    fn caps() -> ProviderCapabilities {
        ProviderCapabilities {
            name: "test".into(),
            supported_input: vec![AudioFormat::pcm16(16000), AudioFormat::mulaw_8k()],
            supported_output: vec![AudioFormat::pcm16(24000), AudioFormat::mulaw_8k()],
            gate_policy: GatePolicy::LocalGate,
        }
    }

    #[test]
    fn telephony_plan_builds_expected_chains() {
        let profile = AudioProfile::telephony_mulaw_8k();
        let plan = TransportPlan::plan("telephony_ulaw_8k", &profile, &caps()).unwrap();

        assert_eq!(
            plan.ingress,
            vec![
                ConversionStep::Decompand(AudioEncoding::Mulaw),
                ConversionStep::Resample { from_hz: 8000, to_hz: 16000 },
            ]
        );
        assert_eq!(
            plan.egress,
            vec![
                ConversionStep::Resample { from_hz: 24000, to_hz: 8000 },
                ConversionStep::Compand(AudioEncoding::Mulaw),
            ]
        );
        assert_eq!(plan.wire_frame_bytes(), 160);
    }

    #[test]
    fn matching_formats_yield_passthrough() {
        let profile = AudioProfile {
            wire: AudioFormat::mulaw_8k(),
            provider_input: AudioFormat::mulaw_8k(),
            provider_output: AudioFormat::mulaw_8k(),
        };
        let plan = TransportPlan::plan("loop", &profile, &caps()).unwrap();
        assert!(plan.ingress.is_empty());
        assert!(plan.egress.is_empty());
    }

    #[test]
    fn unsupported_provider_format_is_incompatible() {
        let profile = AudioProfile {
            wire: AudioFormat::mulaw_8k(),
            provider_input: AudioFormat::pcm16(8000),
            provider_output: AudioFormat::pcm16(24000),
        };
        assert!(matches!(
            TransportPlan::plan("p", &profile, &caps()),
            Err(TransportError::ProfileIncompatible(_))
        ));
    }

    #[test]
    fn negotiate_rebuilds_on_mismatch() {
        let profile = AudioProfile::telephony_mulaw_8k();
        let plan = TransportPlan::plan("telephony_ulaw_8k", &profile, &caps()).unwrap();
        let applied = AppliedSettings {
            input: AudioFormat::pcm16(16000),
            output: AudioFormat::mulaw_8k(),
        };
        let renegotiated = plan.negotiate(&applied).unwrap();
        assert_eq!(renegotiated.provider_output, AudioFormat::mulaw_8k());
        // mulaw provider output to mulaw wire is passthrough
        assert!(renegotiated.egress.is_empty());
    }

    #[test]
    fn egress_converter_produces_wire_frames() {
        let profile = AudioProfile::telephony_mulaw_8k();
        let plan = TransportPlan::plan("telephony_ulaw_8k", &profile, &caps()).unwrap();
        let converter = plan.egress_converter();

        // 100 ms of 24 kHz PCM16 from the provider.
        let samples = vec![0i16; 2400];
        let output = converter.convert(&pcm16_to_bytes(&samples)).unwrap();
        // Down to 8 kHz mulaw: one byte per sample, 1/3 the sample count.
        let expected = 800;
        assert!(
            (output.len() as i64 - expected).unsigned_abs() < 64,
            "got {} expected ~{}",
            output.len(),
            expected
        );
    }
}
