//! Rational resampling between telephony rates
//!
//! Wraps `rubato`'s FFT polyphase resampler for the rate pairs the engine
//! actually bridges (8/16/24 kHz). Very short buffers fall back to linear
//! interpolation, which rubato cannot window efficiently.

use rubato::{FftFixedIn, Resampler};

use crate::AudioError;

/// Sample rates the codec kit converts between.
pub const SUPPORTED_RATES: [u32; 3] = [8000, 16000, 24000];

/// Whether the kit can bridge this ordered rate pair.
pub fn is_supported_rate_pair(src_hz: u32, dst_hz: u32) -> bool {
    SUPPORTED_RATES.contains(&src_hz) && SUPPORTED_RATES.contains(&dst_hz)
}

/// Resample a PCM16 buffer from `src_hz` to `dst_hz`.
///
/// Returns the input unchanged when the rates match. Fails with
/// [`AudioError::UnsupportedRate`] for rates outside [`SUPPORTED_RATES`].
pub fn resample_pcm16(samples: &[i16], src_hz: u32, dst_hz: u32) -> Result<Vec<i16>, AudioError> {
    if !is_supported_rate_pair(src_hz, dst_hz) {
        return Err(AudioError::UnsupportedRate {
            src: src_hz,
            dst: dst_hz,
        });
    }
    if src_hz == dst_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    // FFT windowing needs a reasonable block; short frames interpolate.
    if samples.len() < 64 {
        return Ok(resample_linear(samples, src_hz, dst_hz));
    }

    let input: Vec<f64> = samples.iter().map(|&s| s as f64 / 32768.0).collect();
    let chunk = input.len().min(1024);

    match FftFixedIn::<f64>::new(src_hz as usize, dst_hz as usize, chunk, 2, 1) {
        Ok(mut resampler) => {
            let mut out = Vec::with_capacity(samples.len() * dst_hz as usize / src_hz as usize + 8);
            for block in input.chunks(chunk) {
                let frames = if block.len() == chunk {
                    vec![block.to_vec()]
                } else {
                    // Pad the tail block up to the fixed input size.
                    let mut padded = block.to_vec();
                    padded.resize(chunk, 0.0);
                    vec![padded]
                };
                match resampler.process(&frames, None) {
                    Ok(output) => out.extend(output[0].iter().map(|&s| to_i16(s))),
                    Err(e) => {
                        tracing::warn!("fft resampler failed mid-stream, using linear: {e}");
                        return Ok(resample_linear(samples, src_hz, dst_hz));
                    }
                }
            }
            Ok(out)
        }
        Err(e) => {
            tracing::warn!("fft resampler init failed, using linear: {e}");
            Ok(resample_linear(samples, src_hz, dst_hz))
        }
    }
}

fn to_i16(sample: f64) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Linear interpolation fallback for buffers too short to window.
fn resample_linear(samples: &[i16], src_hz: u32, dst_hz: u32) -> Vec<i16> {
    let ratio = dst_hz as f64 / src_hz as f64;
    let out_len = (samples.len() as f64 * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 / ratio;
        let idx = pos.floor() as usize;
        let next = (idx + 1).min(samples.len().saturating_sub(1));
        let frac = pos - idx as f64;
        let sample = samples[idx] as f64 * (1.0 - frac) + samples[next] as f64 * frac;
        out.push(sample as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rms_i16;

    fn sine(rate_hz: u32, freq_hz: f32, ms: u32) -> Vec<i16> {
        let len = (rate_hz * ms / 1000) as usize;
        (0..len)
            .map(|n| {
                let t = n as f32 / rate_hz as f32;
                ((t * freq_hz * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn unsupported_rate_is_rejected() {
        assert!(matches!(
            resample_pcm16(&[0; 160], 8000, 44100),
            Err(AudioError::UnsupportedRate { .. })
        ));
    }

    #[test]
    fn identity_rate_is_passthrough() {
        let input = sine(8000, 440.0, 20);
        assert_eq!(resample_pcm16(&input, 8000, 8000).unwrap(), input);
    }

    #[test]
    fn upsample_doubles_length() {
        let input = sine(8000, 440.0, 100);
        let output = resample_pcm16(&input, 8000, 16000).unwrap();
        let expected = input.len() * 2;
        // FFT block edges may shave a handful of samples.
        assert!(
            (output.len() as i64 - expected as i64).unsigned_abs() < 64,
            "got {} expected ~{}",
            output.len(),
            expected
        );
    }

    #[test]
    fn round_trip_preserves_energy_within_1db() {
        // Band-limited content well under the 4 kHz Nyquist of the 8 kHz leg.
        let input = sine(16000, 440.0, 200);
        let down = resample_pcm16(&input, 16000, 8000).unwrap();
        let back = resample_pcm16(&down, 8000, 16000).unwrap();

        // Compare steady-state RMS, skipping filter warm-up edges.
        let trim = 320;
        let original = rms_i16(&input[trim..input.len() - trim]);
        let restored = rms_i16(&back[trim..back.len().saturating_sub(trim)]);
        let db = 20.0 * (restored / original).log10();
        assert!(db.abs() < 1.0, "energy drift {db:.2} dB");
    }
}
