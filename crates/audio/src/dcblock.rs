//! Single-pole DC-blocking high-pass filter
//!
//! `y[n] = x[n] - x[n-1] + 0.995 * y[n-1]`
//!
//! Telephony front-ends occasionally deliver audio with a DC offset that
//! skews RMS-based gating; one blocker instance is kept per ingress stream.

/// Per-stream DC blocker state.
#[derive(Debug, Clone, Default)]
pub struct DcBlocker {
    prev_input: f32,
    prev_output: f32,
}

const POLE: f32 = 0.995;

impl DcBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter a buffer in place.
    pub fn process(&mut self, samples: &mut [i16]) {
        for sample in samples.iter_mut() {
            let x = *sample as f32;
            let y = x - self.prev_input + POLE * self.prev_output;
            self.prev_input = x;
            self.prev_output = y;
            *sample = y.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    /// Reset filter state (e.g. when a stream restarts).
    pub fn reset(&mut self) {
        self.prev_input = 0.0;
        self.prev_output = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rms_i16;

    #[test]
    fn removes_dc_offset() {
        let mut blocker = DcBlocker::new();
        // 1 second of constant offset at 8 kHz.
        let mut samples = vec![2000i16; 8000];
        blocker.process(&mut samples);
        // After settling, the tail should be near zero.
        let tail = &samples[4000..];
        assert!(rms_i16(tail) < 100.0, "tail rms {}", rms_i16(tail));
    }

    #[test]
    fn passes_ac_content() {
        let mut blocker = DcBlocker::new();
        let mut samples: Vec<i16> = (0..8000)
            .map(|n| {
                let t = n as f32 / 8000.0;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect();
        let before = rms_i16(&samples);
        blocker.process(&mut samples);
        let after = rms_i16(&samples);
        // 440 Hz is far above the cutoff; attenuation should be tiny.
        assert!((after / before) > 0.9, "attenuated to {after} from {before}");
    }

    #[test]
    fn state_carries_across_buffers() {
        let mut chunked = DcBlocker::new();
        let mut whole = DcBlocker::new();

        let signal: Vec<i16> = (0..1600).map(|n| 1500 + ((n % 7) as i16 * 10)).collect();

        let mut a = signal.clone();
        whole.process(&mut a);

        let mut b = signal.clone();
        for chunk in b.chunks_mut(160) {
            chunked.process(chunk);
        }
        assert_eq!(a, b);
    }
}
