//! Energy-based voice activity detection
//!
//! Classifies 10 ms windows of ingress PCM16 as speech or non-speech using
//! an RMS threshold with a hangover counter, and tracks the length of the
//! current continuous-speech run for barge-in evaluation.
//!
//! Aggressiveness selects how hard non-speech is filtered. Level 0 is
//! permissive enough that provider TTS leaking back over the wire gets
//! classified as caller speech, which makes server-gating providers
//! interrupt themselves; level 1 is the default for those providers.

use crate::rms_i16;

/// Window size the detector classifies at.
pub const VAD_WINDOW_MS: u32 = 10;

/// Three-tier sensitivity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadAggressiveness {
    /// Most permissive; flags low-energy audio as speech
    Level0,
    /// Balanced; required default for server-gating providers
    #[default]
    Level1,
    /// Strictest; only strong speech energy passes
    Level2,
}

impl VadAggressiveness {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => VadAggressiveness::Level0,
            2 => VadAggressiveness::Level2,
            _ => VadAggressiveness::Level1,
        }
    }

    /// RMS threshold (int16 units) above which a window counts as speech
    fn rms_threshold(&self) -> f32 {
        match self {
            VadAggressiveness::Level0 => 700.0,
            VadAggressiveness::Level1 => 1200.0,
            VadAggressiveness::Level2 => 1800.0,
        }
    }

    /// Below-threshold windows still reported as speech after a run ends,
    /// so syllable endings are not clipped
    fn hangover_windows(&self) -> u32 {
        match self {
            VadAggressiveness::Level0 => 10,
            VadAggressiveness::Level1 => 8,
            VadAggressiveness::Level2 => 5,
        }
    }
}

/// Detector configuration.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub aggressiveness: VadAggressiveness,
    pub sample_rate_hz: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            aggressiveness: VadAggressiveness::Level1,
            sample_rate_hz: 8000,
        }
    }
}

/// Result of feeding one buffer through the detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct VadUpdate {
    /// Whether the most recent window was speech (including hangover)
    pub is_speech: bool,
    /// Length of the current continuous-speech run in milliseconds
    pub speech_run_ms: u32,
}

/// Per-stream energy VAD state.
#[derive(Debug)]
pub struct EnergyVad {
    config: VadConfig,
    window_samples: usize,
    pending: Vec<i16>,
    hangover_counter: u32,
    is_speech: bool,
    speech_run_ms: u32,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let window_samples = (config.sample_rate_hz * VAD_WINDOW_MS / 1000) as usize;
        Self {
            config,
            window_samples,
            pending: Vec::with_capacity(window_samples * 2),
            hangover_counter: 0,
            is_speech: false,
            speech_run_ms: 0,
        }
    }

    /// Feed samples; classifies every complete 10 ms window within.
    pub fn push(&mut self, samples: &[i16]) -> VadUpdate {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.window_samples {
            let window: Vec<i16> = self.pending.drain(..self.window_samples).collect();
            let rms = rms_i16(&window);

            if rms >= self.config.aggressiveness.rms_threshold() {
                self.is_speech = true;
                self.hangover_counter = self.config.aggressiveness.hangover_windows();
                self.speech_run_ms += VAD_WINDOW_MS;
            } else if self.hangover_counter > 0 {
                self.hangover_counter -= 1;
                self.speech_run_ms += VAD_WINDOW_MS;
            } else {
                self.is_speech = false;
                self.speech_run_ms = 0;
            }
        }

        VadUpdate {
            is_speech: self.is_speech,
            speech_run_ms: self.speech_run_ms,
        }
    }

    /// Clear all state, e.g. on gate transitions.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.hangover_counter = 0;
        self.is_speech = false;
        self.speech_run_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud(ms: u32, rate: u32) -> Vec<i16> {
        let len = (rate * ms / 1000) as usize;
        (0..len)
            .map(|n| {
                let t = n as f32 / rate as f32;
                ((t * 300.0 * 2.0 * std::f32::consts::PI).sin() * 6000.0) as i16
            })
            .collect()
    }

    fn quiet(ms: u32, rate: u32) -> Vec<i16> {
        vec![40i16; (rate * ms / 1000) as usize]
    }

    #[test]
    fn speech_run_accumulates() {
        let mut vad = EnergyVad::new(VadConfig::default());
        let update = vad.push(&loud(300, 8000));
        assert!(update.is_speech);
        assert_eq!(update.speech_run_ms, 300);
    }

    #[test]
    fn silence_resets_run_after_hangover() {
        let mut vad = EnergyVad::new(VadConfig::default());
        vad.push(&loud(100, 8000));
        let update = vad.push(&quiet(300, 8000));
        assert!(!update.is_speech);
        assert_eq!(update.speech_run_ms, 0);
    }

    #[test]
    fn hangover_bridges_short_gaps() {
        let mut vad = EnergyVad::new(VadConfig::default());
        vad.push(&loud(100, 8000));
        // 50 ms gap is inside the level-1 hangover of 80 ms.
        let update = vad.push(&quiet(50, 8000));
        assert!(update.is_speech);
        let update = vad.push(&loud(50, 8000));
        assert_eq!(update.speech_run_ms, 200);
    }

    #[test]
    fn level2_rejects_moderate_energy() {
        let moderate: Vec<i16> = vec![1400i16; 800];
        let mut relaxed = EnergyVad::new(VadConfig {
            aggressiveness: VadAggressiveness::Level0,
            sample_rate_hz: 8000,
        });
        let mut strict = EnergyVad::new(VadConfig {
            aggressiveness: VadAggressiveness::Level2,
            sample_rate_hz: 8000,
        });
        assert!(relaxed.push(&moderate).is_speech);
        assert!(!strict.push(&moderate).is_speech);
    }

    #[test]
    fn partial_windows_are_buffered() {
        let mut vad = EnergyVad::new(VadConfig::default());
        // 5 ms at a time; windows complete every second push.
        for _ in 0..10 {
            vad.push(&loud(5, 8000));
        }
        let update = vad.push(&[]);
        assert_eq!(update.speech_run_ms, 50);
    }
}
