//! Audio gating and barge-in
//!
//! Decides per inbound frame whether to forward to the provider or drop
//! it, and detects barge-in while the agent is speaking. State machine per
//! call, driven from the single ingress task:
//!
//! - **Open**: forward
//! - **Closed** (playback active): local-gate providers evaluate barge-in
//!   over a rolling VAD window; server-gate providers drop outright:
//!   their own turn detection handles interruptions, and feeding them
//!   gated-out echo makes the agent interrupt itself
//! - **PostPlaybackProtect**: a short drop window after playback ends that
//!   masks the wire echo tail

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use phone_agent_audio::{rms_i16, EnergyVad, VadAggressiveness, VadConfig};
use phone_agent_config::GatingConfig;
use phone_agent_core::GatePolicy;

/// Gate state, visible for tests and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Closed,
    PostPlaybackProtect,
}

/// Verdict for one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Forward to the provider
    Forward,
    Drop,
    /// Caller interrupted the agent: stop playback and reopen
    BargeIn,
}

struct Inner {
    state: GateState,
    vad: EnergyVad,
    protect_until: Option<Instant>,
    cooldown_until: Option<Instant>,
    barge_in_count: u32,
    /// Frames evaluated for barge-in while closed; server-gate keeps this
    /// at zero by contract
    buffered_during_playback: u64,
}

/// Per-call gating manager. Shared between the ingress task (frames) and
/// the coordinator (playback transitions).
pub struct GatingManager {
    policy: GatePolicy,
    config: GatingConfig,
    inner: Mutex<Inner>,
}

impl GatingManager {
    pub fn new(policy: GatePolicy, config: GatingConfig, sample_rate_hz: u32) -> Self {
        let vad = EnergyVad::new(VadConfig {
            aggressiveness: VadAggressiveness::from_level(config.vad_aggressiveness),
            sample_rate_hz,
        });
        Self {
            policy,
            config,
            inner: Mutex::new(Inner {
                state: GateState::Open,
                vad,
                protect_until: None,
                cooldown_until: None,
                barge_in_count: 0,
                buffered_during_playback: 0,
            }),
        }
    }

    /// Playback began: close the gate.
    pub fn on_playback_start(&self) {
        let mut inner = self.inner.lock();
        inner.state = GateState::Closed;
        inner.vad.reset();
    }

    /// Playback ended naturally: protect the echo tail, then reopen.
    pub fn on_playback_end(&self) {
        let mut inner = self.inner.lock();
        inner.state = GateState::PostPlaybackProtect;
        inner.protect_until = Some(
            Instant::now() + Duration::from_millis(self.config.post_playback_protect_ms as u64),
        );
        inner.vad.reset();
    }

    /// Barge-in stopped the playback: reopen immediately (no protect; the
    /// caller is already talking) and start the cooldown.
    fn on_barge_in(inner: &mut Inner, cooldown_ms: u32) {
        inner.state = GateState::Open;
        inner.barge_in_count += 1;
        inner.cooldown_until = Some(Instant::now() + Duration::from_millis(cooldown_ms as u64));
        inner.vad.reset();
        metrics::counter!("barge_in_events_total").increment(1);
    }

    /// Classify one inbound PCM16 frame.
    pub fn on_frame(&self, samples: &[i16]) -> FrameDecision {
        let mut inner = self.inner.lock();

        // Lazy protect expiry.
        if inner.state == GateState::PostPlaybackProtect {
            match inner.protect_until {
                Some(until) if Instant::now() >= until => {
                    inner.state = GateState::Open;
                    inner.protect_until = None;
                }
                _ => return FrameDecision::Drop,
            }
        }

        match inner.state {
            GateState::Open => FrameDecision::Forward,
            GateState::PostPlaybackProtect => FrameDecision::Drop,
            GateState::Closed => match self.policy {
                // Server-side turn detection owns interruptions; local
                // evaluation here is what caused self-interrupt loops.
                GatePolicy::ServerGate => FrameDecision::Drop,
                GatePolicy::LocalGate => {
                    inner.buffered_during_playback += 1;
                    let update = inner.vad.push(samples);
                    let in_cooldown = inner
                        .cooldown_until
                        .map(|until| Instant::now() < until)
                        .unwrap_or(false);

                    let speech_long_enough = update.speech_run_ms >= self.config.barge_in_min_ms;
                    let loud_enough = rms_i16(samples) >= self.config.energy_threshold;

                    if speech_long_enough && loud_enough && !in_cooldown {
                        Self::on_barge_in(&mut inner, self.config.cooldown_ms);
                        FrameDecision::BargeIn
                    } else {
                        FrameDecision::Drop
                    }
                }
            },
        }
    }

    pub fn state(&self) -> GateState {
        self.inner.lock().state
    }

    pub fn barge_in_count(&self) -> u32 {
        self.inner.lock().barge_in_count
    }

    /// Frames that entered barge-in evaluation while the gate was closed.
    pub fn buffered_during_playback(&self) -> u64 {
        self.inner.lock().buffered_during_playback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatingConfig {
        GatingConfig {
            barge_in_min_ms: 250,
            energy_threshold: 1500.0,
            cooldown_ms: 500,
            post_playback_protect_ms: 200,
            vad_aggressiveness: 1,
        }
    }

    fn speech_frame() -> Vec<i16> {
        // 20 ms at 8 kHz, loud sine well over both thresholds.
        (0..160)
            .map(|n| {
                let t = n as f32 / 8000.0;
                ((t * 300.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect()
    }

    fn silence_frame() -> Vec<i16> {
        vec![0i16; 160]
    }

    #[test]
    fn open_gate_forwards() {
        let gating = GatingManager::new(GatePolicy::LocalGate, config(), 8000);
        assert_eq!(gating.on_frame(&speech_frame()), FrameDecision::Forward);
        assert_eq!(gating.on_frame(&silence_frame()), FrameDecision::Forward);
    }

    #[test]
    fn local_gate_triggers_barge_in_after_sustained_speech() {
        let gating = GatingManager::new(GatePolicy::LocalGate, config(), 8000);
        gating.on_playback_start();

        // 240 ms of speech: under the 250 ms window, all dropped.
        let mut decisions = Vec::new();
        for _ in 0..12 {
            decisions.push(gating.on_frame(&speech_frame()));
        }
        assert!(decisions.iter().all(|d| *d == FrameDecision::Drop));

        // The frame crossing 250 ms triggers.
        assert_eq!(gating.on_frame(&speech_frame()), FrameDecision::BargeIn);
        assert_eq!(gating.barge_in_count(), 1);
        assert_eq!(gating.state(), GateState::Open);
    }

    #[test]
    fn quiet_speech_does_not_barge_in() {
        let gating = GatingManager::new(GatePolicy::LocalGate, config(), 8000);
        gating.on_playback_start();
        // Low-amplitude murmur: VAD may fire but RMS stays under 1500.
        let murmur: Vec<i16> = speech_frame().iter().map(|s| s / 8).collect();
        for _ in 0..50 {
            assert_eq!(gating.on_frame(&murmur), FrameDecision::Drop);
        }
    }

    #[test]
    fn server_gate_never_buffers_or_barges() {
        let gating = GatingManager::new(GatePolicy::ServerGate, config(), 8000);
        gating.on_playback_start();
        for _ in 0..100 {
            assert_eq!(gating.on_frame(&speech_frame()), FrameDecision::Drop);
        }
        assert_eq!(gating.buffered_during_playback(), 0);
        assert_eq!(gating.barge_in_count(), 0);
    }

    #[test]
    fn post_playback_protect_drops_then_reopens() {
        let gating = GatingManager::new(GatePolicy::LocalGate, config(), 8000);
        gating.on_playback_start();
        gating.on_playback_end();
        assert_eq!(gating.state(), GateState::PostPlaybackProtect);
        assert_eq!(gating.on_frame(&speech_frame()), FrameDecision::Drop);

        std::thread::sleep(Duration::from_millis(220));
        assert_eq!(gating.on_frame(&speech_frame()), FrameDecision::Forward);
        assert_eq!(gating.state(), GateState::Open);
    }

    #[test]
    fn cooldown_suppresses_repeat_barge_in() {
        let gating = GatingManager::new(GatePolicy::LocalGate, config(), 8000);
        gating.on_playback_start();
        for _ in 0..13 {
            gating.on_frame(&speech_frame());
        }
        assert_eq!(gating.barge_in_count(), 1);

        // New playback immediately; the same sustained speech inside the
        // cooldown window must not trigger again.
        gating.on_playback_start();
        for _ in 0..20 {
            assert_ne!(gating.on_frame(&speech_frame()), FrameDecision::BargeIn);
        }
        assert_eq!(gating.barge_in_count(), 1);
    }
}
