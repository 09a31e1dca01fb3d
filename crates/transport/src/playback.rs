//! Streaming playback manager
//!
//! Accepts a lazy stream of provider-output audio, runs it through the
//! plan's egress conversion chain, and emits exactly one wire frame per
//! frame interval of wall time. Three states:
//!
//! - **warm-up**: buffer `min_start_ms` before the first emission
//! - **steady**: one frame per tick; dropping under `low_watermark_ms`
//!   pauses emission until the producer refills (no re-warmup)
//! - **idle**: `idle_cutoff_ms` with an empty buffer and no new input
//!   closes the playback
//!
//! `stop()` drains at most `provider_grace_ms` of already-buffered audio,
//! then discards anything else, and is idempotent.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use phone_agent_config::PlaybackConfig;

use crate::orchestrator::AudioConverter;

/// Why a playback was stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BargeIn,
    Hangup,
    Replaced,
    ProviderClosed,
}

/// Events surfaced to the conversation coordinator
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    Started { playback_id: String },
    /// `complete` is true when the stream finished naturally (all audio
    /// emitted), false when stopped
    Finished { playback_id: String, complete: bool },
    Underflow { playback_id: String },
}

enum Command {
    Stop(StopReason),
}

/// Handle for one running playback
#[derive(Clone)]
pub struct PlaybackHandle {
    pub id: String,
    commands: mpsc::Sender<Command>,
}

impl PlaybackHandle {
    /// Stop this playback. Safe to call any number of times; calls after
    /// the playback ended are no-ops.
    pub async fn stop(&self, reason: StopReason) {
        let _ = self.commands.send(Command::Stop(reason)).await;
    }
}

/// Factory for paced playback tasks
#[derive(Clone)]
pub struct PlaybackManager {
    config: PlaybackConfig,
}

impl PlaybackManager {
    pub fn new(config: PlaybackConfig) -> Self {
        Self { config }
    }

    /// Start a playback session.
    ///
    /// `input` carries provider-output-format chunks; `sink` receives exact
    /// wire frames, one per tick. Returns immediately with the handle whose
    /// id the engine stores in `CallSession.playback_ref`.
    pub fn start(
        &self,
        call_id: &str,
        input: mpsc::Receiver<Bytes>,
        converter: AudioConverter,
        wire_frame_bytes: usize,
        wire_bytes_per_ms: usize,
        sink: mpsc::Sender<Bytes>,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> PlaybackHandle {
        let playback_id = Uuid::new_v4().to_string();
        let (command_tx, command_rx) = mpsc::channel(4);

        let task = PlaybackTask {
            playback_id: playback_id.clone(),
            call_id: call_id.to_string(),
            config: self.config.clone(),
            input,
            commands: command_rx,
            converter,
            frame_bytes: wire_frame_bytes,
            bytes_per_ms: wire_bytes_per_ms.max(1),
            sink,
            events,
            buffer: VecDeque::new(),
            emitted_any: false,
        };
        tokio::spawn(task.run());

        PlaybackHandle {
            id: playback_id,
            commands: command_tx,
        }
    }
}

struct PlaybackTask {
    playback_id: String,
    call_id: String,
    config: PlaybackConfig,
    input: mpsc::Receiver<Bytes>,
    commands: mpsc::Receiver<Command>,
    converter: AudioConverter,
    frame_bytes: usize,
    bytes_per_ms: usize,
    sink: mpsc::Sender<Bytes>,
    events: mpsc::Sender<PlaybackEvent>,
    buffer: VecDeque<u8>,
    emitted_any: bool,
}

enum RunEnd {
    Complete,
    Stopped(StopReason),
}

impl PlaybackTask {
    fn buffered_ms(&self) -> u32 {
        (self.buffer.len() / self.bytes_per_ms) as u32
    }

    fn ingest(&mut self, chunk: &[u8]) {
        match self.converter.convert(chunk) {
            Ok(wire_bytes) => self.buffer.extend(wire_bytes),
            Err(e) => {
                // Codec-layer failures are bugs; drop the chunk, keep pacing.
                tracing::error!(call_id = %self.call_id, "egress conversion failed: {e}");
            }
        }
    }

    async fn emit_frame(&mut self) -> bool {
        let frame: Vec<u8> = self.buffer.drain(..self.frame_bytes).collect();
        if !self.emitted_any {
            self.emitted_any = true;
            let _ = self
                .events
                .send(PlaybackEvent::Started {
                    playback_id: self.playback_id.clone(),
                })
                .await;
        }
        self.sink.send(Bytes::from(frame)).await.is_ok()
    }

    /// Emit the zero-padded trailing partial frame, if any.
    async fn flush_tail(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut frame: Vec<u8> = self.buffer.drain(..).collect();
        frame.resize(self.frame_bytes, 0);
        self.buffer.extend(frame);
        let _ = self.emit_frame().await;
    }

    async fn run(mut self) {
        let end = self.run_inner().await;
        let complete = matches!(end, RunEnd::Complete);
        if let RunEnd::Stopped(reason) = end {
            tracing::debug!(
                call_id = %self.call_id,
                playback_id = %self.playback_id,
                ?reason,
                "playback stopped"
            );
        }
        let _ = self
            .events
            .send(PlaybackEvent::Finished {
                playback_id: self.playback_id.clone(),
                complete,
            })
            .await;
    }

    async fn run_inner(&mut self) -> RunEnd {
        // Warm-up: fill to min_start_ms before pacing begins.
        let warmup_deadline =
            Instant::now() + Duration::from_millis(self.config.idle_cutoff_ms as u64);
        let mut input_open = true;
        while input_open && self.buffered_ms() < self.config.min_start_ms {
            tokio::select! {
                maybe_chunk = self.input.recv() => match maybe_chunk {
                    Some(chunk) => self.ingest(&chunk),
                    None => input_open = false,
                },
                Some(Command::Stop(reason)) = self.commands.recv() => {
                    return RunEnd::Stopped(reason);
                }
                _ = tokio::time::sleep_until(warmup_deadline) => {
                    if self.buffer.is_empty() {
                        tracing::debug!(call_id = %self.call_id, "playback idle before warm-up");
                        return RunEnd::Complete;
                    }
                    break; // pace out what we have
                }
            }
        }

        // Steady: one frame per tick. Interval catch-up corrects timing
        // error accumulated across paused or late ticks.
        let frame_duration = Duration::from_millis(self.config.chunk_size.as_ms() as u64);
        let mut ticker = tokio::time::interval(frame_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut paused = false;
        // A pause only becomes an underflow once it makes us skip a tick.
        let mut underflow_counted = false;
        let mut last_input = Instant::now();
        let idle_cutoff = Duration::from_millis(self.config.idle_cutoff_ms as u64);

        loop {
            tokio::select! {
                biased;

                Some(Command::Stop(reason)) = self.commands.recv() => {
                    self.drain_grace(&mut ticker).await;
                    return RunEnd::Stopped(reason);
                }

                maybe_chunk = self.input.recv(), if input_open => match maybe_chunk {
                    Some(chunk) => {
                        self.ingest(&chunk);
                        last_input = Instant::now();
                        if paused && self.buffered_ms() >= self.config.low_watermark_ms {
                            paused = false;
                        }
                    }
                    None => input_open = false,
                },

                _ = ticker.tick() => {
                    if !input_open {
                        // Producer gone: drain everything, then finish.
                        if self.buffer.len() >= self.frame_bytes {
                            if !self.emit_frame().await {
                                return RunEnd::Stopped(StopReason::Hangup);
                            }
                        } else {
                            self.flush_tail().await;
                            return RunEnd::Complete;
                        }
                    } else if paused {
                        if self.buffered_ms() >= self.config.low_watermark_ms {
                            paused = false;
                        } else {
                            if !underflow_counted {
                                underflow_counted = true;
                                metrics::counter!("playback_underflows_total").increment(1);
                                let _ = self.events.send(PlaybackEvent::Underflow {
                                    playback_id: self.playback_id.clone(),
                                }).await;
                            }
                            if last_input.elapsed() >= idle_cutoff
                                && self.buffer.len() < self.frame_bytes
                            {
                                tracing::debug!(call_id = %self.call_id, "playback idle cutoff");
                                self.flush_tail().await;
                                return RunEnd::Complete;
                            }
                        }
                    } else if self.buffer.len() >= self.frame_bytes {
                        if !self.emit_frame().await {
                            return RunEnd::Stopped(StopReason::Hangup);
                        }
                        if self.buffered_ms() < self.config.low_watermark_ms {
                            paused = true;
                            underflow_counted = false;
                        }
                    } else {
                        paused = true;
                        underflow_counted = false;
                    }
                }
            }
        }
    }

    /// After stop: keep pacing out buffered frames for at most the grace
    /// window, discarding any further producer input.
    async fn drain_grace(&mut self, ticker: &mut tokio::time::Interval) {
        let deadline = Instant::now() + Duration::from_millis(self.config.provider_grace_ms as u64);
        while self.buffer.len() >= self.frame_bytes && Instant::now() < deadline {
            ticker.tick().await;
            if !self.emit_frame().await {
                return;
            }
        }
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_config::ChunkSize;

    fn test_config() -> PlaybackConfig {
        PlaybackConfig {
            min_start_ms: 100,
            low_watermark_ms: 50,
            idle_cutoff_ms: 500,
            chunk_size: ChunkSize::Auto,
            provider_grace_ms: 500,
        }
    }

    /// mulaw wire: 8 bytes/ms, 160-byte frames.
    const FRAME_BYTES: usize = 160;
    const BYTES_PER_MS: usize = 8;

    fn manager() -> PlaybackManager {
        PlaybackManager::new(test_config())
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn emits_exact_wire_frames_and_finishes() {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (sink_tx, mut sink_rx) = mpsc::channel(512);
        let (event_tx, mut event_rx) = mpsc::channel(64);

        let _handle = manager().start(
            "call-1",
            input_rx,
            AudioConverter::new(vec![]),
            FRAME_BYTES,
            BYTES_PER_MS,
            sink_tx,
            event_tx,
        );

        // 500 ms of wire audio in odd-sized chunks, then end of stream.
        for _ in 0..10 {
            input_tx.send(Bytes::from(vec![0x7fu8; 400])).await.unwrap();
        }
        drop(input_tx);

        let mut frames = 0usize;
        while let Some(frame) = sink_rx.recv().await {
            assert_eq!(frame.len(), FRAME_BYTES);
            frames += 1;
        }
        assert_eq!(frames, 4000 / FRAME_BYTES);

        assert!(matches!(
            event_rx.recv().await,
            Some(PlaybackEvent::Started { .. })
        ));
        let mut finished = None;
        while let Some(event) = event_rx.recv().await {
            if let PlaybackEvent::Finished { complete, .. } = event {
                finished = Some(complete);
            }
        }
        assert_eq!(finished, Some(true));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_is_idempotent_and_bounded_by_grace() {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (sink_tx, mut sink_rx) = mpsc::channel(4096);
        let (event_tx, mut event_rx) = mpsc::channel(64);

        let handle = manager().start(
            "call-1",
            input_rx,
            AudioConverter::new(vec![]),
            FRAME_BYTES,
            BYTES_PER_MS,
            sink_tx,
            event_tx,
        );

        // 5 seconds of audio buffered; stop after warm-up.
        for _ in 0..100 {
            input_tx.send(Bytes::from(vec![0u8; 400])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop(StopReason::BargeIn).await;
        handle.stop(StopReason::BargeIn).await; // second stop: no-op

        let mut finished = 0;
        while let Some(event) = event_rx.recv().await {
            if let PlaybackEvent::Finished { complete, .. } = event {
                assert!(!complete);
                finished += 1;
            }
        }
        assert_eq!(finished, 1, "exactly one finish despite double stop");

        // Emitted audio is bounded: what was paced before the stop plus at
        // most the grace window.
        let mut emitted = 0;
        while sink_rx.try_recv().is_ok() {
            emitted += 1;
        }
        assert!(
            emitted <= (200 + 500 + 40) / 20,
            "emitted {emitted} frames past grace bound"
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn producer_stall_pauses_then_resumes_without_rewarmup() {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (sink_tx, mut sink_rx) = mpsc::channel(4096);
        let (event_tx, mut event_rx) = mpsc::channel(64);

        let _handle = manager().start(
            "call-1",
            input_rx,
            AudioConverter::new(vec![]),
            FRAME_BYTES,
            BYTES_PER_MS,
            sink_tx,
            event_tx,
        );

        // 120 ms buffered, then the producer stalls.
        input_tx.send(Bytes::from(vec![0u8; 960])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let drained: usize = {
            let mut n = 0;
            while sink_rx.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        assert!(drained >= 4, "paced out most of the buffer, got {drained}");

        // Refill well above the watermark; emission resumes promptly
        // (no 100 ms re-warmup).
        input_tx.send(Bytes::from(vec![0u8; 1600])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let resumed = sink_rx.try_recv().is_ok();
        assert!(resumed, "no frames after refill");

        drop(input_tx);
        let mut saw_underflow = false;
        while let Some(event) = event_rx.recv().await {
            if matches!(event, PlaybackEvent::Underflow { .. }) {
                saw_underflow = true;
            }
        }
        assert!(saw_underflow, "stall past the tick deadline counts as underflow");
    }
}
