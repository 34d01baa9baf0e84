//! Real-time frame pacing
//!
//! A pacer drains a decoder's [`FrameRing`] into a [`MediaSink`] at wall
//! clock rate. It owns stutter detection, bounded catch-up after scheduling
//! hiccups, buffer-overflow trimming, the hybrid position model, and the
//! barrier mechanism that lets an audio and a video pacer release their
//! first frames at the same instant.

use super::decoder::FrameRing;
use super::{MediaKind, MediaSink};
use crate::clock::FrameClock;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Window during which position reporting uses wall clock before switching
/// to the frame counter
const POSITION_WALL_WINDOW: Duration = Duration::from_secs(3);

/// Number of recent inter-frame intervals retained for telemetry
const INTERVAL_WINDOW: usize = 32;

/// Stutter classification threshold for a given frame duration
pub(crate) fn stutter_threshold(frame_duration: Duration) -> Duration {
    frame_duration.mul_f64(2.2).max(Duration::from_millis(45))
}

/// Multiply S16LE samples by a volume factor, clamping to the sample range
pub(crate) fn apply_volume(frame: &Bytes, volume: f32) -> Bytes {
    let mut out = Vec::with_capacity(frame.len());
    for pair in frame.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (sample as f32 * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    Bytes::from(out)
}

/// Pacing parameters for one stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerSpec {
    /// Stream kind (volume only applies to audio)
    pub kind: MediaKind,
    /// Presentation duration of one frame, also the pump tick
    pub frame_duration: Duration,
    /// Maximum frames emitted per tick while catching up
    pub max_catchup: u64,
    /// Buffered frames above this are trimmed oldest-first
    pub target_buffer: usize,
}

impl PacerSpec {
    /// Audio from a fixed local file: no catch-up bursts
    pub fn audio_file() -> Self {
        Self {
            kind: MediaKind::Audio,
            frame_duration: super::AUDIO_FRAME,
            max_catchup: 1,
            target_buffer: 30,
        }
    }

    /// Audio from a live or looping stream
    pub fn audio_stream() -> Self {
        Self {
            max_catchup: 3,
            ..Self::audio_file()
        }
    }

    /// Video at a declared frame rate
    pub fn video(fps: f64) -> Self {
        Self {
            kind: MediaKind::Video,
            frame_duration: Duration::from_secs_f64(1.0 / fps),
            max_catchup: 2,
            target_buffer: 90,
        }
    }

    /// Nominal frames per second
    pub fn target_fps(&self) -> f64 {
        1.0 / self.frame_duration.as_secs_f64()
    }
}

/// Events emitted by a running pacer
#[derive(Debug, Clone, PartialEq)]
pub enum PacerEvent {
    /// The gap between two emissions exceeded the stutter threshold
    Stutter { gap: Duration },
    /// Decoder exited cleanly and the ring drained
    Finished,
}

/// Telemetry snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStatus {
    pub buffered_frames: usize,
    pub frames_sent: u64,
    pub stutter_count: u64,
    pub target_fps: f64,
    pub avg_interval: Duration,
}

struct Timing {
    running: bool,
    start: Option<Instant>,
    gate_until: Option<Instant>,
    /// Logical frames counted before `start`, set when a resynced pacer is
    /// released
    frame_offset: u64,
    paused_total: Duration,
    paused_since: Option<Instant>,
    last_emit: Option<Instant>,
    intervals: VecDeque<Duration>,
}

struct Shared {
    frames_sent: AtomicU64,
    stutters: AtomicU64,
    volume: Mutex<f32>,
    timing: Mutex<Timing>,
    pump_started: AtomicBool,
    finished_sent: AtomicBool,
}

/// Paces decoded frames into a sink at real time
pub struct Pacer {
    spec: PacerSpec,
    ring: Arc<FrameRing>,
    sink: Arc<dyn MediaSink>,
    clock: Arc<dyn FrameClock>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PacerEvent>,
    shared: Arc<Shared>,
}

impl Pacer {
    /// Create a pacer over a decoder ring and a sink
    pub fn new(
        spec: PacerSpec,
        ring: Arc<FrameRing>,
        sink: Arc<dyn MediaSink>,
        clock: Arc<dyn FrameClock>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PacerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pacer = Arc::new(Self {
            spec,
            ring,
            sink,
            clock,
            cancel: parent.child_token(),
            events: events_tx,
            shared: Arc::new(Shared {
                frames_sent: AtomicU64::new(0),
                stutters: AtomicU64::new(0),
                volume: Mutex::new(1.0),
                timing: Mutex::new(Timing {
                    running: false,
                    start: None,
                    gate_until: None,
                    frame_offset: 0,
                    paused_total: Duration::ZERO,
                    paused_since: None,
                    last_emit: None,
                    intervals: VecDeque::new(),
                }),
                pump_started: AtomicBool::new(false),
                finished_sent: AtomicBool::new(false),
            }),
        });
        (pacer, events_rx)
    }

    /// Start the pump in paused state; frames buffer but none are emitted
    pub fn prime(self: &Arc<Self>) {
        if self.shared.pump_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let pacer = Arc::clone(self);
        tokio::spawn(async move { pacer.pump().await });
    }

    /// Release frames
    ///
    /// A barrier instant becomes the shared logical start so two pacers can
    /// be unpaused in lock-step; without one, emission starts now.
    pub fn unpause(&self, barrier: Option<Instant>) {
        let now = self.clock.now();
        let mut t = self.shared.timing.lock().unwrap();
        if t.running {
            return;
        }
        t.running = true;
        t.last_emit = None;

        match t.start {
            None => {
                let barrier = barrier.unwrap_or(now);
                // Frames already counted (a resync seek) become the logical
                // offset so emission continues from the seek point.
                t.frame_offset = self.shared.frames_sent.load(Ordering::Acquire);
                t.start = Some(barrier);
                t.gate_until = Some(barrier);
                t.paused_total = Duration::ZERO;
                t.paused_since = None;
            }
            Some(_) => {
                if let Some(since) = t.paused_since.take() {
                    t.paused_total += now - since;
                }
                if let Some(barrier) = barrier {
                    if barrier > now {
                        t.paused_total += barrier - now;
                        t.gate_until = Some(barrier);
                    }
                }
            }
        }
    }

    /// Stop emitting; the buffer is preserved and paused time accumulates
    pub fn pause(&self) {
        let now = self.clock.now();
        let mut t = self.shared.timing.lock().unwrap();
        if !t.running {
            return;
        }
        t.running = false;
        t.paused_since = Some(now);
        t.last_emit = None;
    }

    /// Terminate and drop the buffer
    pub fn stop(&self) {
        self.cancel.cancel();
        self.ring.clear();
        let mut t = self.shared.timing.lock().unwrap();
        t.running = false;
    }

    /// Position since logical start, excluding paused time
    ///
    /// Wall clock for the first seconds of playback, frame count afterwards.
    pub fn position(&self) -> Duration {
        let t = self.shared.timing.lock().unwrap();
        let Some(start) = t.start else {
            return Duration::ZERO;
        };
        let now = self.clock.now();
        let mut paused = t.paused_total;
        if let Some(since) = t.paused_since {
            paused += now - since;
        }
        let wall = (now - start).saturating_sub(paused);
        if wall < POSITION_WALL_WINDOW {
            wall + self.spec.frame_duration.mul_f64(t.frame_offset as f64)
        } else {
            self.spec
                .frame_duration
                .mul_f64(self.shared.frames_sent.load(Ordering::Acquire) as f64)
        }
    }

    /// Reset timing so the pacer realigns
    ///
    /// With an audio position, the frame counter seeks to the matching frame
    /// index; the next `unpause` barrier becomes the new logical origin.
    pub fn resync(&self, audio_position: Option<Duration>) {
        let frames = audio_position
            .map(|p| (p.as_micros() / self.spec.frame_duration.as_micros().max(1)) as u64)
            .unwrap_or(0);
        self.shared.frames_sent.store(frames, Ordering::Release);

        let mut t = self.shared.timing.lock().unwrap();
        t.start = None;
        t.gate_until = None;
        t.frame_offset = 0;
        t.paused_total = Duration::ZERO;
        t.paused_since = None;
        t.last_emit = None;
        t.intervals.clear();
        debug!(
            kind = self.spec.kind.label(),
            frames, "Pacer resynced"
        );
    }

    /// Adjust the playback volume multiplier (audio only)
    pub fn set_volume(&self, volume: f32) {
        *self.shared.volume.lock().unwrap() = volume.max(0.0);
    }

    /// Telemetry snapshot
    pub fn buffer_status(&self) -> BufferStatus {
        let t = self.shared.timing.lock().unwrap();
        let avg_interval = if t.intervals.is_empty() {
            Duration::ZERO
        } else {
            t.intervals.iter().sum::<Duration>() / t.intervals.len() as u32
        };
        BufferStatus {
            buffered_frames: self.ring.len(),
            frames_sent: self.shared.frames_sent.load(Ordering::Acquire),
            stutter_count: self.shared.stutters.load(Ordering::Acquire),
            target_fps: self.spec.target_fps(),
            avg_interval,
        }
    }

    /// Frames emitted so far
    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Acquire)
    }

    async fn pump(self: Arc<Self>) {
        let tick = self.spec.frame_duration;
        loop {
            if !crate::clock::after(self.clock.as_ref(), tick, &self.cancel).await {
                return;
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let now = self.clock.now();
        let due = {
            let t = self.shared.timing.lock().unwrap();
            if !t.running {
                return;
            }
            let Some(start) = t.start else { return };
            if let Some(gate) = t.gate_until {
                if now < gate {
                    return;
                }
            }
            let elapsed = (now - start).saturating_sub(t.paused_total);
            let expected = (elapsed.as_micros() / self.spec.frame_duration.as_micros().max(1))
                as u64
                + t.frame_offset;
            let sent = self.shared.frames_sent.load(Ordering::Acquire);
            expected.saturating_sub(sent).clamp(1, self.spec.max_catchup)
        };

        if self.ring.len() > self.spec.target_buffer {
            self.ring.trim_to(self.spec.target_buffer);
        }

        for _ in 0..due {
            let Some(frame) = self.ring.pop_frame() else {
                if self.ring.is_finished()
                    && !self.shared.finished_sent.swap(true, Ordering::AcqRel)
                {
                    let _ = self.events.send(PacerEvent::Finished);
                }
                break;
            };

            let frame = if self.spec.kind == MediaKind::Audio {
                let volume = *self.shared.volume.lock().unwrap();
                if (volume - 1.0).abs() > f32::EPSILON {
                    apply_volume(&frame, volume)
                } else {
                    frame
                }
            } else {
                frame
            };

            if let Err(e) = self.sink.write_frame(frame, self.spec.frame_duration).await {
                warn!(kind = self.spec.kind.label(), "Sink write failed: {e}");
            }

            self.note_emission(self.clock.now());
            self.shared.frames_sent.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn note_emission(&self, now: Instant) {
        let mut t = self.shared.timing.lock().unwrap();
        if let Some(last) = t.last_emit {
            let gap = now - last;
            t.intervals.push_back(gap);
            if t.intervals.len() > INTERVAL_WINDOW {
                t.intervals.pop_front();
            }
            if gap > stutter_threshold(self.spec.frame_duration) {
                self.shared.stutters.fetch_add(1, Ordering::AcqRel);
                let _ = self.events.send(PacerEvent::Stutter { gap });
            }
        }
        t.last_emit = Some(now);
    }
}
