//! External decoder subprocess supervision
//!
//! One decoder per active playback. The subprocess writes raw frames to its
//! stdout, which a reader task carves into whole frames inside a bounded
//! [`FrameRing`]; stderr lines surface as warnings. Transient failures are
//! retried with a linear back-off, looping inputs respawn once the ring
//! drains, and everything dies with the handle's cancellation token.

use crate::clock::FrameClock;
use crate::config::DecoderConfig;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum spacing between overflow-drop log lines
const DROP_LOG_INTERVAL: Duration = Duration::from_millis(1200);

/// Poll interval while waiting for a looping input's ring to drain
const LOOP_DRAIN_POLL: Duration = Duration::from_millis(50);

/// Maximum spawn/empty-output attempts for HTTP inputs
const MAX_HTTP_ATTEMPTS: u32 = 3;

/// Bounded ring of whole decoded frames
///
/// Written only by the decoder reader task, read only by the pacer pump.
pub struct FrameRing {
    frame_bytes: usize,
    cap_frames: usize,
    inner: Mutex<RingInner>,
    dropped_total: AtomicU64,
    finished: AtomicBool,
    drop_log: Mutex<DropLog>,
}

struct RingInner {
    partial: BytesMut,
    frames: VecDeque<Bytes>,
}

struct DropLog {
    pending: u64,
    last: Option<std::time::Instant>,
}

impl FrameRing {
    /// Create a ring holding up to `cap_frames` whole frames of
    /// `frame_bytes` each
    pub fn new(frame_bytes: usize, cap_frames: usize) -> Self {
        assert!(frame_bytes > 0 && cap_frames > 0);
        Self {
            frame_bytes,
            cap_frames,
            inner: Mutex::new(RingInner {
                partial: BytesMut::new(),
                frames: VecDeque::new(),
            }),
            dropped_total: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            drop_log: Mutex::new(DropLog {
                pending: 0,
                last: None,
            }),
        }
    }

    /// Size of one whole frame in bytes
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Append raw decoder output, carving whole frames and evicting the
    /// oldest ones past the cap
    pub fn push_chunk(&self, chunk: &[u8]) {
        let mut dropped = 0u64;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.partial.extend_from_slice(chunk);
            while inner.partial.len() >= self.frame_bytes {
                let frame = inner.partial.split_to(self.frame_bytes).freeze();
                inner.frames.push_back(frame);
                if inner.frames.len() > self.cap_frames {
                    inner.frames.pop_front();
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.note_dropped(dropped);
        }
    }

    /// Pop the oldest whole frame
    pub fn pop_frame(&self) -> Option<Bytes> {
        self.inner.lock().unwrap().frames.pop_front()
    }

    /// Drop oldest frames until at most `target` remain; returns the count
    /// dropped
    pub fn trim_to(&self, target: usize) -> u64 {
        let mut dropped = 0u64;
        {
            let mut inner = self.inner.lock().unwrap();
            while inner.frames.len() > target {
                inner.frames.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.note_dropped(dropped);
        }
        dropped
    }

    /// Number of buffered whole frames
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    /// True when no whole frame is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything, including any partial frame
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.clear();
        inner.partial.clear();
    }

    /// Mark that the producer exited cleanly; residual frames stay readable
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// True once the producer exited cleanly
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Total frames evicted since creation
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    fn note_dropped(&self, count: u64) {
        self.dropped_total.fetch_add(count, Ordering::Relaxed);

        let mut log = self.drop_log.lock().unwrap();
        log.pending += count;
        let now = std::time::Instant::now();
        let due = log
            .last
            .map(|last| now.duration_since(last) >= DROP_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            warn!(
                dropped = log.pending,
                buffered = self.len(),
                "Frame ring overflow, oldest frames dropped"
            );
            log.pending = 0;
            log.last = Some(now);
        }
    }
}

/// Decoder input specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaInput {
    /// Local container file
    File(PathBuf),
    /// HTTP(S) stream
    Http(String),
}

impl MediaInput {
    /// True for HTTP(S) inputs (these get reconnect flags and retries)
    pub fn is_http(&self) -> bool {
        matches!(self, MediaInput::Http(_))
    }

    /// The location string handed to the decoder
    pub fn location(&self) -> String {
        match self {
            MediaInput::File(path) => path.display().to_string(),
            MediaInput::Http(url) => url.clone(),
        }
    }
}

/// Decoder output format
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    /// S16LE 48 kHz mono PCM in 10 ms frames
    Pcm,
    /// yuv420p frames at a declared canvas and rate
    RawVideo { width: u32, height: u32, fps: f64 },
}

impl OutputFormat {
    /// Bytes per whole output frame
    pub fn frame_bytes(&self) -> usize {
        match self {
            OutputFormat::Pcm => super::AUDIO_FRAME_BYTES,
            OutputFormat::RawVideo { width, height, .. } => {
                super::video_frame_bytes(*width, *height)
            }
        }
    }

    /// Presentation duration of one frame
    pub fn frame_duration(&self) -> Duration {
        match self {
            OutputFormat::Pcm => super::AUDIO_FRAME,
            OutputFormat::RawVideo { fps, .. } => Duration::from_secs_f64(1.0 / fps),
        }
    }
}

/// One decode job: input, output shape, loop flag and optional filter chain
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderJob {
    /// Input specifier
    pub input: MediaInput,
    /// Output format
    pub output: OutputFormat,
    /// Respawn the decoder when the ring drains after a clean exit
    pub looping: bool,
    /// Audio filter chain (`-af` argument)
    pub filter: Option<String>,
}

/// Events surfaced by a running decoder
#[derive(Debug)]
pub enum DecoderEvent {
    /// A non-empty stderr line
    Warning(String),
    /// Clean exit; the ring still holds residual frames until drained
    Finished,
    /// Terminal failure after any applicable retries
    Failed(Error),
}

/// Handle over a running decoder
pub struct DecoderHandle {
    cancel: CancellationToken,
    ring: Arc<FrameRing>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DecoderHandle {
    /// The ring this decoder fills
    pub fn ring(&self) -> &Arc<FrameRing> {
        &self.ring
    }

    /// Kill the subprocess, clear the ring and wait for supervision to
    /// finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.ring.clear();
    }
}

/// Build the decoder argument vector for a job
///
/// Kept pure so the exact invocation is testable.
pub fn build_decoder_args(config: &DecoderConfig, job: &DecoderJob) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-nostdin".into(),
        "-fflags".into(),
        "nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
        "-probesize".into(),
        "32768".into(),
        "-analyzeduration".into(),
        "0".into(),
    ];

    if job.input.is_http() {
        args.extend([
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "2".into(),
            "-rw_timeout".into(),
            config.http_read_timeout.as_micros().to_string(),
            "-user_agent".into(),
            config.user_agent.clone(),
        ]);
    }

    args.extend(["-i".into(), job.input.location()]);

    match job.output {
        OutputFormat::Pcm => {
            args.push("-vn".into());
            if let Some(filter) = &job.filter {
                args.extend(["-af".into(), filter.clone()]);
            }
            args.extend([
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                super::SAMPLE_RATE.to_string(),
                "-ac".into(),
                super::CHANNELS.to_string(),
                "pipe:1".into(),
            ]);
        }
        OutputFormat::RawVideo { width, height, fps } => {
            args.push("-an".into());
            args.extend([
                "-vf".into(),
                format!(
                    "scale={width}:{height}:force_original_aspect_ratio=decrease,\
                     pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1"
                ),
                "-r".into(),
                format!("{fps}"),
                "-c:v".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-f".into(),
                "rawvideo".into(),
                "pipe:1".into(),
            ]);
        }
    }

    args
}

/// Parse an `avg_frame_rate` value such as `30000/1001` or `25`
///
/// Values outside the open interval (1, 240) are rejected.
pub(crate) fn parse_avg_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let fps = if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den == 0.0 {
            return None;
        }
        num / den
    } else {
        raw.parse().ok()?
    };

    (fps > 1.0 && fps < 240.0).then_some(fps)
}

/// Probe the input's average frame rate, `None` when undetectable
pub async fn probe_fps(config: &DecoderConfig, input: &MediaInput) -> Option<f64> {
    let output = Command::new(&config.probe_bin)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=avg_frame_rate",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input.location())
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    parse_avg_frame_rate(&String::from_utf8_lossy(&output.stdout))
}

/// Spawn and supervise a decoder for a job
///
/// Returns immediately once supervision starts; progress is reported on the
/// event channel and decoded frames appear in `ring`.
pub fn start(
    config: DecoderConfig,
    job: DecoderJob,
    ring: Arc<FrameRing>,
    clock: Arc<dyn FrameClock>,
    parent: &CancellationToken,
) -> (DecoderHandle, mpsc::UnboundedReceiver<DecoderEvent>) {
    let cancel = parent.child_token();
    let command_config = config.clone();
    let command_job = job.clone();
    let factory = move || {
        let mut command = Command::new(&command_config.decoder_bin);
        command.args(build_decoder_args(&command_config, &command_job));
        command
    };
    start_with_command(factory, config, job, ring, clock, cancel)
}

/// Supervision entry point with an injectable command factory
pub(crate) fn start_with_command<F>(
    factory: F,
    config: DecoderConfig,
    job: DecoderJob,
    ring: Arc<FrameRing>,
    clock: Arc<dyn FrameClock>,
    cancel: CancellationToken,
) -> (DecoderHandle, mpsc::UnboundedReceiver<DecoderEvent>)
where
    F: Fn() -> Command + Send + 'static,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let task_ring = Arc::clone(&ring);
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        supervise(factory, config, job, task_ring, clock, events_tx, task_cancel).await;
    });

    let handle = DecoderHandle {
        cancel,
        ring,
        task: Mutex::new(Some(task)),
    };
    (handle, events_rx)
}

struct RunOutcome {
    bytes_received: u64,
    cancelled: bool,
}

async fn supervise<F>(
    factory: F,
    config: DecoderConfig,
    job: DecoderJob,
    ring: Arc<FrameRing>,
    clock: Arc<dyn FrameClock>,
    events: mpsc::UnboundedSender<DecoderEvent>,
    cancel: CancellationToken,
) where
    F: Fn() -> Command,
{
    if let MediaInput::File(path) = &job.input {
        if !path.exists() {
            let _ = events.send(DecoderEvent::Failed(Error::DecoderFileMissing(
                path.display().to_string(),
            )));
            return;
        }
    }

    let last_warning: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let mut attempt: u32 = 1;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        debug!(input = %job.input.location(), attempt, "Spawning decoder");
        let outcome = run_once(factory(), &ring, &events, &last_warning, &cancel).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if job.input.is_http() && attempt < MAX_HTTP_ATTEMPTS {
                    if !crate::clock::after(clock.as_ref(), config.retry_backoff * attempt, &cancel)
                        .await
                    {
                        return;
                    }
                    attempt += 1;
                    continue;
                }
                let _ = events.send(DecoderEvent::Failed(e));
                return;
            }
        };

        if outcome.cancelled {
            return;
        }

        let produced = outcome.bytes_received as usize >= ring.frame_bytes();

        if job.looping {
            // Looping inputs always respawn, never error; an empty run is
            // paced by the retry back-off so a broken input cannot spin.
            if !produced
                && !crate::clock::after(clock.as_ref(), config.retry_backoff, &cancel).await
            {
                return;
            }
            // Respawn only after playback has nearly caught up, so loops
            // don't pile latency into the ring.
            while ring.len() >= 1 {
                if !crate::clock::after(clock.as_ref(), LOOP_DRAIN_POLL, &cancel).await {
                    return;
                }
            }
            attempt = 1;
            continue;
        }

        if !produced {
            if job.input.is_http() && attempt < MAX_HTTP_ATTEMPTS {
                debug!(attempt, "Decoder exited empty, retrying");
                if !crate::clock::after(clock.as_ref(), config.retry_backoff * attempt, &cancel)
                    .await
                {
                    return;
                }
                attempt += 1;
                continue;
            }
            let detail = last_warning
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "decoder exited without producing output".to_string());
            let _ = events.send(DecoderEvent::Failed(Error::DecoderExitedEmpty(detail)));
            return;
        }

        ring.mark_finished();
        let _ = events.send(DecoderEvent::Finished);
        return;
    }
}

async fn run_once(
    mut command: Command,
    ring: &FrameRing,
    events: &mpsc::UnboundedSender<DecoderEvent>,
    last_warning: &Arc<Mutex<Option<String>>>,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::DecoderSpawnFailed(e.to_string()))?;

    let stderr = child.stderr.take();
    let warn_events = events.clone();
    let warn_store = Arc::clone(last_warning);
    let stderr_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            *warn_store.lock().unwrap() = Some(line.clone());
            let _ = warn_events.send(DecoderEvent::Warning(line));
        }
    });

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::DecoderSpawnFailed("decoder stdout unavailable".to_string()))?;

    let mut bytes_received = 0u64;
    let mut buf = vec![0u8; 16 * 1024];
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                cancelled = true;
                break;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    bytes_received += n as u64;
                    ring.push_chunk(&buf[..n]);
                }
                Err(e) => {
                    warn!("Decoder stdout read failed: {e}");
                    break;
                }
            }
        }
    }

    let _ = child.wait().await;
    let _ = stderr_task.await;

    Ok(RunOutcome {
        bytes_received,
        cancelled,
    })
}
