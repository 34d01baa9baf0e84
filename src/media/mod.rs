//! Media pipeline building blocks: frame geometry, sinks and sources

pub mod decoder;
pub mod effects;
pub mod pacer;

use crate::peer::MediaTrack;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Audio sample rate on the wire
pub const SAMPLE_RATE: u32 = 48_000;
/// Audio channel count on the wire
pub const CHANNELS: u16 = 1;
/// Audio frame duration
pub const AUDIO_FRAME: Duration = Duration::from_millis(10);
/// Samples per audio frame (10 ms at 48 kHz mono)
pub const AUDIO_FRAME_SAMPLES: usize = 480;
/// Bytes per audio frame (S16LE)
pub const AUDIO_FRAME_BYTES: usize = AUDIO_FRAME_SAMPLES * 2;

/// Ring capacity for decoded audio, in frames
pub const AUDIO_RING_FRAMES: usize = 60;
/// Ring capacity for decoded video, in frames
pub const VIDEO_RING_FRAMES: usize = 300;

/// Bytes per yuv420p frame for a given canvas
pub const fn video_frame_bytes(width: u32, height: u32) -> usize {
    (width as usize * height as usize * 3) / 2
}

/// Kind of a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// 48 kHz mono S16LE PCM
    Audio,
    /// yuv420p raw video
    Video,
}

impl MediaKind {
    /// Lowercase label used in logs and track ids
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Destination for paced media frames
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Push one whole frame with its presentation duration
    async fn write_frame(&self, frame: Bytes, duration: Duration) -> Result<()>;
}

/// Sink that writes frames as samples into a local WebRTC track
pub struct TrackSampleSink {
    track: Arc<TrackLocalStaticSample>,
}

impl TrackSampleSink {
    /// Wrap a local track
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl MediaSink for TrackSampleSink {
    async fn write_frame(&self, frame: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data: frame,
            duration,
            timestamp: std::time::SystemTime::now(),
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| crate::Error::MediaTrackError(format!("Failed to write sample: {e}")))
    }
}

/// Sink that discards frames; backs detached tracks
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl MediaSink for NullSink {
    async fn write_frame(&self, _frame: Bytes, _duration: Duration) -> Result<()> {
        Ok(())
    }
}

/// Sink that records every frame; used by the test suite
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Bytes>>,
}

impl RecordingSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames written so far
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Snapshot of all written frames
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSink for RecordingSink {
    async fn write_frame(&self, frame: Bytes, _duration: Duration) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

/// A shared media source: one track added to every peer, fed by one pacer
///
/// The audio source lives as long as the connection; the video source only
/// while a video playback is active.
#[derive(Clone)]
pub struct MediaSource {
    kind: MediaKind,
    track: MediaTrack,
    sink: Arc<dyn MediaSink>,
}

impl MediaSource {
    /// Build a source around a track, deriving the sink from the track's
    /// backing
    pub fn new(track: MediaTrack) -> Self {
        let sink: Arc<dyn MediaSink> = match track.sample_track() {
            Some(t) => Arc::new(TrackSampleSink::new(t)),
            None => Arc::new(NullSink),
        };
        Self {
            kind: track.kind(),
            track,
            sink,
        }
    }

    /// Stream kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The track handle shared across peer connections
    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    /// The sink the pacer pushes into
    pub fn sink(&self) -> Arc<dyn MediaSink> {
        Arc::clone(&self.sink)
    }
}
