//! End-to-end mesh scenarios over the in-memory bus and scripted peers
//!
//! Signalling and admission flows run on tokio's virtual clock; playback
//! flows run in real time against stub decoder scripts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use voicemesh::peer::mock::{MockCall, MockFactory};
use voicemesh::signaling::events::{
    DescriptionBody, IceCandidateInit, InboundCandidatePayload, InboundDescriptionPayload,
    ParticipantsPayload, SessionDescription,
};
use voicemesh::{
    BusEvent, InboundSignal, MediaKind, MemoryBus, PlayOptions, TokioClock, VideoOptions,
    VoiceConfig, VoiceConnection, VoiceEvent, VoiceIdentity,
};

struct Harness {
    connection: VoiceConnection,
    bus: Arc<MemoryBus>,
    factory: Arc<MockFactory>,
    events: mpsc::UnboundedReceiver<VoiceEvent>,
    _workdir: Option<TempDir>,
}

fn harness(local_id: &str, config: VoiceConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let bus = Arc::new(MemoryBus::new());
    let factory = Arc::new(MockFactory::default());
    let connection = VoiceConnection::new(
        VoiceIdentity {
            peer_id: local_id.to_string(),
            server_id: "server-1".to_string(),
            channel_id: "chan-1".to_string(),
        },
        config,
        bus.clone(),
        factory.clone(),
        Arc::new(TokioClock),
    )
    .unwrap();
    let events = connection.events().unwrap();
    Harness {
        connection,
        bus,
        factory,
        events,
        _workdir: None,
    }
}

/// Stub decoder environment: scripts standing in for the decoder and probe
/// binaries, plus a dummy input file
struct StubMedia {
    dir: TempDir,
}

impl StubMedia {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn script(&self, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn input_file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"container-bytes").unwrap();
        path
    }
}

fn offer_from(peer: &str) -> BusEvent {
    BusEvent::Signal(InboundSignal::Offer(InboundDescriptionPayload {
        from: peer.to_string(),
        description: DescriptionBody::Offer(SessionDescription::offer(format!("sdp-{peer}"))),
        channel_id: "chan-1".to_string(),
    }))
}

fn participants(ids: &[String]) -> BusEvent {
    BusEvent::Signal(InboundSignal::Participants(ParticipantsPayload {
        channel_id: "chan-1".to_string(),
        participants: ids.to_vec(),
    }))
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

async fn connect_peer(h: &Harness, peer: &str) {
    use voicemesh::peer::PeerApi;

    h.bus.deliver(offer_from(peer));
    settle().await;
    let mock = h.factory.peer(peer).expect("session not created");
    for _ in 0..200 {
        if mock.connection_state() == voicemesh::ConnectionState::Connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {peer} never connected");
}

// ===== virtual-clock signalling scenarios =====

#[tokio::test(start_paused = true)]
async fn two_peer_mesh_with_glare_rolls_back_politely() {
    let mut h = harness("bot-1", VoiceConfig::default());
    h.connection.join().await.unwrap();

    // The participant list triggers our own staggered dial.
    h.bus.deliver(participants(&["user-2".to_string()]));
    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(500)).await;
        settle().await;
    }
    assert!(h.bus.sent_count("voice:offer") >= 1);

    // Their offer lands while ours is outstanding. bot-1 < user-2, so the
    // local side is polite and must yield.
    h.bus.deliver(offer_from("user-2"));
    settle().await;

    let mock = h.factory.peer("user-2").unwrap();
    let calls = mock.calls();
    assert!(calls.contains(&MockCall::Rollback), "polite side rolls back");
    assert_eq!(h.bus.sent_count("voice:answer"), 1);

    // The connected announce fires exactly once.
    let mut connected = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, VoiceEvent::PeerConnected { .. }) {
            connected += 1;
        }
    }
    assert_eq!(connected, 1);
}

#[tokio::test(start_paused = true)]
async fn candidate_before_offer_is_buffered_in_order() {
    let h = harness("bot-1", VoiceConfig::default());
    h.connection.join().await.unwrap();

    for i in 0..2 {
        h.bus
            .deliver(BusEvent::Signal(InboundSignal::IceCandidate(
                InboundCandidatePayload {
                    from: "user-x".to_string(),
                    candidate: IceCandidateInit {
                        candidate: format!("cand-{i}"),
                        ..Default::default()
                    },
                    channel_id: "chan-1".to_string(),
                },
            )));
    }
    settle().await;

    let mock = h.factory.peer("user-x").unwrap();
    assert!(mock.candidates().is_empty(), "candidates buffered");

    h.bus.deliver(offer_from("user-x"));
    settle().await;
    assert_eq!(mock.candidates(), vec!["cand-0", "cand-1"]);
}

#[tokio::test(start_paused = true)]
async fn mass_join_of_hundred_peers_connects_everyone_once() {
    let h = harness("bot-1", VoiceConfig::default());
    h.connection.join().await.unwrap();

    let ids: Vec<String> = (0..100).map(|i| format!("user-{i:03}")).collect();
    h.bus.deliver(participants(&ids));
    settle().await;

    // Five batches of twenty, released five seconds apart, drained one dial
    // at a time on the massive tier.
    for _ in 0..400 {
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(h.connection.negotiations_in_flight() <= 1);
    }

    assert_eq!(h.connection.peer_count().await, 100);
    assert_eq!(h.factory.created_count(), 100);
}

// ===== real-time playback scenarios =====

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn solo_join_and_play_finishes_on_fallback() {
    let stub = StubMedia::new();
    let mut config = VoiceConfig::default();
    // 50 frames of PCM, emitted at once; the stub ignores its arguments.
    config.decoder.decoder_bin = stub.script("decoder", "head -c 48000 /dev/zero");
    let input = stub.input_file("clip.wav");

    let mut h = harness("bot-1", config);
    h.connection.join().await.unwrap();
    h.bus.deliver(participants(&[]));
    settle().await;

    h.connection
        .play_file(&input, PlayOptions::default())
        .await
        .unwrap();

    // Nobody to negotiate with: no offers, and the pacer releases on the
    // fallback window.
    let finished = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match h.events.recv().await.expect("event stream ended") {
                VoiceEvent::PlaybackFinished { kind } => break kind,
                VoiceEvent::PlaybackError { message, .. } => {
                    panic!("playback failed: {message}")
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("playback never finished");

    assert_eq!(finished, MediaKind::Audio);
    assert_eq!(h.bus.sent_count("voice:offer"), 0);

    // The finish event races the pipeline teardown by a hair.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.connection.audio_status().await.is_none());

    h.connection.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_http_stream_surfaces_last_stderr_line() {
    let stub = StubMedia::new();
    let mut config = VoiceConfig::default();
    config.decoder.decoder_bin = stub.script("decoder", "echo 'no route to host' >&2; exit 1");
    config.decoder.retry_backoff = Duration::from_millis(50);

    let mut h = harness("bot-1", config);
    h.connection.join().await.unwrap();

    h.connection
        .play_url("http://bad.example/stream", PlayOptions::default())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match h.events.recv().await.expect("event stream ended") {
                VoiceEvent::PlaybackError { message, .. } => break message,
                VoiceEvent::PlaybackFinished { .. } => panic!("unexpected finish"),
                _ => continue,
            }
        }
    })
    .await
    .expect("no terminal error surfaced");

    assert!(
        message.contains("no route to host"),
        "error should carry the last stderr line, got: {message}"
    );

    h.connection.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_fails_immediately() {
    let h = harness("bot-1", VoiceConfig::default());
    h.connection.join().await.unwrap();

    let result = h
        .connection
        .play_file("/nonexistent/clip.wav", PlayOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(voicemesh::Error::DecoderFileMissing(_))
    ));

    h.connection.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_audio_is_idempotent_under_repetition() {
    let stub = StubMedia::new();
    let mut config = VoiceConfig::default();
    config.decoder.decoder_bin = stub.script(
        "decoder",
        "i=0; while [ $i -lt 100 ]; do head -c 9600 /dev/zero; sleep 0.1; i=$((i+1)); done",
    );
    let input = stub.input_file("clip.wav");

    let h = harness("bot-1", config);
    h.connection.join().await.unwrap();

    for _ in 0..2 {
        h.connection
            .play_file(&input, PlayOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.connection.stop_audio().await;
        h.connection.stop_audio().await;
        assert!(h.connection.audio_status().await.is_none());
    }

    h.connection.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_play_video_takes_replace_track_path() {
    let stub = StubMedia::new();
    let mut config = VoiceConfig::default();
    config.video.width = 16;
    config.video.height = 16;
    // One 384-byte frame every 33 ms, for ten seconds.
    config.decoder.decoder_bin = stub.script(
        "decoder",
        "i=0; while [ $i -lt 300 ]; do head -c 384 /dev/zero; sleep 0.03; i=$((i+1)); done",
    );
    config.decoder.probe_bin = stub.script("probe", "echo 30/1");
    let input = stub.input_file("clip.mp4");
    let location = input.display().to_string();

    let h = harness("bot-1", config);
    h.connection.join().await.unwrap();
    connect_peer(&h, "user-2").await;

    h.connection
        .play_video(&location, VideoOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    h.connection
        .play_video(&location, VideoOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mock = h.factory.peer("user-2").unwrap();
    let video_adds = mock.call_count(|c| matches!(c, MockCall::AddTrack(MediaKind::Video, _)));
    let replaces = mock.call_count(|c| matches!(c, MockCall::ReplaceTrack { .. }));
    assert_eq!(video_adds, 1, "a peer is never double-wired");
    assert!(replaces >= 1, "the second playback must replace the track");

    // The enabled announce is de-duplicated; disable fires once on stop.
    assert_eq!(h.bus.sent_count("voice:screen-share"), 1);
    h.connection.stop_video().await;
    assert_eq!(h.bus.sent_count("voice:screen-share"), 2);
    let removes = mock.call_count(|c| matches!(c, MockCall::RemoveTrack(_)));
    assert_eq!(removes, 1);

    h.connection.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_gets_video_track_and_aligned_pacers() {
    let stub = StubMedia::new();
    let mut config = VoiceConfig::default();
    config.video.width = 16;
    config.video.height = 16;
    config.decoder.decoder_bin = stub.script(
        "decoder",
        // Paced output that satisfies both the audio (960 B / 10 ms) and
        // video (384 B / 33 ms) consumers for the test's duration.
        "i=0; while [ $i -lt 100 ]; do head -c 9600 /dev/zero; sleep 0.1; i=$((i+1)); done",
    );
    config.decoder.probe_bin = stub.script("probe", "echo 30/1");
    let input = stub.input_file("clip.mp4");
    let location = input.display().to_string();

    let h = harness("bot-1", config);
    h.connection.join().await.unwrap();
    connect_peer(&h, "user-a").await;

    h.connection
        .play_file(&input, PlayOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    h.connection
        .play_video(&location, VideoOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    // A third participant connects mid-playback.
    connect_peer(&h, "user-b").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let late = h.factory.peer("user-b").unwrap();
    let video_adds = late.call_count(|c| matches!(c, MockCall::AddTrack(MediaKind::Video, _)));
    assert_eq!(video_adds, 1, "late joiner gets the shared video track");

    // After the resync the video frame counter tracks the audio position.
    let audio = h.connection.audio_status().await.expect("audio playing");
    let video = h.connection.video_status().await.expect("video playing");
    let video_pos = Duration::from_secs_f64(video.frames_sent as f64 / 30.0);
    let audio_pos = Duration::from_millis(audio.frames_sent * 10);
    let drift = if video_pos > audio_pos {
        video_pos - audio_pos
    } else {
        audio_pos - video_pos
    };
    assert!(
        drift < Duration::from_millis(800),
        "audio/video drift too large: audio {audio_pos:?} video {video_pos:?}"
    );

    h.connection.leave().await.unwrap();
}
