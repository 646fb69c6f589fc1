//! Bidirectional playback, checkpoints, and inbound-protocol edge cases.

mod mock_server;

use std::time::Duration;

use base64::prelude::*;
use serde_json::json;

use callstream::codec::StreamCodec;
use callstream::{CaptureDirection, Direction, EngineConfig, EventKind, StartParams, Supervisor};
use mock_server::{wait_until, EventLog, MockConsumer};

fn bidi_params(url: &str) -> StartParams {
    StartParams {
        service_url: url.to_string(),
        direction: Direction::Both,
        codec: StreamCodec::L16,
        wire_rate: 8000,
        call_rate: 8000,
        timeout_secs: 0,
        bidirectional: true,
        metadata: None,
    }
}

fn pcm_payload(sample: i16, count: usize) -> String {
    let mut bytes = Vec::with_capacity(count * 2);
    for _ in 0..count {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64_STANDARD.encode(&bytes)
}

async fn connected_engine(consumer: &MockConsumer) -> (Supervisor, EventLog) {
    let log = EventLog::new();
    let supervisor = Supervisor::attached(EngineConfig::default(), log.sink());
    supervisor
        .start_stream("call-1", "s-1", bidi_params(&consumer.url()))
        .unwrap();
    log.wait_for(EventKind::ConnectionEstablished, Duration::from_secs(5))
        .await;
    (supervisor, log)
}

#[tokio::test(flavor = "multi_thread")]
async fn playback_mixes_and_fires_checkpoint() {
    let consumer = MockConsumer::spawn(0).await;
    let (supervisor, log) = connected_engine(&consumer).await;

    // 8000 bytes of PCM16 at the call rate, then a named checkpoint.
    let play = json!({
        "event": "media.play",
        "media": {
            "payload": pcm_payload(100, 4000),
            "contentType": "audio/x-l16",
            "sampleRate": 8000,
        },
    });
    consumer.inject(&play.to_string()).await;
    log.wait_for(EventKind::MediaPlayStart, Duration::from_secs(5))
        .await;
    consumer
        .inject(r#"{"event":"media.checkpoint","name":"A"}"#)
        .await;

    // Inbound frames are processed in order, so once this sentinel has
    // been forwarded the checkpoint is registered too.
    consumer
        .inject(r#"{"event":"transcription.send","text":"sentinel"}"#)
        .await;
    log.wait_for(EventKind::TranscriptionReceived, Duration::from_secs(5))
        .await;

    // 8000 bytes fill exactly 25 outgoing 20 ms frames.
    let mut mixed_frames = 0;
    for _ in 0..30 {
        let mut frame = [10i16; 160];
        if supervisor.mix_playback("call-1", "s-1", &mut frame) {
            mixed_frames += 1;
            assert!(frame.iter().all(|&sample| sample == 110));
        }
    }
    assert_eq!(mixed_frames, 25);

    consumer
        .wait_for(
            |messages| messages.iter().any(|m| m["event"] == "playedStream"),
            Duration::from_secs(5),
        )
        .await;
    let played = consumer.received_events("playedStream");
    assert_eq!(played.len(), 1);
    assert_eq!(played[0]["name"], "A");
    assert_eq!(played[0]["stream_id"], "s-1");
    assert_eq!(log.count(EventKind::MediaPlayComplete), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_acks_and_drops_unfired_checkpoints() {
    let consumer = MockConsumer::spawn(0).await;
    let (supervisor, log) = connected_engine(&consumer).await;

    let play = json!({
        "event": "media.play",
        "media": {
            "payload": pcm_payload(50, 4000),
            "contentType": "audio/x-l16",
            "sampleRate": 8000,
        },
    });
    consumer.inject(&play.to_string()).await;
    log.wait_for(EventKind::MediaPlayStart, Duration::from_secs(5))
        .await;
    consumer
        .inject(r#"{"event":"media.checkpoint","name":"B"}"#)
        .await;
    consumer.inject(r#"{"event":"media.clear"}"#).await;

    log.wait_for(EventKind::MediaCleared, Duration::from_secs(5))
        .await;
    consumer
        .wait_for(
            |messages| messages.iter().any(|m| m["event"] == "media.cleared"),
            Duration::from_secs(5),
        )
        .await;
    let cleared = consumer.received_events("media.cleared");
    assert_eq!(cleared[0]["streamId"], "s-1");

    // The cleared buffer mixes nothing and checkpoint B never fires.
    let mut frame = [0i16; 160];
    assert!(!supervisor.mix_playback("call-1", "s-1", &mut frame));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(consumer.received_events("playedStream").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn odd_sample_rate_is_coerced_and_processed() {
    let consumer = MockConsumer::spawn(0).await;
    let (supervisor, log) = connected_engine(&consumer).await;

    let play = json!({
        "event": "media.play",
        "media": {
            "payload": pcm_payload(40, 1600),
            "contentType": "raw",
            "sampleRate": 44100,
        },
    });
    consumer.inject(&play.to_string()).await;
    log.wait_for(EventKind::MediaPlayStart, Duration::from_secs(5))
        .await;

    // Coerced to 8000 == call rate, so the audio lands unresampled.
    let session = supervisor.session("call-1", "s-1").unwrap();
    wait_until(
        || session.mix_playback(&mut [0i16; 160]),
        Duration::from_secs(2),
        "coerced audio to play",
    )
    .await;
    assert!(consumer.received_events("incorrectPayload").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn mulaw_at_sixteen_k_is_rejected() {
    let consumer = MockConsumer::spawn(0).await;
    let (_supervisor, log) = connected_engine(&consumer).await;

    let play = json!({
        "event": "media.play",
        "media": {
            "payload": pcm_payload(1, 100),
            "contentType": "audio/x-mulaw",
            "sampleRate": 16000,
        },
    });
    consumer.inject(&play.to_string()).await;

    consumer
        .wait_for(
            |messages| messages.iter().any(|m| m["event"] == "incorrectPayload"),
            Duration::from_secs(5),
        )
        .await;
    let event = log
        .wait_for(EventKind::StreamInvalidInput, Duration::from_secs(5))
        .await;
    assert_eq!(
        event.payload["reason"],
        "Unsupported combination of codec, samplerate"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn incorrect_payload_is_latched_per_session() {
    let consumer = MockConsumer::spawn(0).await;
    let (_supervisor, log) = connected_engine(&consumer).await;

    consumer.inject(r#"{"event":"totally.unknown"}"#).await;
    consumer
        .wait_for(
            |messages| messages.iter().any(|m| m["event"] == "incorrectPayload"),
            Duration::from_secs(5),
        )
        .await;

    // Further garbage is suppressed by the once-per-session latch.
    consumer.inject(r#"{"event":"still.unknown"}"#).await;
    consumer.inject("not json at all").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(consumer.received_events("incorrectPayload").len(), 1);
    assert_eq!(log.count(EventKind::StreamInvalidInput), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transcription_is_forwarded_to_the_host() {
    let consumer = MockConsumer::spawn(0).await;
    let (_supervisor, log) = connected_engine(&consumer).await;

    consumer
        .inject(r#"{"event":"transcription.send","text":"hello world"}"#)
        .await;
    let event = log
        .wait_for(EventKind::TranscriptionReceived, Duration::from_secs(5))
        .await;
    assert_eq!(event.payload["payload"]["text"], "hello world");
    assert!(consumer.received_events("incorrectPayload").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_capture_interleaves_both_tracks() {
    let consumer = MockConsumer::spawn(0).await;
    let (supervisor, _log) = connected_engine(&consumer).await;

    let frame = vec![9i16; 160];
    for _ in 0..3 {
        supervisor
            .push_frame("call-1", "s-1", CaptureDirection::Inbound, &frame, false)
            .unwrap();
        supervisor
            .push_frame("call-1", "s-1", CaptureDirection::Outbound, &frame, false)
            .unwrap();
    }

    consumer
        .wait_for(
            |messages| messages.iter().filter(|m| m["event"] == "media").count() >= 6,
            Duration::from_secs(5),
        )
        .await;

    let media = consumer.received_events("media");
    let inbound = media.iter().filter(|m| m["media"]["track"] == "inbound").count();
    let outbound = media
        .iter()
        .filter(|m| m["media"]["track"] == "outbound")
        .count();
    assert_eq!(inbound, 3);
    assert_eq!(outbound, 3);

    // The start frame advertised both tracks.
    let start = &consumer.received_events("start")[0];
    assert_eq!(start["start"]["tracks"], json!(["inbound", "outbound"]));
}
