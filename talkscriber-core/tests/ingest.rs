//! Speech-to-text sessions against an in-process service.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde_json::json;
use talkscriber_core::{
    config::{SessionConfig, TurnDetectionConfig},
    ipc::events::Anomaly,
    CaptureSource, SessionState, SttConfig, TalkscriberError, TranscriptEvent,
    TranscriptionClient,
};
use tokio::sync::oneshot;

use support::{MockServer, Received};

fn config(url: &str) -> SttConfig {
    let mut config = SttConfig::new("test-key");
    config.session = SessionConfig::new(url);
    config.session.auth_timeout = Duration::from_secs(2);
    config
}

/// Collect events until `SessionEnded` or the deadline.
async fn collect(events: Receiver<TranscriptEvent>, limit: Duration) -> Vec<TranscriptEvent> {
    tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + limit;
        let mut out = Vec::new();
        while let Ok(event) = events.recv_deadline(deadline) {
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                break;
            }
        }
        out
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn segments_are_delivered_in_order_with_anomalies() {
    let server = MockServer::start(|mut peer| async move {
        let auth = peer.recv_json().await;
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["api_key"], "test-key");
        assert_eq!(auth["language"], "en");
        assert!(auth["uid"].is_string());

        peer.send_json(json!({"type": "server_ready"})).await;
        peer.send_json(json!({
            "type": "segment", "segment_id": 1, "start": 0.0, "end": 0.4,
            "text": "hel", "EOS": false
        }))
        .await;
        peer.send_json(json!({
            "type": "segment", "segment_id": 1, "start": 0.0, "end": 0.9,
            "text": "hello", "EOS": true, "speaker_name": "A",
            "emotion": {"joy": 0.8, "neutral": 0.2}
        }))
        .await;
        peer.send_json(json!({
            "type": "segment", "segment_id": 1, "text": "hello again", "EOS": false
        }))
        .await;
        peer.send_text("{not json").await;
        peer.send_json(json!({"type": "disconnect"})).await;
        peer.drain().await;
    })
    .await;

    let client = TranscriptionClient::new(config(&server.url)).unwrap();
    let session = client.connect().await.unwrap();
    let events = collect(session.events(), Duration::from_secs(5)).await;

    assert_eq!(events.len(), 5, "{events:?}");
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq(), i as u64);
    }

    match &events[0] {
        TranscriptEvent::Partial { segment, .. } => {
            assert_eq!(segment.text, "hel");
            assert!(segment.emotion.is_none());
        }
        other => panic!("expected Partial, got {other:?}"),
    }
    match &events[1] {
        TranscriptEvent::Final { segment, .. } => {
            assert_eq!(segment.id, 1);
            assert_eq!(segment.text, "hello");
            assert!(segment.eos);
            assert_eq!(segment.speaker_name.as_deref(), Some("A"));
            let emotion = segment.emotion.as_ref().expect("final keeps emotion");
            assert!((emotion["joy"] - 0.8).abs() < 1e-9);
        }
        other => panic!("expected Final, got {other:?}"),
    }
    assert!(matches!(
        &events[2],
        TranscriptEvent::Anomaly {
            anomaly: Anomaly::LateSegment { id: 1 },
            ..
        }
    ));
    assert!(matches!(
        &events[3],
        TranscriptEvent::Anomaly {
            anomaly: Anomaly::ProtocolError { .. },
            ..
        }
    ));
    assert!(matches!(
        &events[4],
        TranscriptEvent::SessionEnded { error: None, .. }
    ));

    let summary = session.finish(Duration::from_millis(200)).await.unwrap();
    assert_eq!(summary.assembler.finals_emitted, 1);
    server.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pcm_source_is_cut_into_wire_frames() {
    let server = MockServer::start(|mut peer| async move {
        peer.recv_json().await;
        peer.send_json(json!({"type": "server_ready"})).await;
        peer.drain().await;
    })
    .await;

    let samples: Vec<i16> = (0..1680).map(|i| (i % 100) as i16).collect();
    let client = TranscriptionClient::new(config(&server.url)).unwrap();
    let session = client
        .start(CaptureSource::Pcm {
            samples: samples.clone(),
            realtime: false,
        })
        .await
        .unwrap();
    let summary = session.finish(Duration::from_millis(200)).await.unwrap();
    assert_eq!(summary.capture.frames_sent, 4);
    assert_eq!(summary.capture.samples_sent, 1680);

    let log = server.finish().await;
    let frames: Vec<Vec<u8>> = log
        .into_iter()
        .filter_map(|r| match r {
            Received::Binary(b) => Some(b),
            Received::Json(_) => None,
        })
        .collect();
    let sizes: Vec<usize> = frames.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![960, 960, 960, 480]);

    let echoed: Vec<i16> = frames
        .concat()
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(echoed, samples);
}

#[tokio::test(flavor = "multi_thread")]
async fn silence_after_a_segment_ends_the_turn() {
    let partial_sent: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let partial_sent_peer = Arc::clone(&partial_sent);

    let server = MockServer::start(move |mut peer| async move {
        let auth = peer.recv_json().await;
        assert_eq!(auth["enable_turn_detection"], true);
        peer.send_json(json!({"type": "server_ready"})).await;
        *partial_sent_peer.lock() = Some(Instant::now());
        peer.send_json(json!({
            "type": "segment", "segment_id": 7, "text": "are you there", "EOS": false
        }))
        .await;
        peer.drain().await;
    })
    .await;

    let mut cfg = config(&server.url);
    cfg.turn_detection = TurnDetectionConfig {
        enabled: true,
        timeout: Duration::from_millis(600),
    };
    let client = TranscriptionClient::new(cfg).unwrap();
    let session = client.connect().await.unwrap();

    let events = session.events();
    let (turn_at, silence) = tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match events.recv_deadline(deadline) {
                Ok(TranscriptEvent::TurnEnded { silence, .. }) => {
                    return Some((Instant::now(), silence))
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap()
    .expect("turn never ended");

    let partial_sent = partial_sent.lock().expect("partial never sent");
    assert!(silence >= Duration::from_millis(600), "{silence:?}");
    assert!(turn_at.duration_since(partial_sent) >= Duration::from_millis(600));

    session.stop().await.unwrap();
    server.finish().await;
}

/// Take exactly `n` events, failing if they do not arrive within `limit`.
async fn take(events: Receiver<TranscriptEvent>, n: usize, limit: Duration) -> Vec<TranscriptEvent> {
    tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + limit;
        (0..n)
            .map(|i| {
                events
                    .recv_deadline(deadline)
                    .unwrap_or_else(|e| panic!("event {i} of {n} missing: {e}"))
            })
            .collect()
    })
    .await
    .unwrap()
}

fn binary_frames(log: Vec<Received>) -> Vec<Vec<i16>> {
    log.into_iter()
        .filter_map(|r| match r {
            Received::Binary(b) => Some(
                b.chunks_exact(2)
                    .map(|p| i16::from_le_bytes([p[0], p[1]]))
                    .collect(),
            ),
            Received::Json(_) => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_frames_and_capture_frames_never_interleave_mid_frame() {
    let server = MockServer::start(|mut peer| async move {
        peer.recv_json().await;
        peer.send_json(json!({"type": "server_ready"})).await;
        peer.drain().await;
    })
    .await;

    // Capture frame k carries the value k; caller frame k carries -k.
    let captured: Vec<i16> = (1..=40i16)
        .flat_map(|k| std::iter::repeat(k).take(480))
        .collect();
    let client = TranscriptionClient::new(config(&server.url)).unwrap();
    let session = client
        .start(CaptureSource::Pcm {
            samples: captured,
            realtime: true,
        })
        .await
        .unwrap();
    for k in 1..=40i16 {
        session.send_pcm(&[-k; 480]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(7)).await;
    }
    let summary = session.finish(Duration::from_millis(200)).await.unwrap();
    assert_eq!(summary.capture.frames_sent, 40);

    let frames = binary_frames(server.finish().await);
    assert_eq!(frames.len(), 80);
    let mut from_capture = Vec::new();
    let mut from_caller = Vec::new();
    for frame in &frames {
        assert_eq!(frame.len(), 480);
        let first = frame[0];
        assert!(frame.iter().all(|&v| v == first), "mixed frame starting {first}");
        if first > 0 {
            from_capture.push(first);
        } else {
            from_caller.push(-first);
        }
    }
    let expected: Vec<i16> = (1..=40).collect();
    assert_eq!(from_capture, expected);
    assert_eq!(from_caller, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn consecutive_undecodable_frames_end_the_session() {
    let server = MockServer::start(|mut peer| async move {
        peer.recv_json().await;
        peer.send_json(json!({"type": "server_ready"})).await;
        for _ in 0..8 {
            peer.send_text("{not json").await;
        }
        peer.drain().await;
    })
    .await;

    let client = TranscriptionClient::new(config(&server.url)).unwrap();
    let session = client.connect().await.unwrap();
    let events = collect(session.events(), Duration::from_secs(5)).await;

    assert_eq!(events.len(), 9, "{events:?}");
    assert!(events[..8].iter().all(|e| matches!(
        e,
        TranscriptEvent::Anomaly {
            anomaly: Anomaly::ProtocolError { .. },
            ..
        }
    )));
    match &events[8] {
        TranscriptEvent::SessionEnded { error: Some(detail), .. } => {
            assert!(detail.contains("undecodable"), "{detail}");
        }
        other => panic!("expected SessionEnded with an error, got {other:?}"),
    }
    let failure = session.failure().expect("session should record the failure");
    assert!(failure.is_protocol(), "{failure}");
    assert_eq!(session.state(), SessionState::Error);

    let err = session.finish(Duration::from_millis(200)).await.err().unwrap();
    assert!(err.is_protocol(), "{err}");
    server.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn a_valid_frame_resets_the_undecodable_count() {
    let server = MockServer::start(|mut peer| async move {
        peer.recv_json().await;
        peer.send_json(json!({"type": "server_ready"})).await;
        for _ in 0..7 {
            peer.send_text("{not json").await;
        }
        peer.send_json(json!({
            "type": "segment", "segment_id": 3, "text": "still here", "EOS": false
        }))
        .await;
        for _ in 0..7 {
            peer.send_text("{not json").await;
        }
        peer.drain().await;
    })
    .await;

    let client = TranscriptionClient::new(config(&server.url)).unwrap();
    let session = client.connect().await.unwrap();
    let events = session.events();
    let received = take(events.clone(), 15, Duration::from_secs(5)).await;

    assert!(matches!(&received[7], TranscriptEvent::Partial { segment, .. } if segment.id == 3));
    let anomalies = received
        .iter()
        .filter(|e| matches!(e, TranscriptEvent::Anomaly { .. }))
        .count();
    assert_eq!(anomalies, 14);

    let quiet = tokio::task::spawn_blocking(move || events.recv_timeout(Duration::from_millis(300)))
        .await
        .unwrap();
    assert!(quiet.is_err(), "unexpected event {quiet:?}");
    assert_eq!(session.state(), SessionState::Open);
    assert!(session.failure().is_none());

    session.stop().await.unwrap();
    server.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_returns_while_the_service_stops_reading() {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let server = MockServer::start(|mut peer| async move {
        peer.recv_json().await;
        peer.send_json(json!({"type": "server_ready"})).await;
        // Hold the socket open without reading a byte.
        let _ = release_rx.await;
        drop(peer);
    })
    .await;

    let mut cfg = config(&server.url);
    // Only the stop itself may unblock the stalled write.
    cfg.session.send_timeout = Duration::from_secs(60);
    let client = TranscriptionClient::new(cfg).unwrap();
    let session = client
        .start(CaptureSource::Pcm {
            samples: vec![0; 30_000_000],
            realtime: false,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    let summary = tokio::time::timeout(Duration::from_secs(5), session.stop())
        .await
        .expect("stop hung on a stalled write")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(summary.capture.stopped);
    assert!(summary.capture.samples_sent < 30_000_000);

    let _ = release_tx.send(());
    server.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn a_write_stalled_past_the_send_timeout_fails_the_session() {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let server = MockServer::start(|mut peer| async move {
        peer.recv_json().await;
        peer.send_json(json!({"type": "server_ready"})).await;
        let _ = release_rx.await;
        drop(peer);
    })
    .await;

    let mut cfg = config(&server.url);
    cfg.session.send_timeout = Duration::from_millis(300);
    let client = TranscriptionClient::new(cfg).unwrap();
    let session = client
        .start(CaptureSource::Pcm {
            samples: vec![0; 30_000_000],
            realtime: false,
        })
        .await
        .unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        session.finish(Duration::from_millis(100)),
    )
    .await
    .expect("finish hung on a stalled write")
    .err()
    .unwrap();
    match err {
        TalkscriberError::Connection(detail) => assert!(detail.contains("stalled"), "{detail}"),
        other => panic!("expected Connection, got {other}"),
    }

    let _ = release_tx.send(());
    server.finish().await;
}
