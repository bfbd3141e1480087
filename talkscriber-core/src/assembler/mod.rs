//! Segment/event assembler for ingest sessions.
//!
//! Each `segment_id` moves through two states:
//!
//! ```text
//!   (new) ──segment──► Open ──segment EOS──► Finalized
//!                       │ ▲
//!                       └─┘ segment (text replaced, last writer wins)
//! ```
//!
//! A finalized segment is delivered once and never changes. Later messages
//! for the same id are reported as [`Anomaly::LateSegment`] and dropped.
//!
//! Output is a bounded, ordered channel. If the caller stops reading, the
//! receive loop blocks on it, which in turn stops reading from the socket.

mod turn;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    diagnostics::{AssemblerDiagnostics, AssemblerSnapshot},
    error::{Result, TalkscriberError},
    ipc::events::{Anomaly, Segment, TranscriptEvent},
    protocol::{SegmentMessage, ServerMessage},
    transport::FrameHandler,
};

use turn::TurnTimer;

/// How many finalized ids are remembered for late-message detection.
pub const FINALIZED_MEMORY: usize = 1024;

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub emit_partials: bool,
    /// `None` disables client-side turn detection.
    pub turn_timeout: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            emit_partials: true,
            turn_timeout: None,
            event_capacity: 256,
        }
    }
}

/// Assigns sequence numbers and sends under one lock, so numbering matches
/// channel order across the receive loop and the timer thread.
struct Emitter {
    tx: Sender<TranscriptEvent>,
    next_seq: Mutex<u64>,
}

impl Emitter {
    fn emit(&self, build: impl FnOnce(u64) -> TranscriptEvent) {
        let mut seq = self.next_seq.lock();
        let event = build(*seq);
        if self.tx.send(event).is_err() {
            debug!("transcript receiver dropped, event discarded");
            return;
        }
        *seq += 1;
    }
}

#[derive(Default)]
struct Tracking {
    open: HashMap<u64, Segment>,
    finalized: HashSet<u64>,
    finalized_order: VecDeque<u64>,
}

impl Tracking {
    fn remember_finalized(&mut self, id: u64) {
        if self.finalized.insert(id) {
            self.finalized_order.push_back(id);
        }
        while self.finalized_order.len() > FINALIZED_MEMORY {
            if let Some(old) = self.finalized_order.pop_front() {
                self.finalized.remove(&old);
            }
        }
    }
}

enum Applied {
    Partial(Segment),
    Final(Segment),
    Late(u64),
}

pub struct SegmentAssembler {
    config: AssemblerConfig,
    tracking: Mutex<Tracking>,
    emitter: Arc<Emitter>,
    timer: Option<TurnTimer>,
    ended: AtomicBool,
    diagnostics: Arc<AssemblerDiagnostics>,
}

impl SegmentAssembler {
    /// Build an assembler and the receiver its events arrive on.
    ///
    /// # Errors
    /// `Config` for a zero event capacity or turn timeout; `Io` if the timer
    /// thread cannot be started.
    pub fn new(config: AssemblerConfig) -> Result<(Self, Receiver<TranscriptEvent>)> {
        if config.event_capacity == 0 {
            return Err(TalkscriberError::config(
                "event_capacity",
                "must be at least 1",
            ));
        }
        if config.turn_timeout.is_some_and(|t| t.is_zero()) {
            return Err(TalkscriberError::config(
                "turn_detection_timeout",
                "must be greater than zero",
            ));
        }

        let (tx, rx) = bounded(config.event_capacity);
        let emitter = Arc::new(Emitter {
            tx,
            next_seq: Mutex::new(0),
        });
        let diagnostics = Arc::new(AssemblerDiagnostics::default());

        let timer = match config.turn_timeout {
            Some(timeout) => {
                let timer_emitter = Arc::clone(&emitter);
                let timer_diag = Arc::clone(&diagnostics);
                Some(TurnTimer::spawn(timeout, move |silence| {
                    timer_diag.turns_ended.fetch_add(1, Ordering::Relaxed);
                    debug!(silence_ms = silence.as_millis() as u64, "turn ended");
                    timer_emitter.emit(|seq| TranscriptEvent::TurnEnded { seq, silence });
                })?)
            }
            None => None,
        };

        Ok((
            Self {
                config,
                tracking: Mutex::new(Tracking::default()),
                emitter,
                timer,
                ended: AtomicBool::new(false),
                diagnostics,
            },
            rx,
        ))
    }

    /// Apply one segment message and emit whatever it produces.
    pub fn apply(&self, msg: &SegmentMessage) {
        let applied = self.update_tracking(msg);
        match applied {
            Applied::Late(id) => {
                self.diagnostics.late_segments.fetch_add(1, Ordering::Relaxed);
                warn!(segment_id = id, "message for finalized segment ignored");
                self.emitter.emit(|seq| TranscriptEvent::Anomaly {
                    seq,
                    anomaly: Anomaly::LateSegment { id },
                });
            }
            Applied::Partial(segment) => {
                if self.config.emit_partials {
                    self.diagnostics.partials_emitted.fetch_add(1, Ordering::Relaxed);
                    self.emitter
                        .emit(|seq| TranscriptEvent::Partial { seq, segment });
                }
            }
            Applied::Final(segment) => {
                self.diagnostics.finals_emitted.fetch_add(1, Ordering::Relaxed);
                info!(
                    segment_id = segment.id,
                    start = segment.start,
                    end = segment.end,
                    "segment finalized"
                );
                self.emitter.emit(|seq| TranscriptEvent::Final { seq, segment });
            }
        }
        if let Some(timer) = &self.timer {
            timer.arm();
        }
    }

    fn update_tracking(&self, msg: &SegmentMessage) -> Applied {
        let id = msg.segment_id;
        let mut tracking = self.tracking.lock();
        if tracking.finalized.contains(&id) {
            return Applied::Late(id);
        }

        let mut segment = Segment::from_message(msg);
        match tracking.open.get(&id) {
            Some(previous) => {
                // Keep earlier fields the update leaves out.
                if segment.text.is_empty() {
                    segment.text.clone_from(&previous.text);
                }
                if segment.speaker_name.is_none() {
                    segment.speaker_name.clone_from(&previous.speaker_name);
                }
                if segment.speaker_id.is_none() {
                    segment.speaker_id.clone_from(&previous.speaker_id);
                }
            }
            None => {
                self.diagnostics.segments_opened.fetch_add(1, Ordering::Relaxed);
            }
        }

        if segment.eos {
            tracking.open.remove(&id);
            tracking.remember_finalized(id);
            Applied::Final(segment)
        } else {
            tracking.open.insert(id, segment.clone());
            Applied::Partial(segment)
        }
    }

    /// Ids currently accumulating partial text.
    pub fn open_segments(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.tracking.lock().open.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.timer.as_ref().map(TurnTimer::timeout)
    }

    pub fn diagnostics_snapshot(&self) -> AssemblerSnapshot {
        self.diagnostics.snapshot()
    }

    /// Emit `SessionEnded` once and stop the timer.
    pub fn end(&self, error: Option<&TalkscriberError>) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = &self.timer {
            timer.shutdown();
        }
        let abandoned = self.tracking.lock().open.len();
        if abandoned > 0 {
            debug!(abandoned, "session ended with open segments");
        }
        let error = error.map(ToString::to_string);
        self.emitter
            .emit(|seq| TranscriptEvent::SessionEnded { seq, error });
    }
}

impl FrameHandler for SegmentAssembler {
    fn on_control(&self, message: &ServerMessage) {
        if let ServerMessage::Segment(segment) = message {
            self.apply(segment);
        }
    }

    fn on_protocol_error(&self, error: &TalkscriberError) {
        warn!("dropped undecodable frame: {error}");
        self.emitter.emit(|seq| TranscriptEvent::Anomaly {
            seq,
            anomaly: Anomaly::ProtocolError {
                detail: error.to_string(),
            },
        });
    }

    fn on_closed(&self, error: Option<&TalkscriberError>) {
        self.end(error);
    }
}

impl Drop for SegmentAssembler {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn msg(id: u64, text: &str, eos: bool) -> SegmentMessage {
        let mut emotion = crate::protocol::EmotionScores::new();
        emotion.insert("neutral".into(), 0.8);
        emotion.insert("happy".into(), 0.2);
        SegmentMessage {
            segment_id: id,
            start: 0.0,
            end: 1.2,
            text: text.into(),
            eos,
            speaker_name: None,
            speaker_id: None,
            emotion: Some(emotion.clone()),
            emotion_audio: Some(emotion),
        }
    }

    fn drain(rx: &Receiver<TranscriptEvent>) -> Vec<TranscriptEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn partial_then_final_delivers_one_final_with_emotions() {
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig::default()).unwrap();
        asm.apply(&msg(1, "hello", false));
        asm.apply(&msg(1, "hello world", true));

        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        let TranscriptEvent::Partial { segment, .. } = &events[0] else {
            panic!("expected partial, got {:?}", events[0]);
        };
        assert!(segment.emotion.is_none());
        let TranscriptEvent::Final { segment, .. } = &events[1] else {
            panic!("expected final, got {:?}", events[1]);
        };
        assert_eq!(segment.text, "hello world");
        assert_eq!(segment.emotion.as_ref().unwrap()["neutral"], 0.8);
        assert!(segment.emotion_audio.is_some());
        assert!(asm.open_segments().is_empty());
    }

    #[test]
    fn late_message_is_an_anomaly_and_not_applied() {
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig::default()).unwrap();
        asm.apply(&msg(4, "done", true));
        asm.apply(&msg(4, "rewritten", false));

        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            TranscriptEvent::Anomaly {
                anomaly: Anomaly::LateSegment { id: 4 },
                ..
            }
        ));
        assert!(asm.open_segments().is_empty());
        assert_eq!(asm.diagnostics_snapshot().late_segments, 1);
    }

    #[test]
    fn partials_can_be_suppressed() {
        let config = AssemblerConfig {
            emit_partials: false,
            ..Default::default()
        };
        let (asm, rx) = SegmentAssembler::new(config).unwrap();
        asm.apply(&msg(1, "a", false));
        asm.apply(&msg(1, "ab", false));
        assert_eq!(asm.open_segments(), vec![1]);
        asm.apply(&msg(1, "abc", true));

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TranscriptEvent::Final { segment, .. } if segment.text == "abc"));
    }

    #[test]
    fn empty_final_text_keeps_last_partial() {
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig::default()).unwrap();
        asm.apply(&msg(2, "kept", false));
        asm.apply(&msg(2, "", true));
        let events = drain(&rx);
        assert!(matches!(&events[1], TranscriptEvent::Final { segment, .. } if segment.text == "kept"));
    }

    #[test]
    fn sequence_numbers_are_contiguous() {
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig::default()).unwrap();
        for id in 0..5 {
            asm.apply(&msg(id, "x", false));
            asm.apply(&msg(id, "x", true));
        }
        asm.end(None);
        let seqs: Vec<u64> = drain(&rx).iter().map(TranscriptEvent::seq).collect();
        assert_eq!(seqs, (0..11).collect::<Vec<_>>());
    }

    #[test]
    fn finalized_memory_is_bounded() {
        let (asm, _rx) = SegmentAssembler::new(AssemblerConfig {
            emit_partials: false,
            event_capacity: 4096,
            ..Default::default()
        })
        .unwrap();
        for id in 0..(FINALIZED_MEMORY as u64 + 10) {
            asm.apply(&msg(id, "x", true));
        }
        let tracking = asm.tracking.lock();
        assert_eq!(tracking.finalized.len(), FINALIZED_MEMORY);
        assert!(!tracking.finalized.contains(&0));
    }

    #[test]
    fn session_end_is_emitted_once_and_carries_error() {
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig::default()).unwrap();
        let err = TalkscriberError::Connection("reset by peer".into());
        asm.on_closed(Some(&err));
        asm.on_closed(None);
        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
        assert!(matches!(
            &events[0],
            TranscriptEvent::SessionEnded { error: Some(e), .. } if e.contains("reset by peer")
        ));
    }

    #[test]
    fn turn_end_fires_after_timeout_not_before() {
        let timeout = Duration::from_millis(600);
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig {
            turn_timeout: Some(timeout),
            ..Default::default()
        })
        .unwrap();
        let armed = Instant::now();
        asm.apply(&msg(1, "hi", false));
        let _partial = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(armed.elapsed() >= timeout);
        let TranscriptEvent::TurnEnded { silence, .. } = event else {
            panic!("expected turn end, got {event:?}");
        };
        assert!(silence >= timeout);
    }

    #[test]
    fn protocol_errors_surface_as_anomalies() {
        let (asm, rx) = SegmentAssembler::new(AssemblerConfig::default()).unwrap();
        asm.on_protocol_error(&TalkscriberError::TruncatedFrame {
            len: 3,
            frame_size: 2,
        });
        assert!(matches!(
            drain(&rx).as_slice(),
            [TranscriptEvent::Anomaly {
                anomaly: Anomaly::ProtocolError { .. },
                ..
            }]
        ));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = AssemblerConfig {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            SegmentAssembler::new(config),
            Err(TalkscriberError::Config { .. })
        ));
    }
}
