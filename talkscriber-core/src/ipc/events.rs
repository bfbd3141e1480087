//! Events delivered to the caller.
//!
//! | Event | Delivery |
//! |-------|----------|
//! | `TranscriptEvent` | bounded, ordered `crossbeam_channel` per ingest session |
//! | `SessionStatusEvent` | `broadcast` channel per transport session |
//!
//! Everything here serialises with camelCase fields so a host can forward
//! events as JSON lines unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{EmotionScores, SegmentMessage};
use crate::transport::{Direction, SessionState};

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// One utterance, or the current state of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Stable across partial → final updates.
    pub id: u64,
    /// Seconds from the start of the stream.
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub eos: bool,
    pub speaker_name: Option<String>,
    pub speaker_id: Option<String>,
    /// Only ever set on a final segment.
    pub emotion: Option<EmotionScores>,
    /// Only ever set on a final segment.
    pub emotion_audio: Option<EmotionScores>,
}

impl Segment {
    /// Build from a wire message. Emotion maps are taken only when the
    /// message carries EOS.
    pub fn from_message(msg: &SegmentMessage) -> Self {
        let (emotion, emotion_audio) = if msg.eos {
            (msg.emotion.clone(), msg.emotion_audio.clone())
        } else {
            (None, None)
        };
        Self {
            id: msg.segment_id,
            start: msg.start,
            end: msg.end,
            text: msg.text.clone(),
            eos: msg.eos,
            speaker_name: msg.speaker_name.clone(),
            speaker_id: msg.speaker_id.clone(),
            emotion,
            emotion_audio,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Why the assembler flagged a message instead of applying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Anomaly {
    /// A message arrived for an id that was already finalized.
    LateSegment { id: u64 },
    /// An undecodable frame was dropped.
    ProtocolError { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum TranscriptEvent {
    /// Text may still change for this id.
    Partial { seq: u64, segment: Segment },
    /// The utterance is complete and immutable.
    Final { seq: u64, segment: Segment },
    /// No segment activity for the turn-detection timeout.
    TurnEnded {
        seq: u64,
        /// Time since the last segment, measured when the timer fired.
        #[serde(with = "duration_ms")]
        silence: Duration,
    },
    Anomaly { seq: u64, anomaly: Anomaly },
    /// Always the last event of a session.
    SessionEnded {
        seq: u64,
        /// `None` on a clean close.
        error: Option<String>,
    },
}

impl TranscriptEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Partial { seq, .. }
            | Self::Final { seq, .. }
            | Self::TurnEnded { seq, .. }
            | Self::Anomaly { seq, .. }
            | Self::SessionEnded { seq, .. } => *seq,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEnded { .. })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Emitted on every transport state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub direction: Direction,
    pub state: SessionState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_message(eos: bool) -> SegmentMessage {
        SegmentMessage {
            segment_id: 2,
            start: 0.0,
            end: 1.5,
            text: "hello".into(),
            eos,
            speaker_name: Some("A".into()),
            speaker_id: None,
            emotion: Some([("joy".to_string(), 0.9)].into_iter().collect()),
            emotion_audio: None,
        }
    }

    #[test]
    fn partial_segments_never_carry_emotions() {
        let partial = Segment::from_message(&segment_message(false));
        assert!(partial.emotion.is_none());
        let fin = Segment::from_message(&segment_message(true));
        assert_eq!(fin.emotion.as_ref().unwrap()["joy"], 0.9);
        assert!(fin.emotion_audio.is_none());
    }

    #[test]
    fn transcript_event_serializes_with_event_tag() {
        let event = TranscriptEvent::Final {
            seq: 7,
            segment: Segment::from_message(&segment_message(true)),
        };
        let json = serde_json::to_value(&event).expect("serialize transcript event");
        assert_eq!(json["event"], "final");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["segment"]["speakerName"], "A");
        assert_eq!(json["segment"]["eos"], true);

        let turn = TranscriptEvent::TurnEnded {
            seq: 8,
            silence: Duration::from_millis(612),
        };
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["event"], "turnEnded");
        assert_eq!(json["silence"], 612);
        let back: TranscriptEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq(), 8);
    }

    #[test]
    fn status_event_serializes_with_lowercase_state() {
        let event = SessionStatusEvent {
            direction: Direction::Egress,
            state: SessionState::Authenticating,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["state"], "authenticating");
        assert_eq!(json["direction"], "egress");
    }
}
