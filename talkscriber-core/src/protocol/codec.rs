//! Frame codec: typed events in, websocket frames out, and back.
//!
//! Outbound audio is raw PCM with no header; outbound control messages are
//! JSON text. Inbound frames are classified into [`Event`]s. A bad frame is
//! an error for that frame only; the decoder keeps no state that a bad
//! frame could corrupt.

use tokio_tungstenite::tungstenite::Message;

use crate::{
    buffering::chunk::AudioChunk,
    error::{Result, TalkscriberError},
    protocol::{
        messages::{ClientMessage, EmotionScores, ServerMessage},
        BYTES_PER_SAMPLE,
    },
};

/// A transport frame, independent of the websocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

impl Frame {
    /// `None` for ping/pong and raw frames, which tungstenite answers itself.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Binary(data) => Some(Self::Binary(data)),
            Message::Text(text) => Some(Self::Text(text)),
            Message::Close(_) => Some(Self::Close),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Binary(data) => Message::Binary(data),
            Self::Text(text) => Message::Text(text),
            Self::Close => Message::Close(None),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Binary(data) => data.len(),
            Self::Text(text) => text.len(),
            Self::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Event {
    Audio(AudioChunk),
    Control(ServerMessage),
    ConnectionClosed,
}

/// Encode raw s16le PCM as a binary frame.
pub fn encode_audio(pcm: &[u8]) -> Frame {
    Frame::Binary(pcm.to_vec())
}

/// Encode samples as s16le and wrap them in a binary frame.
pub fn encode_samples(samples: &[i16]) -> Frame {
    let mut pcm = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        pcm.extend_from_slice(&s.to_le_bytes());
    }
    Frame::Binary(pcm)
}

pub fn encode_control(message: &ClientMessage) -> Result<Frame> {
    serde_json::to_string(message)
        .map(Frame::Text)
        .map_err(|e| TalkscriberError::Protocol(format!("encode control message: {e}")))
}

/// Stateful only in the sequence counter, which advances on successful
/// audio decodes so a rejected frame leaves no gap.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    next_seq: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, frame: Frame) -> Result<Event> {
        match frame {
            Frame::Binary(data) => self.decode_audio(data).map(Event::Audio),
            Frame::Text(text) => decode_control(&text).map(Event::Control),
            Frame::Close => Ok(Event::ConnectionClosed),
        }
    }

    fn decode_audio(&mut self, data: Vec<u8>) -> Result<AudioChunk> {
        if data.len() % BYTES_PER_SAMPLE != 0 {
            return Err(TalkscriberError::TruncatedFrame {
                len: data.len(),
                frame_size: BYTES_PER_SAMPLE,
            });
        }
        let chunk = AudioChunk::new(self.next_seq, data);
        self.next_seq += 1;
        Ok(chunk)
    }
}

fn decode_control(text: &str) -> Result<ServerMessage> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| TalkscriberError::MalformedMessage(format!("invalid JSON: {e}")))?;
    if !value.get("type").is_some_and(serde_json::Value::is_string) {
        return Err(TalkscriberError::MalformedMessage(
            "missing `type` discriminator".into(),
        ));
    }
    let message: ServerMessage = serde_json::from_value(value)
        .map_err(|e| TalkscriberError::MalformedMessage(e.to_string()))?;
    if let ServerMessage::Segment(seg) = &message {
        check_scores("emotion", seg.emotion.as_ref())?;
        check_scores("emotion_audio", seg.emotion_audio.as_ref())?;
    }
    Ok(message)
}

fn check_scores(field: &str, scores: Option<&EmotionScores>) -> Result<()> {
    let Some(scores) = scores else {
        return Ok(());
    };
    match scores.iter().find(|(_, p)| !(0.0..=1.0).contains(*p)) {
        Some((label, p)) => Err(TalkscriberError::MalformedMessage(format!(
            "{field}.{label} = {p} is not a probability"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::AuthMessage;

    #[test]
    fn audio_frames_carry_no_header() {
        let frame = encode_samples(&[1, -1]);
        assert_eq!(frame, Frame::Binary(vec![0x01, 0x00, 0xff, 0xff]));
        assert_eq!(encode_audio(&[1, 2, 3, 4]).len(), 4);
    }

    #[test]
    fn control_frames_are_json_text() {
        let frame =
            encode_control(&ClientMessage::Auth(AuthMessage::egress("k", "j", "m"))).unwrap();
        let Frame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "auth");
    }

    #[test]
    fn truncated_frame_does_not_corrupt_later_decodes() {
        let mut dec = FrameDecoder::new();
        let first = dec.decode(Frame::Binary(vec![0; 960])).unwrap();
        let err = dec.decode(Frame::Binary(vec![0; 961])).unwrap_err();
        assert!(matches!(
            err,
            TalkscriberError::TruncatedFrame {
                len: 961,
                frame_size: 2
            }
        ));
        let second = dec.decode(Frame::Binary(vec![7, 0, 8, 0])).unwrap();

        let (Event::Audio(a), Event::Audio(b)) = (first, second) else {
            panic!("expected audio events");
        };
        assert_eq!(a.seq(), 0);
        assert_eq!(b.seq(), 1);
        assert_eq!(b.to_samples(), vec![7, 8]);
    }

    #[test]
    fn malformed_control_messages_are_errors() {
        let mut dec = FrameDecoder::new();
        for bad in [
            "not json",
            r#"{"text":"no type"}"#,
            r#"{"type":7}"#,
            r#"[1,2,3]"#,
            r#"{"type":"segment","text":"missing id"}"#,
        ] {
            let err = dec.decode(Frame::Text(bad.into())).unwrap_err();
            assert!(
                matches!(err, TalkscriberError::MalformedMessage(_)),
                "{bad} -> {err:?}"
            );
        }
    }

    #[test]
    fn emotion_scores_must_be_probabilities() {
        let mut dec = FrameDecoder::new();
        let bad = r#"{"type":"segment","segment_id":1,"EOS":true,"emotion":{"joy":1.5}}"#;
        assert!(dec.decode(Frame::Text(bad.into())).is_err());
        let good = r#"{"type":"segment","segment_id":1,"EOS":true,"emotion":{"joy":1.0}}"#;
        assert!(matches!(
            dec.decode(Frame::Text(good.into())).unwrap(),
            Event::Control(ServerMessage::Segment(_))
        ));
    }

    #[test]
    fn close_frame_decodes_to_connection_closed() {
        let mut dec = FrameDecoder::new();
        assert!(matches!(
            dec.decode(Frame::Close).unwrap(),
            Event::ConnectionClosed
        ));
    }

    #[test]
    fn ping_is_not_a_frame() {
        assert!(Frame::from_message(Message::Ping(vec![1])).is_none());
        assert_eq!(
            Frame::from_message(Message::Binary(vec![1, 2])),
            Some(Frame::Binary(vec![1, 2]))
        );
    }
}
