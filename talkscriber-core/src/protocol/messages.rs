//! JSON control messages.
//!
//! | Direction | `type` | Payload |
//! |-----------|--------|---------|
//! | client → service | `auth` | [`AuthMessage`] |
//! | client → service | `speak` | text, speaker, optional generation config |
//! | service → client | `authenticated` / `server_ready` | none |
//! | service → client | `speak_started`, `done`, `disconnect` | none |
//! | service → client | `wait`, `error` | optional `message` |
//! | service → client | `segment` | [`SegmentMessage`] |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{GenerationConfig, Task};

/// Emotion label → probability in [0, 1].
pub type EmotionScores = BTreeMap<String, f64>;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth(AuthMessage),
    Speak {
        text: String,
        speaker_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maya_generation_config: Option<GenerationConfig>,
    },
}

impl ClientMessage {
    /// `true` for the handshake message, the only one allowed before the
    /// service confirms authentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Authentication handshake. Egress sessions fill `job_id`/`model`, ingest
/// sessions fill the transcription options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthMessage {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multilingual: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_turn_detection: Option<bool>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection_timeout: Option<f64>,
}

impl AuthMessage {
    pub fn egress(api_key: &str, job_id: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_owned(),
            job_id: Some(job_id.to_owned()),
            model: Some(model.to_owned()),
            uid: None,
            language: None,
            multilingual: None,
            task: None,
            enable_turn_detection: None,
            turn_detection_timeout: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn ingest(
        api_key: &str,
        uid: &str,
        language: Option<&str>,
        multilingual: bool,
        task: Task,
        enable_turn_detection: bool,
        turn_detection_timeout: f64,
    ) -> Self {
        Self {
            api_key: api_key.to_owned(),
            job_id: None,
            model: None,
            uid: Some(uid.to_owned()),
            language: language.map(str::to_owned),
            multilingual: Some(multilingual),
            task: Some(task),
            enable_turn_detection: Some(enable_turn_detection),
            turn_detection_timeout: Some(turn_detection_timeout),
        }
    }
}

/// Messages received from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Credentials accepted. Ingest endpoints announce this as `server_ready`.
    #[serde(alias = "server_ready")]
    Authenticated,
    SpeakStarted,
    /// The current speak request has produced all of its audio.
    Done,
    /// The service is at capacity.
    Wait {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Server-initiated close.
    Disconnect,
    Segment(SegmentMessage),
    /// Any other discriminator. Logged and ignored.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::SpeakStarted => "speak_started",
            Self::Done => "done",
            Self::Wait { .. } => "wait",
            Self::Error { .. } => "error",
            Self::Disconnect => "disconnect",
            Self::Segment(_) => "segment",
            Self::Unknown => "unknown",
        }
    }
}

/// One transcript update for an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMessage {
    pub segment_id: u64,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "EOS", default)]
    pub eos: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion_audio: Option<EmotionScores>,
}
