use thiserror::Error;

use crate::transport::SessionState;

/// All errors produced by talkscriber-core.
#[derive(Debug, Error)]
pub enum TalkscriberError {
    /// Transport-level failure (DNS, TCP, TLS, WebSocket I/O, connect timeout).
    /// Retryable by caller policy.
    #[error("connection error: {0}")]
    Connection(String),

    /// The service rejected the credentials. Retrying with the same key is pointless.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("truncated audio frame: {len} bytes is not a multiple of {frame_size}")]
    TruncatedFrame { len: usize, frame_size: usize },

    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("no default {direction} device found")]
    NoDefaultDevice { direction: &'static str },

    #[error("invalid configuration for {field}: {reason}")]
    Config { field: &'static str, reason: String },

    #[error("session is not open (state: {0})")]
    NotOpen(SessionState),

    #[error("session is not authenticated yet")]
    NotAuthenticatedYet,

    #[error("jitter buffer is full: playback cannot keep up")]
    RingBufferFull,

    #[error("jitter buffer closed")]
    BufferClosed,

    #[error("audio file error: {0}")]
    AudioFile(String),

    #[error("batch API error: {0}")]
    Batch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TalkscriberError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }

    /// Only transport failures are worth retrying with the same configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Errors describing a single bad message; the connection survives them.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::TruncatedFrame { .. } | Self::MalformedMessage(_)
        )
    }
}

impl From<hound::Error> for TalkscriberError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => Self::Io(io),
            other => Self::AudioFile(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TalkscriberError>;
