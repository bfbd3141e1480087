//! Client configuration.
//!
//! Every struct here is a plain value with a `Default` impl. Values are
//! validated once, when a client is constructed, so an out-of-range field
//! fails with [`TalkscriberError::Config`] before any socket is opened.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TalkscriberError};

/// Default ingest (speech-to-text) endpoint.
pub const DEFAULT_STT_URL: &str = "wss://api.talkscriber.com:9090";
/// Default egress (text-to-speech) endpoint.
pub const DEFAULT_TTS_URL: &str = "wss://api.talkscriber.com:9099";
/// Default synthesis model.
pub const DEFAULT_TTS_MODEL: &str = "TTS_MAYA";
/// Default synthesis voice.
pub const DEFAULT_SPEAKER: &str = "tara";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Generation parameters
// ---------------------------------------------------------------------------

/// Sampling parameters forwarded to the synthesis model.
///
/// Absent fields are left to the service default and are not serialised.
/// Construct through [`GenerationConfig::builder`]; deserialisation runs the
/// same range checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGenerationConfig")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGenerationConfig {
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_tokens: Option<u32>,
    repetition_penalty: Option<f32>,
}

impl TryFrom<RawGenerationConfig> for GenerationConfig {
    type Error = TalkscriberError;

    fn try_from(raw: RawGenerationConfig) -> Result<Self> {
        let config = Self {
            temperature: raw.temperature,
            top_p: raw.top_p,
            top_k: raw.top_k,
            max_tokens: raw.max_tokens,
            repetition_penalty: raw.repetition_penalty,
        };
        config.validate()?;
        Ok(config)
    }
}

fn check_range(field: &'static str, value: Option<f32>, min: f32, max: f32) -> Result<()> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(TalkscriberError::config(
            field,
            format!("{v} is outside [{min:.1}, {max:.1}]"),
        )),
        _ => Ok(()),
    }
}

impl GenerationConfig {
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder::default()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    pub fn top_k(&self) -> Option<u32> {
        self.top_k
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn repetition_penalty(&self) -> Option<f32> {
        self.repetition_penalty
    }

    /// True when every field is left to the service default.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// NaN fails every range check because `contains` is false for it.
    pub fn validate(&self) -> Result<()> {
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("repetition_penalty", self.repetition_penalty, 1.0, 2.0)?;
        if self.top_k == Some(0) {
            return Err(TalkscriberError::config("top_k", "must be >= 1"));
        }
        if self.max_tokens == Some(0) {
            return Err(TalkscriberError::config("max_tokens", "must be > 0"));
        }
        Ok(())
    }
}

/// Builder for [`GenerationConfig`]. `build()` is the only way to obtain a
/// config from code, so an invalid one never exists.
#[derive(Debug, Default, Clone)]
pub struct GenerationConfigBuilder {
    inner: GenerationConfig,
}

impl GenerationConfigBuilder {
    pub fn temperature(mut self, value: f32) -> Self {
        self.inner.temperature = Some(value);
        self
    }

    pub fn top_p(mut self, value: f32) -> Self {
        self.inner.top_p = Some(value);
        self
    }

    pub fn top_k(mut self, value: u32) -> Self {
        self.inner.top_k = Some(value);
        self
    }

    pub fn max_tokens(mut self, value: u32) -> Self {
        self.inner.max_tokens = Some(value);
        self
    }

    pub fn repetition_penalty(mut self, value: f32) -> Self {
        self.inner.repetition_penalty = Some(value);
        self
    }

    pub fn build(self) -> Result<GenerationConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

// ---------------------------------------------------------------------------
// Buffering policies
// ---------------------------------------------------------------------------

/// What the jitter buffer does with a new chunk when it is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until the consumer frees a slot. Gives up with
    /// `RingBufferFull` after `timeout`.
    Block { timeout: Duration },
    /// Evict the oldest unread chunk and count it as dropped.
    DropOldest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Block {
            timeout: Duration::from_secs(2),
        }
    }
}

/// What playback does when the jitter buffer runs dry mid-response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunPolicy {
    /// Write nothing; the device plays silence until audio arrives.
    #[default]
    Gap,
    /// Repeat the last chunk to real-time sinks. File sinks never get repeats.
    HoldLast,
}

/// Sizing of the egress jitter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBufferConfig {
    /// Capacity in chunks, not bytes.
    pub capacity: usize,
    /// Chunks that must be buffered before playback starts.
    pub min_fill: usize,
    pub overflow: OverflowPolicy,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            min_fill: 3,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl JitterBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TalkscriberError::config("capacity", "must be > 0"));
        }
        if self.min_fill == 0 || self.min_fill > self.capacity {
            return Err(TalkscriberError::config(
                "min_fill",
                format!("{} is outside [1, {}]", self.min_fill, self.capacity),
            ));
        }
        if let OverflowPolicy::Block { timeout } = self.overflow {
            if timeout.is_zero() {
                return Err(TalkscriberError::config(
                    "overflow",
                    "block timeout must be non-zero",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session-level configuration
// ---------------------------------------------------------------------------

/// Connection parameters shared by both directions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    /// Longest a single frame write may stall before the connection is
    /// declared dead.
    pub send_timeout: Duration,
    /// Consecutive undecodable frames tolerated before the session is closed.
    pub max_protocol_errors: u32,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_protocol_errors: 8,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(TalkscriberError::config(
                "url",
                format!("'{}' is not a ws:// or wss:// URL", self.url),
            ));
        }
        if self.connect_timeout.is_zero()
            || self.auth_timeout.is_zero()
            || self.send_timeout.is_zero()
        {
            return Err(TalkscriberError::config("timeout", "must be non-zero"));
        }
        if self.max_protocol_errors == 0 {
            return Err(TalkscriberError::config("max_protocol_errors", "must be > 0"));
        }
        Ok(())
    }
}

/// Client-side turn detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnDetectionConfig {
    /// Also forwarded to the service in the auth message.
    pub enabled: bool,
    /// Silence after the last segment before a local turn-end fires.
    pub timeout: Duration,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_millis(600),
        }
    }
}

/// Transcription or translation into English.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

/// Ingest (speech-to-text) client configuration.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: String,
    pub session: SessionConfig,
    pub language: String,
    /// Let the service detect the language from the first seconds of speech.
    pub multilingual: bool,
    pub task: Task,
    pub turn_detection: TurnDetectionConfig,
    /// Forward partial (non-EOS) segments to the caller.
    pub emit_partials: bool,
    /// Capacity of the ordered transcript channel.
    pub event_capacity: usize,
}

impl SttConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            session: SessionConfig::new(DEFAULT_STT_URL),
            language: "en".into(),
            multilingual: false,
            task: Task::default(),
            turn_detection: TurnDetectionConfig::default(),
            emit_partials: true,
            event_capacity: 256,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_api_key(&self.api_key)?;
        self.session.validate()?;
        if !self.multilingual && self.language.trim().is_empty() {
            return Err(TalkscriberError::config(
                "language",
                "required unless multilingual is enabled",
            ));
        }
        if self.turn_detection.enabled && self.turn_detection.timeout.is_zero() {
            return Err(TalkscriberError::config(
                "turn_detection_timeout",
                "must be non-zero",
            ));
        }
        if self.event_capacity == 0 {
            return Err(TalkscriberError::config("event_capacity", "must be > 0"));
        }
        Ok(())
    }
}

/// Egress (text-to-speech) client configuration.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub api_key: String,
    pub session: SessionConfig,
    pub model: String,
    /// Voice used for every request on this client.
    pub speaker_name: String,
    pub generation: GenerationConfig,
    pub jitter: JitterBufferConfig,
    pub underrun: UnderrunPolicy,
}

impl TtsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            session: SessionConfig::new(DEFAULT_TTS_URL),
            model: DEFAULT_TTS_MODEL.into(),
            speaker_name: DEFAULT_SPEAKER.into(),
            generation: GenerationConfig::default(),
            jitter: JitterBufferConfig::default(),
            underrun: UnderrunPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_api_key(&self.api_key)?;
        self.session.validate()?;
        if self.model.trim().is_empty() {
            return Err(TalkscriberError::config("model", "must not be empty"));
        }
        if self.speaker_name.trim().is_empty() {
            return Err(TalkscriberError::config("speaker_name", "must not be empty"));
        }
        self.generation.validate()?;
        self.jitter.validate()
    }
}

fn validate_api_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(TalkscriberError::config("api_key", "must not be empty"));
    }
    Ok(())
}
