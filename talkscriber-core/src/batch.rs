//! Offline batch transcription over HTTP.
//!
//! One request uploads the whole file (base64 in JSON); the job is then
//! polled until it reaches a terminal status. The client is blocking; call
//! it from a blocking thread inside async code.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use reqwest::{blocking::Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    config::Task,
    error::{Result, TalkscriberError},
};

pub const DEFAULT_BATCH_URL: &str = "https://api.talkscriber.com/api/jobs";

const DONE: &str = "DONE";
const FAILED: [&str; 3] = ["FAILED", "FAILED_TRANSCRIBE", "FAILED_TS_TRANSCRIBE"];

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub url: String,
    pub api_key: String,
    pub language: String,
    pub task: Task,
    /// Service model tier.
    pub model: String,
    /// Optional service features, e.g. `sentiment`.
    pub features: Vec<String>,
    pub store_conversation: bool,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl BatchConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_BATCH_URL.into(),
            api_key: api_key.into(),
            language: "en".into(),
            task: Task::Transcribe,
            model: "L3".into(),
            features: Vec::new(),
            store_conversation: false,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(3600),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(TalkscriberError::config("api_key", "must not be empty"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(TalkscriberError::config(
                "batch_url",
                format!("expected an http(s) URL, got {:?}", self.url),
            ));
        }
        if self.poll_interval.is_zero() || self.wait_timeout.is_zero() {
            return Err(TalkscriberError::config(
                "poll_interval",
                "poll interval and wait timeout must be non-zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    #[serde(default)]
    pub word: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSegment {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

/// Status document for a job. `raw` keeps fields this client does not model.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: Option<String>,
    pub status: Option<String>,
    pub raw: Value,
}

impl JobStatus {
    fn from_value(raw: Value) -> Self {
        let id = match raw.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let status = raw.get("status").and_then(Value::as_str).map(str::to_owned);
        Self { id, status, raw }
    }

    pub fn is_done(&self) -> bool {
        self.status.as_deref() == Some(DONE)
    }

    pub fn is_failed(&self) -> bool {
        self.status.as_deref().is_some_and(|s| FAILED.contains(&s))
    }

    /// Transcribed segments from `results.transcribe`. `results` may arrive
    /// as an object or as a JSON-encoded string.
    pub fn segments(&self) -> Result<Vec<BatchSegment>> {
        let results = match self.raw.get("results") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded)
                .map_err(|e| TalkscriberError::Batch(format!("results are not JSON: {e}")))?,
            Some(other) => other.clone(),
        };
        match results.get("transcribe") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(list) => serde_json::from_value(list.clone())
                .map_err(|e| TalkscriberError::Batch(format!("malformed transcribe list: {e}"))),
        }
    }
}

/// Join segment texts into one transcript.
pub fn full_transcript(segments: &[BatchSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct BatchClient {
    config: BatchConfig,
    http: Client,
}

impl BatchClient {
    pub fn new(config: BatchConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TalkscriberError::Batch(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    fn payload(&self, audio: &[u8]) -> Value {
        json!({
            "service_type": "batch",
            "name": crate::transport::new_session_id(),
            "model_type": self.config.model,
            "features": self.config.features,
            "language": self.config.language,
            "task": self.config.task,
            "store_conversation": self.config.store_conversation,
            "channels": [],
            "data": base64::engine::general_purpose::STANDARD.encode(audio),
            "meta_info": {},
        })
    }

    /// Upload `path` and return the created job.
    pub fn create_job(&self, path: &Path) -> Result<JobStatus> {
        let audio = std::fs::read(path).map_err(|e| {
            TalkscriberError::AudioFile(format!("{}: {e}", path.display()))
        })?;
        info!(path = %path.display(), bytes = audio.len(), "submitting batch job");
        let response = self
            .http
            .post(&self.config.url)
            .header("X-API-Key", &self.config.api_key)
            .json(&self.payload(&audio))
            .send()
            .map_err(request_error)?;
        let job = JobStatus::from_value(read_json(response)?);
        if job.id.is_none() {
            return Err(TalkscriberError::Batch("job response carries no id".into()));
        }
        Ok(job)
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let url = format!("{}/{job_id}", self.config.url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .header("X-API-Key", &self.config.api_key)
            .send()
            .map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TalkscriberError::Batch(format!("job not found: {job_id}")));
        }
        read_json(response).map(JobStatus::from_value)
    }

    /// Poll until the job is done or failed.
    ///
    /// Transient polling errors are logged and retried; auth errors are not.
    pub fn wait_for_completion(&self, job_id: &str) -> Result<JobStatus> {
        let started = Instant::now();
        let mut last_status: Option<String> = None;
        loop {
            if started.elapsed() > self.config.wait_timeout {
                return Err(TalkscriberError::Batch(format!(
                    "job {job_id} not finished after {:?}",
                    self.config.wait_timeout
                )));
            }
            match self.job_status(job_id) {
                Ok(job) if job.is_done() => {
                    info!(job_id, elapsed_secs = started.elapsed().as_secs_f64(), "batch job done");
                    return Ok(job);
                }
                Ok(job) if job.is_failed() => {
                    return Err(TalkscriberError::Batch(format!(
                        "job {job_id} failed with status {}",
                        job.status.as_deref().unwrap_or_default()
                    )));
                }
                Ok(job) => {
                    if job.status != last_status {
                        debug!(job_id, status = ?job.status, "batch job status");
                        last_status = job.status;
                    }
                }
                Err(e @ TalkscriberError::Auth(_)) => return Err(e),
                Err(e) => warn!(job_id, "status poll failed: {e}"),
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Upload, wait, and return the segments.
    pub fn transcribe_file(&self, path: &Path) -> Result<Vec<BatchSegment>> {
        let job = self.create_job(path)?;
        let id = job.id.unwrap_or_default();
        info!(job_id = %id, "batch job created");
        self.wait_for_completion(&id)?.segments()
    }
}

fn request_error(e: reqwest::Error) -> TalkscriberError {
    if e.is_timeout() {
        TalkscriberError::Connection("batch request timed out".into())
    } else {
        TalkscriberError::Connection(format!("batch request failed: {e}"))
    }
}

fn read_json(response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TalkscriberError::Auth(format!(
            "batch API rejected the API key ({status})"
        )));
    }
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(TalkscriberError::Batch(format!("HTTP {status}: {body}")));
    }
    response
        .json()
        .map_err(|e| TalkscriberError::Batch(format!("response is not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_object_and_string() {
        let object = JobStatus::from_value(json!({
            "id": 42,
            "status": "DONE",
            "results": {"transcribe": [
                {"text": " hello", "start": 0.0, "end": 0.8,
                 "words": [{"word": "hello", "start": 0.1, "end": 0.7}]},
                {"text": "world ", "start": 0.9, "end": 1.4}
            ]}
        }));
        assert_eq!(object.id.as_deref(), Some("42"));
        assert!(object.is_done());
        let segments = object.segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].words[0].word, "hello");
        assert!(segments[1].words.is_empty());
        assert_eq!(full_transcript(&segments), "hello world");

        let encoded = JobStatus::from_value(json!({
            "id": "abc",
            "status": "DONE",
            "results": "{\"transcribe\": [{\"text\": \"hi\"}]}"
        }));
        assert_eq!(encoded.segments().unwrap()[0].text, "hi");
    }

    #[test]
    fn failure_statuses_are_terminal() {
        for status in FAILED {
            assert!(JobStatus::from_value(json!({"status": status})).is_failed());
        }
        let pending = JobStatus::from_value(json!({"status": "PROCESSING"}));
        assert!(!pending.is_failed() && !pending.is_done());
        assert!(pending.segments().unwrap().is_empty());
    }

    #[test]
    fn payload_carries_encoded_audio_and_settings() {
        let mut config = BatchConfig::new("key");
        config.task = Task::Translate;
        let client = BatchClient::new(config).unwrap();
        let payload = client.payload(b"RIFF");
        assert_eq!(payload["service_type"], "batch");
        assert_eq!(payload["task"], "translate");
        assert_eq!(payload["model_type"], "L3");
        assert_eq!(payload["data"], "UklGRg==");
    }

    #[test]
    fn config_validation() {
        assert!(BatchConfig::new("").validate().is_err());
        let mut config = BatchConfig::new("key");
        config.url = "ftp://example.com".into();
        assert!(config.validate().is_err());
    }
}
