//! Text-to-speech: speak requests → session → jitter buffers → sinks.
//!
//! ## Request pipelining
//!
//! ```text
//! speak("a") ─┐                    receive loop
//! speak("b") ─┤ queue: [a, b]      audio ──► front request's buffer
//!             │                    done  ──► finish front, pop it
//! ```
//!
//! Every request owns a jitter buffer and a playback bridge. A request is
//! queued before its `speak` frame is written, so its first audio always has
//! somewhere to go. The voice is fixed per client; requests cannot override it.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, OnceLock,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    bridge::playback::{PlaybackBridge, PlaybackConfig, PlaybackHandle, SinkFailure, SinkTarget},
    buffering::{chunk::AudioChunk, jitter::JitterBuffer},
    config::TtsConfig,
    diagnostics::SessionSnapshot,
    error::{Result, TalkscriberError},
    protocol::{AuthMessage, ClientMessage, ServerMessage, BYTES_PER_SAMPLE, SAMPLE_RATE},
    transport::{new_session_id, Direction, FrameHandler, Session, SessionState},
};

/// Validated egress configuration.
#[derive(Debug, Clone)]
pub struct SpeechClient {
    config: TtsConfig,
}

impl SpeechClient {
    /// # Errors
    /// `Config` for an empty key or out-of-range generation settings. No
    /// connection is attempted.
    pub fn new(config: TtsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TtsConfig {
        &self.config
    }

    /// Connect and send the handshake without waiting for confirmation.
    /// Call [`SpeechSession::wait_authenticated`] before speaking.
    pub async fn connect(&self) -> Result<SpeechSession> {
        let job_id = new_session_id();
        let router = Arc::new(RequestRouter::default());
        let session = Session::connect(
            self.config.session.clone(),
            Direction::Egress,
            AuthMessage::egress(&self.config.api_key, &job_id, &self.config.model),
            Arc::clone(&router) as Arc<dyn FrameHandler>,
        )
        .await?;
        debug!(%job_id, model = %self.config.model, "speech session connecting");
        Ok(SpeechSession {
            config: self.config.clone(),
            job_id,
            session,
            router,
        })
    }

    /// Connect and wait for the service to confirm the credentials.
    pub async fn open(&self) -> Result<SpeechSession> {
        let session = self.connect().await?;
        session.wait_authenticated().await?;
        Ok(session)
    }
}

/// Per-request progress, written by the receive loop.
struct Request {
    id: u64,
    buffer: Arc<JitterBuffer>,
    started_at: Instant,
    first_chunk: OnceLock<Duration>,
    chunks: AtomicU64,
    bytes: AtomicU64,
    lost: AtomicU64,
    speak_started: AtomicBool,
    error: Mutex<Option<String>>,
}

impl Request {
    fn new(id: u64, buffer: Arc<JitterBuffer>, started_at: Instant) -> Self {
        Self {
            id,
            buffer,
            started_at,
            first_chunk: OnceLock::new(),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            speak_started: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn fail(&self, detail: String) {
        self.error.lock().get_or_insert(detail);
        self.buffer.finish();
    }
}

/// Routes egress traffic to the oldest unfinished request.
#[derive(Default)]
struct RequestRouter {
    queue: Mutex<VecDeque<Arc<Request>>>,
    next_id: AtomicU64,
}

impl RequestRouter {
    fn front(&self) -> Option<Arc<Request>> {
        self.queue.lock().front().cloned()
    }

    fn enqueue(&self, request: Arc<Request>) {
        self.queue.lock().push_back(request);
    }

    fn remove(&self, id: u64) {
        self.queue.lock().retain(|r| r.id != id);
    }

    /// Close every pending buffer, dropping unplayed audio.
    fn abort_all(&self) {
        for request in self.queue.lock().drain(..) {
            request.buffer.close();
        }
    }
}

impl FrameHandler for RequestRouter {
    fn on_control(&self, message: &ServerMessage) {
        match message {
            ServerMessage::SpeakStarted => {
                if let Some(request) = self.front() {
                    request.speak_started.store(true, Ordering::Relaxed);
                    debug!(request = request.id, "speak started");
                }
            }
            ServerMessage::Done => {
                let done = self.queue.lock().pop_front();
                match done {
                    Some(request) => {
                        debug!(
                            request = request.id,
                            chunks = request.chunks.load(Ordering::Relaxed),
                            "request complete"
                        );
                        request.buffer.finish();
                    }
                    None => warn!("done received with no pending request"),
                }
            }
            ServerMessage::Error { message } => {
                // Only reached after authentication; the request is lost.
                let failed = self.queue.lock().pop_front();
                if let Some(request) = failed {
                    request.fail(message.clone().unwrap_or_else(|| "service error".into()));
                }
            }
            _ => {}
        }
    }

    fn on_audio(&self, chunk: AudioChunk) {
        let Some(request) = self.front() else {
            warn!(seq = chunk.seq(), "audio with no pending request dropped");
            return;
        };
        request
            .first_chunk
            .get_or_init(|| request.started_at.elapsed());
        request.chunks.fetch_add(1, Ordering::Relaxed);
        request
            .bytes
            .fetch_add(chunk.as_bytes().len() as u64, Ordering::Relaxed);

        // Blocks under the Block overflow policy: backpressure onto the socket.
        match request.buffer.push(chunk) {
            Ok(()) => {}
            Err(TalkscriberError::BufferClosed) => {
                // Cancelled by the caller; keep counting so `done` still lines up.
            }
            Err(e) => {
                request.lost.fetch_add(1, Ordering::Relaxed);
                warn!(request = request.id, "audio chunk lost: {e}");
            }
        }
    }

    fn on_closed(&self, error: Option<&TalkscriberError>) {
        let pending: Vec<Arc<Request>> = self.queue.lock().drain(..).collect();
        let detail = error.map_or_else(
            || "connection closed before the request completed".to_owned(),
            ToString::to_string,
        );
        // Finishing, not closing: what already arrived still plays.
        for request in pending {
            request.fail(detail.clone());
        }
    }
}

/// Result of one speak request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeechReport {
    pub chunks: u64,
    pub total_bytes: u64,
    /// Audio length implied by `total_bytes`.
    pub duration_secs: f64,
    /// Request start to first audio frame off the wire.
    pub time_to_first_chunk: Option<Duration>,
    /// Request start to first sink write.
    pub time_to_first_audio: Option<Duration>,
    pub underruns: u64,
    /// Evicted by `DropOldest` or lost to a push timeout.
    pub dropped_chunks: u64,
    pub sink_failures: Vec<SinkFailure>,
    pub cancelled: bool,
    /// The service acknowledged the request with `speak_started`.
    pub speak_started: bool,
    /// Set when the service or connection ended the request early.
    pub error: Option<String>,
}

/// One in-flight speak request.
pub struct SpeechHandle {
    request: Arc<Request>,
    playback: PlaybackHandle,
}

impl SpeechHandle {
    /// Stop playback now. Remaining audio for this request is discarded.
    pub fn cancel(&self) {
        self.playback.cancel();
    }

    /// Wait for playback to finish.
    ///
    /// # Errors
    /// `Device` when a real-time sink failed.
    pub async fn wait(self) -> Result<SpeechReport> {
        let Self { request, playback } = self;
        let playback = tokio::task::spawn_blocking(move || playback.wait())
            .await
            .map_err(|e| TalkscriberError::Other(anyhow::anyhow!("playback join: {e}")))??;

        let total_bytes = request.bytes.load(Ordering::Relaxed);
        let stats = request.buffer.stats();
        let report = SpeechReport {
            chunks: request.chunks.load(Ordering::Relaxed),
            total_bytes,
            duration_secs: total_bytes as f64 / (BYTES_PER_SAMPLE as f64 * SAMPLE_RATE as f64),
            time_to_first_chunk: request.first_chunk.get().copied(),
            time_to_first_audio: playback.time_to_first_audio,
            underruns: playback.underruns,
            dropped_chunks: stats.dropped + request.lost.load(Ordering::Relaxed),
            sink_failures: playback.sink_failures,
            cancelled: playback.cancelled,
            speak_started: request.speak_started.load(Ordering::Relaxed),
            error: request.error.lock().clone(),
        };
        info!(
            request = request.id,
            chunks = report.chunks,
            duration_secs = report.duration_secs,
            ttfa_ms = report.time_to_first_audio.map(|d| d.as_millis() as u64),
            "speech finished"
        );
        Ok(report)
    }
}

pub struct SpeechSession {
    config: TtsConfig,
    job_id: String,
    session: Session,
    router: Arc<RequestRouter>,
}

impl SpeechSession {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn wait_authenticated(&self) -> Result<()> {
        self.session.wait_authenticated().await
    }

    /// Send `text` and start playing its audio into `outputs`.
    ///
    /// Returns once the sinks are open and the request is on the wire.
    /// Playback starts as soon as the jitter buffer holds its minimum fill.
    ///
    /// # Errors
    /// - `NotAuthenticatedYet` before confirmation; nothing is sent.
    /// - `Config` for empty text or no outputs.
    /// - `Device` when a sink cannot be opened; nothing is sent.
    pub async fn speak(&self, text: &str, outputs: Vec<SinkTarget>) -> Result<SpeechHandle> {
        self.session.check_sendable()?;
        if text.trim().is_empty() {
            return Err(TalkscriberError::config("text", "must not be empty"));
        }
        if outputs.is_empty() {
            return Err(TalkscriberError::config("outputs", "at least one sink is required"));
        }

        let id = self.router.next_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();

        let buffer = Arc::new(JitterBuffer::new(self.config.jitter));
        let playback_buffer = Arc::clone(&buffer);
        let playback_config = PlaybackConfig {
            underrun: self.config.underrun,
            ..PlaybackConfig::default()
        };
        let playback = tokio::task::spawn_blocking(move || {
            PlaybackBridge::spawn(playback_buffer, outputs, playback_config, started_at)
        })
        .await
        .map_err(|e| TalkscriberError::Other(anyhow::anyhow!("playback spawn task: {e}")))??;

        let request = Arc::new(Request::new(id, buffer, started_at));
        self.router.enqueue(Arc::clone(&request));

        let generation = &self.config.generation;
        let message = ClientMessage::Speak {
            text: text.to_owned(),
            speaker_name: self.config.speaker_name.clone(),
            maya_generation_config: (!generation.is_empty()).then(|| generation.clone()),
        };
        if let Err(e) = self.session.send_control(&message).await {
            self.router.remove(id);
            playback.cancel();
            return Err(e);
        }
        info!(
            request = id,
            chars = text.chars().count(),
            speaker = %self.config.speaker_name,
            "speak request sent"
        );

        Ok(SpeechHandle { request, playback })
    }

    /// Speak and wait for playback to finish.
    pub async fn say(&self, text: &str, outputs: Vec<SinkTarget>) -> Result<SpeechReport> {
        self.speak(text, outputs).await?.wait().await
    }

    /// Requests still waiting for `done`.
    pub fn pending_requests(&self) -> usize {
        self.router.queue.lock().len()
    }

    pub fn diagnostics_snapshot(&self) -> SessionSnapshot {
        self.session.diagnostics_snapshot()
    }

    /// Abandon pending requests and close the connection.
    pub async fn close(&self) {
        self.router.abort_all();
        self.session.close().await;
    }
}
