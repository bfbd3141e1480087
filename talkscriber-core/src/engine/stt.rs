//! Speech-to-text: capture → session → assembler → ordered events.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    assembler::{AssemblerConfig, SegmentAssembler},
    bridge::capture::{CaptureBridge, CaptureHandle, CaptureReport, CaptureSource},
    config::SttConfig,
    diagnostics::{AssemblerSnapshot, SessionSnapshot},
    error::{Result, TalkscriberError},
    ipc::events::TranscriptEvent,
    protocol::{encode_samples, AuthMessage},
    transport::{new_session_id, Direction, FrameHandler, Session, SessionState},
};

/// How long `stop` lets the source flush before cutting in-flight sends.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Validated ingest configuration. Cheap to clone; every `start` opens a
/// fresh connection.
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    config: SttConfig,
}

impl TranscriptionClient {
    /// # Errors
    /// `Config` when any field is invalid. Nothing touches the network.
    pub fn new(config: SttConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SttConfig {
        &self.config
    }

    /// Open an authenticated session with no audio source attached.
    pub async fn connect(&self) -> Result<TranscriptionSession> {
        let uid = new_session_id();
        let turn = self.config.turn_detection;
        let auth = AuthMessage::ingest(
            &self.config.api_key,
            &uid,
            (!self.config.multilingual).then_some(self.config.language.as_str()),
            self.config.multilingual,
            self.config.task,
            turn.enabled,
            turn.timeout.as_secs_f64(),
        );

        let (assembler, events) = SegmentAssembler::new(AssemblerConfig {
            emit_partials: self.config.emit_partials,
            turn_timeout: turn.enabled.then_some(turn.timeout),
            event_capacity: self.config.event_capacity,
        })?;
        let assembler = Arc::new(assembler);

        let session = Session::open(
            self.config.session.clone(),
            Direction::Ingest,
            auth,
            Arc::clone(&assembler) as Arc<dyn FrameHandler>,
        )
        .await?;
        info!(%uid, language = %self.config.language, "transcription session open");

        Ok(TranscriptionSession {
            uid,
            session: Arc::new(session),
            assembler,
            events,
            capture: Mutex::new(None),
        })
    }

    /// Connect and start streaming `source`.
    pub async fn start(&self, source: CaptureSource) -> Result<TranscriptionSession> {
        let session = self.connect().await?;
        if let Err(e) = session.stream(source).await {
            session.session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}

/// Totals for one ingest session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptionSummary {
    pub capture: CaptureReport,
    pub session: SessionSnapshot,
    pub assembler: AssemblerSnapshot,
}

pub struct TranscriptionSession {
    uid: String,
    session: Arc<Session>,
    assembler: Arc<SegmentAssembler>,
    events: Receiver<TranscriptEvent>,
    capture: Mutex<Option<CaptureHandle>>,
}

impl TranscriptionSession {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Ordered transcript events. Ends with `SessionEnded`.
    pub fn events(&self) -> Receiver<TranscriptEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The error that ended the connection, if any.
    pub fn failure(&self) -> Option<TalkscriberError> {
        self.session.failure()
    }

    /// Attach an audio source. Only one source may stream at a time.
    pub async fn stream(&self, source: CaptureSource) -> Result<()> {
        if self.capture.lock().is_some() {
            return Err(TalkscriberError::config(
                "source",
                "this session is already streaming a source",
            ));
        }
        self.session.check_sendable()?;
        let sender = Arc::clone(&self.session);
        // Spawning blocks until the device or file is open.
        let handle = tokio::task::spawn_blocking(move || CaptureBridge::spawn(source, sender))
            .await
            .map_err(|e| TalkscriberError::Other(anyhow::anyhow!("capture spawn task: {e}")))??;
        *self.capture.lock() = Some(handle);
        Ok(())
    }

    /// Send samples that are already 24 kHz mono s16.
    pub async fn send_pcm(&self, samples: &[i16]) -> Result<()> {
        self.session.send(encode_samples(samples)).await
    }

    /// Let the source run out, wait up to `drain` for trailing segments,
    /// then close.
    ///
    /// # Errors
    /// The capture error if streaming failed, else the session failure if
    /// the connection broke.
    pub async fn finish(self, drain: Duration) -> Result<TranscriptionSummary> {
        let capture = self.join_capture().await;
        if capture.is_ok() {
            let mut state = self.session.watch_state();
            let closed = tokio::time::timeout(drain, state.wait_for(|s| s.is_terminal()))
                .await
                .is_ok();
            if !closed {
                debug!(drain_ms = drain.as_millis() as u64, "drain period elapsed");
            }
        }
        self.close_with(capture).await
    }

    /// Stop the source now and close.
    ///
    /// The source gets [`STOP_GRACE`] to send what it has. A send still
    /// stuck after that (a peer that stopped reading) is cancelled by
    /// closing the session.
    pub async fn stop(self) -> Result<TranscriptionSummary> {
        let handle = self.capture.lock().take();
        let capture = match handle {
            Some(handle) => {
                handle.stop();
                let mut join = tokio::task::spawn_blocking(move || handle.wait());
                let joined = match tokio::time::timeout(STOP_GRACE, &mut join).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        debug!("capture still sending after stop, closing the session");
                        self.session.close().await;
                        join.await
                    }
                };
                joined
                    .map_err(|e| TalkscriberError::Other(anyhow::anyhow!("capture join: {e}")))
                    .and_then(|report| report)
            }
            None => Ok(CaptureReport::default()),
        };
        self.close_with(capture).await
    }

    async fn join_capture(&self) -> Result<CaptureReport> {
        let handle = self.capture.lock().take();
        match handle {
            Some(handle) => tokio::task::spawn_blocking(move || handle.wait())
                .await
                .map_err(|e| TalkscriberError::Other(anyhow::anyhow!("capture join: {e}")))?,
            None => Ok(CaptureReport::default()),
        }
    }

    async fn close_with(self, capture: Result<CaptureReport>) -> Result<TranscriptionSummary> {
        let failure = self.session.failure();
        self.session.close().await;
        // The receive loop normally reports the end; make sure it is sent.
        self.assembler.end(failure.as_ref());

        let capture = match (capture, failure) {
            (Ok(report), None) => report,
            (Err(e), _) => {
                warn!("capture ended with error: {e}");
                return Err(e);
            }
            (Ok(_), Some(e)) => return Err(e),
        };
        let summary = TranscriptionSummary {
            capture,
            session: self.session.diagnostics_snapshot(),
            assembler: self.assembler.diagnostics_snapshot(),
        };
        info!(
            frames_sent = summary.capture.frames_sent,
            finals = summary.assembler.finals_emitted,
            "transcription session finished"
        );
        Ok(summary)
    }
}

impl Drop for TranscriptionSession {
    fn drop(&mut self) {
        if let Some(handle) = self.capture.lock().as_ref() {
            handle.stop();
        }
    }
}
