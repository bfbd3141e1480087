//! `Session`: one websocket connection to the service.
//!
//! ## Lifecycle
//!
//! ```text
//! Session::connect()
//!     Idle → Connecting → Authenticating   (auth frame sent, receive loop running)
//!         └─► wait_authenticated()  → Open  ("authenticated" / "server_ready")
//!             └─► send()/send_control()/send_blocking()
//!                 └─► close()       → Closing → Closed
//! ```
//!
//! States only move forward. `Error` is terminal and reachable from any
//! non-terminal state.
//!
//! ## Threading
//!
//! The receive loop runs on a `spawn_blocking` thread and drives the socket
//! with `Handle::block_on`, so [`FrameHandler`] callbacks may block (a full
//! jitter buffer applies backpressure to the socket instead of growing).
//! The write half sits behind a `tokio::sync::Mutex`; every send, from any
//! thread, goes through it. A send waiting for the lock or stalled on the
//! socket gives up as soon as the session starts closing, and a write that
//! outlasts `send_timeout` fails the session with `Connection`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::{broadcast, watch, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    buffering::chunk::AudioChunk,
    config::SessionConfig,
    diagnostics::{SessionDiagnostics, SessionSnapshot},
    error::{Result, TalkscriberError},
    ipc::events::SessionStatusEvent,
    protocol::{
        codec::{encode_control, Event, Frame, FrameDecoder},
        messages::{AuthMessage, ClientMessage, ServerMessage},
    },
};

/// Broadcast channel capacity for status events.
const STATUS_CAP: usize = 64;

/// How long `close()` waits for the receive loop to exit.
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `close()` waits for the close handshake to flush.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `close()` waits for an in-flight send to release the write half.
const CLOSE_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection state, ordered by lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    /// Forward moves only; `Error` from anywhere not yet terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Error || next > self
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Audio out, transcript segments back.
    Ingest,
    /// Text out, synthesized audio back.
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ingest => "ingest",
            Self::Egress => "egress",
        })
    }
}

/// Receives decoded events from the receive loop, in arrival order.
///
/// Called on the receive thread. Implementations may block briefly; while
/// they do, the socket is not read.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_control(&self, message: &ServerMessage);

    fn on_audio(&self, chunk: AudioChunk) {
        debug!(seq = chunk.seq(), "no audio consumer, chunk discarded");
    }

    /// A single frame was dropped. The connection stays up.
    fn on_protocol_error(&self, error: &TalkscriberError) {
        warn!("dropped undecodable frame: {error}");
    }

    /// The receive loop has exited. `error` is set when it ended in failure.
    fn on_closed(&self, _error: Option<&TalkscriberError>) {}
}

/// Generate an id for `job_id` / `uid` fields.
pub fn new_session_id() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

/// Why a session failed. Kept separately from the state so waiters can
/// rebuild the right error kind.
#[derive(Debug, Clone)]
enum Failure {
    Connection(String),
    Auth(String),
    Protocol(String),
}

impl Failure {
    fn to_error(&self) -> TalkscriberError {
        match self {
            Self::Connection(m) => TalkscriberError::Connection(m.clone()),
            Self::Auth(m) => TalkscriberError::Auth(m.clone()),
            Self::Protocol(m) => TalkscriberError::Protocol(m.clone()),
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Connection(m) | Self::Auth(m) | Self::Protocol(m) => m,
        }
    }
}

/// State shared between the session handle and its receive loop.
struct Shared {
    direction: Direction,
    state: watch::Sender<SessionState>,
    failure: parking_lot::Mutex<Option<Failure>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    diagnostics: SessionDiagnostics,
}

impl Shared {
    fn new(direction: Direction) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        Self {
            direction,
            state,
            failure: parking_lot::Mutex::new(None),
            status_tx,
            diagnostics: SessionDiagnostics::default(),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Apply `next` if it moves forward. Returns whether it was applied.
    fn transition(&self, next: SessionState, detail: Option<String>) -> bool {
        let applied = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if applied {
            debug!(direction = %self.direction, state = %next, "session state changed");
            let _ = self.status_tx.send(SessionStatusEvent {
                direction: self.direction,
                state: next,
                detail,
            });
        }
        applied
    }

    /// Record the first failure and move to `Error`.
    fn fail(&self, failure: Failure) {
        let message = failure.message().to_owned();
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(failure);
            }
        }
        if self.transition(SessionState::Error, Some(message.clone())) {
            error!(direction = %self.direction, "session failed: {message}");
        }
    }

    fn failure_error(&self) -> Option<TalkscriberError> {
        self.failure.lock().as_ref().map(Failure::to_error)
    }
}

/// A live connection. Dropping it signals the receive loop to stop.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
    sink: AsyncMutex<Option<WsSink>>,
    shutdown: Arc<Notify>,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl Session {
    /// Connect, send the authentication handshake and start the receive loop.
    ///
    /// Returns in `Authenticating`; call [`Session::wait_authenticated`]
    /// before sending anything else.
    ///
    /// # Errors
    /// - `Connection` on network failure or when `connect_timeout` elapses.
    /// - `Auth` when the upgrade is refused with 401/403.
    pub async fn connect(
        config: SessionConfig,
        direction: Direction,
        auth: AuthMessage,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(direction));
        shared.transition(SessionState::Connecting, None);
        info!(%direction, url = %config.url, "connecting");

        let ws = match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                let failure = classify_connect_error(e);
                let err = failure.to_error();
                shared.fail(failure);
                return Err(err);
            }
            Err(_) => {
                let failure = Failure::Connection(format!(
                    "connect timed out after {:?}",
                    config.connect_timeout
                ));
                let err = failure.to_error();
                shared.fail(failure);
                return Err(err);
            }
        };

        let (mut sink, stream) = ws.split();
        shared.transition(SessionState::Authenticating, None);

        // The handshake is the one message allowed before `Open`.
        let auth_frame = encode_control(&ClientMessage::Auth(auth))?;
        let auth_len = auth_frame.len();
        if let Err(e) = sink.send(auth_frame.into_message()).await {
            let failure = Failure::Connection(format!("send auth: {e}"));
            let err = failure.to_error();
            shared.fail(failure);
            return Err(err);
        }
        shared.diagnostics.record_out(auth_len);

        let runtime = Handle::current();
        let shutdown = Arc::new(Notify::new());
        let ctx = ReceiveContext {
            shared: Arc::clone(&shared),
            stream,
            handler,
            shutdown: Arc::clone(&shutdown),
            runtime: runtime.clone(),
            max_protocol_errors: config.max_protocol_errors,
        };
        let recv_task = tokio::task::spawn_blocking(move || receive_loop(ctx));

        Ok(Self {
            config,
            shared,
            sink: AsyncMutex::new(Some(sink)),
            shutdown,
            recv_task: parking_lot::Mutex::new(Some(recv_task)),
            runtime,
        })
    }

    /// Connect and wait for the service to confirm the credentials.
    pub async fn open(
        config: SessionConfig,
        direction: Direction,
        auth: AuthMessage,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self> {
        let session = Self::connect(config, direction, auth, handler).await?;
        session.wait_authenticated().await?;
        Ok(session)
    }

    /// Resolve once the session leaves `Authenticating`.
    ///
    /// # Errors
    /// - `Auth` when the service rejects the credentials or `auth_timeout` elapses.
    /// - `Connection` when the service is busy or the connection drops first.
    pub async fn wait_authenticated(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let waited = tokio::time::timeout(
            self.config.auth_timeout,
            rx.wait_for(|s| *s > SessionState::Authenticating),
        )
        .await
        .map(|r| r.map(|state| *state));

        let state = match waited {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => SessionState::Closed,
            Err(_) => {
                self.shared.fail(Failure::Auth(format!(
                    "no authentication confirmation within {:?}",
                    self.config.auth_timeout
                )));
                self.close().await;
                SessionState::Error
            }
        };

        if state == SessionState::Open {
            info!(direction = %self.shared.direction, "session authenticated");
            return Ok(());
        }
        Err(self.shared.failure_error().unwrap_or_else(|| {
            TalkscriberError::Connection("connection closed during authentication".into())
        }))
    }

    /// Whether a frame could be sent right now. Writes nothing.
    ///
    /// # Errors
    /// `NotAuthenticatedYet` while authenticating, `NotOpen` in any other
    /// state but `Open`.
    pub fn check_sendable(&self) -> Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::Authenticating => Err(TalkscriberError::NotAuthenticatedYet),
            other => Err(TalkscriberError::NotOpen(other)),
        }
    }

    /// Send one frame. Safe to call concurrently from any task.
    ///
    /// # Errors
    /// - `NotAuthenticatedYet` before confirmation; nothing is written.
    /// - `NotOpen` in any other state but `Open`, including when the session
    ///   starts closing while this send waits.
    /// - `Connection` on write failure or when the write outlasts
    ///   `send_timeout`; the session moves to `Error`.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.check_sendable()?;
        let len = frame.len();
        let mut state_rx = self.shared.state.subscribe();

        let mut guard = tokio::select! {
            guard = self.sink.lock() => guard,
            () = closing(&mut state_rx) => {
                return Err(TalkscriberError::NotOpen(self.state()));
            }
        };
        // Re-check under the lock: close() may have run while we waited.
        self.check_sendable()?;
        let Some(sink) = guard.as_mut() else {
            return Err(TalkscriberError::NotOpen(self.state()));
        };

        let write = tokio::time::timeout(self.config.send_timeout, sink.send(frame.into_message()));
        let written = tokio::select! {
            r = write => Some(r),
            () = closing(&mut state_rx) => None,
        };
        let failure = match written {
            Some(Ok(Ok(()))) => {
                self.shared.diagnostics.record_out(len);
                return Ok(());
            }
            // A half-written frame leaves the write half unusable.
            None => {
                guard.take();
                return Err(TalkscriberError::NotOpen(self.state()));
            }
            Some(Ok(Err(e))) => Failure::Connection(format!("send: {e}")),
            Some(Err(_)) => {
                guard.take();
                Failure::Connection(format!(
                    "send stalled for {:?}",
                    self.config.send_timeout
                ))
            }
        };
        drop(guard);
        let err = failure.to_error();
        self.shared.fail(failure);
        self.shutdown.notify_one();
        Err(err)
    }

    /// Encode and send a control message.
    pub async fn send_control(&self, message: &ClientMessage) -> Result<()> {
        self.check_sendable()?;
        if message.is_auth() {
            return Err(TalkscriberError::Protocol(
                "authentication was already sent on this session".into(),
            ));
        }
        let frame = encode_control(message)?;
        self.send(frame).await
    }

    /// Blocking variant of [`Session::send`] for bridge threads.
    ///
    /// Must not be called from inside an async task.
    pub fn send_blocking(&self, frame: Frame) -> Result<()> {
        self.runtime.block_on(self.send(frame))
    }

    /// Stop the receive loop, send a close frame and release the socket.
    /// Idempotent and safe in any state.
    pub async fn close(&self) {
        let was = self.state();
        self.shared.transition(SessionState::Closing, None);
        self.shutdown.notify_one();

        // Senders see `Closing` and let go of the lock; bound the wait anyway.
        match tokio::time::timeout(CLOSE_LOCK_TIMEOUT, self.sink.lock()).await {
            Ok(mut guard) => {
                if let Some(mut sink) = guard.take() {
                    if let Err(e) = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.close()).await {
                        debug!("close frame not flushed: {e}");
                    }
                }
            }
            Err(_) => warn!(direction = %self.shared.direction, "write half still busy, skipping close frame"),
        }

        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(CLOSE_JOIN_TIMEOUT, task).await.is_err() {
                warn!(direction = %self.shared.direction, "receive loop did not stop in time");
            }
        }

        self.shared.transition(SessionState::Closed, None);
        if !was.is_terminal() {
            info!(direction = %self.shared.direction, from = %was, "session closed");
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Subscribe to live state changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Watch the current state; useful for awaiting a particular state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The error that ended the session, if any.
    pub fn failure(&self) -> Option<TalkscriberError> {
        self.shared.failure_error()
    }

    pub fn diagnostics_snapshot(&self) -> SessionSnapshot {
        self.shared.diagnostics.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Resolves once the session reaches `Closing` or any later state.
async fn closing(rx: &mut watch::Receiver<SessionState>) {
    let _ = rx.wait_for(|s| *s >= SessionState::Closing).await;
}

fn classify_connect_error(e: tungstenite::Error) -> Failure {
    match e {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Failure::Auth(format!("upgrade rejected with {}", response.status()))
        }
        other => Failure::Connection(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

struct ReceiveContext {
    shared: Arc<Shared>,
    stream: WsSource,
    handler: Arc<dyn FrameHandler>,
    shutdown: Arc<Notify>,
    runtime: Handle,
    max_protocol_errors: u32,
}

enum Next {
    Shutdown,
    Message(Message),
    Ended,
    Failed(tungstenite::Error),
}

fn receive_loop(mut ctx: ReceiveContext) {
    let span = info_span!("session_recv", direction = %ctx.shared.direction);
    let _enter = span.enter();
    debug!("receive loop started");

    let mut decoder = FrameDecoder::new();
    let mut consecutive_errors = 0u32;

    loop {
        let next = {
            let stream = &mut ctx.stream;
            let shutdown = &ctx.shutdown;
            ctx.runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => Next::Shutdown,
                    msg = stream.next() => match msg {
                        Some(Ok(m)) => Next::Message(m),
                        Some(Err(e)) => Next::Failed(e),
                        None => Next::Ended,
                    },
                }
            })
        };

        let message = match next {
            Next::Message(m) => m,
            Next::Shutdown => {
                debug!("receive loop cancelled");
                break;
            }
            Next::Ended => {
                info!("connection closed by peer");
                break;
            }
            Next::Failed(e) => {
                if ctx.shared.state() < SessionState::Closing {
                    ctx.shared.fail(Failure::Connection(format!("receive: {e}")));
                }
                break;
            }
        };

        let Some(frame) = Frame::from_message(message) else {
            continue;
        };
        ctx.shared.diagnostics.record_in(frame.len());

        match decoder.decode(frame) {
            Ok(Event::Audio(chunk)) => {
                consecutive_errors = 0;
                if ctx.shared.state() != SessionState::Open {
                    let err = TalkscriberError::Protocol(format!(
                        "audio frame received in state {}",
                        ctx.shared.state()
                    ));
                    ctx.shared
                        .diagnostics
                        .protocol_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    ctx.handler.on_protocol_error(&err);
                    continue;
                }
                ctx.shared
                    .diagnostics
                    .audio_chunks_in
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                ctx.handler.on_audio(chunk);
            }
            Ok(Event::Control(message)) => {
                consecutive_errors = 0;
                ctx.shared
                    .diagnostics
                    .control_messages_in
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let keep_going = apply_control(&ctx.shared, &message);
                ctx.handler.on_control(&message);
                if !keep_going {
                    break;
                }
            }
            Ok(Event::ConnectionClosed) => {
                info!("close frame received");
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                ctx.shared
                    .diagnostics
                    .protocol_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                ctx.handler.on_protocol_error(&e);
                if consecutive_errors >= ctx.max_protocol_errors {
                    ctx.shared.fail(Failure::Protocol(format!(
                        "{consecutive_errors} consecutive undecodable frames, last: {e}"
                    )));
                    break;
                }
            }
        }
    }

    // Peer-initiated ends land here too; a pending close() will find Closed.
    ctx.shared.transition(SessionState::Closed, None);
    let failure = ctx.shared.failure_error();
    ctx.handler.on_closed(failure.as_ref());
    debug!("receive loop exited");
}

/// Session-level reaction to a control message. Returns `false` when the
/// loop should stop.
fn apply_control(shared: &Shared, message: &ServerMessage) -> bool {
    let authenticating = shared.state() == SessionState::Authenticating;
    match message {
        ServerMessage::Authenticated => {
            if !shared.transition(SessionState::Open, None) {
                debug!("duplicate authentication confirmation ignored");
            }
            true
        }
        ServerMessage::Wait { message } if authenticating => {
            let detail = message.as_deref().unwrap_or("service busy, try again later");
            shared.fail(Failure::Connection(detail.to_owned()));
            false
        }
        ServerMessage::Error { message } if authenticating => {
            let detail = message.as_deref().unwrap_or("credentials rejected");
            shared.fail(Failure::Auth(detail.to_owned()));
            false
        }
        ServerMessage::Error { message } => {
            warn!(
                "service reported an error: {}",
                message.as_deref().unwrap_or("(no detail)")
            );
            true
        }
        ServerMessage::Disconnect => {
            info!("service requested disconnect");
            false
        }
        ServerMessage::Unknown => {
            debug!("ignoring control message of unknown type");
            true
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Authenticating.can_transition_to(Open));
        assert!(Authenticating.can_transition_to(Closing));
        assert!(!Open.can_transition_to(Authenticating));
        assert!(!Closing.can_transition_to(Open));
        assert!(Open.can_transition_to(Error));
        assert!(!Closed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Closed));
    }

    #[test]
    fn transition_broadcasts_only_applied_changes() {
        let shared = Shared::new(Direction::Egress);
        let mut rx = shared.status_tx.subscribe();
        assert!(shared.transition(SessionState::Connecting, None));
        assert!(!shared.transition(SessionState::Idle, None));
        assert!(shared.transition(SessionState::Open, None));

        assert_eq!(rx.try_recv().unwrap().state, SessionState::Connecting);
        assert_eq!(rx.try_recv().unwrap().state, SessionState::Open);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn first_failure_wins() {
        let shared = Shared::new(Direction::Ingest);
        shared.transition(SessionState::Authenticating, None);
        shared.fail(Failure::Auth("bad key".into()));
        shared.fail(Failure::Connection("reset".into()));
        assert_eq!(shared.state(), SessionState::Error);
        assert!(matches!(
            shared.failure_error(),
            Some(TalkscriberError::Auth(m)) if m == "bad key"
        ));
    }

    #[test]
    fn handshake_errors_end_the_loop_with_the_right_kind() {
        let shared = Shared::new(Direction::Egress);
        shared.transition(SessionState::Authenticating, None);
        let keep_going = apply_control(
            &shared,
            &ServerMessage::Wait {
                message: None,
            },
        );
        assert!(!keep_going);
        assert!(matches!(
            shared.failure_error(),
            Some(TalkscriberError::Connection(_))
        ));

        let open = Shared::new(Direction::Egress);
        open.transition(SessionState::Open, None);
        // After the handshake an error message is only a warning.
        assert!(apply_control(
            &open,
            &ServerMessage::Error {
                message: Some("rate limited".into())
            }
        ));
        assert_eq!(open.state(), SessionState::Open);
    }

    #[test]
    fn session_ids_are_unique_hex() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
