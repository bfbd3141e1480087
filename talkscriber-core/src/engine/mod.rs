//! Top-level clients.
//!
//! ## Lifecycle
//!
//! ```text
//! TranscriptionClient::new(cfg)   validate, no I/O
//!     └─► start(source)           connect → auth → capture thread
//!         └─► events()            Partial / Final / TurnEnded / Anomaly / SessionEnded
//!         └─► finish(drain)       source runs out, trailing segments, close
//!
//! SpeechClient::new(cfg)          validate, no I/O
//!     └─► open()                  connect → auth (must complete before speak)
//!         └─► speak(text, sinks)  jitter buffer + playback thread per request
//!         └─► close()
//! ```
//!
//! ## Threading
//!
//! Connection setup and sends run on the tokio runtime. Each session's
//! receive loop, each capture bridge and each playback bridge get their own
//! blocking thread. Device streams are opened on the bridge thread that uses
//! them, and open errors are reported back to the caller through a oneshot
//! before `start`/`speak` return.

pub mod stt;
pub mod tts;

pub use stt::{TranscriptionClient, TranscriptionSession, TranscriptionSummary};
pub use tts::{SpeechClient, SpeechHandle, SpeechReport, SpeechSession};
