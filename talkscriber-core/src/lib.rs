//! # talkscriber-core
//!
//! Streaming client SDK for the Talkscriber speech service.
//!
//! ## Architecture
//!
//! ```text
//! ingest:  Mic/WAV → CaptureBridge ─frames─► Session ⇄ service
//!                                              │ receive loop
//!                                              ▼
//!                                      SegmentAssembler → crossbeam::Receiver<TranscriptEvent>
//!
//! egress:  text → Session ⇄ service
//!                   │ receive loop (audio)
//!                   ▼
//!             JitterBuffer → PlaybackBridge → device / WAV / custom sinks
//! ```
//!
//! Audio on the wire is 24 kHz mono s16le in 20 ms frames. Device callbacks
//! only touch lock-free rings; everything that allocates or blocks runs on
//! bridge threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod assembler;
pub mod audio;
#[cfg(feature = "batch")]
pub mod batch;
pub mod bridge;
pub mod buffering;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod transport;

// Convenience re-exports for downstream crates
pub use bridge::{CaptureSource, SinkTarget};
pub use config::{GenerationConfig, JitterBufferConfig, OverflowPolicy, SttConfig, TtsConfig, UnderrunPolicy};
pub use engine::{
    SpeechClient, SpeechReport, SpeechSession, TranscriptionClient, TranscriptionSession,
};
pub use error::{Result, TalkscriberError};
pub use ipc::events::{Segment, SessionStatusEvent, TranscriptEvent};
pub use transport::{Direction, SessionState};
