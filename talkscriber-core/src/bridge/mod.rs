//! Bridges between blocking audio I/O and the network session.
//!
//! Each bridge owns one OS thread so device reads and writes never share a
//! thread with the socket. Both report open failures synchronously from
//! `spawn` and everything else from their handle's `wait`.

pub mod capture;
pub mod playback;

pub use capture::{CaptureBridge, CaptureHandle, CaptureReport, CaptureSource, FrameSender};
pub use playback::{
    AudioSink, CollectedAudio, CollectorSink, DeviceSink, PlaybackBridge, PlaybackConfig,
    PlaybackHandle, PlaybackReport, SinkFailure, SinkTarget, WavFileSink,
};
