//! Wire protocol spoken with the Talkscriber websocket endpoints.
//!
//! Text frames carry JSON control messages with a `type` discriminator.
//! Binary frames carry raw PCM with no header, in the fixed format below.

pub mod codec;
pub mod messages;

pub use codec::{encode_audio, encode_control, encode_samples, Event, Frame, FrameDecoder};
pub use messages::{AuthMessage, ClientMessage, EmotionScores, SegmentMessage, ServerMessage};

/// Sample rate of every PCM frame in both directions (Hz).
pub const SAMPLE_RATE: u32 = 24_000;
/// Mono.
pub const CHANNELS: u16 = 1;
/// Signed 16-bit little-endian.
pub const BYTES_PER_SAMPLE: usize = 2;
/// Capture frame length: 20 ms.
pub const FRAME_SAMPLES: usize = 480;
/// 960 bytes per 20 ms frame.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * BYTES_PER_SAMPLE;
