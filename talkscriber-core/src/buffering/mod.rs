//! Buffers between the network, the bridges and the audio devices.
//!
//! - [`jitter::JitterBuffer`]: bounded FIFO of decoded [`chunk::AudioChunk`]s
//!   between the receive loop and the playback bridge.
//! - The sample ring below: `ringbuf::HeapRb<f32>` between a real-time device
//!   callback and a bridge thread. `push_slice`/`pop_slice` are wait-free and
//!   safe to call from the callback.

pub mod chunk;
pub mod jitter;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the capture callback or the playback bridge.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture bridge or the playback callback.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Capture ring: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz. Covers a
/// stalled send path for a few seconds before the callback starts dropping.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Playback ring: 2^15 = 32 768 f32 samples ≈ 0.68 s at 48 kHz. Small on
/// purpose so the bridge blocks instead of queueing far ahead of the device.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 15;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
