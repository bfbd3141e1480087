//! Typed audio chunk passed between the codec, the jitter buffer and the bridges.

use std::time::Instant;

use crate::protocol::{BYTES_PER_SAMPLE, SAMPLE_RATE};

/// An immutable block of 24 kHz mono s16le PCM.
///
/// `seq` increases monotonically per producer and exists for diagnostics
/// only; consumers never reorder by it.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    seq: u64,
    pcm: Vec<u8>,
    received_at: Instant,
}

impl AudioChunk {
    /// Wrap raw s16le bytes. The caller guarantees an even length; the
    /// codec checks it before constructing.
    pub(crate) fn new(seq: u64, pcm: Vec<u8>) -> Self {
        debug_assert!(pcm.len() % BYTES_PER_SAMPLE == 0);
        Self {
            seq,
            pcm,
            received_at: Instant::now(),
        }
    }

    pub fn from_samples(seq: u64, samples: &[i16]) -> Self {
        let mut pcm = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for s in samples {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        Self::new(seq, pcm)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Raw little-endian bytes as they travel on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.pcm
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.pcm
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn to_samples(&self) -> Vec<i16> {
        self.samples().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / BYTES_PER_SAMPLE
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.sample_count() as f64 / SAMPLE_RATE as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn samples_are_little_endian() {
        let chunk = AudioChunk::new(0, vec![0x01, 0x00, 0xff, 0xff, 0x00, 0x80]);
        assert_eq!(chunk.to_samples(), vec![1, -1, i16::MIN]);
    }

    #[test]
    fn from_samples_matches_wire_layout() {
        let chunk = AudioChunk::from_samples(9, &[256, -2]);
        assert_eq!(chunk.as_bytes(), &[0x00, 0x01, 0xfe, 0xff]);
        assert_eq!(chunk.seq(), 9);
    }

    #[test]
    fn twenty_ms_frame_duration() {
        let chunk = AudioChunk::from_samples(0, &[0i16; 480]);
        assert_eq!(chunk.as_bytes().len(), 960);
        assert_relative_eq!(chunk.duration_secs(), 0.02, epsilon = 1e-9);
        assert!(!chunk.is_empty());
    }
}
