//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Devices run at their native rate (commonly 44.1 or 48 kHz) and WAV files
//! at whatever they were recorded at, while the wire format is fixed at
//! 24 kHz. `RateConverter` bridges that gap on bridge threads, where
//! allocation is allowed. When both rates match it is a passthrough and no
//! rubato state is created.
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 24_000, 960)?;
//! let out = rc.process(&raw_samples); // Vec<f32> at 24 kHz
//! let tail = rc.flush();              // remainder, zero-padded
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, TalkscriberError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    input_buf: Vec<f32>,
    /// Input frames rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// # Errors
    /// Returns `TalkscriberError::Config` if rubato rejects the rates.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || chunk_size == 0 {
            return Err(TalkscriberError::config(
                "sample_rate",
                format!("cannot resample {from_rate} Hz → {to_rate} Hz in chunks of {chunk_size}"),
            ));
        }
        let ratio = to_rate as f64 / from_rate as f64;
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| TalkscriberError::config("sample_rate", format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::debug!(from_rate, to_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Input accumulates until a full `chunk_size` block is available; the
    /// remainder waits for the next call or for [`RateConverter::flush`].
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }
        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::with_capacity((samples.len() as f64 * self.ratio) as usize + 16);
        self.drain_full_chunks(&mut result);
        result
    }

    /// Pad the pending remainder with silence, convert it, and return only
    /// the part that corresponds to real input.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            return Vec::new();
        }
        let pending = self.input_buf.len();
        self.input_buf.resize(self.chunk_size, 0.0);
        let mut result = Vec::new();
        self.drain_full_chunks(&mut result);
        let keep = ((pending as f64) * self.ratio).round() as usize;
        result.truncate(keep);
        result
    }

    fn drain_full_chunks(&mut self, result: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            return;
        };
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.input_buf.drain(..self.chunk_size);
        }
    }

    /// Returns `true` when both rates match.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// s16 → f32 in [-1, 1).
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// f32 → s16 with clipping.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}
