//! Audio device I/O via the cpal backend.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They
//! **must not** allocate after warm-up, block on a mutex or condvar, or
//! perform I/O. Both directions therefore exchange samples with bridge
//! threads through an SPSC ring whose `push_slice`/`pop_slice` are
//! lock-free. Overruns and underruns inside a callback are counted in
//! atomics, never logged there.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`AudioCapture`] and [`playback::AudioPlayback`] must be created
//! and dropped on the same thread; the bridges open them on their own thread.

pub mod device;
pub mod playback;
pub mod resample;
pub mod wav;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};

use crate::{
    buffering::SampleProducer,
    error::{Result, TalkscriberError},
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

/// Handle to an active input stream.
///
/// **Not `Send`**: create and drop it on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    /// Samples the callback could not push because the ring was full.
    overruns: Arc<AtomicU64>,
    /// Native rate of the device (Hz).
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Open an input device and push mono f32 samples into `producer`.
    ///
    /// `preferred` names a device exactly; `None` picks the host default.
    ///
    /// # Errors
    /// - `Device` when the named device is missing or cpal fails to build the stream.
    /// - `NoDefaultDevice` when no name is given and the host has no default input.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        producer: SampleProducer,
        running: Arc<AtomicBool>,
        preferred: Option<&str>,
    ) -> Result<Self> {
        let device = device::select_device(device::DeviceKind::Input, preferred)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| TalkscriberError::Device(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, format = ?supported.sample_format(), "input config selected");

        let config: StreamConfig = supported.config();
        let overruns = Arc::new(AtomicU64::new(0));
        let ctx = InputContext {
            producer,
            running: Arc::clone(&running),
            overruns: Arc::clone(&overruns),
            channels: usize::from(channels.max(1)),
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, ctx),
            SampleFormat::I16 => build_input::<i16>(&device, &config, ctx),
            SampleFormat::U16 => build_input::<u16>(&device, &config, ctx),
            SampleFormat::I32 => build_input::<i32>(&device, &config, ctx),
            SampleFormat::U8 => build_input::<u8>(&device, &config, ctx),
            fmt => {
                return Err(TalkscriberError::Device(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| TalkscriberError::Device(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            overruns,
            sample_rate,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: SampleProducer,
        _running: Arc<AtomicBool>,
        _preferred: Option<&str>,
    ) -> Result<Self> {
        Err(TalkscriberError::Device(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
struct InputContext {
    producer: SampleProducer,
    running: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    channels: usize,
}

/// One input stream builder for every sample format; downmixes to mono.
#[cfg(feature = "audio-cpal")]
fn build_input<T>(device: &cpal::Device, config: &StreamConfig, ctx: InputContext) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    use crate::buffering::Producer;

    let InputContext {
        mut producer,
        running,
        overruns,
        channels,
    } = ctx;
    // Grows to the largest callback size once, then stays.
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (f, frame) in data.chunks_exact(channels).enumerate() {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    mono[f] = sum / channels as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    overruns.fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| TalkscriberError::Device(e.to_string()))
}

#[cfg(all(test, not(feature = "audio-cpal")))]
mod tests {
    use super::*;
    use crate::buffering::create_sample_ring;

    #[test]
    fn without_backend_devices_fail_to_open() {
        let (producer, consumer) = create_sample_ring(16);
        let capture = AudioCapture::open(producer, Arc::new(AtomicBool::new(true)), None);
        assert!(matches!(capture.err(), Some(TalkscriberError::Device(_))));
        let output = playback::AudioPlayback::open(consumer, None);
        assert!(matches!(output.err(), Some(TalkscriberError::Device(_))));
    }
}
