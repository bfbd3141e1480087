//! Output stream fed from an SPSC sample ring.
//!
//! The callback pops mono f32 samples and writes them to every channel. When
//! the ring is short it writes silence for the rest of the buffer and counts
//! the missing samples; that silence is the audible form of a gap.

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

use crate::{
    buffering::SampleConsumer,
    error::{Result, TalkscriberError},
};

/// Handle to an active output stream. **Not `Send`**.
pub struct AudioPlayback {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Samples the callback had to fill with silence.
    starved: Arc<AtomicU64>,
    /// Set by the stream error callback; the bridge treats it as fatal.
    failed: Arc<AtomicBool>,
    /// Native rate of the device (Hz).
    pub sample_rate: u32,
}

impl AudioPlayback {
    /// Open an output device and start pulling from `consumer`.
    ///
    /// # Errors
    /// - `Device` when the named device is missing or cpal fails to build the stream.
    /// - `NoDefaultDevice` when no name is given and the host has no default output.
    #[cfg(feature = "audio-cpal")]
    pub fn open(consumer: SampleConsumer, preferred: Option<&str>) -> Result<Self> {
        use super::device::{select_device, DeviceKind};

        let device = select_device(DeviceKind::Output, preferred)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| TalkscriberError::Device(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = usize::from(supported.channels().max(1));
        info!(sample_rate, channels, format = ?supported.sample_format(), "output config selected");

        let config: StreamConfig = supported.config();
        let starved = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicBool::new(false));
        let ctx = OutputContext {
            consumer,
            starved: Arc::clone(&starved),
            failed: Arc::clone(&failed),
            channels,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, ctx),
            SampleFormat::I16 => build_output::<i16>(&device, &config, ctx),
            SampleFormat::U16 => build_output::<u16>(&device, &config, ctx),
            SampleFormat::I32 => build_output::<i32>(&device, &config, ctx),
            SampleFormat::U8 => build_output::<u8>(&device, &config, ctx),
            fmt => {
                return Err(TalkscriberError::Device(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| TalkscriberError::Device(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            starved,
            failed,
            sample_rate,
        })
    }

    pub fn starved_samples(&self) -> u64 {
        self.starved.load(Ordering::Relaxed)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioPlayback {
    pub fn open(_consumer: SampleConsumer, _preferred: Option<&str>) -> Result<Self> {
        Err(TalkscriberError::Device(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
struct OutputContext {
    consumer: SampleConsumer,
    starved: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    channels: usize,
}

#[cfg(feature = "audio-cpal")]
fn build_output<T>(device: &cpal::Device, config: &StreamConfig, ctx: OutputContext) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    use crate::buffering::Consumer;

    let OutputContext {
        mut consumer,
        starved,
        failed,
        channels,
    } = ctx;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                let got = consumer.pop_slice(&mut mono);
                if got < frames {
                    mono[got..].fill(0.0);
                    starved.fetch_add((frames - got) as u64, Ordering::Relaxed);
                }
                for (frame, &s) in data.chunks_exact_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(s);
                    for out in frame {
                        *out = value;
                    }
                }
            },
            move |err| {
                failed.store(true, Ordering::Relaxed);
                error!("output stream error: {err}");
            },
            None,
        )
        .map_err(|e| TalkscriberError::Device(e.to_string()))
}
