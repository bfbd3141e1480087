//! WAV decode for file ingest and the WAV layout used for saved speech.

use std::path::Path;

use crate::{
    audio::resample::{f32_to_i16, RateConverter},
    error::{Result, TalkscriberError},
    protocol::{CHANNELS, SAMPLE_RATE},
};

/// Header for files written by the WAV sink: 24 kHz mono s16.
pub fn wire_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Read any PCM WAV and downmix to mono f32. Returns the file's sample rate.
pub fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Decode a WAV file into the wire format: 24 kHz mono s16.
///
/// # Errors
/// `AudioFile` for unreadable or empty files, `Io` when the file cannot be opened.
pub fn load_wire_pcm(path: &Path) -> Result<Vec<i16>> {
    let (mono, rate) = read_wav_mono_f32(path)?;
    if mono.is_empty() {
        return Err(TalkscriberError::AudioFile(format!(
            "{} contains no samples",
            path.display()
        )));
    }
    // 20 ms blocks at the source rate.
    let chunk = (rate / 50).max(1) as usize;
    let mut rc = RateConverter::new(rate, SAMPLE_RATE, chunk)?;
    let mut out = rc.process(&mono);
    out.extend(rc.flush());
    tracing::debug!(
        path = %path.display(),
        source_rate = rate,
        samples = out.len(),
        "decoded audio file"
    );
    Ok(f32_to_i16(&out))
}
