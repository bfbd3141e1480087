//! Ingest half of the bridge: microphone or file → 20 ms frames → session.
//!
//! Runs on its own OS thread. Every frame goes out through a blocking send,
//! so a slow connection stalls this loop instead of dropping audio. With a
//! microphone the stall is absorbed by the capture ring; once that fills,
//! the device callback counts overruns.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, info_span};

use crate::{
    audio::{
        resample::{f32_to_i16, RateConverter},
        wav::load_wire_pcm,
        AudioCapture,
    },
    buffering::{
        chunk::AudioChunk, create_sample_ring, Consumer, SampleConsumer, CAPTURE_RING_CAPACITY,
    },
    error::{Result, TalkscriberError},
    protocol::{encode_audio, Frame, FRAME_SAMPLES, SAMPLE_RATE},
    transport::Session,
};

/// Sleep while the capture ring is empty.
const RING_EMPTY_SLEEP: Duration = Duration::from_millis(5);

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Anything that can put a frame on the wire, blocking until it is written.
pub trait FrameSender: Send + Sync + 'static {
    fn send_frame(&self, frame: Frame) -> Result<()>;
}

impl FrameSender for Session {
    fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send_blocking(frame)
    }
}

/// Where ingest audio comes from.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    Microphone {
        preferred: Option<String>,
    },
    /// Any PCM WAV; converted to 24 kHz mono.
    WavFile {
        path: PathBuf,
        realtime: bool,
    },
    /// Samples already in wire format.
    Pcm {
        samples: Vec<i16>,
        realtime: bool,
    },
}

impl CaptureSource {
    pub fn microphone() -> Self {
        Self::Microphone { preferred: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::WavFile {
            path: path.into(),
            realtime: false,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Microphone { preferred } => {
                format!("mic:{}", preferred.as_deref().unwrap_or("default"))
            }
            Self::WavFile { path, .. } => format!("file:{}", path.display()),
            Self::Pcm { samples, .. } => format!("pcm:{}", samples.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureReport {
    pub frames_sent: u64,
    pub samples_sent: u64,
    /// Microphone samples lost because the capture ring was full.
    pub overruns: u64,
    /// Stopped by the caller before the source ran out.
    pub stopped: bool,
}

pub struct CaptureHandle {
    join: JoinHandle<Result<CaptureReport>>,
    stop: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Ask the loop to send what it has and exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn wait(self) -> Result<CaptureReport> {
        self.join
            .join()
            .map_err(|_| TalkscriberError::Other(anyhow::anyhow!("capture thread panicked")))?
    }
}

pub struct CaptureBridge;

impl CaptureBridge {
    /// Open `source` on a new thread and stream it through `sender`.
    ///
    /// Blocks until the source is open, so device and file errors come back
    /// here rather than from [`CaptureHandle::wait`].
    pub fn spawn<S: FrameSender + ?Sized>(
        source: CaptureSource,
        sender: Arc<S>,
    ) -> Result<CaptureHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let (open_tx, open_rx) = mpsc::channel::<Result<()>>();

        let thread_stop = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("talkscriber-capture".into())
            .spawn(move || {
                let span = info_span!("capture", source = %source.label());
                let _enter = span.enter();
                let mut framer = Framer::new(sender);
                match source {
                    CaptureSource::Microphone { preferred } => {
                        run_microphone(preferred.as_deref(), &mut framer, &thread_stop, open_tx)
                    }
                    CaptureSource::WavFile { path, realtime } => match load_wire_pcm(&path) {
                        Ok(samples) => {
                            let _ = open_tx.send(Ok(()));
                            run_pcm(&samples, realtime, &mut framer, &thread_stop)
                        }
                        Err(e) => {
                            let detail = e.to_string();
                            let _ = open_tx.send(Err(e));
                            Err(TalkscriberError::AudioFile(detail))
                        }
                    },
                    CaptureSource::Pcm { samples, realtime } => {
                        let _ = open_tx.send(Ok(()));
                        run_pcm(&samples, realtime, &mut framer, &thread_stop)
                    }
                }
            })
            .map_err(TalkscriberError::Io)?;

        match open_rx.recv() {
            Ok(Ok(())) => Ok(CaptureHandle { join, stop }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(TalkscriberError::Other(anyhow::anyhow!(
                "capture thread died before opening its source"
            ))),
        }
    }
}

/// Cuts a sample stream into wire frames and sends them in order.
struct Framer<S: ?Sized> {
    sender: Arc<S>,
    pending: Vec<i16>,
    seq: u64,
    report: CaptureReport,
}

impl<S: FrameSender + ?Sized> Framer<S> {
    fn new(sender: Arc<S>) -> Self {
        Self {
            sender,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            seq: 0,
            report: CaptureReport::default(),
        }
    }

    /// Queue samples and send every complete frame. Returns frames sent.
    fn push(&mut self, samples: &[i16]) -> Result<usize> {
        self.pending.extend_from_slice(samples);
        let mut sent = 0;
        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..FRAME_SAMPLES).collect();
            self.send(&frame)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Send the trailing partial frame, if any.
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tail = std::mem::take(&mut self.pending);
        self.send(&tail)
    }

    fn send(&mut self, samples: &[i16]) -> Result<()> {
        let chunk = AudioChunk::from_samples(self.seq, samples);
        self.sender.send_frame(encode_audio(chunk.as_bytes()))?;
        self.seq += 1;
        self.report.frames_sent += 1;
        self.report.samples_sent += samples.len() as u64;
        Ok(())
    }
}

/// A send refused because the session is closing under a stop request is
/// a normal end, not a failure.
fn settle(result: Result<()>, stop: &AtomicBool, report: &mut CaptureReport) -> Result<()> {
    match result {
        Err(TalkscriberError::NotOpen(state)) if stop.load(Ordering::Acquire) => {
            debug!(%state, "send cancelled by stop");
            report.stopped = true;
            Ok(())
        }
        Err(e) => {
            error!("send failed: {e}");
            Err(e)
        }
        ok => ok,
    }
}

fn run_pcm<S: FrameSender + ?Sized>(
    samples: &[i16],
    realtime: bool,
    framer: &mut Framer<S>,
    stop: &AtomicBool,
) -> Result<CaptureReport> {
    info!(samples = samples.len(), realtime, "streaming pcm");
    let started = Instant::now();
    let mut streamed = Ok(());
    for (i, frame) in samples.chunks(FRAME_SAMPLES).enumerate() {
        if stop.load(Ordering::Acquire) {
            framer.report.stopped = true;
            break;
        }
        if realtime {
            let due = started + FRAME_DURATION * i as u32;
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        if let Err(e) = framer.push(frame) {
            streamed = Err(e);
            break;
        }
    }
    let streamed = streamed.and_then(|()| framer.flush());
    settle(streamed, stop, &mut framer.report)?;
    info!(frames = framer.report.frames_sent, "pcm source finished");
    Ok(framer.report)
}

/// Convert and send everything still sitting in the capture ring.
fn drain_ring<S: FrameSender + ?Sized>(
    consumer: &mut SampleConsumer,
    raw: &mut [f32],
    converter: &mut RateConverter,
    framer: &mut Framer<S>,
) -> Result<()> {
    loop {
        let n = consumer.pop_slice(raw);
        if n == 0 {
            return Ok(());
        }
        framer.push(&f32_to_i16(&converter.process(&raw[..n])))?;
    }
}

fn run_microphone<S: FrameSender + ?Sized>(
    preferred: Option<&str>,
    framer: &mut Framer<S>,
    stop: &AtomicBool,
    open_tx: mpsc::Sender<Result<()>>,
) -> Result<CaptureReport> {
    let (producer, mut consumer) = create_sample_ring(CAPTURE_RING_CAPACITY);
    let running = Arc::new(AtomicBool::new(true));
    // The stream lives on this thread: cpal::Stream is !Send.
    let capture = match AudioCapture::open(producer, Arc::clone(&running), preferred) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to open input device: {e}");
            let detail = e.to_string();
            let _ = open_tx.send(Err(e));
            return Err(TalkscriberError::Device(detail));
        }
    };
    let chunk = (capture.sample_rate / 50).max(1) as usize;
    let mut converter = match RateConverter::new(capture.sample_rate, SAMPLE_RATE, chunk) {
        Ok(rc) => rc,
        Err(e) => {
            let detail = e.to_string();
            let _ = open_tx.send(Err(e));
            return Err(TalkscriberError::Device(detail));
        }
    };
    let _ = open_tx.send(Ok(()));
    info!(device_rate = capture.sample_rate, "microphone streaming");

    let mut raw = vec![0f32; 4096];
    let result = loop {
        if stop.load(Ordering::Acquire) {
            framer.report.stopped = true;
            capture.stop();
            break drain_ring(&mut consumer, &mut raw, &mut converter, framer);
        }
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(RING_EMPTY_SLEEP);
            continue;
        }
        let converted = f32_to_i16(&converter.process(&raw[..n]));
        if let Err(e) = framer.push(&converted) {
            break Err(e);
        }
    };

    capture.stop();
    let tail = f32_to_i16(&converter.flush());
    let flushed = result.and_then(|()| {
        framer.push(&tail)?;
        framer.flush()
    });
    let flushed = settle(flushed, stop, &mut framer.report);
    framer.report.overruns = capture.overruns();
    debug!(
        frames = framer.report.frames_sent,
        overruns = framer.report.overruns,
        "microphone stopped"
    );
    flushed.map(|()| framer.report)
}
