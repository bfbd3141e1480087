//! Egress half of the bridge: jitter buffer → sinks.
//!
//! ## Per request
//!
//! ```text
//! spawn()  ── open sinks on the bridge thread ──► Ok(handle) / Err(Device)
//!   wait_primed()       min_fill chunks buffered (or input finished)
//!   loop pop_timeout()
//!     Chunk  → write to every live sink; first write stamps time-to-first-audio
//!     Empty  → underrun: Gap writes nothing, HoldLast repeats to real-time sinks
//!     Drained→ finish sinks, report
//!     Closed → cancelled, report
//! ```
//!
//! Sinks fail independently. A failing sink is dropped from the set and
//! recorded while the rest keep draining the buffer. A lost real-time sink
//! still ends the bridge with `Device`, but only after the file sinks have
//! received everything and been finished.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{atomic::Ordering, mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    audio::{
        playback::AudioPlayback,
        resample::{i16_to_f32, RateConverter},
        wav::wire_spec,
    },
    buffering::{
        create_sample_ring,
        jitter::{JitterBuffer, PopResult, Priming},
        Observer, Producer, SampleProducer, PLAYBACK_RING_CAPACITY,
    },
    config::UnderrunPolicy,
    diagnostics::{PlaybackDiagnostics, PlaybackSnapshot},
    error::{Result, TalkscriberError},
    protocol::{FRAME_SAMPLES, SAMPLE_RATE},
};

/// Sleep while the device ring is full.
const RING_FULL_SLEEP: Duration = Duration::from_millis(5);

/// A device that makes no progress for this long is treated as failed.
const DEVICE_STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Destination for decoded 24 kHz mono s16 audio.
pub trait AudioSink {
    fn name(&self) -> &str;

    /// Real-time sinks receive underrun repeats and are fatal on failure.
    fn is_realtime(&self) -> bool;

    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Flush and release. Called once after the last write.
    fn finish(&mut self) -> Result<()>;
}

/// Where a request's audio goes. Resolved into sinks on the bridge thread,
/// because a device stream cannot move between threads.
pub enum SinkTarget {
    Device { preferred: Option<String> },
    WavFile(PathBuf),
    Custom(Box<dyn AudioSink + Send>),
}

impl std::fmt::Debug for SinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device { preferred } => f
                .debug_struct("Device")
                .field("preferred", preferred)
                .finish(),
            Self::WavFile(path) => f.debug_tuple("WavFile").field(path).finish(),
            Self::Custom(sink) => f.debug_tuple("Custom").field(&sink.name()).finish(),
        }
    }
}

impl SinkTarget {
    fn open(self) -> Result<Box<dyn AudioSink>> {
        Ok(match self {
            Self::Device { preferred } => Box::new(DeviceSink::open(preferred.as_deref())?),
            Self::WavFile(path) => Box::new(WavFileSink::create(path)?),
            Self::Custom(sink) => sink,
        })
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Output device. Converts to the device rate and blocks while the device
/// ring is full, which paces the bridge at playback speed.
pub struct DeviceSink {
    playback: AudioPlayback,
    producer: SampleProducer,
    converter: RateConverter,
    name: String,
}

impl DeviceSink {
    pub fn open(preferred: Option<&str>) -> Result<Self> {
        let (producer, consumer) = create_sample_ring(PLAYBACK_RING_CAPACITY);
        let playback = AudioPlayback::open(consumer, preferred)?;
        let converter = RateConverter::new(SAMPLE_RATE, playback.sample_rate, FRAME_SAMPLES)?;
        Ok(Self {
            name: format!("device:{}", preferred.unwrap_or("default")),
            playback,
            producer,
            converter,
        })
    }

    fn push_all(&mut self, samples: &[f32]) -> Result<()> {
        let mut offset = 0;
        let mut last_progress = Instant::now();
        while offset < samples.len() {
            let written = self.producer.push_slice(&samples[offset..]);
            offset += written;
            if offset == samples.len() {
                break;
            }
            if self.playback.has_failed() {
                return Err(TalkscriberError::Device("output stream failed".into()));
            }
            if written > 0 {
                last_progress = Instant::now();
            } else if last_progress.elapsed() > DEVICE_STALL_TIMEOUT {
                return Err(TalkscriberError::Device("output device stalled".into()));
            }
            thread::sleep(RING_FULL_SLEEP);
        }
        Ok(())
    }
}

impl AudioSink for DeviceSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_realtime(&self) -> bool {
        true
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let converted = self.converter.process(&i16_to_f32(samples));
        self.push_all(&converted)
    }

    fn finish(&mut self) -> Result<()> {
        let tail = self.converter.flush();
        self.push_all(&tail)?;
        // Let the device play out what is queued before the stream drops.
        let queued = self.producer.occupied_len() as f64 / self.playback.sample_rate as f64;
        let deadline = Instant::now() + Duration::from_secs_f64(queued) + Duration::from_millis(500);
        while self.producer.occupied_len() > 0 && Instant::now() < deadline {
            if self.playback.has_failed() {
                return Err(TalkscriberError::Device("output stream failed".into()));
            }
            thread::sleep(RING_FULL_SLEEP);
        }
        debug!(
            starved_samples = self.playback.starved_samples(),
            "device sink finished"
        );
        Ok(())
    }
}

/// 24 kHz mono s16 WAV file.
pub struct WavFileSink {
    name: String,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavFileSink {
    pub fn create(path: PathBuf) -> Result<Self> {
        let writer = hound::WavWriter::create(&path, wire_spec())?;
        Ok(Self {
            name: format!("file:{}", path.display()),
            writer: Some(writer),
        })
    }
}

impl AudioSink for WavFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_realtime(&self) -> bool {
        false
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(TalkscriberError::BufferClosed)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

/// Everything a [`CollectorSink`] received.
#[derive(Debug, Default, Clone)]
pub struct CollectedAudio {
    pub samples: Vec<i16>,
    /// Arrival time and length of every write.
    pub writes: Vec<(Instant, usize)>,
    pub finished: bool,
}

/// In-memory sink. Clone the handle before boxing the sink to inspect
/// what was played.
pub struct CollectorSink {
    name: String,
    realtime: bool,
    store: Arc<Mutex<CollectedAudio>>,
}

impl CollectorSink {
    pub fn new(name: impl Into<String>, realtime: bool) -> (Self, Arc<Mutex<CollectedAudio>>) {
        let store = Arc::new(Mutex::new(CollectedAudio::default()));
        (
            Self {
                name: name.into(),
                realtime,
                store: Arc::clone(&store),
            },
            store,
        )
    }
}

impl AudioSink for CollectorSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let mut store = self.store.lock();
        store.samples.extend_from_slice(samples);
        store.writes.push((Instant::now(), samples.len()));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.store.lock().finished = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    pub underrun: UnderrunPolicy,
    /// How long a pop waits before the bridge counts an underrun.
    pub poll_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            underrun: UnderrunPolicy::Gap,
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkFailure {
    pub sink: String,
    pub error: String,
}

/// Result of one playback run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaybackReport {
    pub chunks: u64,
    pub samples: u64,
    /// From `started_at` to the first sink write.
    pub time_to_first_audio: Option<Duration>,
    pub underruns: u64,
    pub held_repeats: u64,
    pub sink_failures: Vec<SinkFailure>,
    /// The buffer was closed before it drained.
    pub cancelled: bool,
}

pub struct PlaybackHandle {
    join: JoinHandle<Result<PlaybackReport>>,
    buffer: Arc<JitterBuffer>,
    diagnostics: Arc<PlaybackDiagnostics>,
}

impl PlaybackHandle {
    /// Block until playback ends.
    pub fn wait(self) -> Result<PlaybackReport> {
        self.join
            .join()
            .map_err(|_| TalkscriberError::Other(anyhow::anyhow!("playback thread panicked")))?
    }

    /// Stop early. The bridge exits at its next pop.
    pub fn cancel(&self) {
        self.buffer.close();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn diagnostics_snapshot(&self) -> PlaybackSnapshot {
        self.diagnostics.snapshot()
    }
}

pub struct PlaybackBridge;

impl PlaybackBridge {
    /// Open every sink on a new thread and start draining `buffer` into them.
    ///
    /// Blocks until the sinks are open. `started_at` is the request start
    /// used for time-to-first-audio.
    ///
    /// # Errors
    /// Any sink that fails to open fails the whole bridge; nothing plays.
    pub fn spawn(
        buffer: Arc<JitterBuffer>,
        targets: Vec<SinkTarget>,
        config: PlaybackConfig,
        started_at: Instant,
    ) -> Result<PlaybackHandle> {
        let diagnostics = Arc::new(PlaybackDiagnostics::default());
        let (open_tx, open_rx) = mpsc::channel::<Result<()>>();

        let thread_buffer = Arc::clone(&buffer);
        let thread_diag = Arc::clone(&diagnostics);
        let join = thread::Builder::new()
            .name("talkscriber-playback".into())
            .spawn(move || {
                // Sinks must be opened on THIS thread: cpal::Stream is !Send.
                let mut sinks = Vec::with_capacity(targets.len());
                for target in targets {
                    match target.open() {
                        Ok(sink) => sinks.push(LiveSink { sink, failed: false }),
                        Err(e) => {
                            error!("failed to open sink: {e}");
                            let detail = e.to_string();
                            let _ = open_tx.send(Err(e));
                            thread_buffer.close();
                            return Err(TalkscriberError::Device(detail));
                        }
                    }
                }
                let _ = open_tx.send(Ok(()));
                run(PlaybackContext {
                    buffer: thread_buffer,
                    sinks,
                    config,
                    started_at,
                    diagnostics: thread_diag,
                    device_error: None,
                })
            })
            .map_err(TalkscriberError::Io)?;

        match open_rx.recv() {
            Ok(Ok(())) => Ok(PlaybackHandle {
                join,
                buffer,
                diagnostics,
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(TalkscriberError::Other(anyhow::anyhow!(
                "playback thread died before opening sinks"
            ))),
        }
    }
}

struct LiveSink {
    sink: Box<dyn AudioSink>,
    failed: bool,
}

struct PlaybackContext {
    buffer: Arc<JitterBuffer>,
    sinks: Vec<LiveSink>,
    config: PlaybackConfig,
    started_at: Instant,
    diagnostics: Arc<PlaybackDiagnostics>,
    device_error: Option<TalkscriberError>,
}

impl PlaybackContext {
    fn has_live_realtime(&self) -> bool {
        self.sinks.iter().any(|s| !s.failed && s.sink.is_realtime())
    }
}

fn run(mut ctx: PlaybackContext) -> Result<PlaybackReport> {
    let names: Vec<&str> = ctx.sinks.iter().map(|s| s.sink.name()).collect();
    let span = info_span!("playback", sinks = ?names, policy = ?ctx.config.underrun);
    let _enter = span.enter();

    let mut report = PlaybackReport::default();

    if ctx.buffer.wait_primed() == Priming::Closed {
        report.cancelled = true;
        finish_sinks(&mut ctx.sinks, &mut report, &ctx.diagnostics)?;
        return Ok(report);
    }
    debug!(buffered = ctx.buffer.len(), "playback starting");

    let mut last: Option<Vec<i16>> = None;
    let mut in_underrun = false;

    loop {
        match ctx.buffer.pop_timeout(ctx.config.poll_interval) {
            PopResult::Chunk(chunk) => {
                in_underrun = false;
                let samples = chunk.to_samples();
                if report.time_to_first_audio.is_none() {
                    let ttfa = ctx.started_at.elapsed();
                    info!(ttfa_ms = ttfa.as_millis() as u64, "first audio");
                    report.time_to_first_audio = Some(ttfa);
                }
                write_all(&mut ctx, &samples, false, &mut report);
                report.chunks += 1;
                report.samples += samples.len() as u64;
                ctx.diagnostics.chunks_played.fetch_add(1, Ordering::Relaxed);
                ctx.diagnostics
                    .samples_played
                    .fetch_add(samples.len() as u64, Ordering::Relaxed);
                last = Some(samples);
            }
            PopResult::Empty => {
                if !in_underrun {
                    in_underrun = true;
                    report.underruns += 1;
                    ctx.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
                    debug!(underruns = report.underruns, "jitter buffer underrun");
                }
                if ctx.config.underrun == UnderrunPolicy::HoldLast && ctx.has_live_realtime() {
                    if let Some(held) = last.take() {
                        write_all(&mut ctx, &held, true, &mut report);
                        report.held_repeats += 1;
                        ctx.diagnostics.held_repeats.fetch_add(1, Ordering::Relaxed);
                        last = Some(held);
                    }
                }
            }
            PopResult::Drained => break,
            PopResult::Closed => {
                report.cancelled = true;
                debug!("playback cancelled");
                break;
            }
        }
    }

    let finished = finish_sinks(&mut ctx.sinks, &mut report, &ctx.diagnostics);
    info!(
        chunks = report.chunks,
        underruns = report.underruns,
        sink_failures = report.sink_failures.len(),
        "playback finished"
    );
    if let Some(e) = ctx.device_error.take() {
        return Err(e);
    }
    finished.map(|()| report)
}

/// `repeat` writes go to real-time sinks only.
fn write_all(
    ctx: &mut PlaybackContext,
    samples: &[i16],
    repeat: bool,
    report: &mut PlaybackReport,
) {
    for live in ctx.sinks.iter_mut().filter(|s| !s.failed) {
        let realtime = live.sink.is_realtime();
        if repeat && !realtime {
            continue;
        }
        if let Err(e) = live.sink.write(samples) {
            live.failed = true;
            ctx.diagnostics.sink_failures.fetch_add(1, Ordering::Relaxed);
            report.sink_failures.push(SinkFailure {
                sink: live.sink.name().to_owned(),
                error: e.to_string(),
            });
            if realtime {
                error!(sink = live.sink.name(), "real-time sink failed: {e}");
                ctx.device_error.get_or_insert(TalkscriberError::Device(format!(
                    "{}: {e}",
                    live.sink.name()
                )));
            } else {
                warn!(sink = live.sink.name(), "sink disabled after write failure: {e}");
            }
        }
    }
    // Nothing left to play into; let the producer stop pushing.
    if ctx.sinks.iter().all(|s| s.failed) {
        ctx.buffer.close();
    }
}

fn finish_sinks(
    sinks: &mut [LiveSink],
    report: &mut PlaybackReport,
    diagnostics: &PlaybackDiagnostics,
) -> Result<()> {
    let mut fatal = None;
    for live in sinks.iter_mut().filter(|s| !s.failed) {
        if let Err(e) = live.sink.finish() {
            if live.sink.is_realtime() {
                error!(sink = live.sink.name(), "real-time sink failed to finish: {e}");
                fatal.get_or_insert(TalkscriberError::Device(format!(
                    "{}: {e}",
                    live.sink.name()
                )));
                continue;
            }
            warn!(sink = live.sink.name(), "sink failed to finish: {e}");
            live.failed = true;
            diagnostics.sink_failures.fetch_add(1, Ordering::Relaxed);
            report.sink_failures.push(SinkFailure {
                sink: live.sink.name().to_owned(),
                error: e.to_string(),
            });
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
