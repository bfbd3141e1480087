//! Lock-free counters for each stage, read as point-in-time snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct SessionDiagnostics {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub audio_chunks_in: AtomicU64,
    pub control_messages_in: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl SessionDiagnostics {
    pub fn record_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_out.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.audio_chunks_in.store(0, Ordering::Relaxed);
        self.control_messages_in.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            audio_chunks_in: self.audio_chunks_in.load(Ordering::Relaxed),
            control_messages_in: self.control_messages_in.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub audio_chunks_in: u64,
    pub control_messages_in: u64,
    pub protocol_errors: u64,
}

/// Counters for one playback bridge run.
#[derive(Default)]
pub struct PlaybackDiagnostics {
    pub chunks_played: AtomicU64,
    pub samples_played: AtomicU64,
    pub underruns: AtomicU64,
    pub held_repeats: AtomicU64,
    pub sink_failures: AtomicU64,
}

impl PlaybackDiagnostics {
    pub fn reset(&self) {
        self.chunks_played.store(0, Ordering::Relaxed);
        self.samples_played.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.held_repeats.store(0, Ordering::Relaxed);
        self.sink_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            samples_played: self.samples_played.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            held_repeats: self.held_repeats.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackSnapshot {
    pub chunks_played: u64,
    pub samples_played: u64,
    pub underruns: u64,
    pub held_repeats: u64,
    pub sink_failures: u64,
}

#[derive(Default)]
pub struct AssemblerDiagnostics {
    pub segments_opened: AtomicU64,
    pub partials_emitted: AtomicU64,
    pub finals_emitted: AtomicU64,
    pub late_segments: AtomicU64,
    pub turns_ended: AtomicU64,
}

impl AssemblerDiagnostics {
    pub fn reset(&self) {
        self.segments_opened.store(0, Ordering::Relaxed);
        self.partials_emitted.store(0, Ordering::Relaxed);
        self.finals_emitted.store(0, Ordering::Relaxed);
        self.late_segments.store(0, Ordering::Relaxed);
        self.turns_ended.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AssemblerSnapshot {
        AssemblerSnapshot {
            segments_opened: self.segments_opened.load(Ordering::Relaxed),
            partials_emitted: self.partials_emitted.load(Ordering::Relaxed),
            finals_emitted: self.finals_emitted.load(Ordering::Relaxed),
            late_segments: self.late_segments.load(Ordering::Relaxed),
            turns_ended: self.turns_ended.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssemblerSnapshot {
    pub segments_opened: u64,
    pub partials_emitted: u64,
    pub finals_emitted: u64,
    pub late_segments: u64,
    pub turns_ended: u64,
}
