//! Bounded jitter buffer between network receipt and playback.
//!
//! One producer (the receive loop) and one consumer (the playback bridge).
//! Capacity is counted in chunks. Delivery is strict FIFO; sequence numbers
//! are never used to reorder.
//!
//! ```text
//! push ──► [ c0 c1 c2 … cN-1 ] ──► pop
//!            ▲ full: Block{timeout} or DropOldest
//! ```
//!
//! `finish()` marks end of input: pops drain what is left, then report
//! `Drained`. `close()` cancels: every blocked producer and consumer wakes
//! immediately.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    buffering::chunk::AudioChunk,
    config::{JitterBufferConfig, OverflowPolicy},
    error::{Result, TalkscriberError},
};

/// Outcome of a pop.
#[derive(Debug)]
pub enum PopResult {
    Chunk(AudioChunk),
    /// Nothing arrived within the timeout; more may still come.
    Empty,
    /// Input finished and every chunk has been delivered.
    Drained,
    /// The buffer was closed; pending chunks are abandoned.
    Closed,
}

/// How a wait for the minimum fill ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priming {
    /// `min_fill` chunks are buffered.
    Primed,
    /// Input finished before reaching `min_fill`; play whatever is there.
    Finished,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitterStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub high_water: usize,
    pub len: usize,
}

#[derive(Default)]
struct State {
    queue: VecDeque<AudioChunk>,
    finished: bool,
    closed: bool,
    pushed: u64,
    popped: u64,
    dropped: u64,
    high_water: usize,
}

pub struct JitterBuffer {
    config: JitterBufferConfig,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl JitterBuffer {
    /// `config` must already be validated.
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(config.capacity),
                ..State::default()
            }),
            config,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn min_fill(&self) -> usize {
        self.config.min_fill
    }

    /// Append at the tail, applying the overflow policy when full.
    ///
    /// # Errors
    /// - `RingBufferFull` when `Block { timeout }` expires.
    /// - `BufferClosed` after `close()` or `finish()`.
    pub fn push(&self, chunk: AudioChunk) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.finished {
            return Err(TalkscriberError::BufferClosed);
        }

        if state.queue.len() >= self.config.capacity {
            match self.config.overflow {
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = state.queue.pop_front() {
                        state.dropped += 1;
                        warn!(
                            seq = evicted.seq(),
                            dropped = state.dropped,
                            "jitter buffer full: dropped oldest chunk"
                        );
                    }
                }
                OverflowPolicy::Block { timeout } => {
                    let deadline = Instant::now() + timeout;
                    while state.queue.len() >= self.config.capacity && !state.closed {
                        if self
                            .not_full
                            .wait_until(&mut state, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    if state.closed {
                        return Err(TalkscriberError::BufferClosed);
                    }
                    if state.queue.len() >= self.config.capacity {
                        warn!(
                            capacity = self.config.capacity,
                            "jitter buffer push timed out"
                        );
                        return Err(TalkscriberError::RingBufferFull);
                    }
                }
            }
        }

        state.queue.push_back(chunk);
        state.pushed += 1;
        state.high_water = state.high_water.max(state.queue.len());
        drop(state);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Remove the head chunk, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return PopResult::Closed;
            }
            if let Some(chunk) = state.queue.pop_front() {
                state.popped += 1;
                drop(state);
                self.not_full.notify_one();
                return PopResult::Chunk(chunk);
            }
            if state.finished {
                return PopResult::Drained;
            }
            if self
                .not_empty
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                // One last look: a push may have landed as the wait expired.
                if state.closed {
                    return PopResult::Closed;
                }
                return match state.queue.pop_front() {
                    Some(chunk) => {
                        state.popped += 1;
                        drop(state);
                        self.not_full.notify_one();
                        PopResult::Chunk(chunk)
                    }
                    None if state.finished => PopResult::Drained,
                    None => PopResult::Empty,
                };
            }
        }
    }

    pub fn try_pop(&self) -> PopResult {
        self.pop_timeout(Duration::ZERO)
    }

    /// Block until playback may start: `min_fill` chunks buffered, input
    /// finished, or the buffer closed.
    pub fn wait_primed(&self) -> Priming {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Priming::Closed;
            }
            if state.queue.len() >= self.config.min_fill {
                debug!(len = state.queue.len(), "jitter buffer primed");
                return Priming::Primed;
            }
            if state.finished {
                return Priming::Finished;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// No more pushes will come. Pending chunks stay poppable.
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Cancel: wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(abandoned = state.queue.len(), "jitter buffer closed");
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> JitterStats {
        let state = self.state.lock();
        JitterStats {
            pushed: state.pushed,
            popped: state.popped,
            dropped: state.dropped,
            high_water: state.high_water,
            len: state.queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn cfg(capacity: usize, min_fill: usize, overflow: OverflowPolicy) -> JitterBufferConfig {
        JitterBufferConfig {
            capacity,
            min_fill,
            overflow,
        }
    }

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk::from_samples(seq, &[seq as i16; 4])
    }

    fn expect_seq(result: PopResult) -> u64 {
        match result {
            PopResult::Chunk(c) => c.seq(),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn fifo_under_capacity() {
        let buf = JitterBuffer::new(cfg(8, 1, OverflowPolicy::default()));
        for seq in [3, 1, 2, 0] {
            buf.push(chunk(seq)).unwrap();
        }
        let order: Vec<u64> = (0..4).map(|_| expect_seq(buf.try_pop())).collect();
        // Insertion order, not sequence order.
        assert_eq!(order, vec![3, 1, 2, 0]);
        assert!(matches!(buf.try_pop(), PopResult::Empty));
    }

    #[test]
    fn fifo_across_threads_with_backpressure() {
        let buf = Arc::new(JitterBuffer::new(cfg(
            4,
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(5),
            },
        )));
        let producer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for seq in 0..200 {
                    buf.push(chunk(seq)).unwrap();
                }
                buf.finish();
            })
        };

        let mut received = Vec::new();
        loop {
            match buf.pop_timeout(Duration::from_millis(500)) {
                PopResult::Chunk(c) => received.push(c.seq()),
                PopResult::Drained => break,
                PopResult::Empty => continue,
                PopResult::Closed => panic!("unexpected close"),
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..200).collect::<Vec<_>>());
        let stats = buf.stats();
        assert_eq!(stats.pushed, 200);
        assert_eq!(stats.dropped, 0);
        assert!(stats.high_water <= 4);
    }

    #[test]
    fn drop_oldest_evicts_head_and_counts() {
        let buf = JitterBuffer::new(cfg(2, 1, OverflowPolicy::DropOldest));
        for seq in 0..5 {
            buf.push(chunk(seq)).unwrap();
        }
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.stats().dropped, 3);
        assert_eq!(expect_seq(buf.try_pop()), 3);
        assert_eq!(expect_seq(buf.try_pop()), 4);
    }

    #[test]
    fn blocked_push_times_out_with_ring_buffer_full() {
        let buf = JitterBuffer::new(cfg(
            1,
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(50),
            },
        ));
        buf.push(chunk(0)).unwrap();
        let started = Instant::now();
        let err = buf.push(chunk(1)).unwrap_err();
        assert!(matches!(err, TalkscriberError::RingBufferFull));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn close_wakes_blocked_producer_and_consumer() {
        let full = Arc::new(JitterBuffer::new(cfg(
            1,
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(30),
            },
        )));
        full.push(chunk(0)).unwrap();
        let producer = {
            let buf = Arc::clone(&full);
            thread::spawn(move || buf.push(chunk(1)))
        };

        let empty = Arc::new(JitterBuffer::new(cfg(4, 2, OverflowPolicy::default())));
        let consumer = {
            let buf = Arc::clone(&empty);
            thread::spawn(move || buf.pop_timeout(Duration::from_secs(30)))
        };
        let primer = {
            let buf = Arc::clone(&empty);
            thread::spawn(move || buf.wait_primed())
        };

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        full.close();
        empty.close();

        assert!(matches!(
            producer.join().unwrap(),
            Err(TalkscriberError::BufferClosed)
        ));
        assert!(matches!(consumer.join().unwrap(), PopResult::Closed));
        assert_eq!(primer.join().unwrap(), Priming::Closed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn finish_drains_then_reports_drained() {
        let buf = JitterBuffer::new(cfg(4, 3, OverflowPolicy::default()));
        buf.push(chunk(0)).unwrap();
        buf.finish();
        assert_eq!(buf.wait_primed(), Priming::Finished);
        assert_eq!(expect_seq(buf.try_pop()), 0);
        assert!(matches!(buf.try_pop(), PopResult::Drained));
        assert!(matches!(
            buf.push(chunk(1)),
            Err(TalkscriberError::BufferClosed)
        ));
    }

    #[test]
    fn wait_primed_returns_at_min_fill() {
        let buf = Arc::new(JitterBuffer::new(cfg(8, 3, OverflowPolicy::default())));
        let primer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let result = buf.wait_primed();
                (result, buf.len())
            })
        };
        for seq in 0..3 {
            thread::sleep(Duration::from_millis(10));
            buf.push(chunk(seq)).unwrap();
        }
        let (result, len) = primer.join().unwrap();
        assert_eq!(result, Priming::Primed);
        assert!(len >= 3);
    }
}
