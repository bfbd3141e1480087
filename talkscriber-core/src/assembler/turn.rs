//! Client-side turn detection.
//!
//! Every segment re-arms a deadline `timeout` in the future. If the deadline
//! passes with no further activity the timer fires once and stays disarmed
//! until the next segment.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct TimerState {
    deadline: Option<Instant>,
    last_activity: Option<Instant>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

pub(crate) struct TurnTimer {
    shared: Arc<Shared>,
    timeout: Duration,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TurnTimer {
    /// Start the timer thread. `on_fire` receives the silence length.
    pub(crate) fn spawn<F>(timeout: Duration, on_fire: F) -> std::io::Result<Self>
    where
        F: Fn(Duration) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                deadline: None,
                last_activity: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("talkscriber-turn-timer".into())
            .spawn(move || run(&thread_shared, on_fire))?;
        Ok(Self {
            shared,
            timeout,
            join: Mutex::new(Some(join)),
        })
    }

    /// Record activity now and push the deadline out.
    pub(crate) fn arm(&self) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.last_activity = Some(now);
        state.deadline = Some(now + self.timeout);
        self.shared.wake.notify_one();
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stop the thread. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadline = None;
        }
        self.shared.wake.notify_one();
        let join = self.join.lock().take();
        if let Some(join) = join {
            // The callback may be the one shutting us down.
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for TurnTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F: Fn(Duration)>(shared: &Shared, on_fire: F) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.deadline {
            None => shared.wake.wait(&mut state),
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    shared.wake.wait_until(&mut state, deadline);
                    continue;
                }
                state.deadline = None;
                let silence = state
                    .last_activity
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                // Fire without the lock so the callback may re-arm.
                parking_lot::MutexGuard::unlocked(&mut state, || on_fire(silence));
            }
        }
    }
    debug!("turn timer stopped");
}
