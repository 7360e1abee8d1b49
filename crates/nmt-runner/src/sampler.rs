use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampling interval must be greater than zero")]
    ZeroInterval,
    #[error("periodic sampler cannot be restarted")]
    NotRestartable,
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[source] io::Error),
}

enum SamplerState {
    Idle,
    Running(RunningSampler),
    Stopped,
}

struct RunningSampler {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    stopping: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RunningSampler {
    fn shutdown(self, grace: Duration) -> bool {
        self.stopping.store(true, Ordering::SeqCst);
        drop(self.stop_tx);
        match self.done_rx.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "periodic sampler did not stop within the grace period; abandoning it"
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
                true
            }
        }
    }
}

/// Background timer that runs a capture at every interval boundary.
///
/// One-shot: `start` once, `stop` any number of times. Dropping a running
/// sampler stops it.
pub struct PeriodicSampler {
    state: SamplerState,
    grace: Duration,
    captures: Arc<AtomicU64>,
}

impl PeriodicSampler {
    pub fn new(grace: Duration) -> Self {
        Self {
            state: SamplerState::Idle,
            grace,
            captures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns the timer thread. The first capture happens one full
    /// `interval` after this call, never immediately.
    pub fn start<F>(&mut self, interval: Duration, capture: F) -> Result<(), SamplerError>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(SamplerError::ZeroInterval);
        }
        if !matches!(self.state, SamplerState::Idle) {
            return Err(SamplerError::NotRestartable);
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = Arc::clone(&stopping);
        let captures = Arc::clone(&self.captures);
        let handle = thread::Builder::new()
            .name("nmt-sampler".to_string())
            .spawn(move || {
                sample_loop(interval, stop_rx, thread_stopping, captures, capture);
                drop(done_tx);
            })
            .map_err(SamplerError::Spawn)?;
        self.state = SamplerState::Running(RunningSampler {
            stop_tx,
            done_rx,
            stopping,
            handle,
        });
        Ok(())
    }

    /// Prevents further captures, lets an in-flight one finish and waits up
    /// to the grace period for the thread. Returns `false` if the thread had
    /// to be abandoned. Calling it again is a no-op.
    pub fn stop(&mut self) -> bool {
        match std::mem::replace(&mut self.state, SamplerState::Stopped) {
            SamplerState::Running(running) => running.shutdown(self.grace),
            SamplerState::Idle | SamplerState::Stopped => true,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self.state, SamplerState::Running(_))
    }

    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::SeqCst)
    }
}

impl Drop for PeriodicSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop<F: FnMut()>(
    interval: Duration,
    stop_rx: Receiver<()>,
    stopping: Arc<AtomicBool>,
    captures: Arc<AtomicU64>,
    mut capture: F,
) {
    let started = Instant::now();
    let mut tick: u32 = 1;
    loop {
        let Some(offset) = interval.checked_mul(tick) else {
            break;
        };
        match stop_rx.recv_deadline(started + offset) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        capture();
        captures.fetch_add(1, Ordering::SeqCst);
        tick = tick.saturating_add(1);
    }
    debug!(tick, "periodic sampler exiting");
}
