//! Periodic timer driving the raw-data collection tick
//!
//! The timer owns one dedicated thread. The thread sleeps on its control
//! channel against a monotonic deadline: a timeout is a tick, a message is
//! either a new interval or a stop request. The callback always runs on the
//! timer thread, never on the caller's.

use crate::error::{Result, SpeechError};
use crossbeam_channel::{self as cb, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Largest interval accepted, matching a signed 32-bit millisecond count
pub const MAX_INTERVAL_MS: u64 = i32::MAX as u64;

const TIMER_THREAD_NAME: &str = "aifw_timer";

type TimerCallback = Box<dyn FnMut() + Send>;

enum TimerCommand {
    Reprogram(Duration),
    Stop,
}

pub struct PeriodicTimer {
    callback: Arc<Mutex<TimerCallback>>,
    interval_ms: u64,
    enabled: bool,
    control: Option<cb::Sender<TimerCommand>>,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl PeriodicTimer {
    /// Create a disabled timer firing `callback` every `interval_ms` once started
    pub fn create<F>(callback: F, interval_ms: u64) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        validate_interval(interval_ms)?;
        Ok(Self {
            callback: Arc::new(Mutex::new(Box::new(callback))),
            interval_ms,
            enabled: false,
            control: None,
            thread: None,
            thread_id: None,
        })
    }

    pub fn interval(&self) -> u64 {
        self.interval_ms
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Spawn the timer thread and arm it. No-op when already enabled.
    pub fn start(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        let (tx, rx) = cb::unbounded();
        let callback = Arc::clone(&self.callback);
        let period = Duration::from_millis(self.interval_ms);

        let handle = thread::Builder::new()
            .name(TIMER_THREAD_NAME.to_string())
            .spawn(move || run_timer(rx, period, callback))
            .map_err(|e| SpeechError::Timer(format!("Failed to spawn timer thread: {}", e)))?;

        self.thread_id = Some(handle.thread().id());
        self.thread = Some(handle);
        self.control = Some(tx);
        self.enabled = true;
        log::info!("Timer started with {}ms interval", self.interval_ms);
        Ok(())
    }

    /// Reprogram the period. Arms the timer the first time it is called.
    pub fn change_interval(&mut self, interval_ms: u64) -> Result<()> {
        validate_interval(interval_ms)?;
        self.interval_ms = interval_ms;

        if !self.enabled {
            return self.start();
        }

        let sent = self
            .control
            .as_ref()
            .map(|tx| tx.send(TimerCommand::Reprogram(Duration::from_millis(interval_ms))).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(SpeechError::Timer(
                "Timer thread is no longer listening".to_string(),
            ));
        }

        log::debug!("Timer interval changed to {}ms", interval_ms);
        Ok(())
    }

    /// Tear down the timer thread. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.enabled = false;

        if let Some(tx) = self.control.take() {
            // A dead thread has already torn itself down
            let _ = tx.send(TimerCommand::Stop);
        }

        let thread_id = self.thread_id.take();
        if let Some(handle) = self.thread.take() {
            if thread_id == Some(thread::current().id()) {
                // Stopped from inside the callback; the loop exits on its own
                log::debug!("Timer stopped from its own thread, not joining");
            } else if handle.join().is_err() {
                log::error!("Timer thread panicked during teardown");
            }
        }

        log::info!("Timer stopped");
        Ok(())
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Timer teardown failed: {}", e);
        }
    }
}

fn validate_interval(interval_ms: u64) -> Result<()> {
    if interval_ms == 0 || interval_ms > MAX_INTERVAL_MS {
        return Err(SpeechError::InvalidArgument(format!(
            "Timer interval must be within 1..={}ms, got {}",
            MAX_INTERVAL_MS, interval_ms
        )));
    }
    Ok(())
}

fn run_timer(rx: cb::Receiver<TimerCommand>, period: Duration, callback: Arc<Mutex<TimerCallback>>) {
    let mut period = period;
    let mut deadline = Instant::now() + period;

    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(TimerCommand::Reprogram(new_period)) => {
                period = new_period;
                deadline = Instant::now() + period;
            }
            Ok(TimerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                (callback.lock())();

                deadline += period;
                let now = Instant::now();
                if deadline <= now {
                    // Callback overran one or more periods; drop the missed ticks
                    deadline = now + period;
                }
            }
        }
    }

    log::debug!("Timer thread exiting");
}
