//! Lifecycle for a named background loop thread.
//!
//! The loop runs one tick immediately, then one per interval, and wakes as
//! soon as it is told to stop. Stopping waits a bounded time for the thread
//! to exit and detaches it if it does not.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{LedgerError, Result};

pub(crate) struct LoopThread {
    name: String,
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
    handle: thread::JoinHandle<()>,
}

impl LoopThread {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                info!("[{}] loop started", thread_name);
                loop {
                    tick();
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("[{}] loop stopped", thread_name);
                let _ = done_tx.send(());
            })
            .map_err(|e| LedgerError::Internal(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            stop_tx,
            done_rx,
            handle,
        })
    }

    /// Signal the loop and wait up to `timeout`. Returns whether it exited.
    pub(crate) fn stop(self, timeout: Duration) -> bool {
        let _ = self.stop_tx.send(());
        match self.done_rx.recv_timeout(timeout) {
            // Disconnected means the thread ended without reporting: it panicked
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    error!("[{}] loop thread panicked", self.name);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[{}] did not stop within {:?}; detaching thread",
                    self.name, timeout
                );
                false
            }
        }
    }
}

/// Running/stopped slot for a service that owns one loop thread
pub(crate) enum LoopState {
    Stopped,
    Running(LoopThread),
}

impl LoopState {
    pub(crate) fn is_running(&self) -> bool {
        matches!(self, LoopState::Running(_))
    }

    pub(crate) fn take_running(&mut self) -> Option<LoopThread> {
        match std::mem::replace(self, LoopState::Stopped) {
            LoopState::Running(thread) => Some(thread),
            LoopState::Stopped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_ticks_immediately_and_stops_promptly() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let thread = LoopThread::spawn("test-loop", Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        assert!(thread.stop(Duration::from_secs(5)));
        // The long interval does not delay shutdown
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stop_times_out_on_stuck_tick() {
        let thread = LoopThread::spawn("stuck-loop", Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!thread.stop(Duration::from_millis(50)));
    }
}
