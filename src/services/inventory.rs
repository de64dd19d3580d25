//! Inventory cache service
//!
//! Owns the one background refresh loop. Every tick opens a fresh session
//! adapter, fetches a template and publishes a new immutable snapshot by
//! swapping the shared pointer. Readers clone the `Arc` and never wait on a
//! ledger round trip.

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::background::{LoopState, LoopThread};
use crate::adapters::LedgerConnection;
use crate::config::InventoryConfig;
use crate::domain::InventorySnapshot;
use crate::error::{LedgerError, Result};

/// How loudly to report the n-th consecutive refresh failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureSeverity {
    Warn,
    Error,
    Quiet,
}

fn failure_severity(consecutive: u32) -> FailureSeverity {
    match consecutive {
        1 => FailureSeverity::Warn,
        2 | 3 => FailureSeverity::Error,
        n if n % 5 == 0 => FailureSeverity::Error,
        _ => FailureSeverity::Quiet,
    }
}

struct CacheInner {
    connection: Arc<LedgerConnection>,
    config: InventoryConfig,
    /// Held only to clone or swap the pointer; fetches happen outside it
    current: RwLock<Arc<InventorySnapshot>>,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    refresh_count: AtomicU64,
    state: Mutex<LoopState>,
}

impl CacheInner {
    fn refresh(&self) -> Result<Arc<InventorySnapshot>> {
        let session = self.connection.session("inventory");
        match session.fetch_template() {
            Ok(template) => {
                let snapshot = Arc::new(InventorySnapshot::from_template(
                    &template,
                    self.config.stale_after(),
                ));
                let published = self.publish(snapshot);
                self.record_success(&published);
                Ok(published)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Swap in `snapshot` unless a newer one is already current
    fn publish(&self, snapshot: Arc<InventorySnapshot>) -> Arc<InventorySnapshot> {
        let mut current = self.current.write();
        if snapshot.fetched_at < current.fetched_at {
            debug!("Discarding older snapshot from a concurrent refresh");
            return Arc::clone(&current);
        }
        *current = Arc::clone(&snapshot);
        snapshot
    }

    fn record_success(&self, snapshot: &InventorySnapshot) {
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        *self.last_error.lock() = None;
        if previous > 0 {
            info!(
                "Inventory refresh recovered after {} consecutive failures",
                previous
            );
        }
        debug!(
            "Inventory refreshed: {} toners, {} media",
            snapshot.toner_balances.len(),
            snapshot.media_options.len()
        );
    }

    fn record_failure(&self, err: &LedgerError) {
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_error.lock() = Some(err.to_string());
        match failure_severity(consecutive) {
            FailureSeverity::Warn => warn!("Inventory refresh failed: {}", err),
            FailureSeverity::Error => error!(
                "Inventory refresh failed ({} consecutive): {}",
                consecutive, err
            ),
            FailureSeverity::Quiet => debug!(
                "Inventory refresh failed ({} consecutive): {}",
                consecutive, err
            ),
        }
    }

    /// One background tick. Never panics out of the loop.
    fn tick(&self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.refresh()));
        if outcome.is_err() {
            self.record_failure(&LedgerError::Internal("inventory refresh panicked".into()));
        }
    }
}

/// Shared inventory cache. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct InventoryCache {
    inner: Arc<CacheInner>,
}

impl InventoryCache {
    pub fn new(connection: Arc<LedgerConnection>, config: InventoryConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                connection,
                config,
                current: RwLock::new(Arc::new(InventorySnapshot::empty())),
                consecutive_failures: AtomicU32::new(0),
                last_error: Mutex::new(None),
                refresh_count: AtomicU64::new(0),
                state: Mutex::new(LoopState::Stopped),
            }),
        }
    }

    /// Start the background refresh loop. Calling twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.is_running() {
            warn!("Inventory cache already running");
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let thread = LoopThread::spawn(
            "inventory-refresh",
            self.inner.config.refresh_interval(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.tick();
                }
            },
        )?;
        *state = LoopState::Running(thread);
        info!(
            "Inventory cache started (refresh every {:?})",
            self.inner.config.refresh_interval()
        );
        Ok(())
    }

    /// Stop the loop, waiting at most the configured stop timeout.
    ///
    /// Returns false if the thread had to be detached.
    pub fn stop(&self) -> bool {
        let Some(thread) = self.inner.state.lock().take_running() else {
            debug!("Inventory cache not running");
            return true;
        };
        thread.stop(self.inner.config.stop_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().is_running()
    }

    /// The current snapshot. Always returns a value.
    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        Arc::clone(&self.inner.current.read())
    }

    /// Fetch and publish synchronously in the calling thread
    pub fn force_refresh(&self) -> Result<Arc<InventorySnapshot>> {
        self.inner.refresh()
    }

    /// The current snapshot, refused when empty or too old to act on
    pub fn snapshot_or_not_ready(&self) -> Result<Arc<InventorySnapshot>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Err(LedgerError::InventoryNotReady(
                "no inventory has been fetched yet".to_string(),
            ));
        }
        let limit = self.inner.config.not_ready_after();
        if snapshot.age() > limit {
            return Err(LedgerError::InventoryNotReady(format!(
                "inventory is {}s old (limit {}s)",
                snapshot.age().as_secs(),
                limit.as_secs()
            )));
        }
        Ok(snapshot)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Successful refreshes since construction
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::Relaxed)
    }
}
