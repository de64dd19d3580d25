//! Settlement finalizer background service
//!
//! Reconciles jobs that were reported as "submitted" before the ledger
//! settled them:
//! - Polls every tracked job handle on a fixed interval
//! - Records the final outcome and refreshes inventory once a job settles
//! - Drops handles that never settle as orphaned
//! - Discards settled outcomes nobody took within the settle timeout

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::background::{LoopState, LoopThread};
use super::inventory::InventoryCache;
use crate::adapters::LedgerConnection;
use crate::config::FinalizerConfig;
use crate::domain::{describe_ledger_failure, FrozenOrder, JobId, JobResult};
use crate::error::Result;

/// A provisionally reported job awaiting final settlement
#[derive(Debug, Clone)]
pub struct TrackedSettlement {
    pub job_id: JobId,
    pub job_handle: u64,
    pub order: FrozenOrder,
    pub submitted_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub check_count: u32,
}

/// Finalizer statistics
#[derive(Debug, Clone, Default)]
pub struct FinalizerStats {
    pub settlements_checked: u64,
    pub settled: u64,
    pub failed: u64,
    pub orphaned: u64,
    /// Settled outcomes discarded because nobody took them
    pub expired: u64,
    pub errors: u64,
    pub last_check: Option<DateTime<Utc>>,
}

struct FinalizerInner {
    connection: Arc<LedgerConnection>,
    inventory: InventoryCache,
    config: FinalizerConfig,
    tracked: Mutex<HashMap<JobId, TrackedSettlement>>,
    settled: Mutex<HashMap<JobId, (JobResult, DateTime<Utc>)>>,
    stats: Mutex<FinalizerStats>,
    state: Mutex<LoopState>,
}

impl FinalizerInner {
    fn run_check_cycle(&self) -> usize {
        let now = Utc::now();
        self.expire_unclaimed(now);
        let pending: Vec<TrackedSettlement> = self.tracked.lock().values().cloned().collect();
        if pending.is_empty() {
            self.stats.lock().last_check = Some(now);
            return 0;
        }

        debug!("Checking {} pending settlements", pending.len());
        let session = self.connection.session("finalizer");
        let mut checked = 0u64;
        let mut settled = 0u64;
        let mut failed = 0u64;
        let mut orphaned = 0u64;
        let mut errors = 0u64;

        for entry in pending {
            checked += 1;

            let age = (now - entry.submitted_at).to_std().unwrap_or_default();
            if age > self.config.settle_timeout() {
                orphaned += 1;
                warn!(
                    "Job {} (handle {}) never settled after {}s; outcome unknown",
                    entry.job_id,
                    entry.job_handle,
                    age.as_secs()
                );
                self.resolve(
                    &entry,
                    JobResult::failed(
                        entry.job_id,
                        "No final settlement was reported by the ledger. The outcome is \
                         unknown; check inventory before resubmitting.",
                        entry.order.estimated_cost(),
                        Some(entry.job_handle),
                    ),
                );
                continue;
            }

            match session.status(entry.job_handle) {
                Ok(Some(status)) if status.is_final => {
                    let result = if status.is_success() {
                        settled += 1;
                        JobResult::completed(
                            entry.job_id,
                            status.ledger_entries(&entry.job_handle.to_string()),
                            entry.order.estimated_cost(),
                            Some(entry.job_handle),
                        )
                    } else {
                        failed += 1;
                        JobResult::failed(
                            entry.job_id,
                            describe_ledger_failure(&status.failure_text()),
                            entry.order.estimated_cost(),
                            Some(entry.job_handle),
                        )
                    };
                    info!("Job {} settled: {}", entry.job_id, result.status);
                    self.resolve(&entry, result);
                }
                Ok(_) => {
                    if let Some(tracked) = self.tracked.lock().get_mut(&entry.job_id) {
                        tracked.last_checked = Some(now);
                        tracked.check_count += 1;
                    }
                }
                Err(e) => {
                    errors += 1;
                    error!("Error checking settlement of job {}: {}", entry.job_id, e);
                }
            }
        }

        if settled + failed > 0 {
            // Balances moved on the ledger; make them visible to readers
            if let Err(e) = self.inventory.force_refresh() {
                warn!("Post-settlement inventory refresh failed: {}", e);
            }
        }

        let mut stats = self.stats.lock();
        stats.settlements_checked += checked;
        stats.settled += settled;
        stats.failed += failed;
        stats.orphaned += orphaned;
        stats.errors += errors;
        stats.last_check = Some(now);

        (settled + failed + orphaned) as usize
    }

    fn resolve(&self, entry: &TrackedSettlement, result: JobResult) {
        self.settled
            .lock()
            .insert(entry.job_id, (result, Utc::now()));
        self.tracked.lock().remove(&entry.job_id);
    }

    fn expire_unclaimed(&self, now: DateTime<Utc>) {
        let limit = self.config.settle_timeout();
        let mut settled = self.settled.lock();
        let before = settled.len();
        settled.retain(|job_id, (_, settled_at)| {
            let keep = (now - *settled_at).to_std().unwrap_or_default() <= limit;
            if !keep {
                debug!("Discarding unclaimed settlement of job {}", job_id);
            }
            keep
        });
        let expired = (before - settled.len()) as u64;
        drop(settled);
        if expired > 0 {
            warn!("Discarded {} settled outcomes nobody took", expired);
            self.stats.lock().expired += expired;
        }
    }

    fn tick(&self) {
        if catch_unwind(AssertUnwindSafe(|| self.run_check_cycle())).is_err() {
            error!("Settlement check cycle panicked");
            self.stats.lock().errors += 1;
        }
    }
}

/// Background reconciler for provisionally reported jobs
#[derive(Clone)]
pub struct AsyncFinalizer {
    inner: Arc<FinalizerInner>,
}

impl AsyncFinalizer {
    pub fn new(
        connection: Arc<LedgerConnection>,
        inventory: InventoryCache,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(FinalizerInner {
                connection,
                inventory,
                config,
                tracked: Mutex::new(HashMap::new()),
                settled: Mutex::new(HashMap::new()),
                stats: Mutex::new(FinalizerStats::default()),
                state: Mutex::new(LoopState::Stopped),
            }),
        }
    }

    /// Start tracking a submitted job handle
    pub fn track(&self, job_id: JobId, job_handle: u64, order: FrozenOrder) {
        info!("Tracking settlement of job {} (handle {})", job_id, job_handle);
        self.inner.tracked.lock().insert(
            job_id,
            TrackedSettlement {
                job_id,
                job_handle,
                order,
                submitted_at: Utc::now(),
                last_checked: None,
                check_count: 0,
            },
        );
    }

    pub fn untrack(&self, job_id: &JobId) -> bool {
        let removed = self.inner.tracked.lock().remove(job_id).is_some();
        if removed {
            debug!("Untracked settlement of job {}", job_id);
        }
        removed
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    pub fn is_tracking(&self, job_id: &JobId) -> bool {
        self.inner.tracked.lock().contains_key(job_id)
    }

    /// Take the reconciled outcome of a job, once
    pub fn take_settlement(&self, job_id: &JobId) -> Option<JobResult> {
        self.inner
            .settled
            .lock()
            .remove(job_id)
            .map(|(result, _)| result)
    }

    /// Settled outcomes waiting to be taken
    pub fn settled_count(&self) -> usize {
        self.inner.settled.lock().len()
    }

    pub fn stats(&self) -> FinalizerStats {
        self.inner.stats.lock().clone()
    }

    /// Run one check cycle in the calling thread. Returns jobs resolved.
    pub fn check_now(&self) -> usize {
        self.inner.run_check_cycle()
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.is_running() {
            warn!("Settlement finalizer already running");
            return Ok(());
        }

        info!(
            "Starting settlement finalizer (interval: {:?}, orphan threshold: {:?})",
            self.inner.config.poll_interval(),
            self.inner.config.settle_timeout()
        );
        let weak = Arc::downgrade(&self.inner);
        let thread = LoopThread::spawn(
            "settlement-finalizer",
            self.inner.config.poll_interval(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.tick();
                }
            },
        )?;
        *state = LoopState::Running(thread);
        Ok(())
    }

    pub fn stop(&self) -> bool {
        let Some(thread) = self.inner.state.lock().take_running() else {
            return true;
        };
        let pending = self.tracked_count();
        if pending > 0 {
            warn!("Settlement finalizer stopping with {} jobs unsettled", pending);
        }
        thread.stop(self.inner.config.stop_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedLedger;
    use crate::config::InventoryConfig;
    use crate::domain::{JobStatus, Order, OrderChoices, OrderEstimate};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn order() -> FrozenOrder {
        Order::new("finalize")
            .with_choices(OrderChoices {
                quantity: 1,
                color_mode: "cmyk".to_string(),
                media_id: "mint-media-matte-a4".to_string(),
                media_display_name: "Matte A4".to_string(),
                turnaround_time: "standard".to_string(),
                quality: "standard".to_string(),
                notes: String::new(),
            })
            .with_estimate(OrderEstimate {
                sheets_required: 4,
                toner_usage: HashMap::from([("black".to_string(), 3.0)]),
                estimated_cost: Decimal::new(199, 2),
            })
            .freeze()
            .unwrap()
    }

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        connection: Arc<LedgerConnection>,
        inventory: InventoryCache,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(SimulatedLedger::demo());
        let connection = LedgerConnection::open(ledger.clone()).unwrap();
        let inventory = InventoryCache::new(Arc::clone(&connection), InventoryConfig::default());
        Fixture {
            ledger,
            connection,
            inventory,
        }
    }

    fn submit(fx: &Fixture, order: &FrozenOrder) -> u64 {
        let session = fx.connection.session("test");
        let mut template = session.fetch_template().unwrap();
        template.apply_order(order).unwrap();
        session.submit(&template.to_payload().unwrap()).unwrap()
    }

    #[test]
    fn test_settlement_refreshes_inventory() {
        let fx = fixture();
        fx.ledger.settle_after_polls(1);
        let finalizer = AsyncFinalizer::new(
            Arc::clone(&fx.connection),
            fx.inventory.clone(),
            FinalizerConfig::default(),
        );
        let order = order();
        let job_id = JobId::new();
        finalizer.track(job_id, submit(&fx, &order), order);

        assert_eq!(finalizer.check_now(), 0);
        assert!(finalizer.is_tracking(&job_id));
        assert_eq!(fx.inventory.refresh_count(), 0);

        assert_eq!(finalizer.check_now(), 1);
        assert!(!finalizer.is_tracking(&job_id));
        assert_eq!(fx.inventory.refresh_count(), 1);
        let black = fx.inventory.snapshot().toner_by_color("black").unwrap().balance_ml;
        assert_eq!(black, 747.0);

        let result = finalizer.take_settlement(&job_id).unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.ledger_entries.len(), 2);
        assert!(finalizer.take_settlement(&job_id).is_none());

        let stats = finalizer.stats();
        assert_eq!(stats.settled, 1);
        assert_eq!(stats.settlements_checked, 2);
    }

    #[test]
    fn test_failed_settlement_carries_friendly_note() {
        let fx = fixture();
        fx.ledger.set_balance("mint-toner-black", 0.5);
        let finalizer = AsyncFinalizer::new(
            Arc::clone(&fx.connection),
            fx.inventory.clone(),
            FinalizerConfig::default(),
        );
        let order = order();
        let job_id = JobId::new();
        finalizer.track(job_id, submit(&fx, &order), order);

        finalizer.check_now();
        let result = finalizer.take_settlement(&job_id).unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.notes.starts_with("Insufficient inventory"));
        assert_eq!(finalizer.stats().failed, 1);
    }

    #[test]
    fn test_orphaned_handles_are_dropped() {
        let fx = fixture();
        fx.ledger.never_settle(true);
        let config = FinalizerConfig {
            settle_timeout_ms: 0,
            ..FinalizerConfig::default()
        };
        let finalizer =
            AsyncFinalizer::new(Arc::clone(&fx.connection), fx.inventory.clone(), config);
        let order = order();
        let job_id = JobId::new();
        finalizer.track(job_id, submit(&fx, &order), order);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(finalizer.check_now(), 1);
        assert_eq!(finalizer.tracked_count(), 0);
        assert_eq!(finalizer.stats().orphaned, 1);
        let result = finalizer.take_settlement(&job_id).unwrap();
        assert!(result.notes.contains("unknown"));
    }

    #[test]
    fn test_unclaimed_settlements_expire() {
        let fx = fixture();
        fx.ledger.never_settle(true);
        let config = FinalizerConfig {
            settle_timeout_ms: 0,
            ..FinalizerConfig::default()
        };
        let finalizer =
            AsyncFinalizer::new(Arc::clone(&fx.connection), fx.inventory.clone(), config);
        let order = order();
        let job_id = JobId::new();
        finalizer.track(job_id, submit(&fx, &order), order);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(finalizer.check_now(), 1);
        assert_eq!(finalizer.settled_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(finalizer.check_now(), 0);
        assert_eq!(finalizer.settled_count(), 0);
        assert!(finalizer.take_settlement(&job_id).is_none());
        assert_eq!(finalizer.stats().expired, 1);
    }

    #[test]
    fn test_background_loop_settles_tracked_jobs() {
        let fx = fixture();
        let config = FinalizerConfig {
            poll_interval_ms: 10,
            ..FinalizerConfig::default()
        };
        let finalizer =
            AsyncFinalizer::new(Arc::clone(&fx.connection), fx.inventory.clone(), config);
        finalizer.start().unwrap();

        let order = order();
        let job_id = JobId::new();
        finalizer.track(job_id, submit(&fx, &order), order);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while finalizer.is_tracking(&job_id) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(finalizer.stop());
        assert!(finalizer.take_settlement(&job_id).is_some());
    }

    #[test]
    fn test_untrack() {
        let fx = fixture();
        let finalizer = AsyncFinalizer::new(
            Arc::clone(&fx.connection),
            fx.inventory.clone(),
            FinalizerConfig::default(),
        );
        let job_id = JobId::new();
        finalizer.track(job_id, 99, order());
        assert!(finalizer.untrack(&job_id));
        assert!(!finalizer.untrack(&job_id));
    }
}
