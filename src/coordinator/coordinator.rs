//! Job coordinator: one isolated worker thread per submitted job
//!
//! Each worker owns its frozen order and its own session adapter, fetches
//! an authoritative template (never the cached snapshot), writes the
//! expenditures, submits, then either waits for settlement or hands the
//! ledger job handle to the finalizer. Whatever happens, the worker deposits
//! exactly one result in the store before it exits.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

use super::config::CoordinatorConfig;
use super::state::{ActiveJob, JobPoll, WorkerSlot};
use crate::adapters::{LedgerConnection, LedgerSession};
use crate::config::SettlementMode;
use crate::domain::{describe_ledger_failure, FrozenOrder, JobId, JobProgress, JobResult, JobStatus};
use crate::error::{LedgerError, Result};
use crate::services::{AsyncFinalizer, ResultStore};

/// Everything a worker needs, cloned into its thread
#[derive(Clone)]
struct WorkerContext {
    connection: Arc<LedgerConnection>,
    results: Arc<ResultStore>,
    finalizer: Option<AsyncFinalizer>,
    config: CoordinatorConfig,
}

impl WorkerContext {
    fn run(&self, job_id: JobId, order: FrozenOrder) {
        let span = info_span!("job", id = %job_id.short());
        let _enter = span.enter();
        let started = Instant::now();

        let result = match catch_unwind(AssertUnwindSafe(|| self.process(job_id, &order))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("Job failed: {}", e);
                failure_result(job_id, &e, &order)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Worker panicked: {}", reason);
                JobResult::failed(
                    job_id,
                    format!("Job processing failed: worker panicked: {reason}"),
                    order.estimated_cost(),
                    None,
                )
            }
        };

        info!(
            "Job finished as {} in {}ms",
            result.status,
            started.elapsed().as_millis()
        );
        self.results.put(result);
    }

    fn process(&self, job_id: JobId, order: &FrozenOrder) -> Result<JobResult> {
        let mut progress = JobProgress::new();
        let session = self.connection.session(format!("job-{}", job_id.short()));
        info!("Processing '{}'", order.job_name());

        // Always fetch fresh: cached inventory may already be spent
        let mut template = session.fetch_template()?;
        let summary = template.apply_order(order)?;
        debug!(
            "Payload: {} accounts, {} toner matched, {} media matched, {} zeroed",
            summary.accounts, summary.toner_matched, summary.media_matched, summary.zeroed
        );
        if !summary.unmatched_colors.is_empty() {
            warn!(
                "No toner account for colors {:?}; submitting zero for them",
                summary.unmatched_colors
            );
        }
        if summary.media_matched == 0 && order.sheets_required() > 0 {
            warn!("Media account '{}' not found in template", order.media_id());
        }

        let job_handle = session.submit(&template.to_payload()?)?;
        info!("Submitted as ledger job {}", job_handle);

        // The ledger holds the job from here on; no error may drop the handle
        match self.settle(&session, job_id, job_handle, order, &mut progress) {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Job {} lost track of ledger job {}: {}", job_id, job_handle, e);
                Ok(unknown_outcome_result(job_id, job_handle, &e, order))
            }
        }
    }

    fn settle(
        &self,
        session: &LedgerSession,
        job_id: JobId,
        job_handle: u64,
        order: &FrozenOrder,
        progress: &mut JobProgress,
    ) -> Result<JobResult> {
        progress.advance(JobStatus::Submitted)?;
        match self.config.settlement {
            SettlementMode::Provisional => {
                let finalizer = self.finalizer.as_ref().ok_or_else(|| {
                    LedgerError::InvalidConfig(
                        "provisional settlement requires a finalizer".to_string(),
                    )
                })?;
                finalizer.track(job_id, job_handle, order.clone());
                Ok(JobResult::submitted(
                    job_id,
                    job_handle,
                    order.estimated_cost(),
                ))
            }
            SettlementMode::Blocking => {
                let status = session.wait_for_final(
                    job_handle,
                    self.config.timeout,
                    self.config.poll_interval,
                )?;
                if status.is_success() {
                    progress.advance(JobStatus::Completed)?;
                    Ok(JobResult::completed(
                        job_id,
                        status.ledger_entries(&job_handle.to_string()),
                        order.estimated_cost(),
                        Some(job_handle),
                    ))
                } else {
                    progress.advance(JobStatus::Failed)?;
                    warn!("Ledger rejected job: {}", status.failure_text());
                    Ok(JobResult::failed(
                        job_id,
                        describe_ledger_failure(&status.failure_text()),
                        order.estimated_cost(),
                        Some(job_handle),
                    ))
                }
            }
        }
    }
}

/// Failure before the ledger accepted the job
fn failure_result(job_id: JobId, err: &LedgerError, order: &FrozenOrder) -> JobResult {
    let notes = match err {
        LedgerError::Submission(reason) => describe_ledger_failure(reason),
        other => describe_ledger_failure(&other.to_string()),
    };
    JobResult::failed(job_id, notes, order.estimated_cost(), None)
}

/// Failure after the ledger accepted the job: it may still complete
fn unknown_outcome_result(
    job_id: JobId,
    job_handle: u64,
    err: &LedgerError,
    order: &FrozenOrder,
) -> JobResult {
    let notes = match err {
        LedgerError::SettlementTimeout { elapsed_ms, .. } => format!(
            "Job submission timed out after {elapsed_ms}ms without a final ledger status. \
             The outcome is unknown and the ledger may still complete it; check \
             inventory before retrying."
        ),
        other => format!(
            "Job processing failed after the ledger accepted it ({other}). The outcome \
             is unknown and the ledger may still complete it; check inventory before \
             retrying."
        ),
    };
    JobResult::failed(job_id, notes, order.estimated_cost(), Some(job_handle))
}

struct CoordinatorInner {
    context: WorkerContext,
    workers: DashMap<JobId, WorkerSlot>,
    /// Consumption time per job, pruned after the configured retention
    consumed: DashMap<JobId, DateTime<Utc>>,
    accepting: AtomicBool,
}

/// Spawns and tracks job workers. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl JobCoordinator {
    pub fn new(
        connection: Arc<LedgerConnection>,
        results: Arc<ResultStore>,
        finalizer: Option<AsyncFinalizer>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        if config.settlement == SettlementMode::Provisional && finalizer.is_none() {
            return Err(LedgerError::InvalidConfig(
                "provisional settlement requires a finalizer".to_string(),
            ));
        }
        info!(
            "Job coordinator ready (settlement: {}, timeout: {:?})",
            config.settlement, config.timeout
        );
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                context: WorkerContext {
                    connection,
                    results,
                    finalizer,
                    config,
                },
                workers: DashMap::new(),
                consumed: DashMap::new(),
                accepting: AtomicBool::new(true),
            }),
        })
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.inner.context.results
    }

    pub fn settlement_mode(&self) -> SettlementMode {
        self.inner.context.config.settlement
    }

    /// Spawn a worker for `order` and return its id immediately
    pub fn submit(&self, order: FrozenOrder) -> Result<JobId> {
        self.submit_with_id(JobId::new(), order)
    }

    /// Like `submit`, with a caller-chosen id
    pub fn submit_with_id(&self, job_id: JobId, order: FrozenOrder) -> Result<JobId> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(LedgerError::Validation(
                "job coordinator is shut down".to_string(),
            ));
        }
        self.prune_consumed();
        if self.inner.consumed.contains_key(&job_id) {
            return Err(LedgerError::Validation(format!("job id {job_id} already used")));
        }
        match self.inner.workers.entry(job_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(LedgerError::Validation(format!("job id {job_id} already used")));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(WorkerSlot::new(order.job_name()));
            }
        }

        let context = self.inner.context.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", job_id.short()))
            .spawn(move || context.run(job_id, order));

        match spawned {
            Ok(handle) => {
                if let Some(mut slot) = self.inner.workers.get_mut(&job_id) {
                    slot.handle = Some(handle);
                }
                debug!("Spawned worker for job {}", job_id);
                Ok(job_id)
            }
            Err(e) => {
                self.inner.workers.remove(&job_id);
                error!("Failed to spawn worker for job {}: {}", job_id, e);
                Err(LedgerError::Internal(format!("failed to spawn job worker: {e}")))
            }
        }
    }

    /// Whether the worker for `job_id` is still alive
    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.inner
            .workers
            .get(job_id)
            .map_or(false, |slot| slot.is_alive())
    }

    /// Poll for a result, distinguishing "still processing" from "consumed"
    pub fn poll(&self, job_id: &JobId) -> JobPoll {
        if let Some(result) = self.take_from_store(job_id) {
            return JobPoll::Ready(result);
        }
        if self.inner.consumed.contains_key(job_id) {
            return JobPoll::Consumed;
        }
        let alive = match self.inner.workers.get(job_id) {
            Some(slot) => slot.is_alive(),
            None => return JobPoll::Unknown,
        };
        if alive {
            return JobPoll::Running;
        }
        // The worker stores its result before exiting, so look once more
        match self.take_from_store(job_id) {
            Some(result) => JobPoll::Ready(result),
            None => JobPoll::Consumed,
        }
    }

    /// `Ok(Some)` once, `Ok(None)` while running, errors otherwise
    pub fn take_result(&self, job_id: &JobId) -> Result<Option<JobResult>> {
        match self.poll(job_id) {
            JobPoll::Ready(result) => Ok(Some(result)),
            JobPoll::Running => Ok(None),
            JobPoll::Consumed => Err(LedgerError::ResultAlreadyConsumed {
                job_id: job_id.to_string(),
            }),
            JobPoll::Unknown => Err(LedgerError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    fn take_from_store(&self, job_id: &JobId) -> Option<JobResult> {
        let result = self.inner.context.results.get(job_id)?;
        self.inner.consumed.insert(*job_id, Utc::now());
        // The worker is done or about to be; detach rather than join
        self.inner.workers.remove(job_id);
        Some(result)
    }

    /// Forget consumed jobs older than the retention window. Polling one
    /// afterwards reports `Unknown`. Returns how many were dropped.
    pub fn prune_consumed(&self) -> usize {
        let retention = self.inner.context.config.consumed_retention;
        let now = Utc::now();
        let before = self.inner.consumed.len();
        self.inner
            .consumed
            .retain(|_, consumed_at| (now - *consumed_at).to_std().unwrap_or_default() < retention);
        let pruned = before.saturating_sub(self.inner.consumed.len());
        if pruned > 0 {
            debug!("Pruned {} consumed job ids", pruned);
        }
        pruned
    }

    pub fn consumed_count(&self) -> usize {
        self.inner.consumed.len()
    }

    /// Jobs whose workers are still alive
    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.inner
            .workers
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| ActiveJob {
                job_id: *entry.key(),
                job_name: entry.value().job_name.clone(),
                submitted_at: entry.value().submitted_at,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|entry| entry.value().is_alive())
            .count()
    }

    /// Stop accepting jobs and wait for live workers, each up to the
    /// configured shutdown timeout. Returns how many were left running.
    pub fn shutdown(&self) -> usize {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let timeout = self.inner.context.config.shutdown_timeout;

        let ids: Vec<JobId> = self.inner.workers.iter().map(|e| *e.key()).collect();
        let slots: Vec<(JobId, WorkerSlot)> = ids
            .into_iter()
            .filter_map(|id| self.inner.workers.remove(&id))
            .collect();
        if slots.is_empty() {
            return 0;
        }

        info!("Waiting for {} job workers", slots.len());
        let mut stragglers = 0;
        for (job_id, mut slot) in slots {
            let Some(handle) = slot.handle.take() else {
                // Still being spawned; leave it registered
                self.inner.workers.insert(job_id, slot);
                continue;
            };
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Worker for job {} panicked outside its guard", job_id);
                }
            } else {
                stragglers += 1;
                warn!(
                    "Worker for job {} still running after {:?}; detaching",
                    job_id, timeout
                );
                slot.handle = Some(handle);
                self.inner.workers.insert(job_id, slot);
            }
        }
        stragglers
    }
}
