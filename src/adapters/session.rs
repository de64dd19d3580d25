use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::backend::SessionHandle;
use super::connection::LedgerConnection;
use super::status::StatusDocument;
use super::template::LedgerTemplate;
use crate::error::{LedgerError, Result};

/// Lightweight per-caller adapter over the shared connection.
///
/// Every refresh tick, job worker and finalizer pass creates its own, so
/// per-call state never leaks between callers.
#[derive(Debug)]
pub struct LedgerSession {
    connection: Arc<LedgerConnection>,
    label: String,
}

impl LedgerSession {
    pub(crate) fn new(connection: Arc<LedgerConnection>, label: impl Into<String>) -> Self {
        Self {
            connection,
            label: label.into(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.connection.handle()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Most recent failure text reported by the ledger
    pub fn last_error(&self) -> Option<String> {
        self.connection
            .backend()
            .last_error(self.handle())
            .filter(|e| !e.trim().is_empty())
    }

    fn failure_text(&self, fallback: &str) -> String {
        self.last_error().unwrap_or_else(|| fallback.to_string())
    }

    /// Fetch and classify a fresh template. Never served from cache.
    pub fn fetch_template(&self) -> Result<LedgerTemplate> {
        let raw = self
            .connection
            .backend()
            .new_template(self.handle())
            .ok_or_else(|| {
                LedgerError::TemplateFetch(self.failure_text("ledger returned no template"))
            })?;
        let template = LedgerTemplate::parse(&raw)?;
        debug!(
            "[{}] Template fetched: {} accounts",
            self.label,
            template.accounts().len()
        );
        Ok(template)
    }

    /// Submit a payload and return the ledger's job handle
    pub fn submit(&self, payload: &str) -> Result<u64> {
        let job_handle = self.connection.backend().submit(self.handle(), payload);
        if job_handle == 0 {
            return Err(LedgerError::Submission(
                self.failure_text("ledger returned no job handle"),
            ));
        }
        debug!("[{}] Submitted, job handle {}", self.label, job_handle);
        Ok(job_handle)
    }

    /// Current status, `None` while the ledger has nothing to report yet
    pub fn status(&self, job_handle: u64) -> Result<Option<StatusDocument>> {
        match self.connection.backend().status(self.handle(), job_handle) {
            Some(raw) => StatusDocument::parse(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Poll until a final status or the timeout elapses.
    ///
    /// An unreadable status document counts as "not ready" and polling
    /// continues. Timing out does not cancel anything on the ledger side.
    pub fn wait_for_final(
        &self,
        job_handle: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<StatusDocument> {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            match self.status(job_handle) {
                Ok(Some(status)) if status.is_final => {
                    debug!(
                        "[{}] Final status after {} polls: {}",
                        self.label, polls, status.status
                    );
                    return Ok(status);
                }
                Ok(Some(status)) => {
                    trace!("[{}] Job {} not final: {}", self.label, job_handle, status.status);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "[{}] Unreadable status for job {}, still waiting: {}",
                        self.label, job_handle, e
                    );
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LedgerError::SettlementTimeout {
                    job_handle,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            std::thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::backend::MockLedgerBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connect(mut backend: MockLedgerBackend) -> Arc<LedgerConnection> {
        backend
            .expect_open()
            .returning(|| SessionHandle::from_raw(1));
        backend.expect_close().return_const(());
        LedgerConnection::open(Arc::new(backend)).unwrap()
    }

    #[test]
    fn test_submit_zero_handle_reports_last_error() {
        let mut backend = MockLedgerBackend::new();
        backend.expect_submit().returning(|_, _| 0);
        backend
            .expect_last_error()
            .returning(|_| Some("Insufficient balance".to_string()));

        let session = connect(backend).session("test");
        match session.submit("{}") {
            Err(LedgerError::Submission(msg)) => assert_eq!(msg, "Insufficient balance"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_template_falls_back_to_generic_text() {
        let mut backend = MockLedgerBackend::new();
        backend.expect_new_template().returning(|_| None);
        backend.expect_last_error().returning(|_| Some("  ".to_string()));

        let session = connect(backend).session("test");
        match session.fetch_template() {
            Err(LedgerError::TemplateFetch(msg)) => assert!(msg.contains("no template")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wait_for_final_skips_not_ready_and_non_final() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut backend = MockLedgerBackend::new();
        backend.expect_status().returning(move |_, _| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => None,
                1 => Some(r#"{"final": false, "status": "processing"}"#.to_string()),
                _ => Some(
                    r#"{"final": true, "status": "completed", "transactionSuccess": true}"#
                        .to_string(),
                ),
            }
        });

        let session = connect(backend).session("test");
        let status = session
            .wait_for_final(9, Duration::from_secs(2), Duration::from_millis(5))
            .unwrap();
        assert!(status.is_final);
        assert!(status.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wait_for_final_keeps_polling_past_garbled_status() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut backend = MockLedgerBackend::new();
        backend.expect_status().returning(move |_, _| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Some("garbled{".to_string()),
                _ => Some(
                    r#"{"final": true, "status": "completed", "transactionSuccess": true}"#
                        .to_string(),
                ),
            }
        });

        let session = connect(backend).session("test");
        let status = session
            .wait_for_final(4, Duration::from_secs(2), Duration::from_millis(5))
            .unwrap();
        assert!(status.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_for_final_times_out_as_unknown_outcome() {
        let mut backend = MockLedgerBackend::new();
        backend.expect_status().returning(|_, _| None);

        let session = connect(backend).session("test");
        let started = Instant::now();
        let err = session
            .wait_for_final(3, Duration::from_millis(100), Duration::from_millis(250))
            .unwrap_err();
        assert!(err.is_outcome_unknown());
        // Sleeps are capped by the remaining budget
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
