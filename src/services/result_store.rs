use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::domain::{JobId, JobResult};

/// Consume-once map from job id to its result.
///
/// The only genuinely shared mutable state between workers and callers.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: Mutex<HashMap<JobId, JobResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a job's result. A second result for the same id is ignored.
    pub fn put(&self, result: JobResult) {
        let mut results = self.results.lock();
        if results.contains_key(&result.job_id) {
            warn!(
                "Duplicate result for job {} ignored ({})",
                result.job_id, result.status
            );
            return;
        }
        debug!("Stored result for job {}: {}", result.job_id, result.status);
        results.insert(result.job_id, result);
    }

    /// Atomically take the result; later calls for the same id get `None`
    pub fn get(&self, job_id: &JobId) -> Option<JobResult> {
        self.results.lock().remove(job_id)
    }

    /// Non-removing read, for diagnostics only
    pub fn peek(&self, job_id: &JobId) -> Option<JobResult> {
        self.results.lock().get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.results.lock().contains_key(job_id)
    }

    /// Drop every unconsumed result, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut results = self.results.lock();
        let removed = results.len();
        results.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    #[test]
    fn test_get_consumes_once() {
        let store = ResultStore::new();
        let id = JobId::new();
        store.put(JobResult::completed(id, Vec::new(), Decimal::ZERO, Some(1)));

        assert!(store.peek(&id).is_some());
        assert!(store.get(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(store.peek(&id).is_none());
    }

    #[test]
    fn test_first_result_wins() {
        let store = ResultStore::new();
        let id = JobId::new();
        store.put(JobResult::completed(id, Vec::new(), Decimal::ZERO, Some(1)));
        store.put(JobResult::failed(id, "late", Decimal::ZERO, None));

        assert_eq!(store.len(), 1);
        assert!(!store.get(&id).unwrap().is_error());
    }

    #[test]
    fn test_clear_reports_removed_count() {
        let store = ResultStore::new();
        for _ in 0..3 {
            store.put(JobResult::failed(JobId::new(), "x", Decimal::ZERO, None));
        }
        assert_eq!(store.clear(), 3);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_consumers_see_one_result() {
        let store = Arc::new(ResultStore::new());
        let id = JobId::new();
        store.put(JobResult::completed(id, Vec::new(), Decimal::ZERO, None));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.get(&id).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
