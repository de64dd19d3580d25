use chrono::{DateTime, Utc};
use serde::Serialize;
use std::thread::JoinHandle;

use crate::domain::{JobId, JobResult};

/// Registry entry for one spawned worker
pub(crate) struct WorkerSlot {
    pub job_name: String,
    pub submitted_at: DateTime<Utc>,
    /// `None` between registration and a successful spawn
    pub handle: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    pub fn new(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            submitted_at: Utc::now(),
            handle: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// A job whose worker thread is still alive
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub job_name: String,
    pub submitted_at: DateTime<Utc>,
}

/// What a caller polling for a result can observe
#[derive(Debug, Clone, PartialEq)]
pub enum JobPoll {
    /// The result, handed over exactly once
    Ready(JobResult),
    /// Worker still processing
    Running,
    /// Result already taken by an earlier poll
    Consumed,
    /// Never submitted here
    Unknown,
}
