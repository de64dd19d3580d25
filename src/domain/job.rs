use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Unique job identifier handed back to the caller on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used for thread names and log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| LedgerError::Validation(format!("invalid job id '{raw}': {e}")))
    }
}

/// Job lifecycle: Pending -> Submitted -> (Completed | Failed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be submitted
    Pending,
    /// Accepted by the ledger, awaiting final settlement
    Submitted,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Legal forward moves. Any non-terminal state may fail.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Submitted)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Submitted, JobStatus::Completed)
                | (JobStatus::Submitted, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Worker-local state machine guarding the job lifecycle
#[derive(Debug)]
pub struct JobProgress {
    status: JobStatus,
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumable's recorded expenditure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account id (or name when the ledger omits the id)
    pub account: String,
    pub amount: f64,
    /// "mL", "sheets" or "units"
    pub unit: String,
    /// Ledger transaction reference
    pub tx_id: String,
    pub success: bool,
}

/// Terminal (or provisional) outcome of one job, written once by its worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    pub ledger_entries: Vec<LedgerEntry>,
    pub estimated_cost: Decimal,
    pub transaction_success: bool,
    pub job_handle: Option<u64>,
    pub notes: String,
}

impl JobResult {
    /// Accepted by the ledger; settlement is reconciled later
    pub fn submitted(job_id: JobId, job_handle: u64, estimated_cost: Decimal) -> Self {
        Self {
            job_id,
            submitted_at: Utc::now(),
            status: JobStatus::Submitted,
            ledger_entries: Vec::new(),
            estimated_cost,
            transaction_success: true,
            job_handle: Some(job_handle),
            notes: "Job submitted, awaiting ledger confirmation.".to_string(),
        }
    }

    pub fn completed(
        job_id: JobId,
        ledger_entries: Vec<LedgerEntry>,
        estimated_cost: Decimal,
        job_handle: Option<u64>,
    ) -> Self {
        Self {
            job_id,
            submitted_at: Utc::now(),
            status: JobStatus::Completed,
            ledger_entries,
            estimated_cost,
            transaction_success: true,
            job_handle,
            notes: "Job completed successfully.".to_string(),
        }
    }

    pub fn failed(
        job_id: JobId,
        notes: impl Into<String>,
        estimated_cost: Decimal,
        job_handle: Option<u64>,
    ) -> Self {
        Self {
            job_id,
            submitted_at: Utc::now(),
            status: JobStatus::Failed,
            ledger_entries: Vec::new(),
            estimated_cost,
            transaction_success: false,
            job_handle,
            notes: notes.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == JobStatus::Failed || !self.transaction_success
    }
}

/// Rewrite raw ledger failure text into a caller-facing note
pub fn describe_ledger_failure(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if ["insufficient", "balance", "not enough", "depleted"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "Insufficient inventory to complete this job. One or more consumables \
         (toner or media) have been depleted. Check current inventory levels and \
         reduce quantity if needed."
            .to_string()
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "Job submission timed out. The ledger may be busy and the job may still \
         complete; check inventory before retrying."
            .to_string()
    } else if raw.trim().is_empty() {
        "Job processing failed. Please check inventory and try again.".to_string()
    } else {
        format!("Job processing failed: {}", raw.trim())
    }
}
