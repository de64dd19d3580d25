use thiserror::Error;

/// Main error type for the ledger subsystem
#[derive(Error, Debug)]
pub enum LedgerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger session errors
    #[error("Ledger unavailable: {0}")]
    StartupFailure(String),

    #[error("Failed to fetch template: {0}")]
    TemplateFetch(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Job submission failed: {0}")]
    Submission(String),

    #[error(
        "No final ledger status for job handle {job_handle} after {elapsed_ms}ms; \
         outcome unknown, the ledger may still settle it"
    )]
    SettlementTimeout { job_handle: u64, elapsed_ms: u64 },

    // Inventory errors
    #[error("Inventory not ready: {0}")]
    InventoryNotReady(String),

    // Job result errors
    #[error("Result for job {job_id} was already consumed")]
    ResultAlreadyConsumed { job_id: String },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for LedgerError
pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    /// Whether the failure leaves the ledger-side outcome undetermined.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, LedgerError::SettlementTimeout { .. })
    }
}
