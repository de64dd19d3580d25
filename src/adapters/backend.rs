use std::num::NonZeroU64;

/// Opaque session handle issued by the ledger library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(NonZeroU64);

impl SessionHandle {
    /// Wrap a raw handle; zero means the ledger refused to open a session
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// The consumed ledger boundary.
///
/// Mirrors the native library one call per operation. Documents cross the
/// boundary as owned JSON strings, so each buffer the library hands out is
/// released exactly once when the returned `String` drops. Implementations
/// must tolerate concurrent calls on the same handle.
#[cfg_attr(test, mockall::automock)]
pub trait LedgerBackend: Send + Sync {
    /// Open a session; `None` when the library cannot be initialised
    fn open(&self) -> Option<SessionHandle>;

    /// Fetch a fresh inventory template document
    fn new_template(&self, handle: SessionHandle) -> Option<String>;

    /// Submit a payload. Returns the job handle, 0 on failure.
    fn submit(&self, handle: SessionHandle, payload: &str) -> u64;

    /// Poll a job. `None` means no status is available yet.
    fn status(&self, handle: SessionHandle, job_handle: u64) -> Option<String>;

    /// Text of the most recent failure on this session
    fn last_error(&self, handle: SessionHandle) -> Option<String>;

    fn close(&self, handle: SessionHandle);
}
