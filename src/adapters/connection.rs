use std::sync::Arc;
use tracing::{error, info};

use super::backend::{LedgerBackend, SessionHandle};
use super::session::LedgerSession;
use crate::error::{LedgerError, Result};

/// The single long-lived ledger session shared by every caller.
///
/// Closed when the last `Arc` drops.
pub struct LedgerConnection {
    backend: Arc<dyn LedgerBackend>,
    handle: SessionHandle,
}

impl LedgerConnection {
    pub fn open(backend: Arc<dyn LedgerBackend>) -> Result<Arc<Self>> {
        let Some(handle) = backend.open() else {
            let reason = "ledger library returned no session handle".to_string();
            error!("Failed to open ledger session: {}", reason);
            return Err(LedgerError::StartupFailure(reason));
        };
        info!("Ledger session opened ({})", handle);
        Ok(Arc::new(Self { backend, handle }))
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub(crate) fn backend(&self) -> &dyn LedgerBackend {
        self.backend.as_ref()
    }

    /// Fresh per-caller adapter bound to this connection
    pub fn session(self: &Arc<Self>, label: impl Into<String>) -> LedgerSession {
        LedgerSession::new(Arc::clone(self), label)
    }
}

impl std::fmt::Debug for LedgerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConnection")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for LedgerConnection {
    fn drop(&mut self) {
        self.backend.close(self.handle);
        info!("Ledger session closed ({})", self.handle);
    }
}
