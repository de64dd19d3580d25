//! Job coordination
//!
//! Spawns one isolated worker per submitted job and wires the ledger
//! services together behind an explicit start/shutdown lifecycle.

pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod state;

pub use bootstrap::LedgerServices;
pub use config::CoordinatorConfig;
pub use coordinator::JobCoordinator;
pub use state::{ActiveJob, JobPoll};
