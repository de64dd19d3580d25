pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod services;

pub use adapters::{LedgerBackend, LedgerConnection, LedgerSession, SimulatedLedger};
pub use config::{AppConfig, SettlementMode};
pub use coordinator::{CoordinatorConfig, JobCoordinator, JobPoll, LedgerServices};
pub use domain::{
    FrozenOrder, InventorySnapshot, JobId, JobResult, JobStatus, LedgerEntry, MediaOption, Order,
    OrderChoices, OrderEstimate, TonerBalance,
};
pub use error::{LedgerError, Result};
pub use services::{AsyncFinalizer, HealthReport, InventoryCache, ResultStore};
