pub(crate) mod background;
pub mod finalizer;
pub mod health;
pub mod inventory;
pub mod result_store;

pub use finalizer::{AsyncFinalizer, FinalizerStats, TrackedSettlement};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use inventory::InventoryCache;
pub use result_store::ResultStore;
