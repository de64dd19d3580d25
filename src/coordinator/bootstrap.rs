//! Service bootstrap: wires the connection, cache, finalizer and
//! coordinator together from config, with explicit start and shutdown.

use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::{LedgerBackend, LedgerConnection};
use crate::config::{AppConfig, SettlementMode};
use crate::coordinator::{CoordinatorConfig, JobCoordinator};
use crate::error::{LedgerError, Result};
use crate::services::{AsyncFinalizer, HealthReport, InventoryCache, ResultStore};

/// The running ledger subsystem
pub struct LedgerServices {
    connection: Arc<LedgerConnection>,
    inventory: InventoryCache,
    results: Arc<ResultStore>,
    finalizer: Option<AsyncFinalizer>,
    coordinator: JobCoordinator,
}

impl LedgerServices {
    /// Open the ledger session and start every background loop.
    ///
    /// Fails fast when the config is invalid or the ledger cannot be opened.
    pub fn start(backend: Arc<dyn LedgerBackend>, config: &AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| LedgerError::InvalidConfig(errors.join("; ")))?;

        let connection = LedgerConnection::open(backend)?;
        let inventory = InventoryCache::new(Arc::clone(&connection), config.inventory.clone());
        let finalizer = match config.jobs.settlement {
            SettlementMode::Provisional => Some(AsyncFinalizer::new(
                Arc::clone(&connection),
                inventory.clone(),
                config.finalizer.clone(),
            )),
            SettlementMode::Blocking => None,
        };
        let results = Arc::new(ResultStore::new());
        let coordinator = JobCoordinator::new(
            Arc::clone(&connection),
            Arc::clone(&results),
            finalizer.clone(),
            CoordinatorConfig::from(&config.jobs),
        )?;

        inventory.start()?;
        if let Some(finalizer) = &finalizer {
            finalizer.start()?;
        }

        info!(
            "Ledger services started ({}, settlement: {})",
            connection.handle(),
            config.jobs.settlement
        );
        Ok(Self {
            connection,
            inventory,
            results,
            finalizer,
            coordinator,
        })
    }

    pub fn connection(&self) -> &Arc<LedgerConnection> {
        &self.connection
    }

    pub fn inventory(&self) -> &InventoryCache {
        &self.inventory
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    pub fn finalizer(&self) -> Option<&AsyncFinalizer> {
        self.finalizer.as_ref()
    }

    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::collect(
            &self.inventory,
            self.coordinator.active_count(),
            self.finalizer.as_ref(),
        )
    }

    /// Stop accepting jobs, drain workers, then stop the background loops.
    ///
    /// Returns true when every thread exited within its timeout.
    pub fn shutdown(&self) -> bool {
        info!("Shutting down ledger services");
        let stragglers = self.coordinator.shutdown();
        let finalizer_stopped = self.finalizer.as_ref().map_or(true, |f| f.stop());
        let inventory_stopped = self.inventory.stop();

        let clean = stragglers == 0 && finalizer_stopped && inventory_stopped;
        if clean {
            info!("Ledger services stopped");
        } else {
            warn!(
                "Ledger services stopped with {} job workers and {} background loops still running",
                stragglers,
                [finalizer_stopped, inventory_stopped]
                    .iter()
                    .filter(|stopped| !**stopped)
                    .count()
            );
        }
        clean
    }
}
