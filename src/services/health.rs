//! Aggregated health of the ledger subsystem

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::finalizer::AsyncFinalizer;
use super::inventory::InventoryCache;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    fn degraded(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Degraded,
            message: Some(message),
        }
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub inventory_running: bool,
    pub inventory_stale: bool,
    pub inventory_age_secs: u64,
    pub consecutive_failures: u32,
    pub last_refresh_error: Option<String>,
    pub active_jobs: usize,
    pub pending_settlements: usize,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn collect(
        inventory: &InventoryCache,
        active_jobs: usize,
        finalizer: Option<&AsyncFinalizer>,
    ) -> Self {
        let snapshot = inventory.snapshot();
        let consecutive_failures = inventory.consecutive_failures();
        let last_refresh_error = inventory.last_error();
        let mut components = Vec::new();

        // The connection is held open for the lifetime of the services
        components.push(ComponentHealth::healthy("ledger"));

        components.push(if !inventory.is_running() {
            ComponentHealth::degraded("inventory", "refresh loop not running".to_string())
        } else if consecutive_failures > 0 {
            ComponentHealth::degraded(
                "inventory",
                format!(
                    "{} consecutive refresh failures: {}",
                    consecutive_failures,
                    last_refresh_error.clone().unwrap_or_default()
                ),
            )
        } else if snapshot.is_stale() {
            ComponentHealth::degraded(
                "inventory",
                format!("snapshot is {}s old", snapshot.age().as_secs()),
            )
        } else {
            ComponentHealth::healthy("inventory")
        });

        let pending_settlements = match finalizer {
            Some(finalizer) => {
                components.push(if finalizer.is_running() {
                    ComponentHealth::healthy("finalizer")
                } else {
                    ComponentHealth::degraded("finalizer", "not running".to_string())
                });
                finalizer.tracked_count()
            }
            None => 0,
        };

        let status = if components.iter().all(|c| c.status.is_healthy()) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            timestamp: Utc::now(),
            inventory_running: inventory.is_running(),
            inventory_stale: snapshot.is_stale(),
            inventory_age_secs: snapshot.age().as_secs(),
            consecutive_failures,
            last_refresh_error,
            active_jobs,
            pending_settlements,
            components,
        }
    }
}
