//! Coordinator Configuration

use std::time::Duration;

use crate::config::{JobConfig, SettlementMode};

/// Runtime settings handed to every job worker
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between status polls while blocking on settlement
    pub poll_interval: Duration,
    /// Hard limit on waiting for a final status
    pub timeout: Duration,
    pub settlement: SettlementMode,
    /// Per-worker join timeout on shutdown
    pub shutdown_timeout: Duration,
    /// How long a consumed job id is remembered as `Consumed`
    pub consumed_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&JobConfig::default())
    }
}

impl From<&JobConfig> for CoordinatorConfig {
    fn from(config: &JobConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            settlement: config.settlement,
            shutdown_timeout: config.shutdown_timeout(),
            consumed_retention: config.consumed_retention(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_consumed_retention(mut self, retention: Duration) -> Self {
        self.consumed_retention = retention;
        self
    }

    pub fn with_settlement(mut self, settlement: SettlementMode) -> Self {
        self.settlement = settlement;
        self
    }
}
