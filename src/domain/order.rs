use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{LedgerError, Result};

/// User choices captured for a print job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderChoices {
    pub quantity: u32,
    /// Color profile (e.g. "cmyk")
    pub color_mode: String,
    /// Opaque ledger account id of the selected media
    pub media_id: String,
    pub media_display_name: String,
    #[serde(default = "default_turnaround")]
    pub turnaround_time: String,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default)]
    pub notes: String,
}

fn default_turnaround() -> String {
    "standard".to_string()
}

fn default_quality() -> String {
    "standard".to_string()
}

/// Estimated resource usage for a print job
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderEstimate {
    pub sheets_required: u32,
    /// Toner usage in mL by color name
    pub toner_usage: HashMap<String, f64>,
    #[serde(default)]
    pub estimated_cost: Decimal,
}

/// Request-scoped, mutable order owned by the web layer.
///
/// Must be frozen before it crosses into a worker thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    pub job_name: String,
    pub original_filename: String,
    pub pages: u32,
    pub width_mm: f64,
    pub height_mm: f64,
    pub choices: Option<OrderChoices>,
    pub estimate: Option<OrderEstimate>,
}

impl Order {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    pub fn with_choices(mut self, choices: OrderChoices) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn with_estimate(mut self, estimate: OrderEstimate) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// Deep-copy everything a worker needs into an immutable `FrozenOrder`.
    pub fn freeze(&self) -> Result<FrozenOrder> {
        let choices = self.choices.as_ref().ok_or_else(|| {
            LedgerError::Validation(format!(
                "order '{}' has no job details; choices are required",
                self.job_name
            ))
        })?;
        let estimate = self.estimate.clone().unwrap_or_default();

        let mut toner_usage = BTreeMap::new();
        for (color, usage) in &estimate.toner_usage {
            if !usage.is_finite() || *usage < 0.0 {
                return Err(LedgerError::Validation(format!(
                    "toner usage for '{color}' must be a non-negative number, got {usage}"
                )));
            }
            *toner_usage.entry(color.trim().to_lowercase()).or_insert(0.0) += *usage;
        }

        Ok(FrozenOrder {
            job_name: self.job_name.clone(),
            original_filename: self.original_filename.clone(),
            pages: self.pages,
            quantity: choices.quantity,
            color_mode: choices.color_mode.clone(),
            quality: choices.quality.clone(),
            media_id: choices.media_id.clone(),
            sheets_required: estimate.sheets_required,
            toner_usage,
            estimated_cost: estimate.estimated_cost,
        })
    }
}

/// Immutable snapshot of everything one job needs.
///
/// Shares nothing with the `Order` it came from; a worker thread owns it
/// outright for the lifetime of the job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrozenOrder {
    job_name: String,
    original_filename: String,
    pages: u32,
    quantity: u32,
    color_mode: String,
    quality: String,
    media_id: String,
    sheets_required: u32,
    toner_usage: BTreeMap<String, f64>,
    estimated_cost: Decimal,
}

impl FrozenOrder {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn color_mode(&self) -> &str {
        &self.color_mode
    }

    pub fn quality(&self) -> &str {
        &self.quality
    }

    /// Selected media account id
    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    pub fn sheets_required(&self) -> u32 {
        self.sheets_required
    }

    /// Per-color usage with lower-cased keys
    pub fn toner_usage(&self) -> &BTreeMap<String, f64> {
        &self.toner_usage
    }

    /// Usage for a color; the lookup is case-insensitive
    pub fn usage_for(&self, color: &str) -> Option<f64> {
        self.toner_usage.get(&color.to_lowercase()).copied()
    }

    pub fn estimated_cost(&self) -> Decimal {
        self.estimated_cost
    }
}
