use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::adapters::{AccountKind, LedgerTemplate};

/// Consumable family used for detail lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumableKind {
    Toner,
    Media,
}

impl std::fmt::Display for ConsumableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumableKind::Toner => write!(f, "toner"),
            ConsumableKind::Media => write!(f, "media"),
        }
    }
}

/// One toner account as seen at fetch time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TonerBalance {
    /// Lower-cased color name (e.g. "cyan")
    pub color: String,
    pub balance_ml: f64,
    /// Opaque ledger account id
    pub account_id: String,
    pub slot_number: Option<u32>,
    pub manufacturer: String,
    pub product_name: String,
    pub price: Decimal,
    pub tax_rate: Decimal,
}

/// One sheet-media account as seen at fetch time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaOption {
    pub account_id: String,
    pub display_name: String,
    pub balance_sheets: f64,
    pub width_mm: f64,
    pub height_mm: f64,
    pub manufacturer: String,
    pub product_name: String,
    pub price: Decimal,
    pub tax_rate: Decimal,
}

/// Point-in-time view of ledger inventory.
///
/// Never mutated after construction. The cache publishes a new
/// `Arc<InventorySnapshot>` on every successful refresh and readers keep
/// whichever one they loaded.
#[derive(Debug, Clone, Serialize)]
pub struct InventorySnapshot {
    pub fetched_at: DateTime<Utc>,
    pub toner_balances: Vec<TonerBalance>,
    pub media_options: Vec<MediaOption>,
    #[serde(skip)]
    stale_after: Duration,
    /// Raw account documents, kept only for detail display
    #[serde(skip)]
    details: HashMap<(ConsumableKind, String), serde_json::Value>,
}

impl InventorySnapshot {
    /// Sentinel published before the first successful fetch.
    ///
    /// Dated at the Unix epoch so it always reports stale.
    pub fn empty() -> Self {
        Self {
            fetched_at: DateTime::<Utc>::UNIX_EPOCH,
            toner_balances: Vec::new(),
            media_options: Vec::new(),
            stale_after: Duration::ZERO,
            details: HashMap::new(),
        }
    }

    /// Build a snapshot from a freshly fetched, classified template.
    pub fn from_template(template: &LedgerTemplate, stale_after: Duration) -> Self {
        let mut toner_balances = Vec::new();
        let mut media_options = Vec::new();
        let mut details = HashMap::new();

        for account in template.accounts() {
            match &account.kind {
                AccountKind::Toner { color } => {
                    toner_balances.push(TonerBalance {
                        color: color.clone(),
                        balance_ml: account.balance,
                        account_id: account.id.clone(),
                        slot_number: account.info.slot_number,
                        manufacturer: account.info.manufacturer.clone(),
                        product_name: account.info.product_name.clone(),
                        price: account.info.price,
                        tax_rate: account.info.tax_rate,
                    });
                    if let Some(doc) = template.account_document(account) {
                        details.insert((ConsumableKind::Toner, color.clone()), doc.clone());
                    }
                }
                AccountKind::Sheet => {
                    let display_name = if account.info.product_name.is_empty() {
                        account.id.clone()
                    } else {
                        account.info.product_name.clone()
                    };
                    media_options.push(MediaOption {
                        account_id: account.id.clone(),
                        display_name: display_name.clone(),
                        balance_sheets: account.balance,
                        width_mm: account.info.width_mm,
                        height_mm: account.info.height_mm,
                        manufacturer: account.info.manufacturer.clone(),
                        product_name: display_name,
                        price: account.info.price,
                        tax_rate: account.info.tax_rate,
                    });
                    if let Some(doc) = template.account_document(account) {
                        details.insert((ConsumableKind::Media, account.id.clone()), doc.clone());
                    }
                }
                AccountKind::Unknown { .. } => {}
            }
        }

        Self {
            fetched_at: Utc::now(),
            toner_balances,
            media_options,
            stale_after,
            details,
        }
    }

    /// How old this snapshot is
    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Stale data may still be served but should be flagged to callers
    pub fn is_stale(&self) -> bool {
        self.age() > self.stale_after
    }

    pub fn is_empty(&self) -> bool {
        self.toner_balances.is_empty() && self.media_options.is_empty()
    }

    /// Find a toner by color name (case-insensitive)
    pub fn toner_by_color(&self, color: &str) -> Option<&TonerBalance> {
        let color = color.to_lowercase();
        self.toner_balances.iter().find(|t| t.color == color)
    }

    pub fn media_by_id(&self, account_id: &str) -> Option<&MediaOption> {
        self.media_options.iter().find(|m| m.account_id == account_id)
    }

    /// Raw account document for sidebar-style detail display.
    ///
    /// `key` is a color name for toner and an account id for media.
    pub fn account_detail(&self, kind: ConsumableKind, key: &str) -> Option<&serde_json::Value> {
        let key = match kind {
            ConsumableKind::Toner => key.to_lowercase(),
            ConsumableKind::Media => key.to_string(),
        };
        self.details.get(&(kind, key))
    }
}
