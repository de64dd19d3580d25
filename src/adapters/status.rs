use serde::Deserialize;
use serde_json::Value;

use super::template::{lenient_f64, text, RawTokenMetadata};
use crate::domain::LedgerEntry;
use crate::error::Result;

/// Status document returned by a job poll
#[derive(Debug, Clone, Deserialize)]
pub struct StatusDocument {
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "transactionSuccess", default)]
    pub transaction_success: Option<bool>,
    #[serde(default)]
    results: Option<SettlementResults>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Ledgers report results either nested under a job id or as bare wallets
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SettlementResults {
    // Tried first: the struct variant would also accept a JSON array
    Wallets(Vec<SettledWallet>),
    Nested {
        #[serde(rename = "jobID", default)]
        job_id: Option<Value>,
        #[serde(default)]
        results: Vec<SettledWallet>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct SettledWallet {
    #[serde(default)]
    accounts: Vec<SettledAccount>,
}

#[derive(Debug, Clone, Deserialize)]
struct SettledAccount {
    #[serde(rename = "actualExpenditure", default)]
    actual_expenditure: Option<Value>,
    #[serde(rename = "mintId", default)]
    mint_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metadata: SettledMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SettledMetadata {
    #[serde(default)]
    metadata: RawTokenMetadata,
}

impl SettledAccount {
    fn unit(&self) -> &'static str {
        let uom = self.metadata.metadata.uom.as_deref().unwrap_or_default();
        if uom.eq_ignore_ascii_case("toner") {
            "mL"
        } else if uom.eq_ignore_ascii_case("media") {
            "sheets"
        } else {
            "units"
        }
    }

    fn account_name(&self) -> String {
        let meta = &self.metadata.metadata;
        self.mint_id
            .clone()
            .or_else(|| self.id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| text(&meta.token_description.project_data, "Consumable Name"))
            .or_else(|| meta.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl StatusDocument {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// `transactionSuccess` (falling back to `final`) and a settled status
    pub fn is_success(&self) -> bool {
        let tx_success = self.transaction_success.unwrap_or(self.is_final);
        let status = self.status.to_ascii_lowercase();
        tx_success && (status == "ready" || status == "completed")
    }

    /// Ledger transaction reference, when the ledger reported one
    pub fn transaction_id(&self) -> Option<String> {
        match &self.results {
            Some(SettlementResults::Nested {
                job_id: Some(id), ..
            }) => match id {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Entries with a non-zero actual expenditure
    pub fn ledger_entries(&self, fallback_tx_id: &str) -> Vec<LedgerEntry> {
        let wallets: &[SettledWallet] = match &self.results {
            Some(SettlementResults::Nested { results, .. }) => results.as_slice(),
            Some(SettlementResults::Wallets(wallets)) => wallets.as_slice(),
            None => &[],
        };
        let tx_id = self
            .transaction_id()
            .unwrap_or_else(|| fallback_tx_id.to_string());
        let success = self.is_success();

        wallets
            .iter()
            .flat_map(|w| w.accounts.iter())
            .filter_map(|account| {
                let amount = lenient_f64(account.actual_expenditure.as_ref()).unwrap_or(0.0);
                if amount == 0.0 {
                    return None;
                }
                Some(LedgerEntry {
                    account: account.account_name(),
                    amount,
                    unit: account.unit().to_string(),
                    tx_id: tx_id.clone(),
                    success,
                })
            })
            .collect()
    }

    /// Best available explanation for an unsuccessful settlement
    pub fn failure_text(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.notes.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("ledger reported status '{}'", self.status))
    }
}
