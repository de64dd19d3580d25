use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use crate::domain::FrozenOrder;
use crate::error::{LedgerError, Result};

const EXPENDITURE_FIELD: &str = "currentExpenditure";
const ECHOED_BALANCE_FIELD: &str = "estimatedBalance";

/// Account classification, decided once at parse time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountKind {
    /// Volume-based consumable, keyed by lower-cased color
    Toner { color: String },
    /// Count-based consumable, keyed by account id
    Sheet,
    Unknown { uom: String },
}

/// Descriptive metadata pulled out of the nested account document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountInfo {
    pub slot_number: Option<u32>,
    pub manufacturer: String,
    pub product_name: String,
    pub price: Decimal,
    pub tax_rate: Decimal,
    pub width_mm: f64,
    pub height_mm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateAccount {
    pub wallet: usize,
    pub index: usize,
    pub id: String,
    pub balance: f64,
    pub kind: AccountKind,
    pub info: AccountInfo,
}

impl TemplateAccount {
    fn pointer(&self) -> String {
        format!(
            "/inventoryParameters/wallets/{}/accounts/{}",
            self.wallet, self.index
        )
    }
}

/// What `apply_order` wrote into the payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadSummary {
    pub accounts: usize,
    pub toner_matched: usize,
    pub media_matched: usize,
    pub zeroed: usize,
    /// Colors the order uses that no toner account carries
    pub unmatched_colors: Vec<String>,
}

// Wire shapes. Everything is optional; classification decides what matters.

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(rename = "inventoryParameters")]
    inventory_parameters: RawInventoryParameters,
}

#[derive(Debug, Deserialize)]
struct RawInventoryParameters {
    #[serde(default)]
    wallets: Vec<RawWallet>,
}

#[derive(Debug, Deserialize)]
struct RawWallet {
    #[serde(default)]
    accounts: Vec<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(rename = "mintId", default)]
    mint_id: Option<String>,
    #[serde(rename = "estimatedBalance", default)]
    estimated_balance: Option<Value>,
    #[serde(default)]
    metadata: RawAccountMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct RawAccountMetadata {
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    tax: Option<Value>,
    #[serde(default)]
    metadata: RawTokenMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawTokenMetadata {
    #[serde(default)]
    pub(crate) uom: Option<String>,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(rename = "tokenDescription", default)]
    pub(crate) token_description: RawTokenDescription,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawTokenDescription {
    #[serde(rename = "projectData", default)]
    pub(crate) project_data: HashMap<String, Value>,
}

/// Ledgers send numbers both as JSON numbers and as strings
pub(crate) fn lenient_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_decimal(value: Option<&Value>) -> Decimal {
    match value {
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).unwrap_or_default(),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

pub(crate) fn text(data: &HashMap<String, Value>, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn classify(uom: Option<&str>, data: &HashMap<String, Value>) -> AccountKind {
    let uom = uom.unwrap_or_default();
    if uom.eq_ignore_ascii_case("toner") {
        match text(data, "Color") {
            Some(color) => AccountKind::Toner {
                color: color.to_lowercase(),
            },
            None => AccountKind::Unknown {
                uom: uom.to_string(),
            },
        }
    } else if uom.eq_ignore_ascii_case("media") {
        AccountKind::Sheet
    } else {
        AccountKind::Unknown {
            uom: uom.to_string(),
        }
    }
}

/// A fetched template: the raw document plus its classified accounts.
///
/// Each worker owns its own instance; nothing here is shared.
#[derive(Debug, Clone)]
pub struct LedgerTemplate {
    document: Value,
    accounts: Vec<TemplateAccount>,
}

impl LedgerTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(raw)?;
        Self::from_value(document)
    }

    pub fn from_value(document: Value) -> Result<Self> {
        let raw: RawTemplate = serde_json::from_value(document.clone())
            .map_err(|e| LedgerError::InvalidTemplate(e.to_string()))?;

        let mut accounts = Vec::new();
        for (wallet, raw_wallet) in raw.inventory_parameters.wallets.into_iter().enumerate() {
            for (index, account) in raw_wallet.accounts.into_iter().enumerate() {
                let meta = account.metadata;
                let data = &meta.metadata.token_description.project_data;
                let info = AccountInfo {
                    slot_number: lenient_f64(data.get("SlotNumber")).map(|n| n as u32),
                    manufacturer: text(data, "Manufacturer").unwrap_or_default(),
                    product_name: text(data, "Consumable Name")
                        .or_else(|| text(data, "ProductName"))
                        .unwrap_or_default(),
                    price: lenient_decimal(meta.price.as_ref()),
                    tax_rate: lenient_decimal(meta.tax.as_ref()),
                    width_mm: lenient_f64(data.get("Width")).unwrap_or_default(),
                    height_mm: lenient_f64(data.get("Height")).unwrap_or_default(),
                };
                accounts.push(TemplateAccount {
                    wallet,
                    index,
                    id: account.mint_id.unwrap_or_default(),
                    balance: lenient_f64(account.estimated_balance.as_ref()).unwrap_or_default(),
                    kind: classify(meta.metadata.uom.as_deref(), data),
                    info,
                });
            }
        }

        Ok(Self { document, accounts })
    }

    pub fn accounts(&self) -> &[TemplateAccount] {
        &self.accounts
    }

    /// Raw JSON of one account, for detail display
    pub fn account_document(&self, account: &TemplateAccount) -> Option<&Value> {
        self.document.pointer(&account.pointer())
    }

    /// Write an explicit expenditure onto every account and strip echoed
    /// balances.
    ///
    /// Toner matches by color, media by exact account id. Everything else
    /// gets zero.
    pub fn apply_order(&mut self, order: &FrozenOrder) -> Result<PayloadSummary> {
        let mut summary = PayloadSummary {
            accounts: self.accounts.len(),
            ..Default::default()
        };
        let mut seen_colors = BTreeSet::new();

        for account in &self.accounts {
            let expenditure = match &account.kind {
                AccountKind::Toner { color } => {
                    seen_colors.insert(color.as_str());
                    order.usage_for(color)
                }
                AccountKind::Sheet if account.id == order.media_id() => {
                    Some(order.sheets_required() as f64)
                }
                _ => None,
            };
            match (&account.kind, expenditure) {
                (AccountKind::Toner { .. }, Some(_)) => summary.toner_matched += 1,
                (AccountKind::Sheet, Some(_)) => summary.media_matched += 1,
                _ => summary.zeroed += 1,
            }

            let slot = self
                .document
                .pointer_mut(&account.pointer())
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    LedgerError::InvalidTemplate(format!(
                        "account {} is not an object",
                        account.pointer()
                    ))
                })?;
            write_expenditure(slot, expenditure.unwrap_or(0.0));
        }

        summary.unmatched_colors = order
            .toner_usage()
            .keys()
            .filter(|c| !seen_colors.contains(c.as_str()))
            .cloned()
            .collect();
        Ok(summary)
    }

    /// Serialise the (applied) document for submission
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.document)?)
    }

    pub fn document(&self) -> &Value {
        &self.document
    }
}

fn write_expenditure(account: &mut Map<String, Value>, amount: f64) {
    account.insert(EXPENDITURE_FIELD.to_string(), json!(amount));
    account.remove(ECHOED_BALANCE_FIELD);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Order, OrderChoices, OrderEstimate};

    fn account(mint: &str, balance: f64, uom: &str, data: Value) -> Value {
        json!({
            "mintId": mint,
            "estimatedBalance": balance,
            "metadata": {
                "price": 10,
                "metadata": {
                    "uom": uom,
                    "tokenDescription": { "projectData": data }
                }
            }
        })
    }

    fn template() -> LedgerTemplate {
        LedgerTemplate::from_value(json!({
            "inventoryParameters": {
                "wallets": [
                    { "accounts": [
                        account("mint-cyan", 500.0, "Toner", json!({ "Color": "Cyan" })),
                        account("mint-black", 500.0, "Toner", json!({ "Color": "Black" })),
                    ]},
                    { "accounts": [
                        account("mint-gloss", 200.0, "Media", json!({ "ProductName": "Gloss" })),
                        account("mint-matte", 300.0, "Media", json!({ "ProductName": "Matte" })),
                        account("mint-blade", 2.0, "Blade", json!({})),
                    ]}
                ]
            }
        }))
        .unwrap()
    }

    fn order(usage: &[(&str, f64)], media: &str, sheets: u32) -> FrozenOrder {
        Order::new("job")
            .with_choices(OrderChoices {
                quantity: 1,
                color_mode: "cmyk".to_string(),
                media_id: media.to_string(),
                media_display_name: media.to_string(),
                turnaround_time: "standard".to_string(),
                quality: "standard".to_string(),
                notes: String::new(),
            })
            .with_estimate(OrderEstimate {
                sheets_required: sheets,
                toner_usage: usage.iter().map(|(c, u)| (c.to_string(), *u)).collect(),
                estimated_cost: Decimal::ZERO,
            })
            .freeze()
            .unwrap()
    }

    fn expenditure(template: &LedgerTemplate, wallet: usize, index: usize) -> Option<f64> {
        template
            .document()
            .pointer(&format!(
                "/inventoryParameters/wallets/{wallet}/accounts/{index}/currentExpenditure"
            ))
            .and_then(Value::as_f64)
    }

    #[test]
    fn test_classification() {
        let template = template();
        let kinds: Vec<_> = template.accounts().iter().map(|a| a.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                AccountKind::Toner { color: "cyan".to_string() },
                AccountKind::Toner { color: "black".to_string() },
                AccountKind::Sheet,
                AccountKind::Sheet,
                AccountKind::Unknown { uom: "Blade".to_string() },
            ]
        );
        assert_eq!(template.accounts()[2].balance, 200.0);
        assert_eq!(template.accounts()[0].info.price, Decimal::from(10));
    }

    #[test]
    fn test_missing_inventory_parameters_is_invalid() {
        let err = LedgerTemplate::parse(r#"{"wallets": []}"#).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTemplate(_)));
        assert!(LedgerTemplate::parse("not json").is_err());
    }

    #[test]
    fn test_apply_order_writes_every_account() {
        let mut template = template();
        let summary = template
            .apply_order(&order(&[("CYAN", 1.25), ("magenta", 0.5)], "mint-matte", 12))
            .unwrap();

        assert_eq!(expenditure(&template, 0, 0), Some(1.25));
        assert_eq!(expenditure(&template, 0, 1), Some(0.0));
        assert_eq!(expenditure(&template, 1, 0), Some(0.0));
        assert_eq!(expenditure(&template, 1, 1), Some(12.0));
        assert_eq!(expenditure(&template, 1, 2), Some(0.0));

        assert_eq!(summary.accounts, 5);
        assert_eq!(summary.toner_matched, 1);
        assert_eq!(summary.media_matched, 1);
        assert_eq!(summary.zeroed, 3);
        assert_eq!(summary.unmatched_colors, vec!["magenta".to_string()]);
    }

    #[test]
    fn test_apply_order_strips_echoed_balances() {
        let mut template = template();
        template.apply_order(&order(&[], "none", 0)).unwrap();
        let payload: Value = serde_json::from_str(&template.to_payload().unwrap()).unwrap();

        let wallets = payload["inventoryParameters"]["wallets"].as_array().unwrap();
        for account in wallets.iter().flat_map(|w| w["accounts"].as_array().unwrap()) {
            assert!(account.get("estimatedBalance").is_none());
            assert_eq!(account["currentExpenditure"].as_f64(), Some(0.0));
        }
    }

    #[test]
    fn test_lenient_numbers() {
        assert_eq!(lenient_f64(Some(&json!("12.5"))), Some(12.5));
        assert_eq!(lenient_f64(Some(&json!(3))), Some(3.0));
        assert_eq!(lenient_f64(Some(&json!(null))), None);
        assert_eq!(lenient_decimal(Some(&json!("0.08"))), Decimal::new(8, 2));
    }
}
