use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

use super::backend::{LedgerBackend, SessionHandle};

#[derive(Debug, Clone)]
enum SimKind {
    Toner { color: String, slot: u32 },
    Media { width_mm: f64, height_mm: f64 },
}

#[derive(Debug, Clone)]
struct SimAccount {
    mint_id: String,
    name: String,
    balance: f64,
    price: Decimal,
    kind: SimKind,
}

impl SimAccount {
    fn document(&self) -> Value {
        let (uom, project_data) = match &self.kind {
            SimKind::Toner { color, slot } => (
                "Toner",
                json!({
                    "Color": capitalize(color),
                    "Manufacturer": "Simulated",
                    "Consumable Name": self.name,
                    "SlotNumber": slot.to_string(),
                }),
            ),
            SimKind::Media {
                width_mm,
                height_mm,
            } => (
                "Media",
                json!({
                    "Manufacturer": "Simulated",
                    "ProductName": self.name,
                    "Width": width_mm.to_string(),
                    "Height": height_mm.to_string(),
                }),
            ),
        };
        json!({
            "mintId": self.mint_id,
            "estimatedBalance": self.balance,
            "metadata": {
                "price": self.price.to_string(),
                "tax": 0,
                "metadata": {
                    "uom": uom,
                    "name": self.name,
                    "tokenDescription": { "projectData": project_data }
                }
            }
        })
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug)]
struct SimJob {
    polls_until_final: u32,
    expenditures: Vec<(String, f64)>,
    settled: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    accounts: Vec<SimAccount>,
    open_sessions: HashSet<u64>,
    last_error: HashMap<u64, String>,
    jobs: HashMap<u64, SimJob>,
    next_job: u64,
    failing_templates: u32,
    outage: bool,
    refuse_open: bool,
    rejection: Option<String>,
    settle_after_polls: u32,
    never_settle: bool,
    last_payload: Option<Value>,
}

impl SimState {
    fn fail(&mut self, handle: SessionHandle, message: impl Into<String>) {
        self.last_error.insert(handle.get(), message.into());
    }

    fn template(&self) -> Value {
        let toner: Vec<Value> = self
            .accounts
            .iter()
            .filter(|a| matches!(a.kind, SimKind::Toner { .. }))
            .map(SimAccount::document)
            .collect();
        let media: Vec<Value> = self
            .accounts
            .iter()
            .filter(|a| matches!(a.kind, SimKind::Media { .. }))
            .map(SimAccount::document)
            .collect();
        json!({
            "inventoryParameters": {
                "wallets": [
                    { "accounts": toner },
                    { "accounts": media }
                ]
            }
        })
    }

    /// Check a payload the way the ledger does: every known account must
    /// carry an expenditure and none may echo a balance back.
    fn validate_payload(&self, payload: &Value) -> Result<Vec<(String, f64)>, String> {
        let wallets = payload
            .pointer("/inventoryParameters/wallets")
            .and_then(Value::as_array)
            .ok_or("payload has no inventoryParameters.wallets")?;

        let mut expenditures = Vec::new();
        for account in wallets
            .iter()
            .filter_map(|w| w.get("accounts").and_then(Value::as_array))
            .flatten()
        {
            let mint = account
                .get("mintId")
                .and_then(Value::as_str)
                .ok_or("account without mintId")?;
            if account.get("estimatedBalance").is_some() {
                return Err(format!("stale balance echoed for {mint}"));
            }
            let amount = account
                .get("currentExpenditure")
                .and_then(Value::as_f64)
                .ok_or_else(|| format!("missing currentExpenditure on {mint}"))?;
            if !self.accounts.iter().any(|a| a.mint_id == mint) {
                return Err(format!("unknown account {mint}"));
            }
            expenditures.push((mint.to_string(), amount));
        }

        if expenditures.len() != self.accounts.len() {
            return Err(format!(
                "payload covers {} of {} accounts",
                expenditures.len(),
                self.accounts.len()
            ));
        }
        Ok(expenditures)
    }

    fn settle(&mut self, job_handle: u64, expenditures: &[(String, f64)]) -> String {
        for (mint, amount) in expenditures {
            let available = self
                .accounts
                .iter()
                .find(|a| &a.mint_id == mint)
                .map(|a| a.balance)
                .unwrap_or(0.0);
            if *amount > available {
                return json!({
                    "final": true,
                    "status": "failed",
                    "transactionSuccess": false,
                    "error": format!(
                        "Insufficient balance for {mint}: requested {amount}, available {available}"
                    ),
                })
                .to_string();
            }
        }

        let mut settled = Vec::new();
        for (mint, amount) in expenditures {
            if let Some(account) = self.accounts.iter_mut().find(|a| &a.mint_id == mint) {
                account.balance -= amount;
                let mut doc = account.document();
                if let Some(obj) = doc.as_object_mut() {
                    obj.remove("estimatedBalance");
                    obj.insert("balance".to_string(), json!(account.balance));
                    obj.insert("actualExpenditure".to_string(), json!(amount));
                }
                settled.push(doc);
            }
        }

        json!({
            "final": true,
            "status": "completed",
            "transactionSuccess": true,
            "results": {
                "jobID": format!("sim-{job_handle}"),
                "results": [{ "accounts": settled }]
            }
        })
        .to_string()
    }
}

/// In-process ledger for development and tests.
///
/// Behaves like the vendor library: settlement lags submission, balances
/// are only deducted on settlement, and faults can be injected at runtime.
#[derive(Debug, Default)]
pub struct SimulatedLedger {
    state: Mutex<SimState>,
    next_session: AtomicU64,
    template_fetches: AtomicUsize,
    submissions: AtomicUsize,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Four CMYK toners and two media stocks
    pub fn demo() -> Self {
        Self::new()
            .with_toner("mint-toner-cyan", "cyan", 500.0)
            .with_toner("mint-toner-magenta", "magenta", 500.0)
            .with_toner("mint-toner-yellow", "yellow", 500.0)
            .with_toner("mint-toner-black", "black", 750.0)
            .with_media("mint-media-gloss-a3", "Gloss A3", 200.0, 297.0, 420.0)
            .with_media("mint-media-matte-a4", "Matte A4", 500.0, 210.0, 297.0)
    }

    pub fn with_toner(self, mint_id: &str, color: &str, balance_ml: f64) -> Self {
        {
            let mut state = self.state.lock();
            let slot = state.accounts.len() as u32 + 1;
            state.accounts.push(SimAccount {
                mint_id: mint_id.to_string(),
                name: format!("{} Toner", capitalize(color)),
                balance: balance_ml,
                price: Decimal::new(1250, 2),
                kind: SimKind::Toner {
                    color: color.to_lowercase(),
                    slot,
                },
            });
        }
        self
    }

    pub fn with_media(
        self,
        mint_id: &str,
        name: &str,
        balance_sheets: f64,
        width_mm: f64,
        height_mm: f64,
    ) -> Self {
        self.state.lock().accounts.push(SimAccount {
            mint_id: mint_id.to_string(),
            name: name.to_string(),
            balance: balance_sheets,
            price: Decimal::new(35, 2),
            kind: SimKind::Media {
                width_mm,
                height_mm,
            },
        });
        self
    }

    /// Fail the next `count` template fetches
    pub fn fail_next_templates(&self, count: u32) {
        self.state.lock().failing_templates = count;
    }

    /// Fail every fetch and submission until cleared
    pub fn set_outage(&self, outage: bool) {
        self.state.lock().outage = outage;
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.state.lock().refuse_open = refuse;
    }

    /// Reject every submission with the given error text
    pub fn reject_submissions(&self, reason: Option<&str>) {
        self.state.lock().rejection = reason.map(str::to_string);
    }

    /// Number of "not ready" polls before a job settles
    pub fn settle_after_polls(&self, polls: u32) {
        self.state.lock().settle_after_polls = polls;
    }

    /// Report jobs as non-final forever
    pub fn never_settle(&self, never: bool) {
        self.state.lock().never_settle = never;
    }

    pub fn set_balance(&self, mint_id: &str, balance: f64) {
        let mut state = self.state.lock();
        if let Some(account) = state.accounts.iter_mut().find(|a| a.mint_id == mint_id) {
            account.balance = balance;
        }
    }

    pub fn balance(&self, mint_id: &str) -> Option<f64> {
        self.state
            .lock()
            .accounts
            .iter()
            .find(|a| a.mint_id == mint_id)
            .map(|a| a.balance)
    }

    /// Template fetch attempts, failed ones included
    pub fn template_fetches(&self) -> usize {
        self.template_fetches.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// The most recent accepted payload
    pub fn last_payload(&self) -> Option<Value> {
        self.state.lock().last_payload.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions.len()
    }
}

impl LedgerBackend for SimulatedLedger {
    fn open(&self) -> Option<SessionHandle> {
        let mut state = self.state.lock();
        if state.refuse_open {
            return None;
        }
        let handle = SessionHandle::from_raw(self.next_session.fetch_add(1, Ordering::SeqCst) + 1)?;
        state.open_sessions.insert(handle.get());
        Some(handle)
    }

    fn new_template(&self, handle: SessionHandle) -> Option<String> {
        self.template_fetches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.outage {
            state.fail(handle, "ledger unavailable");
            return None;
        }
        if state.failing_templates > 0 {
            state.failing_templates -= 1;
            state.fail(handle, "template fetch failed");
            return None;
        }
        Some(state.template().to_string())
    }

    fn submit(&self, handle: SessionHandle, payload: &str) -> u64 {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if !state.open_sessions.contains(&handle.get()) {
            state.fail(handle, "invalid session handle");
            return 0;
        }
        if state.outage {
            state.fail(handle, "ledger unavailable");
            return 0;
        }
        if let Some(reason) = state.rejection.clone() {
            state.fail(handle, reason);
            return 0;
        }

        let payload: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                state.fail(handle, format!("malformed payload: {e}"));
                return 0;
            }
        };
        let expenditures = match state.validate_payload(&payload) {
            Ok(e) => e,
            Err(reason) => {
                state.fail(handle, reason);
                return 0;
            }
        };

        state.next_job += 1;
        let job_handle = state.next_job;
        let polls_until_final = state.settle_after_polls;
        state.jobs.insert(
            job_handle,
            SimJob {
                polls_until_final,
                expenditures,
                settled: None,
            },
        );
        state.last_payload = Some(payload);
        debug!("Simulated ledger accepted job {}", job_handle);
        job_handle
    }

    fn status(&self, handle: SessionHandle, job_handle: u64) -> Option<String> {
        let mut state = self.state.lock();
        let never_settle = state.never_settle;
        let Some(job) = state.jobs.get_mut(&job_handle) else {
            state.fail(handle, format!("unknown job handle {job_handle}"));
            return None;
        };
        if let Some(settled) = &job.settled {
            return Some(settled.clone());
        }
        if never_settle {
            return Some(json!({ "final": false, "status": "processing" }).to_string());
        }
        if job.polls_until_final > 0 {
            job.polls_until_final -= 1;
            return None;
        }

        let expenditures = std::mem::take(&mut job.expenditures);
        let settled = state.settle(job_handle, &expenditures);
        if let Some(job) = state.jobs.get_mut(&job_handle) {
            job.settled = Some(settled.clone());
        }
        Some(settled)
    }

    fn last_error(&self, handle: SessionHandle) -> Option<String> {
        self.state.lock().last_error.get(&handle.get()).cloned()
    }

    fn close(&self, handle: SessionHandle) {
        self.state.lock().open_sessions.remove(&handle.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LedgerTemplate, StatusDocument};
    use crate::domain::{Order, OrderChoices, OrderEstimate};
    use std::collections::HashMap as Map;

    fn order(media: &str) -> crate::domain::FrozenOrder {
        Order::new("sim")
            .with_choices(OrderChoices {
                quantity: 1,
                color_mode: "cmyk".to_string(),
                media_id: media.to_string(),
                media_display_name: String::new(),
                turnaround_time: "standard".to_string(),
                quality: "standard".to_string(),
                notes: String::new(),
            })
            .with_estimate(OrderEstimate {
                sheets_required: 10,
                toner_usage: Map::from([("cyan".to_string(), 2.5)]),
                estimated_cost: Decimal::ZERO,
            })
            .freeze()
            .unwrap()
    }

    #[test]
    fn test_settles_and_deducts_after_lag() {
        let ledger = SimulatedLedger::demo();
        ledger.settle_after_polls(1);
        let handle = ledger.open().unwrap();

        let mut template = LedgerTemplate::parse(&ledger.new_template(handle).unwrap()).unwrap();
        template.apply_order(&order("mint-media-gloss-a3")).unwrap();
        let job = ledger.submit(handle, &template.to_payload().unwrap());
        assert_ne!(job, 0);

        // Not settled yet, balances untouched
        assert!(ledger.status(handle, job).is_none());
        assert_eq!(ledger.balance("mint-toner-cyan"), Some(500.0));

        let status = StatusDocument::parse(&ledger.status(handle, job).unwrap()).unwrap();
        assert!(status.is_final && status.is_success());
        assert_eq!(ledger.balance("mint-toner-cyan"), Some(497.5));
        assert_eq!(ledger.balance("mint-media-gloss-a3"), Some(190.0));
        assert_eq!(status.ledger_entries("x").len(), 2);

        // Settled status is stable across polls
        assert_eq!(ledger.balance("mint-toner-cyan"), Some(497.5));
        assert!(ledger.status(handle, job).is_some());
        assert_eq!(ledger.balance("mint-toner-cyan"), Some(497.5));
    }

    #[test]
    fn test_rejects_echoed_balance_and_missing_expenditure() {
        let ledger = SimulatedLedger::demo();
        let handle = ledger.open().unwrap();
        let raw = ledger.new_template(handle).unwrap();

        assert_eq!(ledger.submit(handle, &raw), 0);
        assert!(ledger.last_error(handle).unwrap().contains("stale balance"));

        let mut doc: Value = serde_json::from_str(&raw).unwrap();
        for wallet in doc["inventoryParameters"]["wallets"].as_array_mut().unwrap() {
            for account in wallet["accounts"].as_array_mut().unwrap() {
                account.as_object_mut().unwrap().remove("estimatedBalance");
            }
        }
        assert_eq!(ledger.submit(handle, &doc.to_string()), 0);
        assert!(ledger
            .last_error(handle)
            .unwrap()
            .contains("missing currentExpenditure"));
    }

    #[test]
    fn test_insufficient_balance_fails_at_settlement() {
        let ledger = SimulatedLedger::demo();
        ledger.set_balance("mint-toner-cyan", 1.0);
        let handle = ledger.open().unwrap();

        let mut template = LedgerTemplate::parse(&ledger.new_template(handle).unwrap()).unwrap();
        template.apply_order(&order("mint-media-gloss-a3")).unwrap();
        let job = ledger.submit(handle, &template.to_payload().unwrap());

        let status = StatusDocument::parse(&ledger.status(handle, job).unwrap()).unwrap();
        assert!(status.is_final);
        assert!(!status.is_success());
        assert!(status.failure_text().contains("Insufficient balance"));
        assert_eq!(ledger.balance("mint-media-gloss-a3"), Some(200.0));
    }

    #[test]
    fn test_fault_injection() {
        let ledger = SimulatedLedger::demo();
        let handle = ledger.open().unwrap();

        ledger.fail_next_templates(1);
        assert!(ledger.new_template(handle).is_none());
        assert!(ledger.new_template(handle).is_some());
        assert_eq!(ledger.template_fetches(), 2);

        ledger.refuse_open(true);
        assert!(ledger.open().is_none());
        ledger.close(handle);
        assert_eq!(ledger.open_sessions(), 0);
    }
}
