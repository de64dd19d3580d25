use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};
use tabled::{Table, Tabled};
use tracing::info;

use crate::config::SettlementMode;
use crate::coordinator::{JobPoll, LedgerServices};
use crate::domain::{InventorySnapshot, JobId, JobResult, JobStatus, Order, OrderChoices, OrderEstimate};
use crate::error::{LedgerError, Result};

#[derive(Parser)]
#[command(name = "printledger")]
#[command(version)]
#[command(about = "Consumable ledger client for print jobs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus per-environment overrides)
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Print JSON instead of tables
    #[arg(long)]
    pub json: bool,

    /// Override jobs.settlement (blocking|provisional)
    #[arg(long)]
    pub settlement: Option<SettlementMode>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Refresh inventory and print current balances
    Inventory,
    /// Submit a print job and wait for its result
    Submit {
        /// Job name
        #[arg(long, default_value = "cli-job")]
        name: String,
        /// Media account id
        #[arg(long)]
        media: String,
        /// Sheets required
        #[arg(long, default_value = "1")]
        sheets: u32,
        /// Toner usage as COLOR=ML, repeatable
        #[arg(long = "toner", value_parser = parse_usage)]
        toner: Vec<(String, f64)>,
        /// Copies
        #[arg(long, default_value = "1")]
        quantity: u32,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "90")]
        wait_secs: u64,
    },
    /// Print subsystem health
    Health,
}

fn parse_usage(raw: &str) -> std::result::Result<(String, f64), String> {
    let (color, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected COLOR=ML, got '{raw}'"))?;
    let amount: f64 = amount
        .trim()
        .parse()
        .map_err(|e| format!("invalid amount in '{raw}': {e}"))?;
    Ok((color.trim().to_string(), amount))
}

/// Output mode for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
pub struct TonerRow {
    pub color: String,
    pub balance_ml: String,
    pub account: String,
    pub slot: String,
    pub product: String,
    pub price: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct MediaRow {
    pub account: String,
    pub name: String,
    pub sheets: String,
    pub size_mm: String,
    pub price: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct EntryRow {
    pub account: String,
    pub amount: String,
    pub unit: String,
    pub tx_id: String,
}

fn toner_rows(snapshot: &InventorySnapshot) -> Vec<TonerRow> {
    snapshot
        .toner_balances
        .iter()
        .map(|t| TonerRow {
            color: t.color.clone(),
            balance_ml: format!("{:.1}", t.balance_ml),
            account: t.account_id.clone(),
            slot: t.slot_number.map(|s| s.to_string()).unwrap_or_default(),
            product: t.product_name.clone(),
            price: t.price.to_string(),
        })
        .collect()
}

fn media_rows(snapshot: &InventorySnapshot) -> Vec<MediaRow> {
    snapshot
        .media_options
        .iter()
        .map(|m| MediaRow {
            account: m.account_id.clone(),
            name: m.display_name.clone(),
            sheets: format!("{:.0}", m.balance_sheets),
            size_mm: format!("{}x{}", m.width_mm, m.height_mm),
            price: m.price.to_string(),
        })
        .collect()
}

/// Force a refresh and print what the ledger holds
pub fn show_inventory(services: &LedgerServices, mode: OutputMode) -> Result<()> {
    let snapshot = services.inventory().force_refresh()?;
    if mode == OutputMode::Table {
        println!("Inventory fetched at {}", snapshot.fetched_at.to_rfc3339());
        println!("\nToner:");
    }
    print_items(&toner_rows(&snapshot), mode)?;
    if mode == OutputMode::Table {
        println!("\nMedia:");
    }
    print_items(&media_rows(&snapshot), mode)
}

pub struct SubmitArgs {
    pub name: String,
    pub media: String,
    pub sheets: u32,
    pub toner: Vec<(String, f64)>,
    pub quantity: u32,
    pub wait: Duration,
}

/// Submit one job and wait for its terminal result
pub fn submit_job(services: &LedgerServices, args: SubmitArgs) -> Result<JobResult> {
    let mut toner_usage: HashMap<String, f64> = HashMap::new();
    for (color, amount) in args.toner {
        *toner_usage.entry(color).or_insert(0.0) += amount;
    }
    let media_display_name = services
        .inventory()
        .snapshot()
        .media_by_id(&args.media)
        .map(|m| m.display_name.clone())
        .unwrap_or_else(|| args.media.clone());

    let order = Order::new(args.name)
        .with_choices(OrderChoices {
            quantity: args.quantity,
            color_mode: "cmyk".to_string(),
            media_id: args.media,
            media_display_name,
            turnaround_time: "standard".to_string(),
            quality: "standard".to_string(),
            notes: String::new(),
        })
        .with_estimate(OrderEstimate {
            sheets_required: args.sheets,
            toner_usage,
            ..Default::default()
        });

    let coordinator = services.coordinator();
    let job_id = coordinator.submit(order.freeze()?)?;
    info!("Submitted job {}", job_id);

    let deadline = Instant::now() + args.wait;
    let result = wait_for_result(services, &job_id, deadline)?;
    if result.status != JobStatus::Submitted {
        return Ok(result);
    }

    // Provisional mode: the finalizer owns the final outcome
    let Some(finalizer) = services.finalizer() else {
        return Ok(result);
    };
    println!("Job {} submitted (ledger job {:?}), awaiting settlement...", job_id, result.job_handle);
    while Instant::now() < deadline {
        if let Some(settled) = finalizer.take_settlement(&job_id) {
            return Ok(settled);
        }
        thread::sleep(Duration::from_millis(250));
    }
    Ok(result)
}

fn wait_for_result(services: &LedgerServices, job_id: &JobId, deadline: Instant) -> Result<JobResult> {
    loop {
        match services.coordinator().poll(job_id) {
            JobPoll::Ready(result) => return Ok(result),
            JobPoll::Running if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(100))
            }
            JobPoll::Running => {
                return Err(LedgerError::Internal(format!(
                    "job {job_id} still running when the wait expired"
                )))
            }
            JobPoll::Consumed => {
                return Err(LedgerError::ResultAlreadyConsumed {
                    job_id: job_id.to_string(),
                })
            }
            JobPoll::Unknown => {
                return Err(LedgerError::JobNotFound {
                    job_id: job_id.to_string(),
                })
            }
        }
    }
}

pub fn print_result(result: &JobResult, mode: OutputMode) -> Result<()> {
    if mode == OutputMode::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("Job {}: {}", result.job_id, result.status);
    println!("{}", result.notes);
    let rows: Vec<EntryRow> = result
        .ledger_entries
        .iter()
        .map(|e| EntryRow {
            account: e.account.clone(),
            amount: format!("{:.2}", e.amount),
            unit: e.unit.clone(),
            tx_id: e.tx_id.clone(),
        })
        .collect();
    if !rows.is_empty() {
        print_items(&rows, mode)?;
    }
    Ok(())
}

pub fn print_health(services: &LedgerServices, mode: OutputMode) -> Result<()> {
    let report = services.health();
    match mode {
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputMode::Table => {
            println!("Status: {:?}", report.status);
            for component in &report.components {
                println!(
                    "  {:<10} {:?} {}",
                    component.name,
                    component.status,
                    component.message.as_deref().unwrap_or("")
                );
            }
            println!(
                "Inventory age {}s, {} consecutive failures, {} active jobs, {} pending settlements",
                report.inventory_age_secs,
                report.consecutive_failures,
                report.active_jobs,
                report.pending_settlements
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usage() {
        assert_eq!(parse_usage("cyan=1.5").unwrap(), ("cyan".to_string(), 1.5));
        assert!(parse_usage("cyan").is_err());
        assert!(parse_usage("cyan=lots").is_err());
    }

    #[test]
    fn test_cli_parses_submit() {
        let cli = Cli::try_parse_from([
            "printledger",
            "--settlement",
            "provisional",
            "submit",
            "--media",
            "mint-media-gloss-a3",
            "--toner",
            "cyan=1.5",
            "--toner",
            "black=2",
        ])
        .unwrap();
        assert_eq!(cli.settlement, Some(SettlementMode::Provisional));
        match cli.command {
            Commands::Submit { toner, sheets, .. } => {
                assert_eq!(toner.len(), 2);
                assert_eq!(sheets, 1);
            }
            _ => panic!("expected submit"),
        }
    }
}
