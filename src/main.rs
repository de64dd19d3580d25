use anyhow::Context;
use clap::Parser;
use printledger::adapters::SimulatedLedger;
use printledger::cli::{self, Cli, Commands, OutputMode, SubmitArgs};
use printledger::config::AppConfig;
use printledger::coordinator::LedgerServices;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    if let Some(mode) = cli.settlement {
        config.jobs.settlement = mode;
    }

    match &cli.command {
        Commands::Submit { .. } => init_logging(&config.logging),
        Commands::Inventory | Commands::Health => init_logging_simple(),
    }

    // The bundled ledger is in-process; a vendor binding implements the same trait
    let ledger = Arc::new(SimulatedLedger::demo());
    let services = LedgerServices::start(ledger, &config).context("failed to start ledger services")?;

    let mode = OutputMode::from_json_flag(cli.json);
    let outcome = run(&services, cli.command, mode);

    if !services.shutdown() {
        warn!("Some background threads did not stop in time");
    }
    outcome
}

fn run(services: &LedgerServices, command: Commands, mode: OutputMode) -> anyhow::Result<()> {
    match command {
        Commands::Inventory => cli::show_inventory(services, mode)?,
        Commands::Health => cli::print_health(services, mode)?,
        Commands::Submit {
            name,
            media,
            sheets,
            toner,
            quantity,
            wait_secs,
        } => {
            // Give the first refresh a moment so media names resolve
            if let Err(e) = services.inventory().force_refresh() {
                warn!("Initial inventory refresh failed: {}", e);
            }
            let result = cli::submit_job(
                services,
                SubmitArgs {
                    name,
                    media,
                    sheets,
                    toner,
                    quantity,
                    wait: Duration::from_secs(wait_secs),
                },
            )?;
            cli::print_result(&result, mode)?;
            if result.is_error() {
                anyhow::bail!("job {} failed", result.job_id);
            }
        }
    }
    Ok(())
}
