//! ledger-reconcile
//!
//! Compares every account's stored balance with the signed sum of its
//! completed ledger entries and prints a JSON report.
//!
//! ```text
//! ledger-reconcile [--env dev] [--config path/to/config.yaml]
//! ```
//!
//! Exit status is 0 when the ledger is consistent, 1 on any discrepancy.

use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info};

use transfer_ledger::config::LedgerConfig;
use transfer_ledger::ledger::Discrepancy;
use transfer_ledger::logging::init_logging;
use transfer_ledger::services::LedgerServices;
use transfer_ledger::store::LedgerStore;

#[derive(Debug, Serialize)]
struct ReconcileReport {
    accounts_checked: usize,
    consistent: bool,
    discrepancies: Vec<Discrepancy>,
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn load_config(args: &[String]) -> Result<LedgerConfig> {
    if let Some(path) = arg_value(args, "--config") {
        return LedgerConfig::load(&path).with_context(|| format!("loading {path}"));
    }
    let env = arg_value(args, "--env").unwrap_or_else(|| "dev".to_string());
    LedgerConfig::for_env(&env).with_context(|| format!("loading config for env '{env}'"))
}

async fn run(config: &LedgerConfig) -> Result<ReconcileReport> {
    let services = LedgerServices::connect(config)
        .await
        .context("connecting to PostgreSQL")?;

    let accounts_checked = services.store.list_accounts().await?.len();
    let discrepancies = services.ledger.reconcile().await?;

    Ok(ReconcileReport {
        accounts_checked,
        consistent: discrepancies.is_empty(),
        discrepancies,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().collect();
    let config = load_config(&args)?;
    let _guard = init_logging(&config.logging);

    info!("Starting ledger reconciliation");
    let report = run(&config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.consistent {
        info!(accounts = report.accounts_checked, "Ledger is consistent");
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            discrepancies = report.discrepancies.len(),
            "Ledger balances do not match stored balances"
        );
        Ok(ExitCode::FAILURE)
    }
}
