use cargoledger::application::orchestrator::{DeliveryProof, TransactionOrchestrator, TransactionView};
use cargoledger::config::EngineConfig;
use cargoledger::domain::ports::{GatewayRef, NotifierRef, StoreRef};
use cargoledger::error::SettlementError;
use cargoledger::infrastructure::in_memory::InMemoryStore;
#[cfg(feature = "storage-rocksdb")]
use cargoledger::infrastructure::rocksdb::RocksDbStore;
use cargoledger::infrastructure::simulated::{LogNotifier, SimulatedGateway};
use cargoledger::interfaces::csv::summary_writer::SummaryWriter;
use cargoledger::interfaces::jsonl::command_reader::{Command, CommandReader};
use cargoledger::telemetry;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands, one JSON object per line
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON file with engine settings; flags below override it
    #[arg(long, env = "CARGOLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Platform fee in basis points
    #[arg(long, env = "CARGOLEDGER_PLATFORM_FEE_BPS")]
    platform_fee_bps: Option<u32>,

    /// Hours before a held escrow counts as overdue
    #[arg(long, env = "CARGOLEDGER_ESCROW_SLA_HOURS")]
    escrow_sla_hours: Option<i64>,

    #[arg(long, env = "CARGOLEDGER_CURRENCY")]
    currency: Option<String>,

    /// Simulate a gateway that declines every charge
    #[arg(long)]
    decline_payments: bool,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path).into_diagnostic()?;
                serde_json::from_reader(file).into_diagnostic()?
            }
            None => EngineConfig::default(),
        };
        if let Some(bps) = self.platform_fee_bps {
            config.platform_fee_bps = bps;
        }
        if let Some(hours) = self.escrow_sla_hours {
            config.escrow_sla_hours = hours;
        }
        if let Some(currency) = &self.currency {
            config.currency = currency.clone();
        }
        Ok(config)
    }
}

fn open_store(db_path: Option<PathBuf>) -> Result<StoreRef> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => Ok(Arc::new(RocksDbStore::open(path)?)),
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

async fn current_transaction(orchestrator: &TransactionOrchestrator, order_id: &str) -> cargoledger::error::Result<String> {
    orchestrator
        .transaction_for_order(order_id)
        .await?
        .map(|txn| txn.transaction_id)
        .ok_or_else(|| SettlementError::not_found("order", order_id))
}

async fn apply(orchestrator: &TransactionOrchestrator, command: Command) -> cargoledger::error::Result<String> {
    let result = match command {
        Command::Initiate { request } => {
            let result = orchestrator.initiate_transaction(request).await?;
            if !result.success {
                tracing::warn!(transaction_id = %result.transaction_id, message = %result.message, "initiation did not complete");
            }
            result
        }
        Command::ConfirmDelivery {
            order_id,
            confirmation_id,
            confirmed_by,
            notes,
        } => {
            let id = current_transaction(orchestrator, &order_id).await?;
            let proof = DeliveryProof {
                confirmation_id,
                confirmed_by,
                notes,
            };
            orchestrator.confirm_delivery_and_release_escrow(&id, Some(proof)).await?
        }
        Command::Refund { order_id, reason } => {
            let id = current_transaction(orchestrator, &order_id).await?;
            orchestrator.refund_transaction(&id, &reason).await?
        }
        Command::Dispute {
            order_id,
            reason,
            initiated_by,
            evidence,
        } => {
            let id = current_transaction(orchestrator, &order_id).await?;
            orchestrator.raise_dispute(&id, &reason, &initiated_by, evidence).await?
        }
        Command::Resume { order_id } => {
            let id = current_transaction(orchestrator, &order_id).await?;
            orchestrator.resume_transaction(&id).await?
        }
    };
    Ok(result.transaction_id)
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    let config = cli.engine_config()?;
    let input = cli.input.clone();
    let store = open_store(cli.db_path)?;
    let gateway: GatewayRef = if cli.decline_payments {
        Arc::new(SimulatedGateway::declining("payment declined by provider"))
    } else {
        Arc::new(SimulatedGateway::approving())
    };
    let notifier: NotifierRef = Arc::new(LogNotifier);
    let orchestrator = TransactionOrchestrator::new(store, gateway, notifier, config);

    // Replay commands
    let file = File::open(input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    let mut seen = HashSet::new();
    let mut touched = Vec::new();
    for command in reader.commands() {
        match command {
            Ok(command) => {
                let order_id = command.order_id().to_string();
                match apply(&orchestrator, command).await {
                    Ok(transaction_id) => {
                        if seen.insert(transaction_id.clone()) {
                            touched.push(transaction_id);
                        }
                    }
                    Err(e) => eprintln!("Error processing command for order {}: {}", order_id, e),
                }
            }
            Err(e) => eprintln!("Error reading command: {}", e),
        }
    }

    let mut views: Vec<TransactionView> = Vec::with_capacity(touched.len());
    for transaction_id in &touched {
        views.push(orchestrator.get_transaction_status(transaction_id).await?);
    }

    let stdout = io::stdout();
    let mut writer = SummaryWriter::new(stdout.lock());
    writer.write_views(&views)?;

    Ok(())
}
