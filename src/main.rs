use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use payrecon::application::{
    OrderStateMachine, PaymentLedger, ProviderRegistry, ReconciliationService,
};
use payrecon::config::AppConfig;
use payrecon::domain::payment::PaymentStatus;
use payrecon::domain::ports::{NotifierRef, OrderStore, OrderStoreRef, PaymentStore, PaymentStoreRef};
use payrecon::infrastructure::in_memory::InMemoryStore;
use payrecon::infrastructure::notifier::{HttpNotifier, LogNotifier};
use payrecon::infrastructure::providers::{CardWalletClient, MobileMoneyClient};
use payrecon::interfaces::csv::payment_writer::PaymentWriter;
use payrecon::interfaces::http;
use payrecon::telemetry;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and periodically reconcile stale pending payments
    Serve {
        /// Listen address (overrides PAYRECON_BIND)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Poll providers once for pending payments and print the tally as JSON
    Sweep {
        /// Only poll payments pending for at least this many seconds
        #[arg(long)]
        min_age_secs: Option<u64>,
    },
    /// Write the payment ledger to stdout as CSV
    Report {
        /// Only include payments in this status
        #[arg(long)]
        status: Option<String>,
    },
}

fn shared<S>(store: Arc<S>) -> (PaymentStoreRef, OrderStoreRef)
where
    S: PaymentStore + OrderStore + 'static,
{
    let payments: PaymentStoreRef = store.clone();
    let orders: OrderStoreRef = store;
    (payments, orders)
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<(PaymentStoreRef, OrderStoreRef)> {
    use payrecon::infrastructure::rocksdb::RocksDbStore;

    match db_path {
        Some(path) => Ok(shared(Arc::new(RocksDbStore::open(path).into_diagnostic()?))),
        None => Ok(shared(Arc::new(InMemoryStore::new()))),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<(PaymentStoreRef, OrderStoreRef)> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(shared(Arc::new(InMemoryStore::new())))
}

fn build_service(
    config: &AppConfig,
    payments: PaymentStoreRef,
    orders: OrderStoreRef,
) -> Result<Arc<ReconciliationService>> {
    let mut providers = ProviderRegistry::new();
    if let Some(provider_config) = config.card_wallet.clone() {
        providers = providers.with(Arc::new(
            CardWalletClient::new(provider_config).into_diagnostic()?,
        ));
    }
    if let Some(provider_config) = config.mobile_money.clone() {
        providers = providers.with(Arc::new(
            MobileMoneyClient::new(provider_config).into_diagnostic()?,
        ));
    }
    let configured: Vec<_> = providers.configured().map(|p| p.as_str()).collect();
    if configured.is_empty() {
        warn!("No payment provider configured");
    } else {
        info!(providers = ?configured, "Payment providers configured");
    }

    let notifier: NotifierRef = match &config.notify_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone(), NOTIFY_TIMEOUT).into_diagnostic()?),
        None => Arc::new(LogNotifier),
    };

    Ok(Arc::new(ReconciliationService::new(
        PaymentLedger::new(payments),
        OrderStateMachine::new(orders, notifier),
        providers,
        config.retry.clone(),
        config.public_base_url.clone(),
    )))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env().into_diagnostic()?;

    let (payments, orders) = open_stores(cli.db_path)?;
    let service = build_service(&config, payments, orders)?;

    match cli.command {
        Command::Serve { bind } => {
            let min_age = chrono::Duration::from_std(config.sweep_min_age).into_diagnostic()?;
            let sweeper = {
                let service = service.clone();
                let interval = config.sweep_interval;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if let Err(e) = service.reconcile_pending(min_age).await {
                            error!(error = %e, "Pending sweep aborted");
                        }
                    }
                })
            };

            let addr = bind.unwrap_or(config.bind_addr);
            let served = http::serve(service, addr, shutdown_signal()).await;
            sweeper.abort();
            served.into_diagnostic()?;
        }
        Command::Sweep { min_age_secs } => {
            let min_age = min_age_secs
                .map(Duration::from_secs)
                .unwrap_or(config.sweep_min_age);
            let min_age = chrono::Duration::from_std(min_age).into_diagnostic()?;
            let report = service.reconcile_pending(min_age).await.into_diagnostic()?;
            println!("{}", serde_json::to_string(&report).into_diagnostic()?);
        }
        Command::Report { status } => {
            let payments = match status {
                Some(status) => {
                    let status: PaymentStatus = status.parse().into_diagnostic()?;
                    service.ledger().with_status(status).await
                }
                None => service.ledger().all().await,
            }
            .into_diagnostic()?;

            let stdout = io::stdout();
            let mut writer = PaymentWriter::new(stdout.lock());
            writer.write_payments(&payments).into_diagnostic()?;
        }
    }

    Ok(())
}
