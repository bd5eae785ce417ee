//! Entry point for the Payout Engine binary.
//!
//! Running this binary starts an HTTP server over an in-memory ledger and
//! a sandbox transfer provider.  The engine configuration is read from
//! the JSON file named by `PAYOUT_CONFIG_PATH` (defaults apply when the
//! file is absent), the bind address from `PAYOUT_BIND_ADDR` and the log
//! filter from `PAYOUT_LOG`.

use payout_engine::config::load_config;
use payout_engine::notify::TracingNotifier;
use payout_engine::provider::SandboxTransferProvider;
use payout_engine::store::MemoryStore;
use payout_engine::work_units::MemoryWorkUnits;
use payout_engine::EngineContext;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "payout engine stopped");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PAYOUT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run() -> anyhow::Result<()> {
    let config_path = std::env::var("PAYOUT_CONFIG_PATH").unwrap_or_else(|_| "payout.json".to_string());
    let config = load_config(&PathBuf::from(config_path))?;
    let addr = std::env::var("PAYOUT_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());

    let provider = SandboxTransferProvider::new(config.currency.clone(), dec!(1000000));
    let ctx = EngineContext::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(provider),
        Arc::new(MemoryWorkUnits::new()),
        Arc::new(TracingNotifier),
    );
    payout_engine::api::serve(&addr, ctx).await
}
