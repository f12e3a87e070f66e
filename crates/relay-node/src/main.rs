//! Bridge relay node.
//!
//! Loads the deployment files, connects to both ledgers and runs the relay
//! engine until interrupted.

mod config;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_engine::{RelayConfig, RelayEngine};
use relay_ledger::{EvmConfig, EvmLedger, GatewayClient, GatewayConfig, LedgerClient};
use relay_store::{MemoryStore, TransferStore};
use relay_types::format_units;

/// How the node reaches the two ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LedgerBackend {
    /// JSON-RPC nodes, signing with `--private-key`.
    Evm,
    /// Signing gateways, authenticated with `--relayer-api-key`.
    Gateway,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"), version)]
struct Args {
    #[clap(long, value_enum, env = "LEDGER_BACKEND", default_value_t = LedgerBackend::Evm)]
    ledger_backend: LedgerBackend,

    /// Endpoint of the source ledger (lock contract side).
    #[clap(long, env = "SOURCE_RPC_URL", default_value = "http://localhost:8545")]
    source_url: String,

    /// Endpoint of the destination ledger (credit contract side).
    #[clap(long, env = "DESTINATION_RPC_URL", default_value = "http://localhost:8546")]
    destination_url: String,

    /// Hex private key of the relay identity on both ledgers.
    #[clap(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Signing credential of the relay identity on both gateways.
    #[clap(long, env = "RELAYER_API_KEY", hide_env_values = true)]
    relayer_api_key: Option<String>,

    #[clap(long, env = "SOURCE_DEPLOYMENT", default_value = "deployments/source.json")]
    source_deployment: PathBuf,

    #[clap(long, env = "DESTINATION_DEPLOYMENT", default_value = "deployments/destination.json")]
    destination_deployment: PathBuf,

    #[clap(long, env = "STATS_INTERVAL_SECS", default_value_t = 60)]
    stats_interval_secs: u64,

    /// Decimals of the bridged asset, for log output.
    #[clap(long, env = "AMOUNT_DECIMALS", default_value_t = 18, value_parser = clap::value_parser!(u8).range(0..=77))]
    amount_decimals: u8,

    /// Receipt and event poll interval.
    #[clap(long, env = "POLL_MS", default_value_t = 2_000)]
    poll_ms: u64,

    /// Most blocks covered by one log query.
    #[clap(long, env = "LOG_BLOCK_RANGE", default_value_t = 1_000)]
    log_block_range: u64,
}

impl Args {
    async fn ledger(&self, name: &str, url: &str) -> anyhow::Result<Arc<dyn LedgerClient>> {
        match self.ledger_backend {
            LedgerBackend::Evm => {
                let key = self
                    .private_key
                    .as_deref()
                    .context("--private-key (PRIVATE_KEY) is required for the evm backend")?;
                let mut config = EvmConfig::new(url);
                config.poll_ms = self.poll_ms;
                config.block_range = self.log_block_range;
                let ledger = EvmLedger::connect(name, &config, key)
                    .await
                    .with_context(|| format!("failed to connect to {name} ledger at {url}"))?;
                Ok(Arc::new(ledger))
            }
            LedgerBackend::Gateway => {
                let key = self
                    .relayer_api_key
                    .clone()
                    .context("--relayer-api-key (RELAYER_API_KEY) is required for the gateway backend")?;
                let mut config = GatewayConfig::new(url);
                config.api_key = Some(key);
                config.poll_ms = self.poll_ms;
                Ok(Arc::new(GatewayClient::new(name, config)))
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing();

    let addresses = config::load_address_book(&args.source_deployment, &args.destination_deployment)
        .context("failed to load deployment addresses")?;

    let source = args.ledger("source", &args.source_url).await?;
    let destination = args.ledger("destination", &args.destination_url).await?;
    let store = Arc::new(MemoryStore::new());

    let engine = RelayEngine::new(
        RelayConfig {
            stats_interval_ms: args.stats_interval_secs.saturating_mul(1_000),
            amount_decimals: args.amount_decimals as usize,
        },
        addresses,
        store.clone(),
        source,
        destination,
    );

    engine.start().await.context("failed to start relay engine")?;

    shutdown_signal().await;
    info!("shutting down relay");
    engine.stop();

    let stats = engine.stats().await?;
    info!(
        total_deposits = stats.total_deposits,
        total_withdrawals = stats.total_withdrawals,
        total_volume = %format_units(stats.total_volume, args.amount_decimals as usize),
        "final bridge statistics"
    );
    store.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_evm_backend() {
        let args = Args::try_parse_from(["relay-node", "--private-key", "0xabc"]).unwrap();
        assert_eq!(args.ledger_backend, LedgerBackend::Evm);
        assert_eq!(args.private_key.as_deref(), Some("0xabc"));
        assert_eq!(args.amount_decimals, 18);
    }

    #[test]
    fn test_gateway_backend_selection() {
        let args = Args::try_parse_from([
            "relay-node",
            "--ledger-backend",
            "gateway",
            "--source-url",
            "http://gateway-a",
        ])
        .unwrap();
        assert_eq!(args.ledger_backend, LedgerBackend::Gateway);
        assert_eq!(args.source_url, "http://gateway-a");
    }

    #[test]
    fn test_amount_decimals_are_bounded() {
        assert!(Args::try_parse_from(["relay-node", "--amount-decimals", "77"]).is_ok());
        assert!(Args::try_parse_from(["relay-node", "--amount-decimals", "160"]).is_err());
    }

    #[tokio::test]
    async fn test_missing_credential_is_reported() {
        let args = Args::try_parse_from(["relay-node", "--ledger-backend", "gateway"]).unwrap();
        let err = args.ledger("source", "http://localhost:1").await.err().unwrap();
        assert!(err.to_string().contains("RELAYER_API_KEY"));
    }
}
