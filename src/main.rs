//! VeilPool relayer - claim relaying service for the VeilPool transfer pool
//!
//! Recipients claim from the anonymous pool by posting a proof here; the
//! relayer pays for and signs every transaction, taking its fee from the
//! claimed amount, so the recipient never signs anything on-chain.

#![allow(dead_code)] // Public API items may not be used internally

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};

mod claim;
mod codec;
mod config;
mod deposit_verify;
mod error;
mod gateway;
mod handlers;
mod index;
mod proof_buffer;
mod replay;
mod voucher;

#[cfg(test)]
mod tests;

use claim::ClaimOrchestrator;
use config::RelayerConfig;
use gateway::LedgerGateway;
use handlers::{AppState, StaticSessionVerifier};
use index::DepositIndex;
use replay::RingCache;
use voucher::{RedeemThrottle, VoucherStore};

#[derive(Parser)]
#[command(name = "veilpool-relayer")]
#[command(version = "0.1.0")]
#[command(about = "Relayer service for the VeilPool anonymous transfer pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Solana RPC URL
    #[arg(long, global = true, default_value = "https://api.devnet.solana.com")]
    rpc_url: String,

    /// Path to the relayer keypair file
    #[arg(long, global = true)]
    keypair: Option<String>,

    /// Directory for the deposit index and voucher table
    #[arg(long, global = true)]
    data_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relayer HTTP service
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8787")]
        bind: String,

        /// Pool program address
        #[arg(long)]
        pool_program: String,

        /// Verifier program address
        #[arg(long)]
        verifier_program: String,

        /// Production mode: suppress error detail in responses
        #[arg(long)]
        production: bool,

        /// Wall-clock budget per claim request, in seconds
        #[arg(long, default_value_t = 120)]
        claim_timeout_secs: u64,
    },

    /// Purge claimed vouchers past the retention window
    CleanupVouchers {
        /// Retention window in days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("veilpool_relayer=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            pool_program,
            verifier_program,
            production,
            claim_timeout_secs,
        } => {
            serve(
                &bind,
                &cli.rpc_url,
                cli.keypair.as_deref(),
                &pool_program,
                &verifier_program,
                cli.data_dir.as_deref(),
                production,
                claim_timeout_secs,
            )
            .await
        }
        Commands::CleanupVouchers { days } => {
            let config = RelayerConfig::load(
                cli.rpc_url,
                // Programs are irrelevant for cleanup; placeholders keep one
                // config path for every command.
                "11111111111111111111111111111111",
                "11111111111111111111111111111111",
                cli.data_dir.as_deref(),
                true,
                120,
            )?;
            let vouchers =
                VoucherStore::open(&config.data_dir).map_err(|e| anyhow::anyhow!("{e}"))?;
            let removed = vouchers.cleanup(days).map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(removed, days, "voucher cleanup complete");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    bind: &str,
    rpc_url: &str,
    keypair_path: Option<&str>,
    pool_program: &str,
    verifier_program: &str,
    data_dir: Option<&str>,
    production: bool,
    claim_timeout_secs: u64,
) -> Result<()> {
    let config = RelayerConfig::load(
        rpc_url.to_string(),
        pool_program,
        verifier_program,
        data_dir,
        production,
        claim_timeout_secs,
    )?;
    error::set_production(production);

    let relayer = config::load_solana_keypair(keypair_path)?;
    let gateway = Arc::new(LedgerGateway::new(
        rpc_url,
        relayer,
        config.pool_program,
        config.verifier_program,
    ));
    tracing::info!(relayer = %gateway.relayer_pubkey(), %rpc_url, "relayer identity loaded");

    let cache = Arc::new(RingCache::default());
    let orchestrator = Arc::new(ClaimOrchestrator::new(Arc::clone(&gateway), cache));
    let index = Arc::new(DepositIndex::open(&config.data_dir).map_err(|e| anyhow::anyhow!("{e}"))?);
    let vouchers =
        Arc::new(VoucherStore::open(&config.data_dir).map_err(|e| anyhow::anyhow!("{e}"))?);
    let sessions = Arc::new(StaticSessionVerifier::new(config.session_identities.clone()));

    let state = Arc::new(AppState {
        config,
        gateway,
        orchestrator,
        index,
        vouchers,
        throttle: RedeemThrottle::new(),
        sessions,
    });

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/claim", post(handlers::claim))
        .route("/pool-info", get(handlers::pool_info))
        .route("/deposits/register", post(handlers::register_deposit))
        .route("/deposits", get(handlers::list_deposits))
        .route("/vouchers/:code", get(handlers::voucher_status))
        .route("/vouchers/redeem", post(handlers::redeem_voucher))
        .with_state(state);

    let addr: SocketAddr = bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind")?;
    tracing::info!(%addr, "relayer listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
