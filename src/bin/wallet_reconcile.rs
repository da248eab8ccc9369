use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use bubbles_wallet::{
    adapters::{
        database::postgres::{DatabaseConfig, PostgresDatabase},
        member::http::HttpMemberDirectory,
        payment::http::HttpPaymentGateway,
    },
    commands::{DomainLogic, ExpireStaleTopupsRequest, ReconcileWalletRequest},
    config::WalletConfig,
    domain::Page,
    ports::database::DatabasePort,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Maintenance jobs for the wallet ledger
#[derive(Parser, Debug)]
#[command(name = "wallet-reconcile", version)]
struct Cli {
    /// Apply pending migrations before running
    #[arg(long)]
    migrate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare cached balances against the ledger
    ///
    /// Exits with a non-zero status if any wallet drifted.
    Wallets {
        /// Only check this wallet
        #[arg(long)]
        wallet_id: Option<Uuid>,

        #[arg(long, default_value_t = 100)]
        page_size: u32,
    },
    /// Expire topups that were never confirmed
    Topups,
}

type Logic = DomainLogic<PostgresDatabase, PostgresDatabase, HttpMemberDirectory, HttpPaymentGateway>;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = WalletConfig::from_env().context("invalid wallet configuration")?;
    let database_config = DatabaseConfig::from_env().context("invalid database configuration")?;
    let database = Arc::new(
        PostgresDatabase::connect(&database_config)
            .await
            .context("cannot connect to the database")?,
    );
    if cli.migrate {
        database.migrate().await.context("migrations failed")?;
    }
    let logic = DomainLogic::new(
        database.clone(),
        database.clone(),
        Arc::new(HttpMemberDirectory::new(HttpMemberDirectory::config_from_env()?)?),
        Arc::new(HttpPaymentGateway::new(HttpPaymentGateway::config_from_env()?)?),
        config,
    );

    match cli.command {
        Command::Wallets {
            wallet_id: Some(wallet_id),
            ..
        } => reconcile_wallets(&logic, vec![wallet_id]).await,
        Command::Wallets { page_size, .. } => {
            let mut wallet_ids = Vec::new();
            let mut offset = 0;
            loop {
                let page = Page::new(offset, page_size);
                let ids = database.list_wallet_ids(page).await?;
                if ids.is_empty() {
                    break;
                }
                offset += page.limit;
                wallet_ids.extend(ids);
            }
            reconcile_wallets(&logic, wallet_ids).await
        }
        Command::Topups => {
            let expired = logic
                .expire_stale_topups(ExpireStaleTopupsRequest { now: Utc::now() })
                .await?;
            info!(expired, "topup expiry finished");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn reconcile_wallets(logic: &Logic, wallet_ids: Vec<Uuid>) -> anyhow::Result<ExitCode> {
    let total = wallet_ids.len();
    let mut drifted = 0;
    for wallet_id in wallet_ids {
        let report = logic
            .reconcile_wallet(ReconcileWalletRequest { wallet_id })
            .await
            .with_context(|| format!("cannot reconcile wallet {wallet_id}"))?;
        if !report.consistent {
            drifted += 1;
        }
    }

    if drifted > 0 {
        warn!(total, drifted, "reconciliation found drifted wallets");
        return Ok(ExitCode::FAILURE);
    }
    info!(total, "all wallets are consistent");
    Ok(ExitCode::SUCCESS)
}
