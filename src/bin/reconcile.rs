//! One-shot reconciliation run: stored positions vs live balances.

use clap::Parser;
use tao_treasury_backend::reconciliation::ReconciliationService;
use tao_treasury_backend::{AppContext, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "reconcile", about = "Reconcile stored positions against the live API")]
struct Args {
    /// Wallet to reconcile; defaults to the configured wallet.
    #[arg(long)]
    wallet: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tao_treasury_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let ctx = AppContext::build(Config::from_env()?).await?;
    let wallet = args
        .wallet
        .unwrap_or_else(|| ctx.config.wallet_address.clone());

    let service =
        ReconciliationService::new(ctx.store.clone(), ctx.client.clone(), ctx.config.clone());
    let run = service.run(&wallet).await?;

    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.passed {
        Ok(())
    } else {
        anyhow::bail!(
            "reconciliation failed: {} of {} checks",
            run.failed_checks,
            run.total_checks
        )
    }
}
