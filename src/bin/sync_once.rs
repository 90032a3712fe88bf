//! Run a single sync tier and exit. Operational tool for backfills and
//! debugging without the resident scheduler.

use clap::Parser;
use tao_treasury_backend::models::SyncTier;
use tao_treasury_backend::{AppContext, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sync-once", about = "Run one sync tier and exit")]
struct Args {
    /// Tier to run: refresh, full or deep.
    #[arg(long, default_value = "refresh")]
    tier: String,
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
    let tier = match args.tier.as_str() {
        "refresh" => SyncTier::Refresh,
        "full" => SyncTier::Full,
        "deep" => SyncTier::Deep,
        other => anyhow::bail!("unknown tier: {other}"),
    };

    let ctx = AppContext::build(Config::from_env()?).await?;
    let cancel = CancellationToken::new();
    let result = ctx.sync.sync_all(tier, &cancel).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("sync completed with {} error(s)", result.errors.len())
    }
}
