//! TAO Treasury Backend service entrypoint.
//!
//! Loads configuration from the environment, builds the runtime context,
//! starts the three-tier sync scheduler and waits for ctrl-c. Exit
//! codes: 0 normal shutdown, 1 unhandled error, 2 invalid configuration.

use std::process::ExitCode;
use tao_treasury_backend::sync::SyncScheduler;
use tao_treasury_backend::{AppContext, Config};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tao_treasury_backend=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let ctx = AppContext::build(config).await?;
    let health = ctx.health().await;
    info!(
        database = %health.database,
        cache = %health.cache,
        upstream = %health.upstream_api,
        "startup health check"
    );

    let scheduler = SyncScheduler::new(ctx.sync.clone(), ctx.config.clone());
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler.stop().await;
    info!("goodbye");
    Ok(())
}
