use anyhow::Result;
use clap::Parser;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info};

use ig_repostbot::config;
use ig_repostbot::db;
use ig_repostbot::instagram::InstagramClient;
use ig_repostbot::notify::TelegramNotifier;
use ig_repostbot::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let api = Arc::new(InstagramClient::from_config(&cfg)?);
    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let notifier = Arc::new(TelegramNotifier::new(bot));

    let scheduler = Scheduler::new(pool, api, notifier, &cfg);
    let restored = scheduler.restore(Utc::now()).await?;
    info!(restored, "starting scheduler");

    scheduler
        .run(cfg.tick_interval(), async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        })
        .await;

    Ok(())
}
