use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::warn;

use ig_repostbot::config;
use ig_repostbot::db;
use ig_repostbot::model::Pairing;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print persisted pairing state and last run summaries"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only show pairings of this Telegram user id
    #[arg(long)]
    user: Option<i64>,
}

fn flags(p: &Pairing) -> String {
    let mut out = Vec::new();
    if p.paused {
        out.push("paused");
    }
    if p.user_paused {
        out.push("user-paused");
    }
    if p.auth_suspended {
        out.push("auth-suspended");
    }
    if out.is_empty() {
        "active".to_string()
    } else {
        out.join(",")
    }
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

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let pairings = match args.user {
        Some(tg_user_id) => match db::find_user_id(&pool, tg_user_id).await? {
            Some(user_id) => db::list_pairings_for_user(&pool, user_id).await?,
            None => {
                warn!(tg_user_id, "unknown user");
                Vec::new()
            }
        },
        None => db::list_all_pairings(&pool).await?,
    };

    if pairings.is_empty() {
        println!("no pairings");
        return Ok(());
    }

    for p in &pairings {
        let seen = db::dedup_media_ids(&pool, p.id).await?.len();
        println!(
            "#{} user={} {} -> {} every {}m [{}] seen={}",
            p.id,
            p.tg_user_id,
            p.source_account,
            p.destination_account,
            p.options.interval_minutes,
            flags(p),
            seen
        );
        let record = db::fetch_run_record(&pool, p.id).await?.unwrap_or_default();
        match record.summary() {
            Some(run) => {
                println!(
                    "    last run {} at {}: {} published={} skipped={}",
                    run.run_id,
                    run.finished_at.to_rfc3339(),
                    run.outcome.as_str(),
                    run.published,
                    run.skipped
                );
                if let Some(err) = &run.error {
                    println!("    error: {}", err);
                }
            }
            None => println!("    never run"),
        }
        if let Some(at) = record.last_reposted_at {
            println!("    last repost at {}", at.to_rfc3339());
        }
    }
    Ok(())
}
