use anyhow::{bail, Result};
use clap::Parser;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use adsync::app::Engines;
use adsync::config;
use adsync::db::{self, SqliteStore};
use adsync::model::Namespace;
use adsync::store::MetadataStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Poll outstanding batch jobs until none remain and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit instead of waiting when every outstanding job is in backoff
    #[arg(long)]
    skip_waiting: bool,

    /// Give up once an outstanding job has been polled this many times
    #[arg(long, default_value = "10")]
    max_attempts: i32,

    /// Longest sleep between passes while jobs are in backoff
    #[arg(long, default_value = "60")]
    max_wait_secs: u64,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let ns = Namespace::new(cfg.app.namespace.clone());

    let engines = Engines::from_config(&cfg, store.clone())?;
    if engines.is_empty() {
        bail!("no platform is enabled in {}", args.config.display());
    }

    // Jobs of disabled platforms are never polled here.
    let platforms = engines.platforms();
    let load_outstanding = || async {
        let jobs = store.outstanding_jobs(&ns).await?;
        anyhow::Ok(
            jobs.into_iter()
                .filter(|j| platforms.contains(&j.platform))
                .collect::<Vec<_>>(),
        )
    };

    let initial = load_outstanding().await?.len();
    info!(outstanding = initial, "starting drain");
    if initial == 0 {
        info!("no outstanding jobs, exiting");
        return Ok(());
    }

    let mut passes = 0u64;
    loop {
        if let Err(err) = engines.check().await {
            error!(?err, "check pass failed");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        passes += 1;

        let outstanding = load_outstanding().await?;
        if outstanding.is_empty() {
            info!(passes, "all jobs drained");
            break;
        }

        let max_attempts = outstanding.iter().map(|j| j.attempts).max().unwrap_or(0);
        if max_attempts >= args.max_attempts {
            error!(
                max_attempts,
                threshold = args.max_attempts,
                remaining = outstanding.len(),
                "jobs exceeded the attempt threshold, exiting"
            );
            break;
        }

        let now = Utc::now();
        let next_due = outstanding.iter().map(|j| j.execute_at).min().unwrap_or(now);
        if next_due > now {
            if args.skip_waiting {
                warn!(
                    remaining = outstanding.len(),
                    next_due = %next_due,
                    "every remaining job is in backoff; exiting"
                );
                break;
            }
            let wait = (next_due - now)
                .to_std()
                .unwrap_or_default()
                .min(Duration::from_secs(args.max_wait_secs));
            info!(
                remaining = outstanding.len(),
                wait_secs = wait.as_secs(),
                "waiting for the next due job"
            );
            tokio::time::sleep(wait).await;
        }
    }

    Ok(())
}
