use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use adsync::app::Engines;
use adsync::config;
use adsync::db::{self, SqliteStore};
use adsync::model::{Action, Namespace, Operand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Synchronize pending ad entities with the ad platforms")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit pending work for one operand and action
    Schedule {
        /// add, update or remove
        #[arg(long)]
        action: Action,
        /// ad_group, keyword, ad or extension
        #[arg(long)]
        operand: Operand,
    },
    /// Poll due jobs and reconcile finished ones
    Check,
    /// Every schedule pass in dependency order, then one check pass
    Run,
    /// List recent jobs and the pending backlog
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the example configuration
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::Example = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    if let Command::Jobs { limit } = args.command {
        let ns = Namespace::new(cfg.app.namespace.clone());
        for job in store.jobs(&ns, limit).await? {
            println!(
                "#{:<6} {:<9} account={:<6} {:<9} {:<6} {:<13} attempts={:<3} platform_status={}",
                job.id,
                job.platform.as_str(),
                job.account_id,
                job.operand.as_str(),
                job.action.as_str(),
                job.status.as_str(),
                job.attempts,
                job.platform_status.as_deref().unwrap_or("-"),
            );
        }
        for row in store.backlog(&ns).await? {
            println!(
                "pending {:<9} {:<6} {}",
                row.operand.as_str(),
                row.action.as_str(),
                row.count
            );
        }
        return Ok(());
    }

    let engines = Engines::from_config(&cfg, store)?;
    if engines.is_empty() {
        bail!("no platform is enabled in {}", args.config.display());
    }

    match args.command {
        Command::Schedule { action, operand } => {
            info!(operand = %operand, action = %action, "schedule pass");
            engines.schedule(operand, action).await?;
        }
        Command::Check => {
            info!("check pass");
            engines.check().await?;
        }
        Command::Run => {
            info!("full pass");
            engines.schedule_all().await?;
            engines.check().await?;
        }
        Command::Jobs { .. } | Command::Example => {}
    }
    Ok(())
}
