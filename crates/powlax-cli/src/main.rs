use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use powlax_cms::{ChangeSource, FixtureChangeSource};
use powlax_core::{EntityType, SyncStats};
use powlax_store::{PgStore, SyncLogStore};
use powlax_sync::{SyncConfig, SyncOrchestrator, SyncRequest};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "powlax-cli")]
#[command(about = "Sync GamiPress points, badges and ranks into the POWLAX app database")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    sync: SyncArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync (the default).
    Sync(SyncArgs),
    /// Serve the sync HTTP API, plus the scheduler when enabled.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Show recent sync sessions from the audit log.
    Status {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Comma-separated CMS user ids; omit to sync everyone.
    #[arg(long)]
    users: Option<String>,
    /// Ignore the last sync time and request the full history.
    #[arg(long)]
    full: bool,
    /// Replay a saved export instead of calling the CMS.
    #[arg(long, value_name = "FILE")]
    payload: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load().context("loading sync config")?;

    match cli.command.unwrap_or(Commands::Sync(cli.sync)) {
        Commands::Sync(args) => run_sync(&config, args).await?,
        Commands::Serve => {
            let orchestrator = SyncOrchestrator::connect(&config, None).await?;
            powlax_web::serve(&config, orchestrator).await?
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Status { limit } => show_status(&config, limit).await?,
    }

    Ok(())
}

async fn run_sync(config: &SyncConfig, args: SyncArgs) -> Result<()> {
    let source = match &args.payload {
        Some(path) => Some(Arc::new(
            FixtureChangeSource::from_path(path)
                .with_context(|| format!("loading payload {}", path.display()))?,
        ) as Arc<dyn ChangeSource>),
        None => None,
    };
    let orchestrator = SyncOrchestrator::connect(config, source).await?;

    let user_ids = args.users.as_deref().map(parse_user_ids);
    let request = SyncRequest::new().with_user_ids(user_ids).full(args.full);
    let sync_id = request.sync_id;
    let stats = orchestrator.run_sync(request).await?;
    print_stats(&sync_id.to_string(), &stats);
    Ok(())
}

/// Non-numeric entries are dropped with a warning.
fn parse_user_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(entry = s, "ignoring non-numeric user id");
                None
            }
        })
        .collect()
}

fn print_stats(sync_id: &str, stats: &SyncStats) {
    let seconds = stats.duration_ms().unwrap_or_default() as f64 / 1000.0;
    println!(
        "sync complete: sync_id={} users={} points={} badges={} ranks={} ranks_linked={} skipped_users={} errors={} duration={:.1}s{}",
        sync_id,
        stats.users_processed,
        stats.points_synced,
        stats.badges_synced,
        stats.ranks_synced,
        stats.ranks_linked,
        stats.skipped_users,
        stats.errors,
        seconds,
        if stats.cancelled { " (cancelled)" } else { "" },
    );
    for failure in &stats.failures {
        println!(
            "  failed {:?} user={} item={}: {}",
            failure.category, failure.external_user_id, failure.item, failure.message
        );
    }
}

async fn show_status(config: &SyncConfig, limit: i64) -> Result<()> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let rows = store
        .recent_entries(&[EntityType::SyncSession], limit.max(1))
        .await
        .context("reading sync log")?;
    if rows.is_empty() {
        println!("no sync sessions recorded");
    }
    for row in rows {
        let stats = &row.payload["stats"];
        println!(
            "{} {} {} users={} points={} badges={} ranks={} errors={}",
            row.synced_at.to_rfc3339(),
            row.local_id,
            row.action,
            stats["users_processed"],
            stats["points_synced"],
            stats["badges_synced"],
            stats["ranks_synced"],
            stats["errors"],
        );
    }
    Ok(())
}
