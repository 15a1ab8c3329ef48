use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcr_core::SyncAuditRecord;
use gcr_storage::CatalogStore;
use gcr_sync::{SyncConfig, SyncMode};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gcr-cli")]
#[command(about = "Game catalog reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one page of the metadata catalog.
    Sync {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Walk every metadata page until the provider reports no next page.
    SyncAll {
        #[arg(long)]
        max_pages: Option<u32>,
    },
    Migrate,
    /// Print the most recent audit row.
    Last,
    Serve,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn print_audit(audit: &SyncAuditRecord) {
    println!(
        "sync {}: id={} fetched={} inserted={} updated={} skipped={}{}",
        audit.status.as_str(),
        audit.id,
        audit.records_fetched,
        audit.records_inserted,
        audit.records_updated,
        audit.records_skipped,
        audit
            .message
            .as_deref()
            .map(|m| format!(" message={m}"))
            .unwrap_or_default()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { limit: None }) {
        Commands::Sync { limit } => {
            let audit = gcr_sync::run_sync_once_from_env(limit.map(|limit| SyncMode::SinglePage { limit })).await?;
            print_audit(&audit);
        }
        Commands::SyncAll { max_pages } => {
            let config = SyncConfig::from_env();
            let mode = match config.full_catalog() {
                SyncMode::FullCatalog { page_size, max_pages: configured } => SyncMode::FullCatalog {
                    page_size,
                    max_pages: max_pages.or(configured),
                },
                other => other,
            };
            let audit = gcr_sync::run_sync_once_from_env(Some(mode)).await?;
            print_audit(&audit);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            CatalogStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Last => {
            let config = SyncConfig::from_env();
            let store = CatalogStore::connect(&config.database_url).await?;
            match store.last_audit(gcr_core::SYNC_SOURCE).await? {
                Some(audit) => print_audit(&audit),
                None => println!("no sync has run yet"),
            }
        }
        Commands::Serve => gcr_web::serve_from_env().await?,
    }

    Ok(())
}
