mod catalog;
mod config;
mod encode;
mod error;
mod http;
mod media;
mod orientation;
mod paths;
mod reprocess;
mod storage;
mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Photo album backend")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Bake EXIF orientation into every stored photo
    Reprocess {
        /// Worker threads; 1 processes files in order on the current thread
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add the default birthday messages when none exist yet
    Seed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config first so we can honor logging.filter directive.
    let cfg = config::ConfigManager::load(cli.config).await?;
    let settings = Arc::new(config::Settings::from_env(&cfg));
    let filter_directive = settings
        .log_filter
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,photoalbum_server=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Reprocess { jobs, json } => reprocess(&settings, jobs, json).await,
        Command::Seed => seed(&settings).await,
    }
}

async fn seed(settings: &config::Settings) -> anyhow::Result<()> {
    let store = catalog::Catalog::open(&settings.catalog_path).await?;
    let inserted = store.seed_messages(catalog::default_messages()).await?;
    if inserted == 0 {
        println!("catalog already has birthday messages; nothing seeded");
    } else {
        tracing::info!(inserted, path = %settings.catalog_path.display(), "seeded birthday messages");
        println!("seeded {inserted} birthday messages");
    }
    Ok(())
}

async fn serve(settings: Arc<config::Settings>) -> anyhow::Result<()> {
    let storage = storage::PhotoStorage::new(&settings);
    storage.init().await?;
    let catalog = catalog::Catalog::open(&settings.catalog_path).await?;
    tracing::info!(root = %storage.photos_dir().display(), "photo storage ready");
    let state = http::AppState {
        settings: settings.clone(),
        storage: Arc::new(storage),
        catalog: Arc::new(catalog),
    };
    let app = http::router(state);
    http::serve(app, &settings.bind_address).await
}

async fn reprocess(settings: &config::Settings, jobs: usize, json: bool) -> anyhow::Result<()> {
    let photos_dir = settings.photos_dir();
    if !tokio::fs::try_exists(&photos_dir).await.unwrap_or(false) {
        anyhow::bail!("photos directory {} does not exist", photos_dir.display());
    }
    let runner = reprocess::Reprocessor::new(&photos_dir, settings.encode.jpeg_quality);
    let summary = tokio::task::spawn_blocking(move || {
        if jobs > 1 {
            runner.run_parallel(jobs)
        } else {
            Ok(runner.run())
        }
    })
    .await??;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for failed in summary.failures() {
            println!(
                "error: {}: {}",
                failed.file,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
        println!(
            "processed: {}  skipped: {}  errors: {}",
            summary.processed, summary.skipped, summary.errors
        );
    }
    Ok(())
}
