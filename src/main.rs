use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use textassembler_processor::api::{ContentApi, HttpContentApi};
use textassembler_processor::config::{AppConfig, CliConfig, FileConfig};
use textassembler_processor::notifications::{LogNotifier, Notifier};
use textassembler_processor::processors::{
    update_limits, update_sources, CompressionProcessor, DeletionProcessor, DownloadProcessor,
};
use textassembler_processor::searches::{SearchStore, SqliteSearchStore};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir().context("Error resolving current directory")?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite database holding searches and API limits.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Directory search results are written to.
    #[clap(long, value_parser = parse_path)]
    pub storage_root: Option<PathBuf>,

    /// Base URL of the content API.
    #[clap(long)]
    pub api_base_url: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download results of queued searches.
    ProcessQueue,
    /// Archive searches that finished downloading.
    Compress,
    /// Remove expired and deleted searches.
    Delete,
    /// Refresh the stored API rate limits.
    UpdateLimits,
    /// Refresh the list of searchable sources.
    UpdateSources {
        /// Resume an interrupted refresh at this offset.
        #[clap(long, default_value_t = 0)]
        skip: i64,
    },
}

fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        info!("Termination requested");
        handler_token.cancel();
    })
    .context("Failed to install termination handler")?;
    Ok(token)
}

async fn run(cli_args: CliArgs) -> Result<()> {
    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        storage_root: cli_args.storage_root.clone(),
        api_base_url: cli_args.api_base_url.clone(),
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening SQLite database at {:?}...", config.db_path);
    let store: Arc<dyn SearchStore> = Arc::new(SqliteSearchStore::new(&config.db_path)?);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    match cli_args.command {
        Command::ProcessQueue => {
            let api: Arc<dyn ContentApi> = Arc::new(HttpContentApi::new(&config.api)?);
            let mut processor = DownloadProcessor::new(store, api, notifier, &config);
            processor.run(shutdown_token()?).await
        }
        Command::Compress => {
            let mut processor = CompressionProcessor::new(store, notifier, &config);
            processor.run(shutdown_token()?).await
        }
        Command::Delete => {
            let mut processor = DeletionProcessor::new(store, &config);
            processor.run(shutdown_token()?).await
        }
        Command::UpdateLimits => {
            let api = HttpContentApi::new(&config.api)?;
            update_limits(&api, store).await.map(|_| ())
        }
        Command::UpdateSources { skip } => {
            let api = HttpContentApi::new(&config.api)?;
            update_sources(&api, store, &config, &shutdown_token()?, skip)
                .await
                .map(|_| ())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli_args = CliArgs::parse();

    if let Err(e) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli_args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
