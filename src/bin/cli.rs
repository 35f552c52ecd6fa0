//! chanwatch CLI
//!
//! Watches one board until interrupted, or converts an existing file tree
//! into per-date databases.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use chanwatch::{
    client::HttpBoardClient,
    error::Result,
    models::{BackendKind, Config},
    pipeline::Watcher,
    storage::Backend,
};
use tokio::sync::watch;

/// chanwatch - Imageboard Thread Watcher
#[derive(Parser, Debug)]
#[command(
    name = "chanwatch",
    version,
    about = "Persist new posts and pruned threads of an imageboard board"
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, default_value = "chanwatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll a board until Ctrl-C
    Watch {
        /// Board to watch, e.g. "g"
        #[arg(short, long)]
        board: Option<String>,

        /// Output root directory
        #[arg(short, long)]
        directory: Option<PathBuf>,

        /// Persistence backend
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Download attached images as well
        #[arg(short, long)]
        images: bool,

        /// Seconds between polling cycles
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Convert a file tree into per-date databases
    #[cfg(feature = "sqlite")]
    Migrate {
        /// Root of the file tree
        #[arg(long)]
        from: PathBuf,

        /// Directory receiving the databases
        #[arg(long)]
        to: PathBuf,
    },

    /// Validate the configuration file
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Files,
    Sqlite,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Files => BackendKind::Files,
            BackendArg::Sqlite => BackendKind::Sqlite,
        }
    }
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        log::debug!("No config at {}, using defaults", cli.config.display());
        Config::default()
    };

    match cli.command {
        Command::Watch {
            board,
            directory,
            backend,
            images,
            interval,
        } => {
            if let Some(board) = board {
                config.watcher.board = board;
            }
            if let Some(directory) = directory {
                config.storage.root = directory;
            }
            if let Some(backend) = backend {
                config.storage.backend = backend.into();
            }
            if let Some(interval) = interval {
                config.watcher.interval_secs = interval;
            }
            config.watcher.images |= images;
            config.validate()?;

            let client = HttpBoardClient::new(&config.http)?;
            let handler = Backend::open(config.storage.backend, &config.storage.root).await?;
            log::info!(
                "Writing /{}/ to {} ({:?} backend)",
                config.watcher.board,
                config.storage.root.display(),
                handler.kind()
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    // Keep the sender alive; dropping it would stop the watcher.
                    log::error!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
                log::info!("Interrupted, finishing current work...");
                let _ = shutdown_tx.send(true);
            });

            let mut watcher = Watcher::new(&config.watcher, client, handler);
            watcher.run(shutdown_rx).await?;
        }

        #[cfg(feature = "sqlite")]
        Command::Migrate { from, to } => {
            if from == to {
                return Err(chanwatch::error::AppError::config(
                    "--from and --to must differ",
                ));
            }
            let report = chanwatch::pipeline::run_migrate(&from, &to).await?;
            log::info!(
                "Migrated {} threads across {} dates",
                report.threads,
                report.dates
            );
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!(
                "Config OK: /{}/ every {}s into {}",
                config.watcher.board,
                config.watcher.interval_secs,
                config.storage.root.display()
            );
        }
    }

    Ok(())
}
