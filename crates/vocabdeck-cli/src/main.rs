//! vocabdeck - a command line client for a vocabulary flashcard server.
//!
//! Wires the core session lifecycle together (credential store, event bus,
//! API client, session manager) and exposes it as subcommands.

mod commands;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vocabdeck_core::{
    ApiClient, Config, CredentialBackend, CredentialStore, EventBus, FileStore, KeyringStore,
    MemoryStore, SessionManager,
};

#[derive(Debug, Parser)]
#[command(name = "vocabdeck", version, about = "Vocabulary flashcards from the command line")]
struct Cli {
    /// Override the API base URL for this run
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and remember the session
    Login {
        #[arg(long, short)]
        username: Option<String>,
    },
    /// Create an account and log in
    Register {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, short)]
        username: String,
        #[arg(long)]
        email: String,
    },
    /// Forget the stored session
    Logout,
    /// Show who is logged in
    Whoami,
    /// List vocabulary, one page at a time
    List {
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = vocabdeck_core::api::client::DEFAULT_PAGE_SIZE)]
        size: u32,
    },
    /// Show one entry
    Show { id: i64 },
    /// Add an entry
    Add {
        word: String,
        #[arg(long, short)]
        definition: Option<String>,
        #[arg(long, short)]
        example: Option<String>,
    },
    /// Replace an entry
    Edit {
        id: i64,
        word: String,
        #[arg(long, short)]
        definition: Option<String>,
        #[arg(long, short)]
        example: Option<String>,
    },
    /// Delete an entry
    Delete { id: i64 },
}

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.credential_backend {
        CredentialBackend::Keyring => Arc::new(KeyringStore::new()),
        CredentialBackend::File => Arc::new(FileStore::new(config.credentials_path()?)),
        CredentialBackend::Memory => Arc::new(MemoryStore::new()),
    };
    debug!(backend = ?config.credential_backend, "Credential store opened");
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_ref())?;
    info!("vocabdeck starting");

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(url) = cli.api_url.clone() {
        config.api_base_url = url;
    }

    let store = open_store(&config)?;
    let api = ApiClient::new(&config).context("Failed to create HTTP client")?;
    let session = SessionManager::start(
        api,
        store,
        EventBus::new(),
        Arc::new(|| eprintln!("You are signed out. Run `vocabdeck login` to sign in again.")),
    )
    .await;

    commands::run(cli.command, &session, &config).await
}
