use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};
use pulse_client::ClientConfig;
use pulse_client::config::DEFAULT_CREDENTIAL_KEY;
use pulse_client::credential::{FileCredentialStore, MemoryCredentialStore};
use tracing_subscriber::EnvFilter;

mod watch;

#[derive(Parser)]
#[command(name = "pulse-watch")]
#[command(about = "Watch a push hub: join rooms and print what arrives", long_about = None)]
#[command(group(ArgGroup::new("credential").required(true).args(["token", "store"])))]
struct Cli {
    /// Hub WebSocket URL (`/ws` is appended when missing)
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Credential to connect with
    #[arg(short, long)]
    token: Option<String>,

    /// JSON credential file, re-read for login/logout while running
    #[arg(long)]
    store: Option<PathBuf>,

    /// Room to join (repeatable)
    #[arg(short, long = "room")]
    rooms: Vec<String>,

    /// Key holding the credential
    #[arg(short, long, default_value = DEFAULT_CREDENTIAL_KEY)]
    key: String,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout carries only events.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    config.url = ws_url(&cli.server);
    config.credential_key = cli.key;
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    if let Some(token) = cli.token {
        let store = MemoryCredentialStore::with_value(&config.credential_key, &token);
        watch::run(config, &cli.rooms, Arc::new(store)).await;
    } else if let Some(path) = cli.store {
        tracing::info!(path = %path.display(), "Watching credential file");
        watch::run(config, &cli.rooms, Arc::new(FileCredentialStore::new(path))).await;
    } else {
        eprintln!("Error: one of --token or --store is required");
        std::process::exit(2);
    }
}

/// Build the WS URL (append /ws if the user didn't already).
fn ws_url(server: &str) -> String {
    if server.ends_with("/ws") {
        server.to_string()
    } else {
        format!("{}/ws", server.trim_end_matches('/'))
    }
}
