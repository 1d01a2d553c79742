use std::net::SocketAddr;

use pulse_hub::{HubConfig, HubState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialise tracing (respects RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = HubConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    match &config.tokens {
        Some(tokens) => tracing::info!(accepted = tokens.len(), "Token allow-list enabled"),
        None => tracing::info!("Accepting any non-empty token"),
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Pulse hub listening on {addr}");
    pulse_hub::serve(listener, HubState::new(config)).await
}
