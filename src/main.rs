use anyhow::Context;
use quickchat::store::Store;
use quickchat::{ChatClient, Collaborators, Config};
use std::sync::Arc;
use tracing::{error, info};

mod interface;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // Not fatal if .env doesn't exist
        info!("No .env file found or failed to load: {}", e);
    }

    // Logs go to stderr so they don't interleave with the conversation
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("QuickChat client starting...");

    let config = Config::from_env().context("Invalid configuration")?;

    info!("Opening local storage at {}", config.db_path.display());
    let store = Store::new(&config.db_path)
        .await
        .context("Failed to open local storage")?;

    let collaborators =
        Collaborators::from_config(&config).context("Failed to build backend clients")?;
    let client = Arc::new(ChatClient::new(&config, collaborators, store));
    client.spawn_realtime().await;

    match client.restore_session().await {
        Ok(Some(identity)) => info!("Signed in as {}", identity.display_name),
        Ok(None) => info!("Not signed in. Use /login or /signup."),
        Err(e) => error!("Could not restore session: {}", e),
    }

    let console = interface::console::ConsoleInterface::new(client.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = console.run() => {
            if let Err(e) = res {
                error!("Console stopped with error: {}", e);
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
