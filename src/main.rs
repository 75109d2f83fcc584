#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use winadmin_remote::remote::{McpRemoteCommands, RemoteConfig, RemoteConsole, RemoteEvent};

/// Log every core notification; this process is its own default observer.
fn spawn_event_logger(console: &RemoteConsole) {
    let mut events = console.manager().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RemoteEvent::SessionState { name, state, error }) => match error {
                    Some(error) => warn!("Session {} is {}: {}", name, state, error),
                    None => info!("Session {} is {}", name, state),
                },
                Ok(RemoteEvent::TransferState { id, host, state, error }) => match error {
                    Some(error) => warn!("Transfer {} on {} is {}: {}", id, host, state, error),
                    None => info!("Transfer {} on {} is {}", id, host, state),
                },
                Ok(RemoteEvent::TransferProgress { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Event logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = RemoteConfig::from_env();
    if let Some(path) = &config.store_path {
        info!("Connection store: {}", path.display());
    }
    let console = Arc::new(RemoteConsole::from_config(config).await?);
    spawn_event_logger(&console);

    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let commands = McpRemoteCommands::new(console.clone());
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| McpServer::new().tools(commands.clone())),
        )
        .with(Tracing);

    info!("Remote console is ready");
    info!("Use remote_add_connection and remote_connect to reach hosts, remote_apply to fan out");

    Server::new(TcpListener::bind(mcp_addr))
        .name("WinAdmin Remote Console")
        .run(app)
        .await?;

    console.shutdown().await;
    Ok(())
}
