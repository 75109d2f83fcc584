#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use poem_mcpserver::McpServer;
use winadmin_remote::remote::{McpRemoteCommands, RemoteConfig, RemoteConsole};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("warn".parse()?),
        )
        .init();

    let console = Arc::new(RemoteConsole::from_config(RemoteConfig::from_env()).await?);
    poem_mcpserver::stdio::stdio(McpServer::new().tools(McpRemoteCommands::new(console.clone())))
        .await?;

    console.shutdown().await;
    Ok(())
}
