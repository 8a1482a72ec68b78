//! `chat-relay` binary entrypoint.
//!
//! Configuration comes from environment variables, optionally overlaid by a
//! YAML file given with `--config`.

use chat_relay::{serve, GatewayConfig};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "chat-relay", version, about = "Streaming chat gateway for Azure OpenAI")]
struct Cli {
    /// YAML file overriding environment configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = GatewayConfig::from_env();
    if let Some(path) = cli.config {
        config = config.with_yaml_file(path)?;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    if config.endpoint.is_empty() || config.api_key.is_empty() {
        tracing::warn!("AZURE_OPENAI_ENDPOINT or AZURE_OPENAI_API_KEY is not set; upstream calls will fail");
    }

    serve(config).await
}
