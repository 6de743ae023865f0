//! Agentry hub server

use agentry_core::{BindMode, HubConfig};
use agentry_gateway::{serve, ResolvedAuth};
use agentry_llm::HttpProvider;
use agentry_runtime::Hub;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentry", about = "Agentry — agent orchestration hub")]
struct Cli {
    #[arg(short, long, default_value = "17717")]
    port: u16,

    /// "loopback" or "lan"
    #[arg(short, long, default_value = "loopback")]
    bind: String,

    /// Shared secret for the X-SECRET header; unset runs the hub open.
    #[arg(long, env = "AGENTRY_SECRET")]
    secret: Option<String>,

    #[arg(long, default_value = "agentry-data", env = "AGENTRY_DATA_DIR")]
    data_dir: String,

    /// Default model for blueprints that do not pick one.
    #[arg(short, long, default_value = "gpt-4o-mini", env = "AGENTRY_MODEL")]
    model: String,

    /// Provider API key.
    #[arg(long, env = "AGENTRY_API_KEY")]
    api_key: String,

    /// Override the provider endpoint (chat-completions compatible).
    #[arg(long, env = "AGENTRY_API_URL")]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentry=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind = match cli.bind.as_str() {
        "lan" | "0.0.0.0" => BindMode::Lan,
        _ => BindMode::Loopback,
    };
    let config = HubConfig {
        port: cli.port,
        bind: bind.clone(),
        secret: cli.secret.clone(),
        data_dir: cli.data_dir,
        default_model: cli.model,
    };

    let mut provider = HttpProvider::new(&cli.api_key);
    if let Some(api_url) = &cli.api_url {
        provider = provider.with_base_url(api_url.clone());
    }

    let hub = Hub::builder(config.clone())
        .provider(Arc::new(provider))
        .build()
        .await?;

    let addr: SocketAddr = format!("{}:{}", bind.to_addr(), config.port).parse()?;
    serve(hub, ResolvedAuth::new(cli.secret), addr).await
}
