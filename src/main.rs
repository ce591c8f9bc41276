// refractor: a reverse proxy that splits large downloads into ranged chunks
// served by a rotating pool of mirrors.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use refractor::config::Config;
use refractor::server::Server;

#[derive(Parser)]
#[command(name = "refractor", version, about = "Refracting reverse proxy for mirrored downloads")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "refractor.toml")]
    config: String,

    /// Address to listen on, overriding the configured value.
    #[arg(long)]
    listen: Option<String>,

    /// Log filter, e.g. "info" or "refractor=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let server = Server::new(config);

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            cancel.cancel();
        }
    });

    server.run(listener).await
}
