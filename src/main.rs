use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nutbot_relay::config::{
    BOOTSTRAP_TIMEOUT, DEFAULT_PORT, KEEPALIVE_INTERVAL, REQUEST_TIMEOUT,
};
use nutbot_relay::{RelayConfig, RelayServer};

#[derive(Parser)]
#[command(name = "nutbot-relay")]
#[command(about = "Relay devtools protocol clients to a browser extension", long_about = None)]
#[command(version)]
struct Cli {
    /// Host to bind to
    #[arg(long, env = "NUTBOT_RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on, 0 picks a free one
    #[arg(short, long, env = "NUTBOT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Timeout for commands forwarded to the extension, in milliseconds
    #[arg(long, default_value_t = REQUEST_TIMEOUT)]
    request_timeout: u64,

    /// Timeout for creating the initial tab, in milliseconds
    #[arg(long, default_value_t = BOOTSTRAP_TIMEOUT)]
    bootstrap_timeout: u64,

    /// Heartbeat interval, in milliseconds
    #[arg(long, default_value_t = KEEPALIVE_INTERVAL, value_parser = clap::value_parser!(u64).range(1..))]
    keepalive: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> nutbot_relay::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = RelayConfig::builder()
        .host(cli.host)
        .port(cli.port)
        .request_timeout(Duration::from_millis(cli.request_timeout))
        .bootstrap_timeout(Duration::from_millis(cli.bootstrap_timeout))
        .keepalive_interval(Duration::from_millis(cli.keepalive))
        .build();

    let mut server = RelayServer::bind(config).await?;
    tracing::info!(
        "devtools clients connect to ws://{}/cdp",
        server.local_addr()
    );

    tokio::select! {
        _ = server.wait() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutting down");
        }
    }
    server.shutdown();
    Ok(())
}
