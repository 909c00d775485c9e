//! redscaled — the Redis external scaler daemon.
//!
//! Single binary that serves the external scaler gRPC contract. The
//! orchestrator points a ScaledObject at this service; each target's
//! metadata names a Redis endpoint and a Lua script, and the daemon
//! answers metric and activity queries by running the script.
//!
//! # Usage
//!
//! ```text
//! redscaled --host 0.0.0.0 --port 9000 --log-level debug
//! ```
//!
//! Every flag can also be set through the environment:
//! `SCALER_HOST`, `SCALER_PORT`, `SCALER_LOGLEVEL`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use redscale_redis::RedisConnectionManager;
use redscale_scaler::RedisScaler;

#[derive(Parser)]
#[command(name = "redscaled", about = "Redis external scaler for KEDA")]
struct Cli {
    /// Host to bind the gRPC listener on.
    #[arg(long, env = "SCALER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "SCALER_PORT", default_value = "9000")]
    port: u16,

    /// Log verbosity (trace, debug, info, warn, error).
    #[arg(long, env = "SCALER_LOGLEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // An unparsable log level is a startup error, not a silent default.
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cli.host, cli.port))?;

    let connections = Arc::new(RedisConnectionManager::new());
    let scaler = RedisScaler::new(connections.clone());

    info!(%addr, "external scaler starting");

    tonic::transport::Server::builder()
        .add_service(scaler.into_service())
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await
        .context("gRPC server failed")?;

    // Stop the sweep and close every cached connection.
    connections.shutdown().await;

    info!("external scaler stopped");
    Ok(())
}
