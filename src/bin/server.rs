use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use coco::{Config, EchoHandler, Error, Server, ServerError};
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const PORT: u16 = 6379;

#[derive(Parser, Debug)]
struct Args {
    /// The host to bind to
    #[arg(long, env = "COCO_HOST", default_value = "127.0.0.1")]
    host: String,

    /// The port to listen on
    #[arg(short, long, env = "COCO_PORT", default_value_t = PORT)]
    port: u16,

    /// Connections above this count are refused
    #[arg(long, env = "COCO_MAX_CONN", default_value_t = 128)]
    max_conn: usize,

    /// Per-operation read/write timeout, in milliseconds
    #[arg(long, env = "COCO_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    /// How long shutdown waits for listeners to close, in milliseconds
    #[arg(long, env = "COCO_SHUTDOWN_TIMEOUT_MS", default_value_t = 5_000)]
    shutdown_timeout_ms: u64,

    /// Delay before retrying a timed out accept, in milliseconds
    #[arg(long, env = "COCO_RETRY_MS", default_value_t = 2_000)]
    retry_ms: u64,

    /// Largest frame a connection may buffer, in bytes
    #[arg(long, env = "COCO_MAX_FRAME_SIZE", default_value_t = coco::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

impl Args {
    fn config(&self) -> Config {
        Config::default()
            .with_max_connections(self.max_conn)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
            .with_retry_delay(Duration::from_millis(self.retry_ms))
            .with_max_frame_size(self.max_frame_size)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let server = Server::new(args.config())?;
    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    let handler = Arc::new(EchoHandler::new());

    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener, handler).await }
    });

    tokio::select! {
        res = &mut serving => {
            error!("Listener stopped unexpectedly");
            res??;
            return Ok(());
        }
        res = tokio::signal::ctrl_c() => res?,
    }
    info!("Shutdown signal received, stopping server...");

    if let Err(e) = server.shutdown().await {
        error!("Shutdown failed: {}", e);
        return Err(e.into());
    }

    match serving.await? {
        Ok(()) | Err(ServerError::Stopped) => {}
        Err(e) => return Err(e.into()),
    }

    info!("Server shutdown complete");
    Ok(())
}
