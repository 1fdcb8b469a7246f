use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tilerealm_server::config::ServerConfig;
use tilerealm_server::game::map::GeneratedTileMap;
use tilerealm_server::metrics::{self, Metrics};
use tilerealm_server::net::game_session::{start_game_loop, GameSession};
use tilerealm_server::net::transport::{OutboundRouter, TcpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("TileRealm Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, {} Hz, max_connections={}",
        config.bind_address, config.port, config.tick_rate, config.max_connections
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Simulation task owns the session; the transport only sees its queues
    let map = Arc::new(GeneratedTileMap::new(
        config.world_seed,
        config.chunk_tiles,
    ));
    let session = GameSession::new(&config, map, metrics.clone());
    let inbound = session.inbound_sender();
    let router = OutboundRouter::new();
    let game_loop = start_game_loop(session, router.clone());

    let addr = SocketAddr::new(config.bind_address, config.port);
    let transport = TcpTransport::bind(addr, inbound, router, metrics).await?;
    info!("Server ready on {}", transport.local_addr()?);

    // Shutdown signal handler
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    tokio::select! {
        result = transport.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    game_loop.abort();
    info!("Server stopped");

    Ok(())
}
