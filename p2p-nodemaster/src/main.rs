use clap::Parser;
use dotenvy::dotenv;
use p2p_nodemaster::config::{DEFAULT_CONFIG_PATH, load_config};
use p2p_nodemaster::SignalingServer;
use p2p_signal::logging::init_logging;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "p2p-nodemaster", about = "Signaling server for direct peer chat")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the listening port
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config);
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(max_connections) = cli.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(timeout) = cli.heartbeat_timeout_ms {
        config.heartbeat_timeout_ms = timeout;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level);
    log::info!("Starting P2P Node Master (signaling server)...");
    log::debug!("Configuration: {config:?}");

    let server = SignalingServer::bind(config).await?;
    let hub = server.hub();
    let shutdown = server.shutdown_token();
    let mut running = tokio::spawn(server.run());

    tokio::select! {
        result = &mut running => {
            match result {
                Ok(Err(err)) => log::error!("Signaling server error: {err}"),
                Err(err) => log::error!("Signaling server task failed: {err}"),
                Ok(Ok(())) => {}
            }
        }
        _ = signal::ctrl_c() => {
            log::info!("Received shutdown signal, stopping signaling server...");
            shutdown.cancel();
            if let Ok(Err(err)) = running.await {
                log::error!("Signaling server error during shutdown: {err}");
            }
        }
    }

    log::info!("Final statistics: {} users online", hub.online_count());

    Ok(())
}
