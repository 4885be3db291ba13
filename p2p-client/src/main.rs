use clap::Parser;
use dotenvy::dotenv;
use p2p_client::P2PClient;
use p2p_client::config::{DEFAULT_CONFIG_PATH, load_config};
use p2p_client::ui::console;
use p2p_signal::logging::init_logging;
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "p2p-client", about = "Console chat client with direct peer channels")]
struct Cli {
    /// Identity to log in with
    username: String,

    /// Path to the JSON config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[arg(long)]
    server_host: Option<String>,

    #[arg(long)]
    server_port: Option<u16>,

    /// Port for incoming peer channels (ephemeral when omitted)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Host other users should dial, when the local address is not reachable
    #[arg(long)]
    advertise_host: Option<String>,

    /// Accept every incoming chat request without asking
    #[arg(long)]
    auto_accept: bool,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config);
    if let Some(host) = cli.server_host {
        config.server_host = host;
    }
    if let Some(port) = cli.server_port {
        config.server_port = port;
    }
    if cli.listen_port.is_some() {
        config.listen_port = cli.listen_port;
    }
    if cli.advertise_host.is_some() {
        config.advertise_host = cli.advertise_host;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    // UI -> Network
    let (cmd_tx, cmd_rx) = mpsc::channel(100);
    // Network -> UI
    let (event_tx, event_rx) = mpsc::channel(100);

    let client = P2PClient::new(cli.username.trim(), config, event_tx, cmd_rx);
    let network = tokio::spawn(client.run());

    console::run(cmd_tx, event_rx, cli.auto_accept).await;

    match network.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            log::error!("Network client terminated: {err}");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}
