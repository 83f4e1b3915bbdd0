use clap::Parser;
use log::info;
use server::network::Server;
use shared::config::{SimulationConfig, DEFAULT_SERVER_PORT, DEFAULT_TICK_RATE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Simulation steps per second
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "16")]
    max_clients: usize,

    /// Broadcast a snapshot every N frames
    #[arg(short, long, default_value = "2")]
    broadcast_interval: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = SimulationConfig {
        broadcast_interval: args.broadcast_interval.max(1),
        ..SimulationConfig::with_tick_rate(args.tick_rate)
    };

    info!(
        "Starting server at {} Hz, broadcasting every {} frames",
        args.tick_rate, config.broadcast_interval
    );

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config, args.max_clients).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
