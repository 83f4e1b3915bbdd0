use clap::Parser;
use client::input::BotInput;
use client::network::{Client, LinkConditioner};
use log::info;
use shared::config::{SimulationConfig, DEFAULT_TICK_RATE};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Simulate network latency in milliseconds (round trip)
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Fraction of packets to drop in each direction
    #[arg(short = 'p', long, default_value = "0.0")]
    packet_loss: f64,

    /// Simulation steps per second, must match the server
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Stop after this many seconds (0 runs until disconnected)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Seed for the input bot and the simulated packet loss
    #[arg(long, default_value = "1")]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }
    if args.packet_loss > 0.0 {
        info!("Dropping {:.0}% of packets", args.packet_loss * 100.0);
    }

    let config = SimulationConfig::with_tick_rate(args.tick_rate);
    let link = LinkConditioner::new(args.fake_ping, args.packet_loss, args.seed);
    let source = Box::new(BotInput::new(args.seed));

    let mut client = Client::new(&args.server, config, source, link).await?;
    if args.duration > 0 {
        client = client.with_run_duration(Duration::from_secs(args.duration));
    }

    tokio::select! {
        result = client.run() => {
            let stats = result?;
            info!(
                "Finished at frame {} after {} corrections",
                stats.frame, stats.corrections
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
