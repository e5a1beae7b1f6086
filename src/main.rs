use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_pktfwd::config::Config;
use lora_pktfwd::session::Event;
use lora_pktfwd::udp;

#[derive(Parser)]
#[command(name = "lora-pktfwd")]
#[command(about = "Semtech UDP packet forwarder server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-pktfwd v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "ack timeout {:?}, {} retr{}, inactivity window {:?}",
        config.session.ack_timeout(),
        config.session.max_retries,
        if config.session.max_retries == 1 { "y" } else { "ies" },
        config.session.inactivity_timeout()
    );

    let (downlink_sender, mut events) = udp::start_server(&config).await?;

    info!("Server running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
    for event in downlink_sender.sessions().shutdown() {
        log_event(&event);
    }

    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::UplinkReceived { gateway_id, frame } => info!(
            "uplink from gateway {}: freq={} MHz, rssi={} dBm, datr={:?}, size={} bytes",
            gateway_id, frame.freq, frame.rssi, frame.datr, frame.size
        ),
        Event::StatusReceived { gateway_id, status } => info!(
            "status from gateway {}: rxnb={} rxok={} rxfw={} ackr={}% dwnb={} txnb={}",
            gateway_id,
            status.rxnb,
            status.rxok,
            status.rxfw,
            status.ackr,
            status.dwnb,
            status.txnb
        ),
        Event::DownlinkAcked { gateway_id, token } => {
            info!("downlink {} acknowledged by gateway {}", token, gateway_id)
        }
        Event::DownlinkFailed { gateway_id, token } => {
            warn!("downlink {} to gateway {} failed", token, gateway_id)
        }
        Event::GatewayDisconnected { gateway_id } => {
            info!("gateway {} disconnected", gateway_id)
        }
    }
}
