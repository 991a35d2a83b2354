//! Veil Node
//!
//! CLI for the veil anonymous circuit engine. The `demo` subcommand
//! runs a whole network inside one process over the in-memory
//! rendezvous and link fabric, builds a circuit, and pushes a message
//! through it end to end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::timeout;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use veil_core::{Config, NodeEngine};
use veil_crypto::NodeIdentity;
use veil_signal::{MemoryFabric, MemoryRendezvous, Role, WireLocation};

/// Veil - anonymous p2p file transfer
#[derive(Parser)]
#[command(name = "veil-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single-process demo network and send a message through a
    /// fresh circuit
    Demo {
        /// Number of peer nodes besides the originator
        #[arg(short, long, default_value = "6")]
        peers: usize,

        /// Circuit length
        #[arg(long, default_value = "3")]
        hops: usize,

        /// Message to route to the exit
        #[arg(short, long, default_value = "hello from the other side of the onion")]
        message: String,
    },

    /// Generate a fresh identity and print its node id
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Demo { peers, hops, message } => demo(peers, hops, &message).await,
        Commands::Identity => {
            let identity = tokio::task::spawn_blocking(NodeIdentity::generate)
                .await?
                .context("identity generation failed")?;
            println!("node id:     {}", identity.node_id().to_full_hex());
            println!("public key:  {}", identity.public_key().to_base64());
            Ok(())
        }
    }
}

/// Cities used to spread demo peers across regions
const DEMO_LOCATIONS: [(f64, f64); 6] = [
    (40.7, -74.0),   // New York
    (52.5, 13.4),    // Berlin
    (35.7, 139.7),   // Tokyo
    (-23.5, -46.6),  // Sao Paulo
    (6.5, 3.4),      // Lagos
    (-33.8, 151.2),  // Sydney
];

const DEMO_ROLES: [Role; 3] = [Role::Entry, Role::Relay, Role::Exit];

async fn demo(peers: usize, hops: usize, message: &str) -> Result<()> {
    if peers < hops {
        bail!("need at least {hops} peers for a {hops}-hop circuit");
    }

    let bus = MemoryRendezvous::new();
    let fabric = MemoryFabric::new();

    info!(peers, hops, "Spawning demo network");
    let mut engines = Vec::new();
    for i in 0..=peers {
        let identity = Arc::new(
            tokio::task::spawn_blocking(NodeIdentity::generate)
                .await?
                .context("identity generation failed")?,
        );
        let node_id = identity.node_id();

        let mut config = Config::loopback();
        if i > 0 {
            // Peers cycle through the three roles and six regions; the
            // originator keeps the defaults.
            config.role_hint = DEMO_ROLES[(i - 1) % DEMO_ROLES.len()];
            let (latitude, longitude) = DEMO_LOCATIONS[(i - 1) % DEMO_LOCATIONS.len()];
            config.location = Some(WireLocation { latitude, longitude, accuracy: 1000.0 });
        }

        let acceptor = fabric.register(node_id);
        let engine = NodeEngine::new(
            identity,
            config,
            Arc::new(bus.endpoint(node_id)),
            Arc::new(fabric.connector(node_id)),
            acceptor,
        )
        .await?;
        engine.start().await;
        info!(node = %engine.node_id(), "Node up");
        engines.push(engine);
    }

    // Let announcements settle and everyone admit itself.
    tokio::time::sleep(Duration::from_millis(800)).await;

    // Collect exit deliveries from every peer; only the circuit's exit
    // will actually produce one.
    let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::unbounded_channel();
    for engine in engines.iter().skip(1) {
        if let Some(mut incoming) = engine.take_incoming().await {
            let tx = delivered_tx.clone();
            let node = engine.node_id();
            tokio::spawn(async move {
                while let Some((circuit_id, bytes)) = incoming.recv().await {
                    let _ = tx.send((node, circuit_id, bytes));
                }
            });
        }
    }

    let origin = &engines[0];
    let (channel, _events) = origin
        .open_channel(hops)
        .await
        .context("circuit build failed")?;
    let circuit_id = channel.circuit_id();

    let hop_list = origin
        .builder()
        .hops(circuit_id)
        .await
        .context("circuit vanished")?;
    for (i, hop) in hop_list.iter().enumerate() {
        info!(slot = i, peer = %hop.peer, role = ?hop.role, "Circuit hop");
    }

    channel.send_text(message).await?;
    info!(circuit = circuit_id, "Message sent, waiting for the exit");

    let (exit_node, got_circuit, bytes) =
        timeout(Duration::from_secs(10), delivered_rx.recv())
            .await
            .context("timed out waiting for exit delivery")?
            .context("delivery stream closed")?;

    println!("exit {} delivered on circuit {}:", exit_node, got_circuit);
    println!("  {}", String::from_utf8_lossy(&bytes));

    channel.close().await?;
    for engine in &engines {
        engine.stop().await;
    }
    Ok(())
}
