use std::time::Duration;

use clap::Parser;
use synapse::{Address, Node, NodeConfig, PromiseState, Uri};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ECHO_PROTOCOL: u64 = 1;
const ECHO_FUNCTION: u64 = 1;

/// Runs a single overlay node.
#[derive(Parser, Debug)]
#[command(name = "synapse", version)]
struct Args {
    /// Port to listen on. Repeat to listen on several ports.
    #[arg(short, long = "port", default_value = "9000")]
    ports: Vec<u16>,

    /// Peer to keep a connection to, as tcp://host:port. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<Uri>,

    /// Address of a node to call the echo function on, in hex.
    #[arg(long)]
    echo: Option<Address>,

    /// Seed deriving this node's address. Random when omitted.
    #[arg(long)]
    identity: Option<String>,

    /// Milliseconds between maintenance ticks.
    #[arg(long, default_value_t = 2500)]
    maintenance_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = NodeConfig::builder()
        .maintenance_interval(Duration::from_millis(args.maintenance_ms))
        .build();
    let node = match &args.identity {
        Some(seed) => Node::with_address(config, Address::derive(seed.as_bytes())),
        None => Node::new(config),
    };

    node.expose(ECHO_PROTOCOL, ECHO_FUNCTION, |message: String| message);

    if let Err(error) = node.start(&args.ports, args.peers.clone()).await {
        eprintln!("could not start node: {}", error);
        std::process::exit(1);
    }
    info!(address = %node.address(), ports = ?node.listening_ports(), "node is up");

    let mut ticker = tokio::time::interval(node.config().maintenance_interval);
    let mut round = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        for peer in node.direct_peers() {
            info!(
                address = %format_args!("{:#}", peer.address),
                handle = %peer.handle,
                locator = ?peer.locator,
                direction = ?peer.direction,
                "peer"
            );
        }

        if let Some(target) = args.echo {
            round += 1;
            let promise = node.call(target, ECHO_PROTOCOL, ECHO_FUNCTION, (format!("ping {}", round),));
            promise.set_name("echo");
            match promise.settled().await {
                PromiseState::Success => match promise.decode::<String>() {
                    Ok(reply) => info!(%reply, "echo answered"),
                    Err(error) => warn!(%error, "echo reply undecodable"),
                },
                _ => {
                    if let Err(error) = promise.wait_checked(Duration::ZERO) {
                        warn!(%error, "echo failed");
                    }
                }
            }
        }
    }

    node.shutdown();
}
