//! weft-node: a standalone weft DHT daemon.
//!
//! Single OS process on a Tokio runtime: binds the TCP link, joins the
//! overlay through the configured seeds, and keeps the engine's
//! maintenance loops running until ctrl-c.

mod config;

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{info, warn};

use weft_dht::link::pump;
use weft_dht::{DhtConfig, Node};
use weft_net::TcpLink;
use weft_types::id::{new_node_id, node_id_to_hex};

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log.filter.parse()?),
        )
        .init();

    let local_id = new_node_id();
    info!(id = node_id_to_hex(&local_id), "weft node starting");

    let listen_addr: SocketAddr = config.network.listen_addr.parse()?;
    let (link, events) = TcpLink::bind(listen_addr, local_id).await?;
    info!(addr = %link.local_addr(), "listening");

    let node = Node::new(local_id, DhtConfig::default(), link.clone());
    tokio::spawn(pump(node.clone(), events));

    join_via_seeds(&node, &link, &config).await;

    let maintenance = node.start_maintenance();

    // Periodic status line.
    let status_node = node.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let peers = status_node.routing_len().await;
            let connected = status_node.connected_peers().len();
            let records = status_node.store_len().await;
            info!(peers, connected, records, "status");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");

    node.shutdown();
    for handle in maintenance {
        let _ = handle.await;
    }

    info!("weft node stopped");
    Ok(())
}

/// Dial the configured seeds and bootstrap the routing table with a
/// lookup for the local id.
async fn join_via_seeds(node: &Node<TcpLink>, link: &TcpLink, config: &NodeConfig) {
    let mut reached = 0usize;
    for seed in &config.network.seed_addrs {
        let addr: SocketAddr = match seed.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(seed, error = %e, "seed address ignored");
                continue;
            }
        };
        for attempt in 1..=config.network.seed_retries {
            match link.dial(addr).await {
                Ok(peer) => {
                    info!(seed, peer = node_id_to_hex(&peer), "seed reached");
                    reached += 1;
                    break;
                }
                Err(e) => {
                    warn!(seed, attempt, error = %e, "seed dial failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    if reached == 0 {
        if config.network.seed_addrs.is_empty() {
            info!("no seeds configured, starting as a standalone node");
        } else {
            warn!("no seed reachable, overlay join postponed");
        }
        return;
    }

    // Self-lookup populates the buckets nearest to this node.
    let found = node.find_closest_nodes(node.local_id()).await;
    info!(discovered = found.len(), "bootstrap lookup complete");
}
