//! Integration test: bucket-full policy.
//!
//! One bucket is filled with twenty live, responsive peers. A
//! twenty-first candidate must not displace anyone while the
//! least-recently-seen head still answers pings: it waits in the
//! replacement cache. Once the head disappears, the candidate takes a
//! live slot on its next contact.

use std::time::Duration;

use weft_integration_tests::{quick_config, settle, spawn_node, MemNet};
use weft_types::id::NodeId;

const LOCAL: NodeId = [0x01; 32];

/// Peers that all land in bucket 0 relative to `LOCAL`.
fn bucket_peer(tag: u8) -> NodeId {
    let mut id = [0x80u8; 32];
    id[31] = tag;
    id
}

#[tokio::test]
async fn live_head_survives_and_replacement_waits() {
    let net = MemNet::new();
    let local = spawn_node(&net, LOCAL, quick_config());

    // Twenty responsive peers fill bucket 0.
    let k = local.config().k;
    let mut peers = Vec::new();
    for tag in 0..k as u8 {
        let id = bucket_peer(tag);
        peers.push(spawn_node(&net, id, quick_config()));
        net.connect(&LOCAL, &id);
        settle().await;
    }
    assert_eq!(local.routing_len().await, k);

    // The twenty-first candidate triggers the head probe.
    let newcomer_id = bucket_peer(k as u8);
    let newcomer = spawn_node(&net, newcomer_id, quick_config());
    net.connect(&LOCAL, &newcomer_id);

    // Give the probe time to ping the head and hear the answer.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let dump = local.routing_dump().await;
    let bucket = dump.iter().find(|b| b.index == 0).expect("bucket 0");
    assert_eq!(bucket.live.len(), k, "no live member was displaced");
    assert!(
        bucket.live.contains(&bucket_peer(0)),
        "the responsive head stays live"
    );
    assert!(
        bucket.replacements.contains(&newcomer_id),
        "the newcomer waits in the replacement cache"
    );

    // The head's transport link drops; the table forgets it.
    net.disconnect(&LOCAL, &bucket_peer(0));
    settle().await;
    assert_eq!(local.routing_len().await, k - 1);

    // The candidate's next contact seats it in the free slot.
    assert!(newcomer.ping(LOCAL).await, "newcomer can reach the node");
    settle().await;

    let dump = local.routing_dump().await;
    let bucket = dump.iter().find(|b| b.index == 0).expect("bucket 0");
    assert!(
        bucket.live.contains(&newcomer_id),
        "the waiting candidate was promoted into the live list"
    );
    assert!(!bucket.replacements.contains(&newcomer_id));
    assert_eq!(local.routing_len().await, k);
}
