//! Integration test: replica convergence and repair.
//!
//! Concurrent writes with equal timestamps must converge on every
//! replica to the record with the larger publisher id, independent of
//! arrival order. Separately, a publisher's repair pass must detect a
//! replica that lacks its record and push a copy.

use weft_dht::link::PeerLink;
use weft_integration_tests::{quick_config, settle, spawn_node, MemNet};
use weft_types::id::{key_id, node_id_to_hex, NodeId};
use weft_types::record::Record;
use weft_wire::codec::Message;

const PUB_A: NodeId = [0xAA; 32];
const PUB_B: NodeId = [0xBB; 32];

fn record_from(publisher: &NodeId, ts: u64, data: &[u8]) -> Record {
    Record {
        data: data.to_vec(),
        ts,
        publisher: node_id_to_hex(publisher),
    }
}

fn store_frame(key: NodeId, record: Record) -> Vec<u8> {
    Message::Store {
        msg_id: weft_types::id::new_message_id(),
        key,
        record,
    }
    .encode()
    .expect("encode")
}

#[tokio::test]
async fn equal_ts_writes_converge_to_larger_publisher() {
    let key = key_id(b"merge-key");
    let winner = record_from(&PUB_B, 100, b"from-b");
    let loser = record_from(&PUB_A, 100, b"from-a");

    // Same pair of writes in both arrival orders.
    for (first, second) in [(loser.clone(), winner.clone()), (winner.clone(), loser.clone())] {
        let net = MemNet::new();
        let replica_id: NodeId = [0x55; 32];
        let replica = spawn_node(&net, replica_id, quick_config());

        // Raw endpoints play the two publishers.
        let (link_a, _events_a) = net.register(PUB_A);
        let (link_b, _events_b) = net.register(PUB_B);
        net.connect(&PUB_A, &replica_id);
        net.connect(&PUB_B, &replica_id);
        settle().await;

        let (first_link, second_link) = if first.publisher == node_id_to_hex(&PUB_A) {
            (&link_a, &link_b)
        } else {
            (&link_b, &link_a)
        };
        first_link.send(&replica_id, store_frame(key, first));
        settle().await;
        second_link.send(&replica_id, store_frame(key, second));
        settle().await;

        let held = replica.stored_entry(&key).await.expect("record held");
        assert_eq!(
            held.record, winner,
            "replica must converge to the larger publisher id"
        );
        assert!(!held.publisher);
    }
}

#[tokio::test]
async fn repair_pushes_missing_replicas() {
    let net = MemNet::new();
    let cfg = weft_dht::DhtConfig {
        write_quorum: 1,
        ..quick_config()
    };
    let a = spawn_node(&net, PUB_A, cfg.clone());
    let b = spawn_node(&net, PUB_B, cfg.clone());

    net.connect(&PUB_A, &PUB_B);
    settle().await;

    a.store(b"repair-key", b"payload").await.expect("publish");
    let key = key_id(b"repair-key");
    assert!(b.stored_entry(&key).await.is_some());

    // A new replica joins after the publish and has no copy.
    let late_id: NodeId = [0xCC; 32];
    let late = spawn_node(&net, late_id, cfg);
    net.connect(&PUB_A, &late_id);
    settle().await;
    assert!(late.stored_entry(&key).await.is_none());

    // One repair pass probes existence and heals the gap.
    a.repair_replicas().await;
    settle().await;

    let healed = late.stored_entry(&key).await.expect("record pushed");
    assert_eq!(healed.record.data, b"payload");
    assert!(!healed.publisher);

    // The replica that already held the record kept exactly one copy.
    let kept = b.stored_entry(&key).await.expect("record kept");
    assert_eq!(kept.record.data, b"payload");
}
