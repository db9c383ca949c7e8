//! Integration test: iterative lookup convergence.
//!
//! Two overlays of eight nodes: a full mesh, where the lookup must
//! return the globally closest id to the target, and a sparse ring,
//! where it must terminate, stay self-free, and widen the searcher's
//! horizon beyond its two neighbors through dial hints and response
//! absorption.

use std::time::Duration;

use weft_integration_tests::{quick_config, settle, spawn_node, MemNet};
use weft_types::id::{cmp_distance, key_id, xor_distance, NodeId};

fn member_ids() -> Vec<NodeId> {
    (0u8..8).map(|i| key_id(&[i])).collect()
}

#[tokio::test]
async fn mesh_lookup_returns_global_closest() {
    let net = MemNet::new();
    let ids = member_ids();
    let nodes: Vec<_> = ids
        .iter()
        .map(|id| spawn_node(&net, *id, quick_config()))
        .collect();

    for i in 0..ids.len() {
        for j in (i + 1)..ids.len() {
            net.connect(&ids[i], &ids[j]);
        }
    }
    settle().await;

    let target = key_id(b"mesh-target");
    let expected = ids
        .iter()
        .copied()
        .min_by(|a, b| cmp_distance(a, b, &target))
        .expect("nonempty overlay");

    for (i, node) in nodes.iter().enumerate() {
        let found = tokio::time::timeout(
            Duration::from_secs(10),
            node.find_closest_nodes(target),
        )
        .await
        .expect("lookup terminates");

        assert!(
            !found.contains(&ids[i]),
            "node {i} returned itself"
        );
        if ids[i] != expected {
            assert_eq!(found[0], expected, "node {i} missed the closest id");
        }
    }
}

#[tokio::test]
async fn ring_lookup_terminates_and_discovers() {
    let net = MemNet::new();
    let ids = member_ids();
    let nodes: Vec<_> = ids
        .iter()
        .map(|id| spawn_node(&net, *id, quick_config()))
        .collect();

    for i in 0..ids.len() {
        net.connect(&ids[i], &ids[(i + 1) % ids.len()]);
    }
    settle().await;

    // Each searcher starts out knowing exactly its two ring neighbors.
    assert_eq!(nodes[0].routing_len().await, 2);

    let target = key_id(b"ring-target");
    let found = tokio::time::timeout(
        Duration::from_secs(10),
        nodes[0].find_closest_nodes(target),
    )
    .await
    .expect("lookup terminates");

    // Sorted by distance, self-free, and wider than the seed set.
    assert!(!found.is_empty());
    assert!(!found.contains(&ids[0]));
    for pair in found.windows(2) {
        assert!(xor_distance(&pair[0], &target) <= xor_distance(&pair[1], &target));
    }
    assert!(
        found.len() > 2,
        "lookup should surface nodes beyond the two neighbors"
    );
    assert!(nodes[0].routing_len().await > 2);
}
