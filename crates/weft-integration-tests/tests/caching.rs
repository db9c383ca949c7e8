//! Integration test: opportunistic caching during value lookups.
//!
//! A querier fetches a record held only by a distant node. The lookup
//! must seed a copy at the traversed node closest to the key (excluding
//! the responder) and cache the result locally at the querier, both
//! without authorship.

use weft_dht::link::PeerLink;
use weft_integration_tests::{quick_config, settle, spawn_node, MemNet};
use weft_types::id::{key_id, node_id_to_hex, NodeId};
use weft_types::record::Record;
use weft_wire::codec::Message;

#[tokio::test]
async fn lookup_seeds_record_at_closer_node() {
    let user_key = b"cached-key";
    let key = key_id(user_key);

    // Middle node: one bit away from the key, so closest to it.
    let mut middle_id: NodeId = key;
    middle_id[31] ^= 0x01;
    // Distant holder: differs in the leading bit.
    let mut distant_id: NodeId = key;
    distant_id[0] ^= 0x80;
    // Querier: between the two.
    let mut querier_id: NodeId = key;
    querier_id[1] ^= 0xFF;

    let net = MemNet::new();
    let querier = spawn_node(&net, querier_id, quick_config());
    let middle = spawn_node(&net, middle_id, quick_config());
    let distant = spawn_node(&net, distant_id, quick_config());

    net.connect(&querier_id, &middle_id);
    net.connect(&querier_id, &distant_id);
    settle().await;

    // Only the distant node holds the record, injected by a raw writer.
    let record = Record {
        data: b"payload".to_vec(),
        ts: 500,
        publisher: node_id_to_hex(&[0x77; 32]),
    };
    let writer_id: NodeId = [0x77; 32];
    let (writer, _writer_events) = net.register(writer_id);
    net.connect(&writer_id, &distant_id);
    settle().await;
    let frame = Message::Store {
        msg_id: weft_types::id::new_message_id(),
        key,
        record: record.clone(),
    }
    .encode()
    .expect("encode");
    writer.send(&distant_id, frame);
    settle().await;
    assert!(distant.stored_entry(&key).await.is_some());
    assert!(middle.stored_entry(&key).await.is_none());

    // The querier finds the value over the network.
    let got = querier.get(user_key).await;
    assert_eq!(got, Some(b"payload".to_vec()));
    settle().await;

    // The traversed node nearest the key received a fire-and-forget copy.
    let seeded = middle.stored_entry(&key).await.expect("cache copy seeded");
    assert_eq!(seeded.record, record);
    assert!(!seeded.publisher);

    // The querier kept a local cache without claiming authorship.
    let cached = querier.stored_entry(&key).await.expect("local cache");
    assert_eq!(cached.record, record);
    assert!(!cached.publisher);

    // A repeat read is a local hit.
    assert_eq!(querier.get(user_key).await, Some(b"payload".to_vec()));
}
