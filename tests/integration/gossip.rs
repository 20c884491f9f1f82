//! Neighborhood gossip scenarios.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::distance::Distance;
use cairn_core::hash::keccak256;
use cairn_overlay::history::{HeaderWithProof, HistoryNetwork, MAINNET_MERGE_BLOCK};
use cairn_core::accumulator::MasterAccumulator;
use cairn_core::content::HistoryContentKey;
use cairn_core::rlp;

use crate::{eventually, max_distance, BlindProtocol, SimNet, SimNode};

/// Fully meshed little network: everyone knows everyone, radius MAX, so
/// every node is an interested gossip target for any content.
async fn meshed_network(net: &SimNet, n: u16) -> Vec<SimNode> {
    let nodes: Vec<SimNode> = (0..n)
        .map(|i| net.add_node(i + 1, max_distance(), Arc::new(BlindProtocol), 0))
        .collect();
    for a in 0..nodes.len() {
        for b in 0..nodes.len() {
            if a != b {
                nodes[a].knows(&nodes[b]).await;
            }
        }
    }
    nodes
}

#[tokio::test]
async fn admitted_content_reaches_all_covering_nodes_without_duplicates() {
    // Five nodes: with fanout 4, every peer is in every gossiper's
    // neighborhood, so full coverage is required, not just likely.
    let net = SimNet::new();
    let nodes = meshed_network(&net, 5).await;

    let key = b"\x01gossip-item".to_vec();
    let value = vec![0x77; 64];
    nodes[0]
        .overlay
        .verify_and_store(&key, &value)
        .await
        .unwrap();

    // Fanout is 4, but every admission re-gossips: within a bounded
    // interval the item reaches every node whose radius covers it.
    let all_have_it = eventually(Duration::from_secs(5), || {
        let nodes = &nodes;
        let key = key.clone();
        async move {
            for node in nodes.iter() {
                match node.overlay.stored(&key).await {
                    Ok(Some(_)) => continue,
                    _ => return false,
                }
            }
            true
        }
    })
    .await;
    assert!(all_have_it, "gossip did not reach every covering node");

    // Exactly one stored copy per node — duplicate admits collapse.
    for node in &nodes {
        assert_eq!(node.overlay.store_len().await, 1);
        assert_eq!(node.overlay.stored(&key).await.unwrap().unwrap(), value);
    }
}

#[tokio::test]
async fn nodes_outside_radius_decline_offers() {
    let net = SimNet::new();
    let wide = net.add_node(1, max_distance(), Arc::new(BlindProtocol), 0);
    let narrow = net.add_node(2, Distance::ZERO, Arc::new(BlindProtocol), 0);
    wide.knows(&narrow).await;
    narrow.knows(&wide).await;

    wide.overlay
        .verify_and_store(b"\x01decline-me", b"payload")
        .await
        .unwrap();

    // Give gossip every opportunity, then confirm the narrow node
    // declined: its radius covers nothing but its own id.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(narrow.overlay.store_len().await, 0);
}

#[tokio::test]
async fn gossiped_content_passes_real_verifiers() {
    // Same pipeline, but with the History specialization verifying a
    // synthetic post-merge header end to end.
    let net = SimNet::new();
    let master = Arc::new(MasterAccumulator::default());
    let a = net.add_node(
        1,
        max_distance(),
        Arc::new(HistoryNetwork::new(Arc::clone(&master))),
        0,
    );
    let b = net.add_node(
        2,
        max_distance(),
        Arc::new(HistoryNetwork::new(master)),
        0,
    );
    a.knows(&b).await;
    b.knows(&a).await;

    let raw_header = synthetic_header(MAINNET_MERGE_BLOCK + 5);
    let hash = keccak256(&raw_header);
    let key = HistoryContentKey::HeaderByHash(hash).encode();
    let value = HeaderWithProof {
        header: raw_header,
        proof: None,
    }
    .encode();

    a.overlay.verify_and_store(&key, &value).await.unwrap();

    let arrived = eventually(Duration::from_secs(5), || {
        let overlay = Arc::clone(&b.overlay);
        let key = key.clone();
        async move { matches!(overlay.stored(&key).await, Ok(Some(_))) }
    })
    .await;
    assert!(arrived, "verified header never reached the peer");

    // A header whose hash does not match its key is refused outright
    // and never enters the gossip pipeline.
    let bogus_key = HistoryContentKey::HeaderByHash([0xee; 32]).encode();
    assert!(a
        .overlay
        .verify_and_store(&bogus_key, &value)
        .await
        .is_err());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.overlay.stored(&bogus_key).await.unwrap().is_none());
}

fn synthetic_header(number: u64) -> Vec<u8> {
    let empty_list_hash = keccak256(rlp::encode_list(&[]));
    let empty_trie_root =
        hex::decode("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421").unwrap();
    let fields = vec![
        rlp::encode_bytes(&[0x11; 32]),
        rlp::encode_bytes(&empty_list_hash),
        rlp::encode_bytes(&[0x22; 20]),
        rlp::encode_bytes(&[0x33; 32]),
        rlp::encode_bytes(&empty_trie_root),
        rlp::encode_bytes(&empty_trie_root),
        rlp::encode_bytes(&[0u8; 256]),
        rlp::encode_uint(0),
        rlp::encode_uint(number),
        rlp::encode_uint(30_000_000),
        rlp::encode_uint(0),
        rlp::encode_uint(1_700_000_000),
        rlp::encode_bytes(b""),
        rlp::encode_bytes(&[0x00; 32]),
        rlp::encode_bytes(&[0x00; 8]),
    ];
    rlp::encode_list(&fields)
}
