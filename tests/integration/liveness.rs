//! Liveness tracking and eviction scenarios.

use std::sync::Arc;
use std::time::Duration;

use cairn_overlay::OverlayEvent;

use crate::{max_distance, BlindProtocol, SimNet};

#[tokio::test]
async fn unreachable_peer_is_evicted_after_three_failures() {
    let net = SimNet::new();
    let survivor = net.add_node(1, max_distance(), Arc::new(BlindProtocol), 0);
    let doomed = net.add_node(2, max_distance(), Arc::new(BlindProtocol), 0);
    survivor.knows(&doomed).await;
    assert_eq!(survivor.overlay.table_len().await, 1);

    let (subscription, mut events) = survivor.overlay.events().subscribe();

    // Take the peer off the network; each probe now fails.
    net.disconnect(&doomed);
    for _ in 0..3 {
        survivor.overlay.probe(doomed.enr.clone()).await;
    }
    assert_eq!(survivor.overlay.table_len().await, 0);

    let mut removed = false;
    for _ in 0..50 {
        match events.try_recv() {
            Ok(OverlayEvent::NodeRemoved { node_id, .. }) => {
                assert_eq!(node_id, doomed.id());
                removed = true;
                break;
            }
            Ok(_) => continue,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(removed, "eviction must surface as NodeRemoved");
    survivor.overlay.events().unsubscribe(subscription);
}

#[tokio::test]
async fn reachable_peer_survives_probing() {
    let net = SimNet::new();
    let a = net.add_node(1, max_distance(), Arc::new(BlindProtocol), 0);
    let b = net.add_node(2, max_distance(), Arc::new(BlindProtocol), 0);
    a.knows(&b).await;

    for _ in 0..5 {
        a.overlay.probe(b.enr.clone()).await;
    }
    assert_eq!(a.overlay.table_len().await, 1);
}

#[tokio::test]
async fn ping_exchanges_radius_and_seq() {
    let net = SimNet::new();
    let a = net.add_node(1, max_distance(), Arc::new(BlindProtocol), 0);
    let b = net.add_node(2, max_distance(), Arc::new(BlindProtocol), 0);

    let pong = a.overlay.ping(&b.enr).await.expect("peer answers");
    assert_eq!(pong.enr_seq, b.enr.seq());
    assert_eq!(pong.radius(), Some(max_distance()));
    // The exchange also seeds the table both ways: a learned b directly,
    // and b learned a from the inbound ping.
    assert_eq!(a.overlay.table_len().await, 1);
    assert_eq!(b.overlay.table_len().await, 1);
}

#[tokio::test]
async fn content_outside_radius_is_rejected_on_admit() {
    use cairn_overlay::OverlayError;

    let net = SimNet::new();
    let node = net.add_node(1, cairn_core::distance::Distance::ZERO, Arc::new(BlindProtocol), 0);
    let outcome = node
        .overlay
        .verify_and_store(b"\x01far-away", b"value")
        .await;
    // Verification passes (blind protocol) but admission refuses.
    match outcome {
        Ok(cairn_overlay::store::AdmitOutcome::OutsideRadius) => {}
        Ok(other) => panic!("expected OutsideRadius, got {other:?}"),
        Err(OverlayError::Verify(_)) => panic!("verification should pass here"),
        Err(error) => panic!("unexpected error: {error}"),
    }
    assert_eq!(node.overlay.store_len().await, 0);
}
