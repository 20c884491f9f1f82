//! Neighborhood gossip.
//!
//! Newly admitted content is offered to the few peers whose advertised
//! radius covers its content id. Gossip is best-effort: a peer that does
//! not answer, declines, or fails the transfer is simply skipped. There
//! are no retries; steady-state convergence comes from every admitting
//! node gossiping in turn.

use std::sync::Arc;

use bytes::Bytes;
use cairn_core::distance::{ContentId, Distance};
use cairn_core::enr::Enr;
use cairn_core::wire::{Accept, Message, Offer};

use crate::protocol::{encode_offer_payload, OverlayProtocol};

/// Peers offered each newly admitted item.
pub const NEIGHBORHOOD_GOSSIP_FANOUT: usize = 4;

impl OverlayProtocol {
    /// Offer one admitted item to interested neighbors.
    pub(crate) async fn gossip_content(
        self: &Arc<Self>,
        key: &[u8],
        value: &[u8],
        content_id: ContentId,
    ) {
        let targets = self.gossip_targets(&content_id).await;
        if targets.is_empty() {
            return;
        }
        tracing::debug!(
            protocol = self.protocol_id().name(),
            content_id = %hex::encode(content_id),
            peers = targets.len(),
            "gossiping content to neighborhood"
        );
        for enr in targets {
            self.offer_to(enr, key, value).await;
        }
    }

    /// Peers whose last-advertised radius covers the content id, nearest
    /// first, capped at the gossip fanout.
    async fn gossip_targets(&self, content_id: &ContentId) -> Vec<Enr> {
        let table = self.table.lock().await;
        let mut interested: Vec<(Distance, Enr)> = table
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let distance = Distance::between(&entry.node_id(), content_id);
                (distance <= entry.radius).then(|| (distance, entry.enr))
            })
            .collect();
        interested.sort_by(|a, b| a.0.cmp(&b.0));
        interested
            .into_iter()
            .take(NEIGHBORHOOD_GOSSIP_FANOUT)
            .map(|(_, enr)| enr)
            .collect()
    }

    /// One OFFER/ACCEPT/transfer exchange with a single peer.
    async fn offer_to(self: &Arc<Self>, enr: Enr, key: &[u8], value: &[u8]) {
        let offer = Message::Offer(Offer {
            content_keys: vec![Bytes::copy_from_slice(key)],
        });
        let response = tokio::time::timeout(
            crate::lookup::PROBE_TIMEOUT,
            self.transport
                .send_request(enr.clone(), self.protocol_id(), offer.encode()),
        )
        .await;
        let accept = match response {
            Ok(Ok(bytes)) => match Message::decode(&bytes) {
                Ok(Message::Accept(accept)) => accept,
                _ => return,
            },
            _ => return,
        };
        if !wants_first_key(&accept) {
            return;
        }
        let payload = encode_offer_payload(&[value]);
        let sent = tokio::time::timeout(
            self.config.transfer_timeout,
            self.transfers
                .initiate_send(enr.clone(), accept.connection_id, payload),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            tracing::debug!(
                peer = %hex::encode(enr.node_id()),
                "gossip transfer failed"
            );
        }
    }
}

fn wants_first_key(accept: &Accept) -> bool {
    accept.connection_id != 0 && accept.content_keys.first().copied().unwrap_or(false)
}
