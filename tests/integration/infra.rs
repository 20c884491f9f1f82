//! In-memory network harness.
//!
//! `SimNet` hosts any number of overlay instances. The transport
//! delivers a request by invoking the destination overlay's handler
//! directly; the transfer channel pairs senders and receivers through a
//! shared rendezvous map keyed by (sending node, connection id). Every
//! request is counted so convergence bounds can be asserted.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cairn_core::content::ContentKeyError;
use cairn_core::distance::{ContentId, Distance, NodeId, Radius};
use cairn_core::enr::{Enr, EnrBuilder};
use cairn_core::hash::keccak256;
use cairn_core::wire::ProtocolId;
use cairn_overlay::{
    ContentReader, EventBus, MemoryBackend, OverlayConfig, OverlayProtocol, RadiusStore,
    SubProtocol, Transport, TransferChannel, TransferError, TransportError, VerifyError,
};
use futures::future::BoxFuture;
use k256::ecdsa::SigningKey;
use tokio::sync::oneshot;

/// Sub-protocol used by most scenarios: keccak content ids, every value
/// accepted. Scenarios about verification use the real specializations.
pub struct BlindProtocol;

impl SubProtocol for BlindProtocol {
    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::History
    }
    fn content_id(&self, key: &[u8]) -> Result<ContentId, ContentKeyError> {
        if key.is_empty() {
            return Err(ContentKeyError::Empty);
        }
        Ok(keccak256(key))
    }
    fn verify(
        &self,
        _key: &[u8],
        _value: &[u8],
        _reader: &dyn ContentReader,
    ) -> Result<(), VerifyError> {
        Ok(())
    }
}

type OverlayKey = (NodeId, [u8; 2]);

enum TransferSlot {
    /// The payload side arrived first.
    Payload {
        payload: Vec<u8>,
        delivered: oneshot::Sender<()>,
    },
    /// The receiving side arrived first.
    Waiter { waiter: oneshot::Sender<Vec<u8>> },
}

#[derive(Default)]
struct SimState {
    overlays: Mutex<HashMap<OverlayKey, Arc<OverlayProtocol>>>,
    transfers: Mutex<HashMap<(NodeId, u16), TransferSlot>>,
    request_count: AtomicUsize,
}

/// A simulated network of overlay nodes.
#[derive(Clone, Default)]
pub struct SimNet {
    state: Arc<SimState>,
}

impl SimNet {
    pub fn new() -> SimNet {
        SimNet::default()
    }

    /// Requests issued across the whole network since creation.
    pub fn request_count(&self) -> usize {
        self.state.request_count.load(Ordering::Relaxed)
    }

    pub fn reset_request_count(&self) {
        self.state.request_count.store(0, Ordering::Relaxed);
    }

    /// Spin up one overlay node. `seed` fixes its identity.
    pub fn add_node(
        &self,
        seed: u16,
        radius: Radius,
        subprotocol: Arc<dyn SubProtocol>,
        max_bytes: u64,
    ) -> SimNode {
        let mut bytes = [0u8; 32];
        bytes[30..].copy_from_slice(&seed.to_be_bytes());
        bytes[0] = 1;
        let key = SigningKey::from_slice(&bytes).expect("valid key bytes");
        let enr = EnrBuilder::new()
            .ip4(Ipv4Addr::new(127, 0, 0, 1))
            .udp4(20000 + seed)
            .build(&key)
            .expect("buildable record");

        let node_id = enr.node_id();
        let transport = Arc::new(SimTransport {
            local: enr.clone(),
            state: Arc::clone(&self.state),
        });
        let transfers = Arc::new(SimTransfers {
            local: node_id,
            state: Arc::clone(&self.state),
        });
        let store = RadiusStore::open(node_id, radius, max_bytes, Box::new(MemoryBackend::new()))
            .expect("memory store opens");
        let overlay = OverlayProtocol::new(
            subprotocol.clone(),
            transport,
            transfers,
            store,
            Arc::new(EventBus::new()),
            OverlayConfig::default(),
        );
        self.state
            .overlays
            .lock()
            .expect("sim lock poisoned")
            .insert((node_id, subprotocol.protocol_id().tag()), Arc::clone(&overlay));
        SimNode { enr, overlay }
    }

    /// Drop a node from the network; requests to it fail from now on.
    pub fn disconnect(&self, node: &SimNode) {
        self.state
            .overlays
            .lock()
            .expect("sim lock poisoned")
            .remove(&(node.id(), node.overlay.protocol_id().tag()));
    }
}

pub struct SimNode {
    pub enr: Enr,
    pub overlay: Arc<OverlayProtocol>,
}

impl SimNode {
    pub fn id(&self) -> NodeId {
        self.enr.node_id()
    }

    /// Introduce this node to a peer (one-directional table seed).
    pub async fn knows(&self, other: &SimNode) {
        self.overlay.admit_peer(other.enr.clone()).await;
    }
}

struct SimTransport {
    local: Enr,
    state: Arc<SimState>,
}

impl Transport for SimTransport {
    fn local_enr(&self) -> Enr {
        self.local.clone()
    }

    fn send_request(
        &self,
        dest: Enr,
        protocol: ProtocolId,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransportError>> {
        let state = Arc::clone(&self.state);
        let from = self.local.clone();
        Box::pin(async move {
            state.request_count.fetch_add(1, Ordering::Relaxed);
            let target = {
                let overlays = state.overlays.lock().expect("sim lock poisoned");
                overlays.get(&(dest.node_id(), protocol.tag())).cloned()
            };
            let Some(target) = target else {
                return Err(TransportError::NoRoute);
            };
            match target.handle_talk_request(from, &payload).await {
                Some(response) => Ok(response),
                None => Err(TransportError::Timeout),
            }
        })
    }
}

/// Rendezvous-based transfer channel: whichever side arrives first
/// parks in the slot map; the counterpart completes the exchange.
struct SimTransfers {
    local: NodeId,
    state: Arc<SimState>,
}

impl SimTransfers {
    /// The payload-producing side, keyed by the producing node.
    fn offer_payload(
        state: &SimState,
        key: (NodeId, u16),
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        let mut slots = state.transfers.lock().expect("sim lock poisoned");
        match slots.remove(&key) {
            Some(TransferSlot::Waiter { waiter }) => {
                let _ = waiter.send(payload);
                Box::pin(async { Ok(()) })
            }
            Some(other) => {
                slots.insert(key, other);
                Box::pin(async { Err(TransferError::Io("conn id collision".into())) })
            }
            None => {
                let (delivered, done) = oneshot::channel();
                slots.insert(key, TransferSlot::Payload { payload, delivered });
                Box::pin(async move { done.await.map_err(|_| TransferError::Timeout) })
            }
        }
    }

    /// The payload-consuming side, keyed by the producing node.
    fn take_payload(
        state: &SimState,
        key: (NodeId, u16),
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>> {
        let mut slots = state.transfers.lock().expect("sim lock poisoned");
        match slots.remove(&key) {
            Some(TransferSlot::Payload { payload, delivered }) => {
                let _ = delivered.send(());
                Box::pin(async move { Ok(payload) })
            }
            Some(other) => {
                slots.insert(key, other);
                Box::pin(async { Err(TransferError::Io("conn id collision".into())) })
            }
            None => {
                let (waiter, rx) = oneshot::channel();
                slots.insert(key, TransferSlot::Waiter { waiter });
                Box::pin(async move { rx.await.map_err(|_| TransferError::Timeout) })
            }
        }
    }
}

impl TransferChannel for SimTransfers {
    fn initiate_receive(
        &self,
        dest: Enr,
        conn_id: u16,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>> {
        Self::take_payload(&self.state, (dest.node_id(), conn_id))
    }

    fn await_send(
        &self,
        _dest: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        Self::offer_payload(&self.state, (self.local, conn_id), payload)
    }

    fn initiate_send(
        &self,
        _dest: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        Self::offer_payload(&self.state, (self.local, conn_id), payload)
    }

    fn await_receive(
        &self,
        dest: Enr,
        conn_id: u16,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>> {
        Self::take_payload(&self.state, (dest.node_id(), conn_id))
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn eventually<F, Fut>(timeout: std::time::Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

pub fn max_distance() -> Radius {
    Distance::MAX
}
