//! Per-sub-protocol overlay engine.
//!
//! `OverlayProtocol` binds one routing table, one radius-bounded store,
//! the lookup drivers, and the gossip pipeline to a sub-protocol
//! specialization. The discovery substrate and the bulk-transfer channel
//! are consumed through the `Transport` and `TransferChannel` traits; the
//! daemon provides UDP-backed implementations and the test harness
//! provides in-memory ones.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;

use cairn_core::content::ContentKeyError;
use cairn_core::distance::{ContentId, Distance, NodeId};
use cairn_core::enr::Enr;
use cairn_core::wire::{
    Accept, Content, FindContent, FindNodes, Message, Nodes, Offer, Ping, Pong, ProtocolId,
    WireError, MAX_INLINE_CONTENT, MAX_TALK_PAYLOAD,
};
use thiserror::Error;

use crate::events::{EventBus, OverlayEvent};
use crate::lookup::{Lookup, LOOKUP_DEADLINE, LOOKUP_K, PROBE_TIMEOUT};
use crate::store::{AdmitOutcome, Interest, RadiusStore, StoreError};
use crate::table::{InsertOutcome, RoutingTable};

// ── Consumed interfaces ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("no route to peer")]
    NoRoute,
    #[error("malformed response")]
    Malformed,
    #[error("transport: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer stalled")]
    Stalled,
    #[error("connection reset by peer")]
    Reset,
    #[error("transfer: {0}")]
    Io(String),
}

/// The discovery substrate: request/response delivery to a peer,
/// addressed by its record. Handshake and session keys live below this
/// interface.
pub trait Transport: Send + Sync + 'static {
    fn local_enr(&self) -> Enr;
    fn send_request(
        &self,
        dest: Enr,
        protocol: ProtocolId,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransportError>>;
}

/// The bulk-transfer channel, used whenever a payload exceeds the
/// discovery ceiling. Connection ids are exchanged in CONTENT and ACCEPT
/// messages; the side that learned the id initiates.
pub trait TransferChannel: Send + Sync + 'static {
    /// FINDCONTENT requester: connect with the id from the CONTENT
    /// response and receive one payload.
    fn initiate_receive(
        &self,
        dest: Enr,
        conn_id: u16,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>>;

    /// CONTENT responder: await the inbound connection and stream the
    /// payload.
    fn await_send(
        &self,
        dest: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>>;

    /// OFFER sender: connect with the id from the ACCEPT response and
    /// stream the selected items.
    fn initiate_send(
        &self,
        dest: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>>;

    /// OFFER acceptor: await the inbound connection and receive the
    /// selected items.
    fn await_receive(
        &self,
        dest: Enr,
        conn_id: u16,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>>;
}

/// Read access to stored content during verification; body and receipt
/// verifiers resolve their stored header through this.
pub trait ContentReader {
    fn read(&self, key: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("bad content key: {0}")]
    Key(#[from] ContentKeyError),
    #[error("undecodable content value: {0}")]
    Decode(String),
    #[error("hash does not match content key")]
    HashMismatch,
    #[error("commitment root mismatch")]
    RootMismatch,
    #[error("invalid proof: {0}")]
    Proof(String),
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
}

/// A sub-protocol specialization: key grammar, content-id derivation, and
/// the verifier set. The dispatcher above is uniform.
pub trait SubProtocol: Send + Sync + 'static {
    fn protocol_id(&self) -> ProtocolId;

    /// Validate the key grammar and derive the overlay position.
    fn content_id(&self, key: &[u8]) -> Result<ContentId, ContentKeyError>;

    /// Type-specific verification of (key, value).
    fn verify(&self, key: &[u8], value: &[u8], reader: &dyn ContentReader)
        -> Result<(), VerifyError>;

    /// Called after an item is admitted to the store.
    fn on_admitted(&self, _key: &[u8], _value: &[u8]) {}
}

// ── Errors & outcomes ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("content key: {0}")]
    Key(#[from] ContentKeyError),
    #[error("verification: {0}")]
    Verify(#[from] VerifyError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("peer answered with the wrong message type")]
    UnexpectedResponse,
}

/// User-visible outcome of a content lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentOutcome {
    /// First verified payload, with the peer that served it. A local hit
    /// reports the local node id.
    Found { value: Vec<u8>, source: NodeId },
    /// Candidate set exhausted without a verified payload.
    NotFound,
    /// The lookup deadline elapsed.
    Timeout,
}

/// Tunables that differ between production and simulation.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Abort a bulk transfer that stalls longer than this.
    pub transfer_timeout: Duration,
    /// ENRs offered back in a CONTENT or NODES response.
    pub response_enr_limit: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(10),
            response_enr_limit: 8,
        }
    }
}

// ── The overlay ───────────────────────────────────────────────────────────────

pub struct OverlayProtocol {
    pub(crate) subprotocol: Arc<dyn SubProtocol>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) transfers: Arc<dyn TransferChannel>,
    pub(crate) table: Mutex<RoutingTable>,
    pub(crate) store: Mutex<RadiusStore>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) config: OverlayConfig,
}

impl OverlayProtocol {
    pub fn new(
        subprotocol: Arc<dyn SubProtocol>,
        transport: Arc<dyn Transport>,
        transfers: Arc<dyn TransferChannel>,
        store: RadiusStore,
        events: Arc<EventBus>,
        config: OverlayConfig,
    ) -> Arc<OverlayProtocol> {
        let local_id = transport.local_enr().node_id();
        Arc::new(OverlayProtocol {
            subprotocol,
            transport,
            transfers,
            table: Mutex::new(RoutingTable::new(local_id)),
            store: Mutex::new(store),
            events,
            config,
        })
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.subprotocol.protocol_id()
    }

    pub fn local_enr(&self) -> Enr {
        self.transport.local_enr()
    }

    pub fn local_id(&self) -> NodeId {
        self.transport.local_enr().node_id()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn table_len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn radius(&self) -> Distance {
        self.store.lock().await.radius()
    }

    /// Explicit radius reconfiguration: the one path through which the
    /// responsibility radius may grow.
    pub async fn set_radius(&self, radius: Distance) {
        self.store.lock().await.set_radius(radius);
    }

    pub async fn snapshot_peers(&self) -> Vec<Enr> {
        self.table
            .lock()
            .await
            .entries()
            .into_iter()
            .map(|e| e.enr)
            .collect()
    }

    /// Stored value for a content key, straight from the local store.
    pub async fn stored(&self, key: &[u8]) -> Result<Option<Vec<u8>>, OverlayError> {
        let content_id = self.subprotocol.content_id(key)?;
        Ok(self.store.lock().await.get(&content_id)?)
    }

    /// Number of locally stored items.
    pub async fn store_len(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Peers overdue for a liveness re-probe.
    pub async fn probe_candidates(&self) -> Vec<Enr> {
        self.table.lock().await.probe_candidates(std::time::Instant::now())
    }

    /// The peer whose liveness information is stalest.
    pub async fn least_recently_seen(&self) -> Option<Enr> {
        self.table.lock().await.least_recently_seen()
    }

    // ── Outbound requests ────────────────────────────────────────────────────

    /// PING a peer and fold its answer into the table.
    pub async fn ping(self: &Arc<Self>, enr: &Enr) -> Result<Pong, OverlayError> {
        let radius = self.store.lock().await.radius();
        let message = Message::Ping(Ping::with_radius(self.local_enr().seq(), &radius));
        let response = self
            .transport
            .send_request(enr.clone(), self.protocol_id(), message.encode())
            .await?;
        let Message::Pong(pong) = Message::decode(&response)? else {
            return Err(OverlayError::UnexpectedResponse);
        };
        self.admit_peer(enr.clone()).await;
        let node_id = enr.node_id();
        let mut table = self.table.lock().await;
        table.confirm_live(&node_id);
        if let Some(radius) = pong.radius() {
            table.set_radius(&node_id, radius);
        }
        Ok(pong)
    }

    /// Liveness probe used by the maintenance loop: one PING, with
    /// failure accounting and eviction after repeated misses.
    pub fn probe(self: &Arc<Self>, enr: Enr) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        Box::pin(async move {
            if this.ping(&enr).await.is_ok() {
                return;
            }
            let node_id = enr.node_id();
            let evicted = this.table.lock().await.mark_failure(&node_id);
            if let Some(evicted) = evicted {
                tracing::debug!(
                    protocol = this.protocol_id().name(),
                    node_id = %hex::encode(evicted.node_id()),
                    "peer evicted after repeated liveness failures"
                );
                this.events.emit(OverlayEvent::NodeRemoved {
                    node_id: evicted.node_id(),
                    protocol: this.protocol_id(),
                });
            }
        })
    }

    /// One FINDNODES request; returns the validated records.
    pub async fn request_find_nodes(
        self: &Arc<Self>,
        enr: &Enr,
        distances: Vec<u16>,
    ) -> Result<Vec<Enr>, OverlayError> {
        let message = Message::FindNodes(FindNodes { distances });
        let response = self
            .transport
            .send_request(enr.clone(), self.protocol_id(), message.encode())
            .await?;
        let Message::Nodes(nodes) = Message::decode(&response)? else {
            return Err(OverlayError::UnexpectedResponse);
        };
        Ok(decode_enrs(&nodes.enrs))
    }

    /// One FINDCONTENT request, without following the transfer arm.
    async fn request_content(
        self: &Arc<Self>,
        enr: &Enr,
        key: &[u8],
    ) -> Result<Content, OverlayError> {
        let message = Message::FindContent(FindContent {
            content_key: Bytes::copy_from_slice(key),
        });
        let response = self
            .transport
            .send_request(enr.clone(), self.protocol_id(), message.encode())
            .await?;
        let Message::Content(content) = Message::decode(&response)? else {
            return Err(OverlayError::UnexpectedResponse);
        };
        Ok(content)
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    /// Iterative FINDNODE lookup toward a keyspace target.
    pub async fn lookup_nodes(self: &Arc<Self>, target: [u8; 32]) -> Vec<Enr> {
        let seeds = self.table.lock().await.nearest(&target, LOOKUP_K);
        let mut lookup = Lookup::new(target, self.local_id(), seeds);
        let deadline = tokio::time::sleep(LOOKUP_DEADLINE);
        tokio::pin!(deadline);
        let mut pending = FuturesUnordered::new();

        loop {
            for enr in lookup.next_batch() {
                let this = Arc::clone(self);
                let distances = lookup_distances(&target, &enr);
                pending.push(async move {
                    let result = tokio::time::timeout(
                        PROBE_TIMEOUT,
                        this.request_find_nodes(&enr, distances),
                    )
                    .await;
                    let discovered = match result {
                        Ok(Ok(enrs)) => Some(enrs),
                        _ => None,
                    };
                    (enr, discovered)
                });
            }
            if pending.is_empty() {
                break;
            }
            tokio::select! {
                _ = &mut deadline => break,
                Some((enr, discovered)) = pending.next() => {
                    match discovered {
                        Some(enrs) => lookup.on_response(&enr.node_id(), enrs),
                        None => lookup.on_failure(&enr.node_id()),
                    }
                }
            }
            if lookup.is_finished() {
                break;
            }
        }

        let closest = lookup.closest(LOOKUP_K);
        for enr in &closest {
            self.admit_peer(enr.clone()).await;
        }
        closest
    }

    /// Iterative FINDCONTENT lookup. The first verified payload wins;
    /// failed verification counts as no answer from that peer.
    pub async fn lookup_content(self: &Arc<Self>, key: &[u8]) -> Result<ContentOutcome, OverlayError> {
        let content_id = self.subprotocol.content_id(key)?;

        if let Some(value) = self.store.lock().await.get(&content_id)? {
            return Ok(ContentOutcome::Found {
                value,
                source: self.local_id(),
            });
        }

        let seeds = self.table.lock().await.nearest(&content_id, LOOKUP_K);
        let mut lookup = Lookup::new(content_id, self.local_id(), seeds);
        let deadline = tokio::time::sleep(LOOKUP_DEADLINE);
        tokio::pin!(deadline);
        let mut pending = FuturesUnordered::new();
        let mut timed_out = false;

        let outcome = loop {
            for enr in lookup.next_batch() {
                let this = Arc::clone(self);
                let key = key.to_vec();
                pending.push(async move {
                    let probe = this.probe_content(&enr, &key).await;
                    (enr, probe)
                });
            }
            if pending.is_empty() {
                break None;
            }
            tokio::select! {
                _ = &mut deadline => {
                    timed_out = true;
                    break None;
                }
                Some((enr, probe)) = pending.next() => {
                    let source = enr.node_id();
                    match probe {
                        ContentProbe::Payload(value) => {
                            match self.verify_and_store(key, &value).await {
                                Ok(_) => break Some((value, source)),
                                Err(error) => {
                                    tracing::debug!(
                                        protocol = self.protocol_id().name(),
                                        peer = %hex::encode(source),
                                        %error,
                                        "discarding payload that failed verification"
                                    );
                                    lookup.on_failure(&source);
                                }
                            }
                        }
                        ContentProbe::Enrs(enrs) => lookup.on_response(&source, enrs),
                        ContentProbe::Failed => lookup.on_failure(&source),
                    }
                }
            }
            if lookup.is_finished() {
                break None;
            }
        };

        // A cancelled lookup releases its candidates; in-flight probes
        // run to completion in the background but settle nothing.
        lookup.cancel();

        Ok(match outcome {
            Some((value, source)) => ContentOutcome::Found { value, source },
            None if timed_out => ContentOutcome::Timeout,
            None => ContentOutcome::NotFound,
        })
    }

    /// Probe one peer for content, following the transfer arm when the
    /// response elects it.
    async fn probe_content(self: &Arc<Self>, enr: &Enr, key: &[u8]) -> ContentProbe {
        let response =
            tokio::time::timeout(PROBE_TIMEOUT, self.request_content(enr, key)).await;
        match response {
            Ok(Ok(Content::Payload(payload))) => ContentProbe::Payload(payload.to_vec()),
            Ok(Ok(Content::ConnectionId(conn_id))) => {
                let transfer = tokio::time::timeout(
                    self.config.transfer_timeout,
                    self.transfers.initiate_receive(enr.clone(), conn_id),
                )
                .await;
                match transfer {
                    Ok(Ok(payload)) => ContentProbe::Payload(payload),
                    _ => ContentProbe::Failed,
                }
            }
            Ok(Ok(Content::Enrs(enrs))) => ContentProbe::Enrs(decode_enrs(&enrs)),
            _ => ContentProbe::Failed,
        }
    }

    // ── Content admission ────────────────────────────────────────────────────

    /// Verify a (key, value) pair and admit it to the store. Emits the
    /// verification and admission events and kicks off neighborhood
    /// gossip for newly admitted items.
    pub async fn verify_and_store(
        self: &Arc<Self>,
        key: &[u8],
        value: &[u8],
    ) -> Result<AdmitOutcome, OverlayError> {
        let content_id = self.subprotocol.content_id(key)?;
        let outcome = {
            // Verification and the store write happen under one lock:
            // concurrent admits of the same id collapse to one write.
            let mut store = self.store.lock().await;
            let reader = StoreReader {
                store: &store,
                subprotocol: self.subprotocol.as_ref(),
            };
            if let Err(error) = self.subprotocol.verify(key, value, &reader) {
                self.events.emit(OverlayEvent::Verified {
                    content_id,
                    ok: false,
                });
                return Err(error.into());
            }
            self.events.emit(OverlayEvent::Verified {
                content_id,
                ok: true,
            });
            store.insert(content_id, value)?
        };

        if let AdmitOutcome::Admitted { .. } = outcome {
            self.subprotocol.on_admitted(key, value);
            self.events.emit(OverlayEvent::ContentAdded {
                protocol: self.protocol_id(),
                key: key.to_vec(),
                value: value.to_vec(),
            });
            let this = Arc::clone(self);
            let key = key.to_vec();
            let value = value.to_vec();
            tokio::spawn(async move {
                this.gossip_content(&key, &value, content_id).await;
            });
        }
        Ok(outcome)
    }

    /// Fold a record into the routing table, probing the displaced entry
    /// when a bucket is full.
    pub async fn admit_peer(self: &Arc<Self>, enr: Enr) {
        let outcome = self.table.lock().await.insert(enr.clone());
        match outcome {
            InsertOutcome::Inserted => {
                self.events.emit(OverlayEvent::NodeAdded {
                    node_id: enr.node_id(),
                    protocol: self.protocol_id(),
                });
            }
            InsertOutcome::Pending { probe } => {
                tokio::spawn(self.probe(probe));
            }
            _ => {}
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    /// Handle one inbound request and produce the response payload.
    /// Malformed input is dropped without affecting the sender's
    /// liveness state.
    pub async fn handle_talk_request(
        self: &Arc<Self>,
        from: Enr,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::trace!(
                    protocol = self.protocol_id().name(),
                    %error,
                    "dropping malformed message"
                );
                return None;
            }
        };
        match message {
            Message::Ping(ping) => Some(self.handle_ping(from, ping).await),
            Message::FindNodes(request) => Some(self.handle_find_nodes(from, request).await),
            Message::FindContent(request) => self.handle_find_content(from, request).await,
            Message::Offer(offer) => self.handle_offer(from, offer).await,
            // Response-type messages are never valid requests.
            Message::Pong(_) | Message::Nodes(_) | Message::Content(_) | Message::Accept(_) => {
                None
            }
        }
    }

    async fn handle_ping(self: &Arc<Self>, from: Enr, ping: Ping) -> Vec<u8> {
        let node_id = from.node_id();
        self.admit_peer(from).await;
        {
            let mut table = self.table.lock().await;
            table.confirm_live(&node_id);
            if let Some(radius) = ping.radius() {
                table.set_radius(&node_id, radius);
            }
        }
        let radius = self.store.lock().await.radius();
        Message::Pong(Pong::with_radius(self.local_enr().seq(), &radius)).encode()
    }

    async fn handle_find_nodes(self: &Arc<Self>, from: Enr, request: FindNodes) -> Vec<u8> {
        self.admit_peer(from.clone()).await;
        let mut enrs: Vec<Bytes> = Vec::new();
        let mut budget = MAX_TALK_PAYLOAD - 16;
        let mut distances = request.distances;
        distances.sort_unstable();
        distances.dedup();
        let table = self.table.lock().await;
        for distance in distances {
            if distance == 0 {
                push_within_budget(&mut enrs, &mut budget, self.local_enr().encoded());
                continue;
            }
            for enr in table.entries_at_log_distance(distance) {
                if enr.node_id() == from.node_id() {
                    continue;
                }
                push_within_budget(&mut enrs, &mut budget, enr.encoded());
            }
        }
        Message::Nodes(Nodes { total: 1, enrs }).encode()
    }

    async fn handle_find_content(
        self: &Arc<Self>,
        from: Enr,
        request: FindContent,
    ) -> Option<Vec<u8>> {
        self.admit_peer(from.clone()).await;
        let content_id = match self.subprotocol.content_id(&request.content_key) {
            Ok(id) => id,
            Err(error) => {
                tracing::trace!(
                    protocol = self.protocol_id().name(),
                    %error,
                    "dropping FINDCONTENT with invalid key"
                );
                return None;
            }
        };

        let stored = {
            let store = self.store.lock().await;
            store.get(&content_id).ok().flatten()
        };
        let content = match stored {
            Some(value) if value.len() <= MAX_INLINE_CONTENT => {
                Content::Payload(Bytes::from(value))
            }
            Some(value) => {
                // Payload exceeds the discovery ceiling: elect the
                // transfer arm and wait for the requester to connect.
                let conn_id: u16 = rand::random();
                let transfers = Arc::clone(&self.transfers);
                let timeout = self.config.transfer_timeout;
                let dest = from.clone();
                tokio::spawn(async move {
                    let result =
                        tokio::time::timeout(timeout, transfers.await_send(dest, conn_id, value))
                            .await;
                    if !matches!(result, Ok(Ok(()))) {
                        tracing::debug!(conn_id, "content transfer to requester failed");
                    }
                });
                Content::ConnectionId(conn_id)
            }
            None => {
                let table = self.table.lock().await;
                let nearest = table.nearest_excluding(
                    &content_id,
                    self.config.response_enr_limit,
                    Some(&from.node_id()),
                );
                let mut enrs = Vec::new();
                let mut budget = MAX_TALK_PAYLOAD - 16;
                for enr in nearest {
                    push_within_budget(&mut enrs, &mut budget, enr.encoded());
                }
                Content::Enrs(enrs)
            }
        };
        Some(Message::Content(content).encode())
    }

    async fn handle_offer(self: &Arc<Self>, from: Enr, offer: Offer) -> Option<Vec<u8>> {
        self.admit_peer(from.clone()).await;
        let mut wants = Vec::with_capacity(offer.content_keys.len());
        let mut accepted_keys = Vec::new();
        {
            let store = self.store.lock().await;
            for key in &offer.content_keys {
                let want = match self.subprotocol.content_id(key) {
                    Ok(content_id) => store.interest(&content_id) == Interest::Wanted,
                    Err(_) => false,
                };
                if want {
                    accepted_keys.push(key.to_vec());
                }
                wants.push(want);
            }
        }

        let connection_id = if accepted_keys.is_empty() {
            0
        } else {
            let conn_id: u16 = rand::random();
            let this = Arc::clone(self);
            let dest = from.clone();
            let timeout = self.config.transfer_timeout;
            tokio::spawn(async move {
                let received =
                    tokio::time::timeout(timeout, this.transfers.await_receive(dest, conn_id))
                        .await;
                let payload = match received {
                    Ok(Ok(payload)) => payload,
                    _ => {
                        tracing::debug!(conn_id, "offer transfer never completed");
                        return;
                    }
                };
                let items = match decode_offer_payload(&payload) {
                    Ok(items) => items,
                    Err(error) => {
                        tracing::debug!(conn_id, %error, "malformed offer payload");
                        return;
                    }
                };
                for (key, value) in accepted_keys.iter().zip(items.iter()) {
                    if let Err(error) = this.verify_and_store(key, value).await {
                        tracing::debug!(%error, "offered content failed admission");
                    }
                }
            });
            conn_id
        };

        Some(
            Message::Accept(Accept {
                connection_id,
                content_keys: wants,
            })
            .encode(),
        )
    }
}

enum ContentProbe {
    Payload(Vec<u8>),
    Enrs(Vec<Enr>),
    Failed,
}

/// Store view handed to verifiers while the admission lock is held.
struct StoreReader<'a> {
    store: &'a RadiusStore,
    subprotocol: &'a dyn SubProtocol,
}

impl ContentReader for StoreReader<'_> {
    fn read(&self, key: &[u8]) -> Option<Vec<u8>> {
        let content_id = self.subprotocol.content_id(key).ok()?;
        self.store.get(&content_id).ok().flatten()
    }
}

/// Distances requested from a remote during a lookup: the remote's log2
/// distance to the target and its immediate neighbors.
fn lookup_distances(target: &[u8; 32], enr: &Enr) -> Vec<u16> {
    let distance = Distance::between(&enr.node_id(), target);
    let Some(log2) = distance.log2() else {
        // The remote IS the target: ask for its closest neighborhood.
        return vec![0, 1, 2];
    };
    let bits = log2 as u16 + 1;
    let mut out = vec![bits];
    if bits > 1 {
        out.push(bits - 1);
    }
    if bits < 256 {
        out.push(bits + 1);
    }
    out
}

fn decode_enrs(raw: &[Bytes]) -> Vec<Enr> {
    raw.iter()
        .filter_map(|bytes| match Enr::decode(bytes) {
            Ok(enr) => Some(enr),
            Err(error) => {
                tracing::trace!(%error, "discarding undecodable record");
                None
            }
        })
        .collect()
}

fn push_within_budget(enrs: &mut Vec<Bytes>, budget: &mut usize, encoded: &[u8]) {
    let cost = encoded.len() + 4;
    if cost <= *budget {
        enrs.push(Bytes::copy_from_slice(encoded));
        *budget -= cost;
    }
}

// ── Transfer payload framing ──────────────────────────────────────────────────

/// Frame the items selected from an OFFER into one transfer payload:
/// each item is prefixed with its u32 little-endian length, in the order
/// the ACCEPT bitlist selected them.
pub fn encode_offer_payload<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        let item = item.as_ref();
        out.extend_from_slice(&(item.len() as u32).to_le_bytes());
        out.extend_from_slice(item);
    }
    out
}

pub fn decode_offer_payload(buf: &[u8]) -> Result<Vec<Vec<u8>>, WireError> {
    let mut items = Vec::new();
    let mut cursor = buf;
    while !cursor.is_empty() {
        if cursor.len() < 4 {
            return Err(WireError::Truncated);
        }
        let len = u32::from_le_bytes(cursor[..4].try_into().expect("length checked")) as usize;
        cursor = &cursor[4..];
        if cursor.len() < len {
            return Err(WireError::Truncated);
        }
        items.push(cursor[..len].to_vec());
        cursor = &cursor[len..];
    }
    Ok(items)
}
