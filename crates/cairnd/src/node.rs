//! Node assembly: identity, socket, overlays, maintenance loops.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k256::ecdsa::SigningKey;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use cairn_core::accumulator::MasterAccumulator;
use cairn_core::config::{CairnConfig, ConfigError, TransportKind};
use cairn_core::enr::{Enr, EnrBuilder};
use cairn_core::wire::ProtocolId;
use cairn_overlay::history::HistoryNetwork;
use cairn_overlay::state::StateNetwork;
use cairn_overlay::store::BatchOp;
use cairn_overlay::{
    EventBus, MemoryBackend, OverlayConfig, OverlayProtocol, RadiusStore, SqliteBackend,
    StorageBackend, SubProtocol,
};

use crate::dispatch::Dispatcher;
use crate::socket::{spawn_reader, spawn_writer};
use crate::transport::UdpTransport;
use crate::utp::UtpSocket;

/// Liveness maintenance cadence.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(15);

/// Bucket refresh + peer snapshot cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Depth of the serialized send queue.
const SEND_QUEUE: usize = 1024;

pub struct CairnNode {
    local_enr: Enr,
    overlays: HashMap<ProtocolId, Arc<OverlayProtocol>>,
    events: Arc<EventBus>,
    shutdown: broadcast::Sender<()>,
}

impl CairnNode {
    /// Bring a node up from configuration. Configuration errors are
    /// fatal here and nowhere else.
    pub async fn start(config: CairnConfig) -> Result<CairnNode> {
        match config.transport_kind()? {
            TransportKind::Node => {}
            other => return Err(ConfigError::UnsupportedTransport(other).into()),
        }
        let bind_addr = config.bind_addr()?;
        let radius = config.radius()?;
        let protocols = config.subprotocols()?;
        let bootnodes = config.bootnodes()?;

        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .with_context(|| format!("failed to bind {bind_addr}"))?,
        );
        let local_addr = socket.local_addr().context("socket has no local addr")?;

        let key = load_or_create_key(&config.identity.key_path)?;
        let local_enr = build_local_enr(&key, bind_addr, local_addr)?;
        tracing::info!(
            node_id = %hex::encode(local_enr.node_id()),
            %local_addr,
            "identity ready"
        );

        let (shutdown, _) = broadcast::channel(1);
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
        let (transport, request_rx) = UdpTransport::new(local_enr.clone(), out_tx.clone());
        let utp = UtpSocket::new(out_tx.clone());
        let events = Arc::new(EventBus::new());

        let transport = Arc::new(transport);
        let mut dispatcher = Dispatcher::new((*transport).clone());
        let mut overlays = HashMap::new();

        let master = Arc::new(MasterAccumulator::default());
        for protocol in protocols {
            let subprotocol: Arc<dyn SubProtocol> = match protocol {
                ProtocolId::History => Arc::new(HistoryNetwork::new(Arc::clone(&master))),
                ProtocolId::State => Arc::new(StateNetwork::new()),
                other => bail!(
                    "sub-protocol {} is configured but not supported by this build",
                    other.name()
                ),
            };
            let backend = open_backend(&config, protocol)?;
            let store = RadiusStore::open(
                local_enr.node_id(),
                radius,
                config.storage.max_bytes,
                backend,
            )?;
            let overlay = OverlayProtocol::new(
                subprotocol,
                transport.clone(),
                Arc::new(utp.clone()),
                store,
                Arc::clone(&events),
                OverlayConfig::default(),
            );
            dispatcher.register(Arc::clone(&overlay));
            overlays.insert(protocol, overlay);
        }

        spawn_event_logger(&events, shutdown.subscribe());
        let _writer = spawn_writer(Arc::clone(&socket), out_rx, shutdown.subscribe());
        let _reader = spawn_reader(
            Arc::clone(&socket),
            (*transport).clone(),
            utp.clone(),
            shutdown.subscribe(),
        );
        let _dispatcher = dispatcher.run(request_rx, shutdown.subscribe());

        for overlay in overlays.values() {
            let peer_cache = open_peer_cache(&config, overlay.protocol_id())?;
            if config.storage.rebuild_from_memory {
                if let Some(cache) = &peer_cache {
                    rebuild_table(overlay, cache.as_ref()).await;
                }
            }
            spawn_maintenance(Arc::clone(overlay), peer_cache, shutdown.subscribe());
            seed_bootnodes(overlay, &bootnodes);
        }

        Ok(CairnNode {
            local_enr,
            overlays,
            events,
            shutdown,
        })
    }

    pub fn local_enr(&self) -> &Enr {
        &self.local_enr
    }

    pub fn overlay(&self, protocol: ProtocolId) -> Option<&Arc<OverlayProtocol>> {
        self.overlays.get(&protocol)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

fn load_or_create_key(path: &Path) -> Result<SigningKey> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key: {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("key file is not hex")?;
        return SigningKey::from_slice(&bytes).context("key file holds no valid key");
    }
    let key = SigningKey::random(&mut rand::rngs::OsRng);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, hex::encode(key.to_bytes()))
        .with_context(|| format!("failed to write key: {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new identity key");
    Ok(key)
}

fn build_local_enr(key: &SigningKey, bind_addr: SocketAddr, local_addr: SocketAddr) -> Result<Enr> {
    let ip = match bind_addr.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => ip,
        // Advertising the wildcard helps no one; default to loopback
        // until an external address is configured.
        _ => Ipv4Addr::LOCALHOST,
    };
    EnrBuilder::new()
        .ip4(ip)
        .udp4(local_addr.port())
        .build(key)
        .context("failed to sign local record")
}

fn open_backend(config: &CairnConfig, protocol: ProtocolId) -> Result<Box<dyn StorageBackend>> {
    if config.storage.path.as_os_str().is_empty() {
        return Ok(Box::new(MemoryBackend::new()));
    }
    std::fs::create_dir_all(&config.storage.path).with_context(|| {
        format!("failed to create {}", config.storage.path.display())
    })?;
    let db = config
        .storage
        .path
        .join(format!("{}.db", protocol.name()));
    Ok(Box::new(SqliteBackend::open(&db)?))
}

fn open_peer_cache(
    config: &CairnConfig,
    protocol: ProtocolId,
) -> Result<Option<Arc<dyn StorageBackend>>> {
    if config.storage.path.as_os_str().is_empty() {
        return Ok(None);
    }
    let db = config
        .storage
        .path
        .join(format!("{}-peers.db", protocol.name()));
    Ok(Some(Arc::new(SqliteBackend::open(&db)?)))
}

/// Reload routing-table state persisted by an earlier run.
async fn rebuild_table(overlay: &Arc<OverlayProtocol>, cache: &dyn StorageBackend) {
    let mut records = Vec::new();
    let result = cache.for_each(&mut |_key, value| {
        if let Ok(enr) = Enr::decode(value) {
            records.push(enr);
        }
    });
    if let Err(error) = result {
        tracing::warn!(%error, "failed to read peer cache");
        return;
    }
    let count = records.len();
    for enr in records {
        overlay.admit_peer(enr).await;
    }
    tracing::info!(
        protocol = overlay.protocol_id().name(),
        peers = count,
        "routing table rebuilt from persistence"
    );
}

fn seed_bootnodes(overlay: &Arc<OverlayProtocol>, bootnodes: &[Enr]) {
    if bootnodes.is_empty() {
        return;
    }
    let overlay = Arc::clone(overlay);
    let bootnodes = bootnodes.to_vec();
    tokio::spawn(async move {
        for enr in bootnodes {
            if let Err(error) = overlay.ping(&enr).await {
                tracing::debug!(
                    node_id = %hex::encode(enr.node_id()),
                    %error,
                    "bootnode unreachable"
                );
            }
        }
        // Walk toward our own id to fill nearby buckets.
        let local = overlay.local_id();
        let found = overlay.lookup_nodes(local).await;
        tracing::info!(
            protocol = overlay.protocol_id().name(),
            peers = found.len(),
            "table warm-up complete"
        );
    });
}

fn spawn_maintenance(
    overlay: Arc<OverlayProtocol>,
    peer_cache: Option<Arc<dyn StorageBackend>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(
                        protocol = overlay.protocol_id().name(),
                        "maintenance loop shutting down"
                    );
                    return;
                }
                _ = liveness.tick() => {
                    for enr in overlay.probe_candidates().await {
                        overlay.probe(enr).await;
                    }
                    if let Some(stale) = overlay.least_recently_seen().await {
                        overlay.probe(stale).await;
                    }
                }
                _ = refresh.tick() => {
                    let target: [u8; 32] = rand::random();
                    overlay.lookup_nodes(target).await;
                    if let Some(cache) = &peer_cache {
                        snapshot_peers(&overlay, cache.as_ref()).await;
                    }
                }
            }
        }
    });
}

/// Mirror overlay observations into the log at debug level.
fn spawn_event_logger(events: &Arc<EventBus>, mut shutdown: broadcast::Receiver<()>) {
    let (subscription, mut rx) = events.subscribe();
    let events = Arc::clone(events);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    events.unsubscribe(subscription);
                    return;
                }
                event = rx.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        cairn_overlay::OverlayEvent::NodeAdded { node_id, protocol } => {
                            tracing::debug!(protocol = protocol.name(), node_id = %hex::encode(node_id), "node added");
                        }
                        cairn_overlay::OverlayEvent::NodeRemoved { node_id, protocol } => {
                            tracing::debug!(protocol = protocol.name(), node_id = %hex::encode(node_id), "node removed");
                        }
                        cairn_overlay::OverlayEvent::ContentAdded { protocol, key, value } => {
                            tracing::debug!(protocol = protocol.name(), key = %hex::encode(&key), bytes = value.len(), "content added");
                        }
                        cairn_overlay::OverlayEvent::Verified { content_id, ok } => {
                            tracing::trace!(content_id = %hex::encode(content_id), ok, "verification");
                        }
                    }
                }
            }
        }
    });
}

async fn snapshot_peers(overlay: &Arc<OverlayProtocol>, cache: &dyn StorageBackend) {
    let peers = overlay.snapshot_peers().await;
    let ops: Vec<BatchOp> = peers
        .iter()
        .map(|enr| BatchOp::Put(hex::encode(enr.node_id()), enr.encoded().to_vec()))
        .collect();
    if let Err(error) = cache.batch(ops) {
        tracing::debug!(%error, "peer snapshot failed");
    }
}
