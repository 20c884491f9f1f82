//! Transfer session registry and the `TransferChannel` implementation.
//!
//! Sessions live in an arena keyed by the u16 connection id expected on
//! inbound packets, with a generation counter so a timer tick scheduled
//! against a dead session can never touch its replacement. All datagrams
//! leave through the daemon's shared send queue; inbound transfer
//! packets arrive here from the socket reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cairn_overlay::{TransferChannel, TransferError};
use cairn_core::enr::Enr;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use super::connection::{chunk_payload, Connection, Role};
use super::packet::Packet;

/// Timer resolution for retransmission and stall checks.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

struct Slot {
    generation: u64,
    conn: Connection,
}

#[derive(Default)]
struct Arena {
    slots: HashMap<u16, Slot>,
    next_generation: u64,
}

/// The transfer endpoint shared by all overlays on one node.
#[derive(Clone)]
pub struct UtpSocket {
    out_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    arena: Arc<Mutex<Arena>>,
    epoch: Instant,
}

impl UtpSocket {
    /// Create the endpoint and start its timer task. Outgoing datagrams
    /// go to the daemon's serialized send queue.
    pub fn new(out_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>) -> UtpSocket {
        let socket = UtpSocket {
            out_tx,
            arena: Arc::new(Mutex::new(Arena::default())),
            epoch: Instant::now(),
        };
        socket.spawn_ticker();
        socket
    }

    fn now_micros(&self) -> u32 {
        (self.epoch.elapsed().as_micros() & 0xffff_ffff) as u32
    }

    fn spawn_ticker(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                this.tick().await;
            }
        });
    }

    async fn tick(&self) {
        let now = Instant::now();
        let now_micros = self.now_micros();
        // Snapshot (id, generation) pairs first: a session that closes
        // and whose id is reused between the snapshot and the re-entry
        // must not receive the stale tick.
        let scheduled: Vec<(u16, u64)> = {
            let arena = self.arena.lock().expect("utp arena lock poisoned");
            arena
                .slots
                .iter()
                .map(|(id, slot)| (*id, slot.generation))
                .collect()
        };
        let mut outgoing: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        for (id, generation) in scheduled {
            let mut arena = self.arena.lock().expect("utp arena lock poisoned");
            let Some(slot) = arena.slots.get_mut(&id) else {
                continue;
            };
            if slot.generation != generation {
                continue;
            }
            for pkt in slot.conn.on_tick(now, now_micros) {
                outgoing.push((slot.conn.peer, pkt.encode()));
            }
            if slot.conn.is_closed() {
                arena.slots.remove(&id);
            }
        }
        for (addr, bytes) in outgoing {
            let _ = self.out_tx.send((addr, bytes)).await;
        }
    }

    /// Route one inbound transfer datagram, already recognized as such
    /// by the socket reader.
    pub async fn handle_packet(&self, from: SocketAddr, buf: &[u8]) {
        let Some(packet) = Packet::decode(buf) else {
            tracing::trace!(%from, "dropping malformed transfer packet");
            return;
        };
        let now = Instant::now();
        let now_micros = self.now_micros();
        let mut outgoing: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        {
            let mut arena = self.arena.lock().expect("utp arena lock poisoned");
            let Some(slot) = arena.slots.get_mut(&packet.connection_id) else {
                tracing::trace!(
                    conn_id = packet.connection_id,
                    "transfer packet for unknown session"
                );
                return;
            };
            // Sessions are bound to the peer address they were created
            // for; a different source is someone else's traffic.
            if slot.conn.peer.ip() != from.ip() {
                return;
            }
            slot.conn.peer = from;
            for pkt in slot.conn.on_packet(&packet, now, now_micros) {
                outgoing.push((slot.conn.peer, pkt.encode()));
            }
            if slot.conn.is_closed() {
                arena.slots.remove(&packet.connection_id);
            }
        }
        for (addr, bytes) in outgoing {
            let _ = self.out_tx.send((addr, bytes)).await;
        }
    }

    /// Register a session under its inbound id. A live session under the
    /// same id is a collision and rejects the registration.
    fn register(&self, conn: Connection) -> Result<(), TransferError> {
        let mut arena = self.arena.lock().expect("utp arena lock poisoned");
        let id = conn.inbound_id;
        if let Some(existing) = arena.slots.get(&id) {
            if !existing.conn.is_closed() {
                return Err(TransferError::Io(format!(
                    "connection id {id} already in use"
                )));
            }
            tracing::trace!(conn_id = id, "reusing connection id of a closed session");
        }
        arena.next_generation += 1;
        let generation = arena.next_generation;
        arena.slots.insert(id, Slot { generation, conn });
        Ok(())
    }

    async fn start_initiator(
        &self,
        peer: SocketAddr,
        conn_id: u16,
        role: Role,
    ) -> Result<(), TransferError> {
        let now = Instant::now();
        let now_micros = self.now_micros();
        let mut conn = Connection::initiator(peer, conn_id, role, now);
        let packets: Vec<Vec<u8>> = conn
            .start(now, now_micros)
            .into_iter()
            .map(|p| p.encode())
            .collect();
        self.register(conn)?;
        for bytes in packets {
            self.out_tx
                .send((peer, bytes))
                .await
                .map_err(|_| TransferError::Io("send queue closed".to_string()))?;
        }
        Ok(())
    }

    fn resolve(dest: &Enr) -> Result<SocketAddr, TransferError> {
        dest.udp4_socket()
            .map(SocketAddr::V4)
            .ok_or_else(|| TransferError::Io("peer advertises no udp4 endpoint".to_string()))
    }
}

impl TransferChannel for UtpSocket {
    fn initiate_receive(
        &self,
        dest: Enr,
        conn_id: u16,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>> {
        let this = self.clone();
        Box::pin(async move {
            let peer = Self::resolve(&dest)?;
            let (tx, rx) = oneshot::channel();
            this.start_initiator(peer, conn_id, Role::Receiver { done: Some(tx) })
                .await?;
            rx.await.map_err(|_| TransferError::Timeout)?
        })
    }

    fn await_send(
        &self,
        dest: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        let this = self.clone();
        Box::pin(async move {
            let peer = Self::resolve(&dest)?;
            let (tx, rx) = oneshot::channel();
            let conn = Connection::responder(
                peer,
                conn_id,
                Role::Sender {
                    pending: chunk_payload(&payload),
                    done: Some(tx),
                },
                Instant::now(),
            );
            this.register(conn)?;
            rx.await.map_err(|_| TransferError::Timeout)?
        })
    }

    fn initiate_send(
        &self,
        dest: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), TransferError>> {
        let this = self.clone();
        Box::pin(async move {
            let peer = Self::resolve(&dest)?;
            let (tx, rx) = oneshot::channel();
            this.start_initiator(
                peer,
                conn_id,
                Role::Sender {
                    pending: chunk_payload(&payload),
                    done: Some(tx),
                },
            )
            .await?;
            rx.await.map_err(|_| TransferError::Timeout)?
        })
    }

    fn await_receive(
        &self,
        dest: Enr,
        conn_id: u16,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransferError>> {
        let this = self.clone();
        Box::pin(async move {
            let peer = Self::resolve(&dest)?;
            let (tx, rx) = oneshot::channel();
            let conn = Connection::responder(
                peer,
                conn_id,
                Role::Receiver { done: Some(tx) },
                Instant::now(),
            );
            this.register(conn)?;
            rx.await.map_err(|_| TransferError::Timeout)?
        })
    }
}
