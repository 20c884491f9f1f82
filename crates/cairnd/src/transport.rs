//! Plain-UDP discovery transport.
//!
//! This is the in-repo implementation of the consumed discovery
//! substrate: request/response frames with a random nonce for
//! demultiplexing, the sender's record attached so handlers know who is
//! asking. Session keys and handshakes belong to the substrate layer
//! below and are deliberately absent here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::enr::Enr;
use cairn_core::wire::ProtocolId;
use cairn_overlay::{Transport, TransportError};
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

/// Frame discriminators, chosen to never collide with the first byte of
/// a version-1 transfer packet.
pub const FRAME_REQUEST: u8 = 0xdc;
pub const FRAME_RESPONSE: u8 = 0xdd;

pub const NONCE_LEN: usize = 12;

/// How long a request waits for its response frame. Lookup logic applies
/// its own tighter per-probe deadline on top.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One discovery frame on the wire:
/// `kind ‖ nonce(12) ‖ protocol(2) ‖ enr_len(u16 le) ‖ enr ‖ payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub nonce: [u8; NONCE_LEN],
    pub protocol: [u8; 2],
    pub enr: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_LEN + 2 + 2 + self.enr.len() + self.payload.len());
        out.push(self.kind);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.protocol);
        out.extend_from_slice(&(self.enr.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.enr);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Frame> {
        if buf.len() < 1 + NONCE_LEN + 2 + 2 {
            return None;
        }
        let kind = buf[0];
        if kind != FRAME_REQUEST && kind != FRAME_RESPONSE {
            return None;
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[1..1 + NONCE_LEN]);
        let protocol = [buf[13], buf[14]];
        let enr_len = u16::from_le_bytes([buf[15], buf[16]]) as usize;
        let rest = &buf[17..];
        if rest.len() < enr_len {
            return None;
        }
        Some(Frame {
            kind,
            nonce,
            protocol,
            enr: rest[..enr_len].to_vec(),
            payload: rest[enr_len..].to_vec(),
        })
    }
}

/// An inbound request frame, decoded and sender-validated, on its way to
/// the dispatcher.
pub struct InboundRequest {
    pub from: SocketAddr,
    pub nonce: [u8; NONCE_LEN],
    pub protocol: [u8; 2],
    pub enr: Enr,
    pub payload: Vec<u8>,
}

/// The discovery substrate over the daemon's shared UDP socket.
#[derive(Clone)]
pub struct UdpTransport {
    local_enr: Enr,
    out_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    pending: Arc<DashMap<[u8; NONCE_LEN], oneshot::Sender<Vec<u8>>>>,
    request_tx: mpsc::UnboundedSender<InboundRequest>,
}

impl UdpTransport {
    pub fn new(
        local_enr: Enr,
        out_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    ) -> (UdpTransport, mpsc::UnboundedReceiver<InboundRequest>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        (
            UdpTransport {
                local_enr,
                out_tx,
                pending: Arc::new(DashMap::new()),
                request_tx,
            },
            request_rx,
        )
    }

    /// Route one inbound discovery frame from the socket reader.
    pub fn handle_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let Some(frame) = Frame::decode(buf) else {
            tracing::trace!(%from, "dropping malformed discovery frame");
            return;
        };
        match frame.kind {
            FRAME_RESPONSE => {
                // Late responses for expired requests find no waiter and
                // are discarded here.
                if let Some((_, waiter)) = self.pending.remove(&frame.nonce) {
                    let _ = waiter.send(frame.payload);
                }
            }
            FRAME_REQUEST => {
                let enr = match Enr::decode(&frame.enr) {
                    Ok(enr) => enr,
                    Err(error) => {
                        tracing::trace!(%from, %error, "request with invalid sender record");
                        return;
                    }
                };
                let _ = self.request_tx.send(InboundRequest {
                    from,
                    nonce: frame.nonce,
                    protocol: frame.protocol,
                    enr,
                    payload: frame.payload,
                });
            }
            _ => unreachable!("Frame::decode only admits known kinds"),
        }
    }

    /// Send the response to a handled request, echoing its nonce.
    pub async fn respond(&self, to: SocketAddr, nonce: [u8; NONCE_LEN], payload: Vec<u8>) {
        let frame = Frame {
            kind: FRAME_RESPONSE,
            nonce,
            protocol: [0, 0],
            enr: Vec::new(),
            payload,
        };
        let _ = self.out_tx.send((to, frame.encode())).await;
    }
}

impl Transport for UdpTransport {
    fn local_enr(&self) -> Enr {
        self.local_enr.clone()
    }

    fn send_request(
        &self,
        dest: Enr,
        protocol: ProtocolId,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, Result<Vec<u8>, TransportError>> {
        let this = self.clone();
        Box::pin(async move {
            let addr = dest
                .udp4_socket()
                .map(SocketAddr::V4)
                .ok_or(TransportError::NoRoute)?;
            let nonce: [u8; NONCE_LEN] = rand::random();
            let (tx, rx) = oneshot::channel();
            this.pending.insert(nonce, tx);

            let frame = Frame {
                kind: FRAME_REQUEST,
                nonce,
                protocol: protocol.tag(),
                enr: this.local_enr.encoded().to_vec(),
                payload,
            };
            if this.out_tx.send((addr, frame.encode())).await.is_err() {
                this.pending.remove(&nonce);
                return Err(TransportError::Io("send queue closed".to_string()));
            }

            match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => {
                    this.pending.remove(&nonce);
                    Err(TransportError::Io("transport dropped".to_string()))
                }
                Err(_) => {
                    // Deadline expiry resolves the awaiter; any response
                    // arriving later finds no pending entry.
                    this.pending.remove(&nonce);
                    Err(TransportError::Timeout)
                }
            }
        })
    }
}
