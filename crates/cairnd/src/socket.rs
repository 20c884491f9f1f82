//! Shared-socket plumbing: one reader, one writer.
//!
//! The UDP socket is owned by exactly two tasks. The reader demultiplexes
//! every inbound datagram — transfer packets by their connection id,
//! discovery frames by their request nonce — and the writer drains the
//! serialized send queue that every other component feeds.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::transport::{UdpTransport, FRAME_REQUEST, FRAME_RESPONSE};
use crate::utp::packet::looks_like_utp;
use crate::utp::UtpSocket;

/// Largest datagram either protocol produces.
const RECV_BUF: usize = 2048;

pub fn spawn_writer(
    socket: Arc<UdpSocket>,
    mut out_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("socket writer shutting down");
                    return;
                }
                queued = out_rx.recv() => {
                    let Some((addr, bytes)) = queued else {
                        tracing::info!("send queue closed, writer exiting");
                        return;
                    };
                    if let Err(error) = socket.send_to(&bytes, addr).await {
                        tracing::debug!(%addr, %error, "send failed");
                    }
                }
            }
        }
    })
}

pub fn spawn_reader(
    socket: Arc<UdpSocket>,
    transport: UdpTransport,
    utp: UtpSocket,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("socket reader shutting down");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(ok) => ok,
                        Err(error) => {
                            tracing::debug!(%error, "recv failed");
                            continue;
                        }
                    };
                    let datagram = &buf[..len];
                    match datagram.first() {
                        Some(&FRAME_REQUEST) | Some(&FRAME_RESPONSE) => {
                            transport.handle_datagram(from, datagram);
                        }
                        Some(_) if looks_like_utp(datagram) => {
                            utp.handle_packet(from, datagram).await;
                        }
                        _ => {
                            tracing::trace!(%from, len, "unrecognized datagram");
                        }
                    }
                }
            }
        }
    })
}
