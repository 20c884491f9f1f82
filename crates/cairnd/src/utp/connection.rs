//! Transfer connection state machine.
//!
//! One `Connection` is one direction of payload movement: a sender
//! streams chunks and retires them as ACKs arrive; a receiver reassembles
//! in order and delivers the complete payload atomically. The machine is
//! purely event-driven — `on_packet` and `on_tick` return the datagrams
//! to transmit — so the socket layer owns all I/O and time.
//!
//! Sequence rules: ST_SYN consumes sequence 1 of the initiator, and the
//! accepting ST_STATE consumes sequence 1 of the responder, so data
//! always starts at sequence 2 on either side. Outgoing packets are
//! stamped with the sender's receive id; the accepting side therefore
//! expects `recv-id + 1` inbound while the initiator expects its chosen
//! id plus one.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use cairn_overlay::TransferError;
use tokio::sync::oneshot;

use super::packet::{Packet, PacketType, MAX_CHUNK};

/// Advertised receive window.
pub const RECV_WINDOW: u32 = 1024 * 1024;

/// LEDBAT delay target, microseconds.
const TARGET_DELAY_MICROS: f64 = 100_000.0;

/// LEDBAT gain.
const GAIN: f64 = 1.0;

/// Congestion window floor and ceiling, bytes.
const MIN_CWND: f64 = (2 * MAX_CHUNK) as f64;
const MAX_CWND: f64 = (1024 * 1024) as f64;

/// Retransmission timer bounds.
const MIN_RTO: Duration = Duration::from_millis(500);
const MAX_RTO: Duration = Duration::from_secs(3);

/// Duplicate ACKs that trigger fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// A session quiet for longer than this is reset.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// a <= b in wrapping sequence space.
fn seq_le(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 0x8000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Initiator: SYN sent, awaiting the accepting STATE.
    SynSent,
    /// Responder: registered, awaiting the SYN.
    Listening,
    Connected,
    /// Sender: FIN emitted, awaiting its ACK.
    FinSent,
    Closed,
}

/// What this end does with payload data.
pub(crate) enum Role {
    Sender {
        pending: VecDeque<Vec<u8>>,
        done: Option<oneshot::Sender<Result<(), TransferError>>>,
    },
    Receiver {
        done: Option<oneshot::Sender<Result<Vec<u8>, TransferError>>>,
    },
}

struct OutPacket {
    seq: u16,
    packet_type: PacketType,
    payload: Vec<u8>,
    last_sent: Instant,
    rto_at: Instant,
    retransmitted: bool,
}

pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    /// Our receive id: stamped on every outgoing packet.
    send_conn_id: u16,
    /// Connection id expected on inbound packets.
    pub(crate) inbound_id: u16,
    state: ConnState,
    role: Role,

    seq_nr: u16,
    ack_nr: u16,

    // Sender bookkeeping.
    window: VecDeque<OutPacket>,
    cwnd: f64,
    peer_window: u32,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    duplicate_acks: u32,
    last_ack: u16,

    // LEDBAT delay tracking.
    base_delay_micros: Option<u32>,
    reply_delay_micros: u32,

    // Receiver reassembly.
    out_of_order: HashMap<u16, Vec<u8>>,
    received: Vec<u8>,
    fin_seq: Option<u16>,

    pub(crate) last_activity: Instant,
}

impl Connection {
    fn new(
        peer: SocketAddr,
        send_conn_id: u16,
        inbound_id: u16,
        state: ConnState,
        role: Role,
        now: Instant,
    ) -> Connection {
        Connection {
            peer,
            send_conn_id,
            inbound_id,
            state,
            role,
            seq_nr: 1,
            ack_nr: 0,
            window: VecDeque::new(),
            cwnd: MIN_CWND,
            peer_window: RECV_WINDOW,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: Duration::from_secs(1),
            duplicate_acks: 0,
            last_ack: 0,
            base_delay_micros: None,
            reply_delay_micros: 0,
            out_of_order: HashMap::new(),
            received: Vec::new(),
            fin_seq: None,
            last_activity: now,
        }
    }

    /// Initiating side: chooses `conn_id` as its receive id and expects
    /// `conn_id + 1` inbound.
    pub(crate) fn initiator(peer: SocketAddr, conn_id: u16, role: Role, now: Instant) -> Connection {
        Connection::new(
            peer,
            conn_id,
            conn_id.wrapping_add(1),
            ConnState::SynSent,
            role,
            now,
        )
    }

    /// Accepting side: expects the SYN stamped `conn_id` and stamps its
    /// own packets `conn_id + 1`.
    pub(crate) fn responder(peer: SocketAddr, conn_id: u16, role: Role, now: Instant) -> Connection {
        Connection::new(
            peer,
            conn_id.wrapping_add(1),
            conn_id,
            ConnState::Listening,
            role,
            now,
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Initial packets to transmit right after registration.
    pub(crate) fn start(&mut self, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state != ConnState::SynSent {
            return Vec::new();
        }
        let syn = self.track(PacketType::Syn, Vec::new(), now, now_micros);
        vec![syn]
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub(crate) fn on_packet(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state == ConnState::Closed {
            return Vec::new();
        }
        self.last_activity = now;
        self.peer_window = pkt.window_size;
        // Echoed back as timestamp-diff so the peer can track one-way delay.
        self.reply_delay_micros = now_micros.wrapping_sub(pkt.timestamp_micros);

        match pkt.packet_type {
            PacketType::Reset => {
                self.fail(TransferError::Reset);
                Vec::new()
            }
            PacketType::Syn => self.on_syn(pkt, now, now_micros),
            PacketType::State => self.on_state(pkt, now, now_micros),
            PacketType::Data => self.on_data(pkt, now, now_micros),
            PacketType::Fin => self.on_fin(pkt, now, now_micros),
        }
    }

    fn on_syn(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state != ConnState::Listening {
            // Duplicate SYN: re-ack the handshake.
            return vec![self.state_packet(now_micros)];
        }
        self.state = ConnState::Connected;
        self.ack_nr = pkt.seq_nr;
        // The accepting STATE consumes our sequence 1.
        let accept = self.track(PacketType::State, Vec::new(), now, now_micros);
        let mut out = vec![accept];
        out.extend(self.pump(now, now_micros));
        out
    }

    fn on_state(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state == ConnState::SynSent {
            self.state = ConnState::Connected;
            self.ack_nr = pkt.seq_nr;
        }
        let mut out = self.process_ack(pkt, now, now_micros);
        out.extend(self.pump(now, now_micros));
        self.check_send_complete();
        out
    }

    fn on_data(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state == ConnState::Listening || self.state == ConnState::SynSent {
            // Data before a completed handshake is dropped.
            return Vec::new();
        }
        if !matches!(self.role, Role::Receiver { .. }) {
            return self.process_ack(pkt, now, now_micros);
        }
        let mut out = self.process_ack(pkt, now, now_micros);

        let next = self.ack_nr.wrapping_add(1);
        if pkt.seq_nr == next {
            self.received.extend_from_slice(&pkt.payload);
            self.ack_nr = next;
            self.drain_reassembly();
        } else if !seq_le(pkt.seq_nr, self.ack_nr) {
            // Out of order: hold until the gap fills.
            self.out_of_order
                .entry(pkt.seq_nr)
                .or_insert_with(|| pkt.payload.clone());
        }
        // Duplicates fall through to a plain re-ack.

        if self.try_finish_receive() {
            out.push(self.state_packet(now_micros));
            self.state = ConnState::Closed;
            return out;
        }
        out.push(self.state_packet(now_micros));
        out
    }

    fn on_fin(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if !matches!(self.role, Role::Receiver { .. }) {
            return self.process_ack(pkt, now, now_micros);
        }
        let mut out = self.process_ack(pkt, now, now_micros);
        self.fin_seq = Some(pkt.seq_nr);
        self.drain_reassembly();
        if self.try_finish_receive() {
            out.push(self.state_packet(now_micros));
            self.state = ConnState::Closed;
            return out;
        }
        // Gaps remain: the duplicate ACK asks for retransmission.
        out.push(self.state_packet(now_micros));
        out
    }

    /// Move contiguous held chunks into the assembled payload.
    fn drain_reassembly(&mut self) {
        loop {
            let next = self.ack_nr.wrapping_add(1);
            match self.out_of_order.remove(&next) {
                Some(chunk) => {
                    self.received.extend_from_slice(&chunk);
                    self.ack_nr = next;
                }
                None => break,
            }
        }
    }

    /// The receive side is done when the FIN sequence is the next
    /// in-order slot: everything before it has been assembled.
    fn try_finish_receive(&mut self) -> bool {
        let Some(fin) = self.fin_seq else {
            return false;
        };
        if fin != self.ack_nr.wrapping_add(1) {
            return false;
        }
        self.ack_nr = fin;
        if let Role::Receiver { done } = &mut self.role {
            if let Some(done) = done.take() {
                let payload = std::mem::take(&mut self.received);
                let _ = done.send(Ok(payload));
            }
            return true;
        }
        false
    }

    // ── ACK processing & congestion control ──────────────────────────────────

    fn process_ack(&mut self, pkt: &Packet, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.window.is_empty() {
            return Vec::new();
        }
        let ack = pkt.ack_nr;
        let mut bytes_acked = 0usize;
        while let Some(front) = self.window.front() {
            if !seq_le(front.seq, ack) {
                break;
            }
            let retired = self.window.pop_front().expect("front exists");
            bytes_acked += retired.payload.len().max(1);
            if !retired.retransmitted {
                self.rtt_sample(now.duration_since(retired.last_sent));
            }
        }

        if bytes_acked > 0 {
            self.duplicate_acks = 0;
            self.last_ack = ack;
            self.ledbat_update(pkt.timestamp_diff_micros, bytes_acked);
            return Vec::new();
        }

        // Nothing retired: a duplicate of the last cumulative ACK.
        if ack == self.last_ack {
            self.duplicate_acks += 1;
            if self.duplicate_acks == DUP_ACK_THRESHOLD {
                self.duplicate_acks = 0;
                self.cwnd = (self.cwnd / 2.0).max(MIN_CWND);
                let window_size = self.recv_window();
                let rto = self.rto;
                if let Some(front) = self.window.front_mut() {
                    front.retransmitted = true;
                    front.last_sent = now;
                    front.rto_at = now + rto;
                    let resend = Packet {
                        packet_type: front.packet_type,
                        connection_id: self.send_conn_id,
                        timestamp_micros: now_micros,
                        timestamp_diff_micros: self.reply_delay_micros,
                        window_size,
                        seq_nr: front.seq,
                        ack_nr: self.ack_nr,
                        payload: front.payload.clone(),
                    };
                    return vec![resend];
                }
            }
        }
        Vec::new()
    }

    fn rtt_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let computed = self.srtt.expect("just set") + 4 * self.rttvar;
        self.rto = computed.clamp(MIN_RTO, MAX_RTO);
    }

    fn ledbat_update(&mut self, timestamp_diff: u32, bytes_acked: usize) {
        let base = match self.base_delay_micros {
            Some(base) => base.min(timestamp_diff),
            None => timestamp_diff,
        };
        self.base_delay_micros = Some(base);
        let queuing_delay = f64::from(timestamp_diff.wrapping_sub(base));
        let off_target = (TARGET_DELAY_MICROS - queuing_delay) / TARGET_DELAY_MICROS;
        let growth = GAIN * off_target * bytes_acked as f64 * MAX_CHUNK as f64 / self.cwnd;
        self.cwnd = (self.cwnd + growth).clamp(MIN_CWND, MAX_CWND);
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Fill the flight window from pending chunks; append the FIN once
    /// everything has been queued.
    fn pump(&mut self, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state != ConnState::Connected {
            return Vec::new();
        }
        let budget = (self.cwnd.min(self.peer_window as f64)) as usize;
        let mut in_flight: usize = self.window.iter().map(|p| p.payload.len()).sum();
        let mut chunks = Vec::new();
        let exhausted = {
            let Role::Sender { pending, .. } = &mut self.role else {
                return Vec::new();
            };
            while in_flight < budget {
                let Some(chunk) = pending.pop_front() else {
                    break;
                };
                in_flight += chunk.len();
                chunks.push(chunk);
            }
            pending.is_empty()
        };
        let mut out = Vec::new();
        for chunk in chunks {
            out.push(self.track(PacketType::Data, chunk, now, now_micros));
        }
        if exhausted {
            // All payload queued: the FIN takes the next sequence number.
            out.push(self.track(PacketType::Fin, Vec::new(), now, now_micros));
            self.state = ConnState::FinSent;
        }
        out
    }

    /// The sender completes when the FIN (and everything before it) has
    /// been acknowledged.
    fn check_send_complete(&mut self) {
        if self.state != ConnState::FinSent || !self.window.is_empty() {
            return;
        }
        if let Role::Sender { done, .. } = &mut self.role {
            if let Some(done) = done.take() {
                let _ = done.send(Ok(()));
            }
        }
        self.state = ConnState::Closed;
    }

    /// Build, register for retransmission, and return a packet that
    /// consumes a sequence number.
    fn track(
        &mut self,
        packet_type: PacketType,
        payload: Vec<u8>,
        now: Instant,
        now_micros: u32,
    ) -> Packet {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.window.push_back(OutPacket {
            seq,
            packet_type,
            payload: payload.clone(),
            last_sent: now,
            rto_at: now + self.rto,
            retransmitted: false,
        });
        Packet {
            packet_type,
            connection_id: self.send_conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: self.reply_delay_micros,
            window_size: self.recv_window(),
            seq_nr: seq,
            ack_nr: self.ack_nr,
            payload,
        }
    }

    /// Plain acknowledgment; consumes no sequence number.
    fn state_packet(&self, now_micros: u32) -> Packet {
        Packet {
            packet_type: PacketType::State,
            connection_id: self.send_conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: self.reply_delay_micros,
            window_size: self.recv_window(),
            seq_nr: self.seq_nr.wrapping_sub(1),
            ack_nr: self.ack_nr,
            payload: Vec::new(),
        }
    }

    fn recv_window(&self) -> u32 {
        let held: usize = self.out_of_order.values().map(Vec::len).sum();
        RECV_WINDOW.saturating_sub(held as u32)
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub(crate) fn on_tick(&mut self, now: Instant, now_micros: u32) -> Vec<Packet> {
        if self.state == ConnState::Closed {
            return Vec::new();
        }
        if now.duration_since(self.last_activity) > STALL_TIMEOUT {
            let reset = Packet {
                packet_type: PacketType::Reset,
                connection_id: self.send_conn_id,
                timestamp_micros: now_micros,
                timestamp_diff_micros: self.reply_delay_micros,
                window_size: self.recv_window(),
                seq_nr: self.seq_nr,
                ack_nr: self.ack_nr,
                payload: Vec::new(),
            };
            self.fail(TransferError::Stalled);
            return vec![reset];
        }

        // Retransmit the oldest unacked packet past its deadline; the
        // timer doubles (within bounds) on each successive retransmit.
        let window_size = self.recv_window();
        let next_rto = (self.rto * 2).clamp(MIN_RTO, MAX_RTO);
        if let Some(front) = self.window.front_mut() {
            if front.rto_at <= now {
                front.retransmitted = true;
                front.last_sent = now;
                front.rto_at = now + next_rto;
                self.rto = next_rto;
                self.cwnd = MIN_CWND;
                let resend = Packet {
                    packet_type: front.packet_type,
                    connection_id: self.send_conn_id,
                    timestamp_micros: now_micros,
                    timestamp_diff_micros: self.reply_delay_micros,
                    window_size,
                    seq_nr: front.seq,
                    ack_nr: self.ack_nr,
                    payload: front.payload.clone(),
                };
                return vec![resend];
            }
        }
        Vec::new()
    }

    /// Abort: deliver the error and discard the session.
    pub(crate) fn fail(&mut self, error: TransferError) {
        match &mut self.role {
            Role::Sender { done, .. } => {
                if let Some(done) = done.take() {
                    let _ = done.send(Err(error));
                }
            }
            Role::Receiver { done } => {
                if let Some(done) = done.take() {
                    let _ = done.send(Err(error));
                }
            }
        }
        self.state = ConnState::Closed;
    }
}

/// Split a payload into transfer chunks.
pub(crate) fn chunk_payload(payload: &[u8]) -> VecDeque<Vec<u8>> {
    payload.chunks(MAX_CHUNK).map(<[u8]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn now_pair() -> (Instant, u32) {
        (Instant::now(), 0)
    }

    /// Drive two connections against each other until both close or the
    /// exchange stops producing packets.
    fn run_to_completion(a: &mut Connection, b: &mut Connection, now: Instant) {
        let mut queue_ab: VecDeque<Packet> = VecDeque::new();
        let mut queue_ba: VecDeque<Packet> = VecDeque::new();
        queue_ab.extend(a.start(now, 0));
        queue_ba.extend(b.start(now, 0));
        for _ in 0..10_000 {
            if queue_ab.is_empty() && queue_ba.is_empty() {
                break;
            }
            if let Some(pkt) = queue_ab.pop_front() {
                queue_ba.extend(b.on_packet(&pkt, now, 0));
            }
            if let Some(pkt) = queue_ba.pop_front() {
                queue_ab.extend(a.on_packet(&pkt, now, 0));
            }
        }
    }

    #[test]
    fn seq_compare_wraps() {
        assert!(seq_le(1, 2));
        assert!(seq_le(2, 2));
        assert!(!seq_le(3, 2));
        assert!(seq_le(65_535, 2));
        assert!(!seq_le(2, 65_535));
    }

    #[test]
    fn chunking_respects_mtu() {
        let payload = vec![0xaa; MAX_CHUNK * 2 + 17];
        let chunks = chunk_payload(&payload);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_CHUNK);
        assert_eq!(chunks[2].len(), 17);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, payload.len());
    }

    #[test]
    fn small_transfer_completes_in_order() {
        let (now, _) = now_pair();
        let payload = vec![0x42; MAX_CHUNK * 3 + 5];
        let (send_done_tx, mut send_done_rx) = oneshot::channel();
        let (recv_done_tx, mut recv_done_rx) = oneshot::channel();

        let mut sender = Connection::initiator(
            addr(1),
            100,
            Role::Sender {
                pending: chunk_payload(&payload),
                done: Some(send_done_tx),
            },
            now,
        );
        let mut receiver = Connection::responder(
            addr(2),
            100,
            Role::Receiver {
                done: Some(recv_done_tx),
            },
            now,
        );

        run_to_completion(&mut sender, &mut receiver, now);

        assert!(sender.is_closed());
        assert!(receiver.is_closed());
        assert_eq!(send_done_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(recv_done_rx.try_recv().unwrap(), Ok(payload));
    }

    #[test]
    fn empty_payload_transfer_completes() {
        let (now, _) = now_pair();
        let (send_done_tx, mut send_done_rx) = oneshot::channel();
        let (recv_done_tx, mut recv_done_rx) = oneshot::channel();
        let mut sender = Connection::initiator(
            addr(1),
            9,
            Role::Sender {
                pending: chunk_payload(&[]),
                done: Some(send_done_tx),
            },
            now,
        );
        let mut receiver = Connection::responder(
            addr(2),
            9,
            Role::Receiver {
                done: Some(recv_done_tx),
            },
            now,
        );
        run_to_completion(&mut sender, &mut receiver, now);
        assert_eq!(send_done_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(recv_done_rx.try_recv().unwrap(), Ok(vec![]));
    }

    #[test]
    fn connection_id_rule() {
        let (now, _) = now_pair();
        let (tx, _rx) = oneshot::channel();
        let mut initiator = Connection::initiator(
            addr(1),
            500,
            Role::Receiver { done: Some(tx) },
            now,
        );
        let syn = initiator.start(now, 0);
        assert_eq!(syn.len(), 1);
        // SYN carries the chosen recv-id.
        assert_eq!(syn[0].connection_id, 500);
        assert_eq!(syn[0].packet_type, PacketType::Syn);
        assert_eq!(syn[0].seq_nr, 1);
        // The initiator listens for recv-id + 1.
        assert_eq!(initiator.inbound_id, 501);

        let (tx, _rx) = oneshot::channel();
        let mut responder = Connection::responder(
            addr(2),
            500,
            Role::Sender {
                pending: chunk_payload(b"hi"),
                done: Some(tx),
            },
            now,
        );
        assert_eq!(responder.inbound_id, 500);
        let reply = responder.on_packet(&syn[0], now, 0);
        // The accepting STATE is stamped recv-id + 1.
        assert_eq!(reply[0].packet_type, PacketType::State);
        assert_eq!(reply[0].connection_id, 501);
    }

    #[test]
    fn out_of_order_data_is_reassembled() {
        let (now, _) = now_pair();
        let (recv_tx, mut recv_rx) = oneshot::channel();
        let mut receiver = Connection::responder(
            addr(2),
            7,
            Role::Receiver {
                done: Some(recv_tx),
            },
            now,
        );
        // Handshake.
        let syn = Packet {
            packet_type: PacketType::Syn,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 1,
            ack_nr: 0,
            payload: vec![],
        };
        receiver.on_packet(&syn, now, 0);

        let data = |seq: u16, bytes: &[u8]| Packet {
            packet_type: PacketType::Data,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: seq,
            ack_nr: 1,
            payload: bytes.to_vec(),
        };

        // Chunks arrive 3, 2, then FIN at 4.
        let acks = receiver.on_packet(&data(3, b"world"), now, 0);
        assert_eq!(acks.last().unwrap().ack_nr, 1); // still waiting for 2
        let acks = receiver.on_packet(&data(2, b"hello "), now, 0);
        assert_eq!(acks.last().unwrap().ack_nr, 3); // both drained

        let fin = Packet {
            packet_type: PacketType::Fin,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 4,
            ack_nr: 1,
            payload: vec![],
        };
        let acks = receiver.on_packet(&fin, now, 0);
        assert_eq!(acks.last().unwrap().ack_nr, 4);
        assert!(receiver.is_closed());
        assert_eq!(recv_rx.try_recv().unwrap(), Ok(b"hello world".to_vec()));
    }

    #[test]
    fn fin_before_gap_fill_waits_for_retransmission() {
        let (now, _) = now_pair();
        let (recv_tx, mut recv_rx) = oneshot::channel();
        let mut receiver = Connection::responder(
            addr(2),
            7,
            Role::Receiver {
                done: Some(recv_tx),
            },
            now,
        );
        let syn = Packet {
            packet_type: PacketType::Syn,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 1,
            ack_nr: 0,
            payload: vec![],
        };
        receiver.on_packet(&syn, now, 0);

        // Sequence 2 is lost; 3 and the FIN(4) arrive first.
        let data3 = Packet {
            packet_type: PacketType::Data,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 3,
            ack_nr: 1,
            payload: b"-tail".to_vec(),
        };
        let fin = Packet {
            packet_type: PacketType::Fin,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 4,
            ack_nr: 1,
            payload: vec![],
        };
        receiver.on_packet(&data3, now, 0);
        receiver.on_packet(&fin, now, 0);
        assert!(!receiver.is_closed());
        assert!(recv_rx.try_recv().is_err());

        // The missing chunk arrives: payload delivered atomically.
        let data2 = Packet {
            packet_type: PacketType::Data,
            connection_id: 7,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 2,
            ack_nr: 1,
            payload: b"head".to_vec(),
        };
        receiver.on_packet(&data2, now, 0);
        assert!(receiver.is_closed());
        assert_eq!(recv_rx.try_recv().unwrap(), Ok(b"head-tail".to_vec()));
    }

    #[test]
    fn rto_expiry_retransmits_and_backs_off() {
        let now = Instant::now();
        let (tx, _rx) = oneshot::channel();
        let mut sender = Connection::initiator(
            addr(1),
            11,
            Role::Sender {
                pending: chunk_payload(b"payload"),
                done: Some(tx),
            },
            now,
        );
        let syn = sender.start(now, 0);
        assert_eq!(syn.len(), 1);

        // No reply: past the RTO the SYN is retransmitted.
        let later = now + Duration::from_millis(1500);
        let resent = sender.on_tick(later, 0);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].packet_type, PacketType::Syn);
        assert_eq!(resent[0].seq_nr, 1);

        // Back-off: the next deadline is further out.
        let immediately_after = later + Duration::from_millis(100);
        assert!(sender.on_tick(immediately_after, 0).is_empty());
    }

    #[test]
    fn triple_duplicate_ack_fast_retransmits() {
        let (now, _) = now_pair();
        let payload = vec![0x55; MAX_CHUNK * 4];
        let (tx, _rx) = oneshot::channel();
        let mut sender = Connection::initiator(
            addr(1),
            11,
            Role::Sender {
                pending: chunk_payload(&payload),
                done: Some(tx),
            },
            now,
        );
        sender.start(now, 0);
        // Accepting STATE: handshake done, data flows.
        let accept = Packet {
            packet_type: PacketType::State,
            connection_id: 12,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 1,
            ack_nr: 1,
            payload: vec![],
        };
        let data = sender.on_packet(&accept, now, 0);
        assert!(data.len() >= 2, "expected at least two data packets in flight");
        let first_data_seq = data[0].seq_nr;

        // Three duplicate ACKs for the handshake: first data packet is
        // retransmitted exactly once.
        let dup = |ts: u32| Packet {
            packet_type: PacketType::State,
            connection_id: 12,
            timestamp_micros: ts,
            timestamp_diff_micros: 0,
            window_size: RECV_WINDOW,
            seq_nr: 1,
            ack_nr: 1,
            payload: vec![],
        };
        assert!(sender.on_packet(&dup(1), now, 0).is_empty());
        assert!(sender.on_packet(&dup(2), now, 0).is_empty());
        let retransmit = sender.on_packet(&dup(3), now, 0);
        assert_eq!(retransmit.len(), 1);
        assert_eq!(retransmit[0].seq_nr, first_data_seq);
    }

    #[test]
    fn stall_resets_the_session() {
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let mut receiver = Connection::responder(
            addr(2),
            3,
            Role::Receiver { done: Some(tx) },
            now,
        );
        let much_later = now + STALL_TIMEOUT + Duration::from_secs(1);
        let out = receiver.on_tick(much_later, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packet_type, PacketType::Reset);
        assert!(receiver.is_closed());
        assert_eq!(rx.try_recv().unwrap(), Err(TransferError::Stalled));
    }

    #[test]
    fn reset_aborts_immediately() {
        let (now, _) = now_pair();
        let (tx, mut rx) = oneshot::channel();
        let mut receiver = Connection::responder(
            addr(2),
            3,
            Role::Receiver { done: Some(tx) },
            now,
        );
        let reset = Packet {
            packet_type: PacketType::Reset,
            connection_id: 3,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window_size: 0,
            seq_nr: 1,
            ack_nr: 0,
            payload: vec![],
        };
        assert!(receiver.on_packet(&reset, now, 0).is_empty());
        assert!(receiver.is_closed());
        assert_eq!(rx.try_recv().unwrap(), Err(TransferError::Reset));
    }

    #[test]
    fn large_transfer_with_loss_recovers_via_tick() {
        let now = Instant::now();
        let payload: Vec<u8> = (0..MAX_CHUNK * 8).map(|i| (i % 251) as u8).collect();
        let (send_tx, mut send_rx) = oneshot::channel();
        let (recv_tx, mut recv_rx) = oneshot::channel();
        let mut sender = Connection::initiator(
            addr(1),
            77,
            Role::Sender {
                pending: chunk_payload(&payload),
                done: Some(send_tx),
            },
            now,
        );
        let mut receiver = Connection::responder(
            addr(2),
            77,
            Role::Receiver {
                done: Some(recv_tx),
            },
            now,
        );

        // Drop every third packet from the sender on its first pass,
        // then let RTO ticks drive recovery.
        let mut to_receiver: VecDeque<Packet> = sender.start(now, 0).into();
        let mut to_sender: VecDeque<Packet> = VecDeque::new();
        let mut drop_counter = 0usize;
        let mut clock = now;
        for round in 0..20_000 {
            if sender.is_closed() && receiver.is_closed() {
                break;
            }
            if let Some(pkt) = to_receiver.pop_front() {
                drop_counter += 1;
                let lose = round < 40 && drop_counter % 3 == 0;
                if !lose {
                    to_sender.extend(receiver.on_packet(&pkt, clock, 0));
                }
            }
            if let Some(pkt) = to_sender.pop_front() {
                to_receiver.extend(sender.on_packet(&pkt, clock, 0));
            }
            if to_receiver.is_empty() && to_sender.is_empty() {
                // Quiescent with loss outstanding: advance time past the
                // retransmission deadline.
                clock += Duration::from_millis(600);
                to_receiver.extend(sender.on_tick(clock, 0));
                to_sender.extend(receiver.on_tick(clock, 0));
            }
        }

        assert_eq!(send_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(recv_rx.try_recv().unwrap(), Ok(payload));
    }
}
