//! Per-connection uTP socket
//!
//! A socket is created for exactly one content transfer and plays exactly
//! one role: a writer streams a payload it owns, a reader reassembles a
//! payload its peer streams. The state machine, sequence bookkeeping,
//! congestion control, selective acknowledgment, and retransmission
//! timing all live here; routing and id allocation live in the
//! multiplexer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::UtpConfig;
use crate::error::UtpError;
use crate::types::NodeId;

use super::buffer::{seq_le, seq_lt, OutgoingBuffer};
use super::congestion::LedbatController;
use super::packet::{
    timestamp_micros, Packet, PacketType, SelectiveAck, MAX_PACKET_SIZE,
};
use super::reader::ContentReader;
use super::writer::ContentWriter;

/// Channel the socket enqueues outbound datagrams on; drained by the
/// multiplexer's send task.
pub type OutboundSender = mpsc::UnboundedSender<(NodeId, Vec<u8>)>;

/// uTP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake traffic yet
    Idle,

    /// SYN sent, waiting for the acknowledging STATE (writer)
    SynSent,

    /// SYN received, STATE not yet sent (reader)
    SynRecv,

    /// Handshake complete, transfer in progress
    Connected,

    /// FIN observed, final STATE being emitted
    GotFin,

    /// Transfer finished normally
    Closed,

    /// Torn down, locally or by the peer
    Reset,
}

impl ConnectionState {
    /// Terminal states drop all further inbound packets
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::SynRecv => write!(f, "SYN_RECV"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::GotFin => write!(f, "GOT_FIN"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Reset => write!(f, "RESET"),
        }
    }
}

/// Which side of the transfer this socket is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Reader,
    Writer,
}

/// Per-transfer counters
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub timeouts: u64,
}

enum Transfer {
    Read(ContentReader),
    Write(ContentWriter),
}

enum DataReply {
    Plain,
    Selective(SelectiveAck),
}

pub(crate) struct SocketInner {
    remote: NodeId,

    /// Connection ID stamped on outbound packets (SYN is the exception:
    /// it carries `recv_conn_id`)
    send_conn_id: u16,

    /// Connection ID expected on inbound packets
    recv_conn_id: u16,

    role: SocketRole,
    transfer: Transfer,
    state: ConnectionState,

    /// Next sequence number to consume; only SYN, DATA, and FIN consume
    seq_nr: u16,

    /// Highest in-order sequence received from the peer
    ack_nr: u16,

    /// Sequence of the FIN we sent (writer) or observed (reader)
    fin_nr: Option<u16>,

    congestion: LedbatController,
    out_buffer: OutgoingBuffer,

    /// Peer's advertised receive window; open until first advertised
    peer_window: u32,

    /// Our most recent one-way delay measurement, echoed in outbound
    /// headers as `timestamp_diff_micros`
    reply_delay_micros: u32,

    outbound: OutboundSender,
    completion: Option<oneshot::Sender<Result<Bytes, UtpError>>>,

    /// Bumped on every handled packet; the coordinator watches this to
    /// detect idle transfers
    progress: Arc<AtomicU64>,

    stats: TransferStats,
    config: UtpConfig,

    consecutive_timeouts: u32,
    timer: Option<JoinHandle<()>>,
    timer_gen: u64,
    weak: Weak<Mutex<SocketInner>>,
}

impl SocketInner {
    fn header(&self, packet_type: PacketType) -> Packet {
        let conn_id = if packet_type == PacketType::Syn {
            self.recv_conn_id
        } else {
            self.send_conn_id
        };
        Packet::new(packet_type, conn_id, self.seq_nr, self.ack_nr)
            .with_timestamps(timestamp_micros(), self.reply_delay_micros)
            .with_window(self.config.recv_window)
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        seq
    }

    fn send(&mut self, pkt: Packet) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += pkt.payload.len() as u64;
        if self.outbound.send((self.remote, pkt.encode())).is_err() {
            warn!(remote = %self.remote, "outbound channel closed, dropping packet");
        }
    }

    fn resolve(&mut self, result: Result<Bytes, UtpError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }

    fn send_state_plain(&mut self) {
        let pkt = self.header(PacketType::State);
        self.send(pkt);
    }

    fn send_state_selective(&mut self, sack: SelectiveAck) {
        let pkt = self.header(PacketType::State).with_selective_ack(sack);
        self.send(pkt);
    }

    fn send_syn(&mut self) {
        let seq = self.next_seq();
        let mut syn = self.header(PacketType::Syn);
        syn.seq_nr = seq;
        self.out_buffer.record(seq);
        self.state = ConnectionState::SynSent;
        self.send(syn);
        self.arm_rto();
        debug!(remote = %self.remote, conn_id = self.recv_conn_id, seq, "sent SYN");
    }

    /// Entry point for every routed inbound packet.
    fn handle_packet(&mut self, pkt: Packet) -> Result<(), UtpError> {
        if self.state.is_terminal() {
            return Err(UtpError::StaleConnection {
                conn_id: self.recv_conn_id,
            });
        }

        self.stats.packets_received += 1;
        self.progress.fetch_add(1, Ordering::Relaxed);
        self.peer_window = pkt.wnd_size;

        if pkt.timestamp_micros != 0 {
            let delay = timestamp_micros().wrapping_sub(pkt.timestamp_micros);
            self.reply_delay_micros = delay;
            self.congestion
                .on_delay_sample(delay, self.out_buffer.cur_window(), Instant::now());
        }

        match pkt.packet_type {
            PacketType::Syn => self.on_syn(&pkt),
            PacketType::State => self.on_state(&pkt),
            PacketType::Data => self.on_data(&pkt),
            PacketType::Fin => self.on_fin(&pkt),
            PacketType::Reset => self.on_reset(),
        }
        Ok(())
    }

    fn on_syn(&mut self, pkt: &Packet) {
        if self.role != SocketRole::Reader {
            debug!(remote = %self.remote, "writer socket ignoring SYN");
            return;
        }
        match self.state {
            ConnectionState::Idle => {
                self.ack_nr = pkt.seq_nr;
                self.seq_nr = rand::random();
                if let Transfer::Read(reader) = &mut self.transfer {
                    reader.bind_first(pkt.seq_nr.wrapping_add(1));
                }
                self.state = ConnectionState::SynRecv;
                self.send_state_plain();
                self.state = ConnectionState::Connected;
                debug!(
                    remote = %self.remote,
                    conn_id = self.recv_conn_id,
                    peer_seq = pkt.seq_nr,
                    "accepted SYN"
                );
            }
            // Duplicate SYN: the peer missed our STATE, repeat it
            ConnectionState::SynRecv | ConnectionState::Connected => {
                self.send_state_plain();
            }
            _ => {
                debug!(remote = %self.remote, state = %self.state, "ignoring SYN");
            }
        }
    }

    fn on_state(&mut self, pkt: &Packet) {
        if self.state == ConnectionState::SynSent {
            for (seq, entry) in self.out_buffer.ack_through(pkt.ack_nr) {
                if seq == pkt.ack_nr && entry.transmissions == 1 {
                    self.congestion
                        .on_rtt_sample(entry.sent_at.elapsed().as_micros() as u64);
                }
            }
            self.ack_nr = pkt.seq_nr;
            self.state = ConnectionState::Connected;
            self.consecutive_timeouts = 0;
            debug!(remote = %self.remote, conn_id = self.recv_conn_id, "connected");
            self.writer_pump();
            return;
        }

        // The STATE acknowledging our FIN finishes the transfer
        if self.role == SocketRole::Writer && self.fin_nr == Some(pkt.ack_nr) {
            self.out_buffer.ack_through(pkt.ack_nr);
            self.state = ConnectionState::Closed;
            self.cancel_rto();
            self.resolve(Ok(Bytes::new()));
            debug!(remote = %self.remote, conn_id = self.recv_conn_id, "closed");
            return;
        }

        let mut progressed = false;

        for (seq, entry) in self.out_buffer.ack_through(pkt.ack_nr) {
            progressed = true;
            if seq == pkt.ack_nr && entry.transmissions == 1 {
                self.congestion
                    .on_rtt_sample(entry.sent_at.elapsed().as_micros() as u64);
            }
            if let Transfer::Write(writer) = &mut self.transfer {
                writer.mark_acked(seq);
            }
        }

        if let Some(sack) = &pkt.selective_ack {
            let mut horizon: Option<u16> = None;
            for offset in sack.acked_offsets() {
                let seq = pkt.ack_nr.wrapping_add(2).wrapping_add(offset as u16);
                if self.out_buffer.ack(seq).is_some() {
                    progressed = true;
                }
                if let Transfer::Write(writer) = &mut self.transfer {
                    writer.mark_acked(seq);
                }
                if horizon.map_or(true, |h| seq_lt(h, seq)) {
                    horizon = Some(seq);
                }
            }

            // Any sent-but-unacked sequence below the highest
            // selectively-acked one was lost on the wire
            if let Some(horizon) = horizon {
                let lost = match &self.transfer {
                    Transfer::Write(writer) => writer.lost_below(horizon),
                    Transfer::Read(_) => Vec::new(),
                };
                for seq in lost {
                    if self.out_buffer.contains(seq) {
                        debug!(remote = %self.remote, seq, "retransmitting after selective ack gap");
                        self.retransmit(seq);
                    }
                }
            }
        }

        if progressed {
            self.consecutive_timeouts = 0;
        }

        self.writer_pump();
    }

    fn on_data(&mut self, pkt: &Packet) {
        let is_reader = matches!(self.transfer, Transfer::Read(_));
        if !is_reader || self.state != ConnectionState::Connected {
            debug!(remote = %self.remote, state = %self.state, "ignoring DATA");
            return;
        }
        if pkt.payload.is_empty() {
            return;
        }

        // Already delivered: the peer missed an earlier STATE, repeat it
        if seq_le(pkt.seq_nr, self.ack_nr) {
            self.send_state_plain();
            return;
        }

        let reply = {
            let Transfer::Read(reader) = &mut self.transfer else {
                return;
            };
            if reader.insert(pkt.seq_nr, pkt.payload.clone()) {
                self.stats.bytes_received += pkt.payload.len() as u64;
            }

            if pkt.seq_nr == self.ack_nr.wrapping_add(1) {
                // In order: advance to the end of the contiguous run
                let mut next = self.ack_nr.wrapping_add(1);
                while reader.contains(next) {
                    self.ack_nr = next;
                    next = next.wrapping_add(1);
                }
                DataReply::Plain
            } else {
                // Out of order: describe what we hold past ack_nr + 1
                let mut sack = SelectiveAck::default();
                for offset in 0..32u8 {
                    let seq = self.ack_nr.wrapping_add(2).wrapping_add(offset as u16);
                    if reader.contains(seq) {
                        sack.set(offset);
                    }
                }
                DataReply::Selective(sack)
            }
        };

        match reply {
            DataReply::Plain => self.send_state_plain(),
            DataReply::Selective(sack) => self.send_state_selective(sack),
        }
    }

    fn on_fin(&mut self, pkt: &Packet) {
        if self.role != SocketRole::Reader {
            debug!(remote = %self.remote, "writer socket ignoring FIN");
            return;
        }

        self.fin_nr = Some(pkt.seq_nr);
        self.state = ConnectionState::GotFin;
        self.ack_nr = pkt.seq_nr;
        self.send_state_plain();

        let assembled = match &mut self.transfer {
            Transfer::Read(reader) => reader.assemble(pkt.seq_nr),
            Transfer::Write(_) => unreachable!("role checked above"),
        };

        self.state = ConnectionState::Closed;
        self.cancel_rto();
        match assembled {
            Ok(content) => {
                debug!(
                    remote = %self.remote,
                    conn_id = self.recv_conn_id,
                    bytes = content.len(),
                    "transfer assembled"
                );
                self.resolve(Ok(content));
            }
            Err(err) => {
                debug!(remote = %self.remote, error = %err, "assembly failed");
                self.resolve(Err(err));
            }
        }
    }

    fn on_reset(&mut self) {
        debug!(remote = %self.remote, conn_id = self.recv_conn_id, "peer reset");
        self.state = ConnectionState::Reset;
        self.cancel_rto();
        self.out_buffer.clear();
        self.resolve(Err(UtpError::PeerReset));
    }

    /// Stream as much as the window allows; once everything is acked,
    /// send the FIN. No-op for readers and unconnected sockets.
    fn writer_pump(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let complete = matches!(&self.transfer, Transfer::Write(w) if w.complete());
        if complete {
            if self.fin_nr.is_none() {
                let seq = self.next_seq();
                let mut fin = self.header(PacketType::Fin);
                fin.seq_nr = seq;
                self.fin_nr = Some(seq);
                self.out_buffer.record(seq);
                self.send(fin);
                debug!(remote = %self.remote, seq, "sent FIN");
            }
            self.arm_rto();
            return;
        }

        loop {
            let window = self.congestion.window().min(self.peer_window);
            if self.out_buffer.cur_window() + MAX_PACKET_SIZE as u32 > window {
                break;
            }
            let seq = self.seq_nr;
            let chunk = match &mut self.transfer {
                Transfer::Write(writer) => writer.assign_next(seq),
                Transfer::Read(_) => return,
            };
            let Some(chunk) = chunk else { break };
            self.seq_nr = self.seq_nr.wrapping_add(1);

            let mut pkt = self.header(PacketType::Data);
            pkt.seq_nr = seq;
            pkt.payload = chunk;
            self.out_buffer.record(seq);
            self.send(pkt);
        }

        if self.out_buffer.is_empty() {
            self.cancel_rto();
        } else {
            self.arm_rto();
        }
    }

    /// Put the frame for `seq` back on the wire with a fresh timestamp
    fn retransmit(&mut self, seq: u16) {
        let pkt = if self.fin_nr == Some(seq) {
            let mut fin = self.header(PacketType::Fin);
            fin.seq_nr = seq;
            fin
        } else {
            let chunk = match &self.transfer {
                Transfer::Write(writer) => writer.chunk_for(seq),
                Transfer::Read(_) => None,
            };
            let Some(chunk) = chunk else { return };
            let mut data = self.header(PacketType::Data);
            data.seq_nr = seq;
            data.payload = chunk;
            data
        };
        self.out_buffer.mark_retransmit(seq);
        self.stats.retransmits += 1;
        self.send(pkt);
    }

    fn on_rto(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.consecutive_timeouts += 1;
        self.stats.timeouts += 1;

        if self.consecutive_timeouts > self.config.max_timeouts {
            warn!(
                remote = %self.remote,
                conn_id = self.recv_conn_id,
                timeouts = self.consecutive_timeouts,
                "giving up after repeated timeouts"
            );
            let reset = self.header(PacketType::Reset);
            self.send(reset);
            self.state = ConnectionState::Reset;
            self.cancel_rto();
            self.out_buffer.clear();
            self.resolve(Err(UtpError::Timeout {
                attempts: self.consecutive_timeouts,
            }));
            return;
        }

        self.congestion.on_timeout();
        debug!(
            remote = %self.remote,
            conn_id = self.recv_conn_id,
            rto_micros = self.congestion.rto_micros(),
            "retransmission timeout"
        );

        match self.state {
            ConnectionState::SynSent => {
                let seq = self.seq_nr.wrapping_sub(1);
                let mut syn = self.header(PacketType::Syn);
                syn.seq_nr = seq;
                self.out_buffer.mark_retransmit(seq);
                self.stats.retransmits += 1;
                self.send(syn);
            }
            ConnectionState::Connected => {
                // The collapsed window holds one packet: resend the
                // longest-waiting frame, then let the pump continue
                if let Some(seq) = self.out_buffer.oldest() {
                    self.retransmit(seq);
                }
                self.writer_pump();
            }
            _ => {}
        }
        self.arm_rto();
    }

    /// Locally abandon the transfer: RESET on the wire, buffers dropped,
    /// pending handle resolved with `Cancelled`.
    fn cancel_local(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!(remote = %self.remote, conn_id = self.recv_conn_id, "cancelling transfer");
        let reset = self.header(PacketType::Reset);
        self.send(reset);
        self.state = ConnectionState::Reset;
        self.cancel_rto();
        self.out_buffer.clear();
        self.resolve(Err(UtpError::Cancelled));
    }

    /// (Re)arm the single retransmission timer. Arming replaces any
    /// pending timer.
    fn arm_rto(&mut self) {
        self.timer_gen = self.timer_gen.wrapping_add(1);
        let gen = self.timer_gen;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let weak = self.weak.clone();
        let rto = self.congestion.rto();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(rto).await;
            let Some(socket) = weak.upgrade() else { return };
            let mut inner = socket.lock().await;
            if inner.timer_gen == gen {
                inner.on_rto();
            }
        }));
    }

    fn cancel_rto(&mut self) {
        self.timer_gen = self.timer_gen.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Pieces handed to the multiplexer when a socket is created.
pub(crate) struct SocketParts {
    pub socket: UtpSocket,
    pub done: oneshot::Receiver<Result<Bytes, UtpError>>,
    pub progress: Arc<AtomicU64>,
}

/// Handle to one uTP connection.
#[derive(Clone)]
pub struct UtpSocket {
    inner: Arc<Mutex<SocketInner>>,
}

impl UtpSocket {
    fn build(
        remote: NodeId,
        send_conn_id: u16,
        recv_conn_id: u16,
        role: SocketRole,
        transfer: Transfer,
        initial_seq: u16,
        outbound: OutboundSender,
        config: UtpConfig,
    ) -> SocketParts {
        let (done_tx, done_rx) = oneshot::channel();
        let progress = Arc::new(AtomicU64::new(0));
        let progress_clone = progress.clone();
        let max_window = config.max_window;
        let inner = Arc::new_cyclic(|weak| {
            Mutex::new(SocketInner {
                remote,
                send_conn_id,
                recv_conn_id,
                role,
                transfer,
                state: ConnectionState::Idle,
                seq_nr: initial_seq,
                ack_nr: 0,
                fin_nr: None,
                congestion: LedbatController::new(max_window),
                out_buffer: OutgoingBuffer::new(),
                peer_window: u32::MAX,
                reply_delay_micros: 0,
                outbound,
                completion: Some(done_tx),
                progress: progress_clone,
                stats: TransferStats::default(),
                config,
                consecutive_timeouts: 0,
                timer: None,
                timer_gen: 0,
                weak: weak.clone(),
            })
        });
        SocketParts {
            socket: UtpSocket { inner },
            done: done_rx,
            progress,
        }
    }

    /// Writer socket for an outbound transfer. `conn_id` is the id the
    /// peer's packets will arrive under; the SYN advertises it.
    pub(crate) fn new_writer(
        remote: NodeId,
        conn_id: u16,
        payload: Bytes,
        outbound: OutboundSender,
        config: UtpConfig,
    ) -> SocketParts {
        Self::new_writer_with_seq(remote, conn_id, payload, outbound, config, rand::random())
    }

    pub(crate) fn new_writer_with_seq(
        remote: NodeId,
        conn_id: u16,
        payload: Bytes,
        outbound: OutboundSender,
        config: UtpConfig,
        initial_seq: u16,
    ) -> SocketParts {
        Self::build(
            remote,
            conn_id.wrapping_add(1),
            conn_id,
            SocketRole::Writer,
            Transfer::Write(ContentWriter::new(payload)),
            initial_seq,
            outbound,
            config,
        )
    }

    /// Reader socket accepting an inbound transfer pre-negotiated under
    /// `conn_id`: the SYN arrives carrying `conn_id`, data arrives
    /// carrying `conn_id + 1`.
    pub(crate) fn new_reader(
        remote: NodeId,
        conn_id: u16,
        outbound: OutboundSender,
        config: UtpConfig,
    ) -> SocketParts {
        Self::build(
            remote,
            conn_id,
            conn_id.wrapping_add(1),
            SocketRole::Reader,
            Transfer::Read(ContentReader::new()),
            0,
            outbound,
            config,
        )
    }

    /// Start the handshake (writer sockets)
    pub(crate) async fn initiate(&self) {
        self.inner.lock().await.send_syn();
    }

    /// Process one routed inbound packet
    pub(crate) async fn handle_packet(&self, pkt: Packet) -> Result<(), UtpError> {
        self.inner.lock().await.handle_packet(pkt)
    }

    /// Abandon the transfer, resetting the connection
    pub async fn cancel(&self) {
        self.inner.lock().await.cancel_local();
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn role(&self) -> SocketRole {
        self.inner.lock().await.role
    }

    pub async fn stats(&self) -> TransferStats {
        self.inner.lock().await.stats.clone()
    }

    /// Connection id inbound packets are expected under
    pub async fn recv_conn_id(&self) -> u16 {
        self.inner.lock().await.recv_conn_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utp::packet::{MAX_PAYLOAD_SIZE, SACK_BITMAP};

    fn outbound() -> (OutboundSender, mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>) {
        mpsc::unbounded_channel()
    }

    fn recv_packet(rx: &mut mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>) -> Packet {
        let (_, datagram) = rx.try_recv().expect("expected an outbound packet");
        Packet::decode(&datagram).expect("outbound packet must decode")
    }

    fn no_packet(rx: &mut mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>) {
        assert!(rx.try_recv().is_err(), "unexpected outbound packet");
    }

    // Crafted replies carry no timestamp so the delay sampler stays out
    // of the way and window arithmetic is exact
    fn state_reply(to: &Packet, seq: u16, ack: u16) -> Packet {
        Packet::state(to.connection_id, seq, ack).with_window(1024 * 1024)
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 239) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_writer_handshake_and_single_chunk() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            700,
            payload(800),
            tx,
            UtpConfig::default(),
            100,
        );
        let socket = parts.socket;
        socket.initiate().await;

        let syn = recv_packet(&mut rx);
        assert_eq!(syn.packet_type, PacketType::Syn);
        assert_eq!(syn.connection_id, 700);
        assert_eq!(syn.seq_nr, 100);
        assert_eq!(socket.state().await, ConnectionState::SynSent);

        // Peer acks the SYN
        socket
            .handle_packet(state_reply(&syn, 5000, 100))
            .await
            .unwrap();
        assert_eq!(socket.state().await, ConnectionState::Connected);

        let data = recv_packet(&mut rx);
        assert_eq!(data.packet_type, PacketType::Data);
        assert_eq!(data.connection_id, 701);
        assert_eq!(data.seq_nr, 101);
        assert_eq!(data.payload.len(), 800);

        // Peer acks the data; writer should FIN
        socket
            .handle_packet(state_reply(&data, 5000, 101))
            .await
            .unwrap();
        let fin = recv_packet(&mut rx);
        assert_eq!(fin.packet_type, PacketType::Fin);
        assert_eq!(fin.seq_nr, 102);

        // Peer acks the FIN; transfer completes
        socket
            .handle_packet(state_reply(&fin, 5000, 102))
            .await
            .unwrap();
        assert_eq!(socket.state().await, ConnectionState::Closed);
        assert!(matches!(parts.done.await, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_writer_wraparound_sequences() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            42,
            payload(10 * MAX_PAYLOAD_SIZE),
            tx,
            UtpConfig::default(),
            65530,
        );
        let socket = parts.socket;
        socket.initiate().await;

        let syn = recv_packet(&mut rx);
        assert_eq!(syn.seq_nr, 65530);
        socket
            .handle_packet(state_reply(&syn, 1, 65530))
            .await
            .unwrap();

        let mut seqs = Vec::new();
        for _ in 0..10 {
            let data = recv_packet(&mut rx);
            assert_eq!(data.packet_type, PacketType::Data);
            seqs.push(data.seq_nr);
        }
        assert_eq!(seqs, vec![65531, 65532, 65533, 65534, 65535, 0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_selective_ack_gap_triggers_retransmit() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            9,
            payload(3 * MAX_PAYLOAD_SIZE),
            tx,
            UtpConfig::default(),
            200,
        );
        let socket = parts.socket;
        socket.initiate().await;

        let syn = recv_packet(&mut rx);
        socket
            .handle_packet(state_reply(&syn, 700, 200))
            .await
            .unwrap();
        let d1 = recv_packet(&mut rx);
        let d2 = recv_packet(&mut rx);
        let d3 = recv_packet(&mut rx);
        assert_eq!((d1.seq_nr, d2.seq_nr, d3.seq_nr), (201, 202, 203));

        // Chunk 202 was lost: the peer acks 201 cumulatively and 203 via
        // the selective-ack bit at offset 0 (ack_nr + 2)
        let mut sack = SelectiveAck::default();
        sack.set(0);
        let reply = state_reply(&d1, 700, 201).with_selective_ack(sack);
        socket.handle_packet(reply).await.unwrap();

        let resent = recv_packet(&mut rx);
        assert_eq!(resent.packet_type, PacketType::Data);
        assert_eq!(resent.seq_nr, 202);
        assert_eq!(resent.payload, d2.payload);

        // Everything acked: FIN follows
        socket
            .handle_packet(state_reply(&d1, 700, 203))
            .await
            .unwrap();
        let fin = recv_packet(&mut rx);
        assert_eq!(fin.packet_type, PacketType::Fin);
        assert_eq!(fin.seq_nr, 204);
    }

    #[tokio::test]
    async fn test_reader_flow_in_order_and_out_of_order() {
        let (tx, mut rx) = outbound();
        let remote = NodeId::random();
        let parts = UtpSocket::new_reader(remote, 300, tx, UtpConfig::default());
        let socket = parts.socket;

        // Peer's SYN with seq 50
        let syn = Packet::syn(300, 50).with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(syn).await.unwrap();
        let synack = recv_packet(&mut rx);
        assert_eq!(synack.packet_type, PacketType::State);
        assert_eq!(synack.connection_id, 300);
        assert_eq!(synack.ack_nr, 50);
        assert_eq!(socket.state().await, ConnectionState::Connected);

        // In-order data 51
        let d51 = Packet::data(301, 51, synack.seq_nr, payload(100))
            .with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(d51).await.unwrap();
        let ack = recv_packet(&mut rx);
        assert_eq!(ack.ack_nr, 51);
        assert!(ack.selective_ack.is_none());

        // Out-of-order data 53 (52 missing): selective ack with offset 0
        let d53 = Packet::data(301, 53, synack.seq_nr, payload(100))
            .with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(d53).await.unwrap();
        let sack_state = recv_packet(&mut rx);
        assert_eq!(sack_state.ack_nr, 51);
        let sack = sack_state.selective_ack.expect("selective ack expected");
        assert!(sack.contains(0));
        assert_eq!(sack.mask(), 1 << (SACK_BITMAP[0] - 1));

        // The gap fills: ack jumps to 53
        let d52 = Packet::data(301, 52, synack.seq_nr, payload(100))
            .with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(d52).await.unwrap();
        let ack = recv_packet(&mut rx);
        assert_eq!(ack.ack_nr, 53);

        // FIN delivers the assembled content
        let fin = Packet::fin(301, 54, synack.seq_nr).with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(fin).await.unwrap();
        let fin_ack = recv_packet(&mut rx);
        assert_eq!(fin_ack.ack_nr, 54);
        assert_eq!(socket.state().await, ConnectionState::Closed);

        let content = parts.done.await.unwrap().unwrap();
        assert_eq!(content.len(), 300);
    }

    #[tokio::test]
    async fn test_duplicate_data_is_reacked() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_reader(NodeId::random(), 11, tx, UtpConfig::default());
        let socket = parts.socket;

        socket
            .handle_packet(Packet::syn(11, 10).with_timestamps(timestamp_micros(), 0))
            .await
            .unwrap();
        recv_packet(&mut rx);

        let data = Packet::data(12, 11, 1, payload(40)).with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(data.clone()).await.unwrap();
        let first_ack = recv_packet(&mut rx);
        assert_eq!(first_ack.ack_nr, 11);

        // Redelivery of the same packet: idempotent, but re-acked
        socket.handle_packet(data).await.unwrap();
        let second_ack = recv_packet(&mut rx);
        assert_eq!(second_ack.ack_nr, 11);
        assert_eq!(socket.stats().await.bytes_received, 40);
    }

    #[tokio::test]
    async fn test_peer_reset_resolves_and_goes_quiet() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            5,
            payload(4 * MAX_PAYLOAD_SIZE),
            tx,
            UtpConfig::default(),
            900,
        );
        let socket = parts.socket;
        socket.initiate().await;
        let syn = recv_packet(&mut rx);
        socket
            .handle_packet(state_reply(&syn, 1, 900))
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        let reset = Packet::reset(5, 1, 900).with_timestamps(timestamp_micros(), 0);
        socket.handle_packet(reset).await.unwrap();
        assert_eq!(socket.state().await, ConnectionState::Reset);
        assert!(matches!(parts.done.await, Ok(Err(UtpError::PeerReset))));
        no_packet(&mut rx);

        // Further packets are stale
        let late = Packet::state(5, 2, 901).with_timestamps(timestamp_micros(), 0);
        assert!(matches!(
            socket.handle_packet(late).await,
            Err(UtpError::StaleConnection { .. })
        ));
        no_packet(&mut rx);
    }

    #[tokio::test]
    async fn test_cancel_sends_reset() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            77,
            payload(100),
            tx,
            UtpConfig::default(),
            10,
        );
        let socket = parts.socket;
        socket.initiate().await;
        recv_packet(&mut rx);

        socket.cancel().await;
        let reset = recv_packet(&mut rx);
        assert_eq!(reset.packet_type, PacketType::Reset);
        assert_eq!(socket.state().await, ConnectionState::Reset);
        assert!(matches!(parts.done.await, Ok(Err(UtpError::Cancelled))));
    }

    #[tokio::test]
    async fn test_empty_payload_goes_straight_to_fin() {
        let (tx, mut rx) = outbound();
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            1,
            Bytes::new(),
            tx,
            UtpConfig::default(),
            60,
        );
        let socket = parts.socket;
        socket.initiate().await;
        let syn = recv_packet(&mut rx);
        socket
            .handle_packet(state_reply(&syn, 2, 60))
            .await
            .unwrap();

        let fin = recv_packet(&mut rx);
        assert_eq!(fin.packet_type, PacketType::Fin);
        assert_eq!(fin.seq_nr, 61);
        socket
            .handle_packet(state_reply(&fin, 2, 61))
            .await
            .unwrap();
        assert_eq!(socket.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_window_limits_packets_in_flight() {
        let (tx, mut rx) = outbound();
        let config = UtpConfig {
            max_window: 2 * MAX_PACKET_SIZE as u32,
            ..UtpConfig::default()
        };
        let parts = UtpSocket::new_writer_with_seq(
            NodeId::random(),
            3,
            payload(6 * MAX_PAYLOAD_SIZE),
            tx,
            config,
            500,
        );
        let socket = parts.socket;
        socket.initiate().await;
        let syn = recv_packet(&mut rx);
        socket
            .handle_packet(state_reply(&syn, 1, 500))
            .await
            .unwrap();

        // Two packets fit the window
        assert_eq!(recv_packet(&mut rx).seq_nr, 501);
        assert_eq!(recv_packet(&mut rx).seq_nr, 502);
        no_packet(&mut rx);

        // Each ack opens room for one more
        socket
            .handle_packet(state_reply(&syn, 1, 501))
            .await
            .unwrap();
        assert_eq!(recv_packet(&mut rx).seq_nr, 503);
        no_packet(&mut rx);
    }
}
