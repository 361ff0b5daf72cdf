//! uTP connection multiplexer
//!
//! One `UtpMux` serves a whole host instance: it demultiplexes inbound
//! datagrams from the discovery session onto per-connection sockets by
//! `(remote, connection_id)`, allocates fresh connection ids, and funnels
//! every socket's outbound packets through a single send task into the
//! host session.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::UtpConfig;
use crate::error::UtpError;
use crate::session::HostSession;
use crate::types::NodeId;

use super::packet::{Packet, PacketType};
use super::socket::{SocketParts, UtpSocket};

type ConnectionKey = (NodeId, u16);

/// Routes packets between the host session and per-connection sockets.
pub struct UtpMux {
    session: Arc<dyn HostSession>,

    /// Active connections keyed by the id their inbound packets carry
    sockets: RwLock<HashMap<ConnectionKey, UtpSocket>>,

    /// Outbound path shared by every socket
    outbound: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,

    send_task: JoinHandle<()>,

    config: UtpConfig,
}

impl UtpMux {
    pub fn new(session: Arc<dyn HostSession>, config: UtpConfig) -> Arc<Self> {
        let (outbound, mut send_rx) = mpsc::unbounded_channel::<(NodeId, Vec<u8>)>();

        let send_session = session.clone();
        let send_task = tokio::spawn(async move {
            while let Some((remote, datagram)) = send_rx.recv().await {
                if let Err(err) = send_session.send(remote, datagram).await {
                    warn!(%remote, error = %err, "session send failed");
                }
            }
        });

        Arc::new(Self {
            session,
            sockets: RwLock::new(HashMap::new()),
            outbound,
            send_task,
            config,
        })
    }

    pub fn config(&self) -> &UtpConfig {
        &self.config
    }

    /// Number of sockets currently registered
    pub fn active_connections(&self) -> usize {
        self.sockets.read().len()
    }

    /// Pick a connection id unused for `remote`. Both the id and its
    /// pair (`id + 1` carries the counter-direction traffic) must be
    /// free.
    fn fresh_conn_id(&self, remote: NodeId) -> u16 {
        let sockets = self.sockets.read();
        loop {
            let id: u16 = rand::random();
            if !sockets.contains_key(&(remote, id))
                && !sockets.contains_key(&(remote, id.wrapping_add(1)))
            {
                return id;
            }
        }
    }

    /// Open a writer connection with a freshly allocated id and start
    /// streaming `payload`. Returns the id (to hand to the peer out of
    /// band) and the transfer handle.
    pub async fn create_writer(
        self: &Arc<Self>,
        remote: NodeId,
        payload: Bytes,
    ) -> (u16, TransferHandle) {
        let conn_id = self.fresh_conn_id(remote);
        let handle = self.connect_writer(remote, conn_id, payload).await;
        (conn_id, handle)
    }

    /// Open a writer connection under an id negotiated out of band (an
    /// accepted offer) and start streaming `payload`.
    pub async fn connect_writer(
        self: &Arc<Self>,
        remote: NodeId,
        conn_id: u16,
        payload: Bytes,
    ) -> TransferHandle {
        let parts = UtpSocket::new_writer(
            remote,
            conn_id,
            payload,
            self.outbound.clone(),
            self.config.clone(),
        );
        self.sockets
            .write()
            .insert((remote, conn_id), parts.socket.clone());
        debug!(%remote, conn_id, "writer connection opened");
        parts.socket.initiate().await;
        TransferHandle::new(parts, remote, conn_id, Arc::downgrade(self))
    }

    /// Register a reader for an inbound transfer pre-negotiated under
    /// `conn_id`. The peer's SYN arrives carrying `conn_id`; its data
    /// carries `conn_id + 1`.
    pub fn create_reader(self: &Arc<Self>, remote: NodeId, conn_id: u16) -> TransferHandle {
        let parts = UtpSocket::new_reader(
            remote,
            conn_id,
            self.outbound.clone(),
            self.config.clone(),
        );
        let recv_id = conn_id.wrapping_add(1);
        self.sockets
            .write()
            .insert((remote, recv_id), parts.socket.clone());
        debug!(%remote, conn_id, "reader connection registered");
        TransferHandle::new(parts, remote, recv_id, Arc::downgrade(self))
    }

    /// Entry point for every inbound datagram tagged with the uTP
    /// protocol id by the host session.
    pub async fn on_datagram(&self, remote: NodeId, datagram: &[u8]) {
        let pkt = match Packet::decode(datagram) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!(%remote, error = %err, "dropping undecodable datagram");
                return;
            }
        };

        let socket = {
            let sockets = self.sockets.read();
            sockets
                .get(&(remote, pkt.connection_id))
                .cloned()
                .or_else(|| {
                    // A SYN advertises the initiator's receive id; the
                    // accepting socket is registered one above it
                    if pkt.packet_type == PacketType::Syn {
                        sockets
                            .get(&(remote, pkt.connection_id.wrapping_add(1)))
                            .cloned()
                    } else {
                        None
                    }
                })
        };

        match socket {
            Some(socket) => {
                if let Err(err) = socket.handle_packet(pkt).await {
                    debug!(%remote, error = %err, "dropping packet");
                }
            }
            None => {
                let err = UtpError::UnknownConnection {
                    remote,
                    conn_id: pkt.connection_id,
                };
                debug!(%remote, ty = ?pkt.packet_type, "{}", err);
            }
        }
    }

    /// The session this mux transmits through
    pub fn session(&self) -> &Arc<dyn HostSession> {
        &self.session
    }

    fn release(&self, remote: NodeId, recv_conn_id: u16) {
        self.sockets.write().remove(&(remote, recv_conn_id));
    }
}

impl Drop for UtpMux {
    fn drop(&mut self) {
        self.send_task.abort();
    }
}

/// Pending transfer: resolves when the socket's transfer completes or
/// fails. Dropping an unresolved handle abandons the transfer and resets
/// the connection.
pub struct TransferHandle {
    socket: UtpSocket,
    done: Option<oneshot::Receiver<Result<Bytes, UtpError>>>,
    progress: Arc<std::sync::atomic::AtomicU64>,
    mux: Weak<UtpMux>,
    remote: NodeId,
    recv_conn_id: u16,
    finished: bool,
}

impl TransferHandle {
    fn new(parts: SocketParts, remote: NodeId, recv_conn_id: u16, mux: Weak<UtpMux>) -> Self {
        Self {
            socket: parts.socket,
            done: Some(parts.done),
            progress: parts.progress,
            mux,
            remote,
            recv_conn_id,
            finished: false,
        }
    }

    /// Number of packets the socket has handled so far
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// The socket driving this transfer
    pub fn socket(&self) -> &UtpSocket {
        &self.socket
    }

    /// Wait for the transfer to finish. Readers resolve with the
    /// assembled content, writers with empty bytes once their FIN is
    /// acknowledged.
    pub async fn wait(mut self) -> Result<Bytes, UtpError> {
        let done = self.done.take().expect("wait consumes the handle");
        let result = done.await.unwrap_or(Err(UtpError::Cancelled));
        self.retire();
        result
    }

    /// Like [`wait`](Self::wait), but resolves with empty bytes if no
    /// packet arrives for `idle` (the peer never showed up or went
    /// silent), resetting the connection.
    pub async fn wait_idle(mut self, idle: Duration) -> Result<Bytes, UtpError> {
        let mut done = self.done.take().expect("wait consumes the handle");
        let mut seen = self.progress.load(Ordering::Relaxed);
        let result = loop {
            match tokio::time::timeout(idle, &mut done).await {
                Ok(result) => break result.unwrap_or(Err(UtpError::Cancelled)),
                Err(_) => {
                    let now = self.progress.load(Ordering::Relaxed);
                    if now == seen {
                        debug!(remote = %self.remote, conn_id = self.recv_conn_id, "transfer idle, giving up");
                        self.socket.cancel().await;
                        break Ok(Bytes::new());
                    }
                    seen = now;
                }
            }
        };
        self.retire();
        result
    }

    /// Abandon the transfer now
    pub async fn cancel(mut self) {
        self.socket.cancel().await;
        self.retire();
    }

    fn retire(&mut self) {
        self.finished = true;
        if let Some(mux) = self.mux.upgrade() {
            mux.release(self.remote, self.recv_conn_id);
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let socket = self.socket.clone();
        let mux = self.mux.clone();
        let remote = self.remote;
        let recv_conn_id = self.recv_conn_id;
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                socket.cancel().await;
                if let Some(mux) = mux.upgrade() {
                    mux.release(remote, recv_conn_id);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullSession;
    use crate::utp::packet::timestamp_micros;
    use crate::utp::socket::ConnectionState;

    fn mux() -> Arc<UtpMux> {
        UtpMux::new(Arc::new(NullSession), UtpConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_connection_is_dropped() {
        let mux = mux();
        let pkt = Packet::data(77, 1, 0, Bytes::from_static(b"x"))
            .with_timestamps(timestamp_micros(), 0);
        mux.on_datagram(NodeId::random(), &pkt.encode()).await;
        assert_eq!(mux.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_dropped() {
        let mux = mux();
        mux.on_datagram(NodeId::random(), &[0xff, 0x01, 0x02]).await;
        assert_eq!(mux.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_syn_routes_to_accepting_reader() {
        let mux = mux();
        let remote = NodeId::random();
        let handle = mux.create_reader(remote, 500);
        assert_eq!(mux.active_connections(), 1);

        let syn = Packet::syn(500, 33).with_timestamps(timestamp_micros(), 0);
        mux.on_datagram(remote, &syn.encode()).await;
        assert_eq!(handle.socket().state().await, ConnectionState::Connected);
        handle.cancel().await;
        assert_eq!(mux.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_syn_from_other_peer_does_not_match() {
        let mux = mux();
        let remote = NodeId::random();
        let handle = mux.create_reader(remote, 500);

        let syn = Packet::syn(500, 33).with_timestamps(timestamp_micros(), 0);
        mux.on_datagram(NodeId::random(), &syn.encode()).await;
        assert_eq!(handle.socket().state().await, ConnectionState::Idle);
        handle.cancel().await;
    }

    #[tokio::test]
    async fn test_fresh_conn_ids_avoid_live_connections() {
        let mux = mux();
        let remote = NodeId::random();
        let _handle = mux.create_reader(remote, 500);
        for _ in 0..64 {
            let id = mux.fresh_conn_id(remote);
            assert_ne!(id, 501);
            assert_ne!(id, 500);
        }
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_the_socket() {
        let mux = mux();
        let remote = NodeId::random();
        let handle = mux.create_reader(remote, 9);
        assert_eq!(mux.active_connections(), 1);
        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mux.active_connections(), 0);
    }
}
