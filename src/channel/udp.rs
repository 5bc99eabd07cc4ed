//! Per-peer UDP channel
//!
//! UDP links are minted by the manager when a datagram arrives from an
//! unknown peer, and all of them share the manager's one socket. A link is
//! `Connected` from birth (it exists because the peer just spoke) and decays
//! to `Closed` when the peer stays silent past the inactivity timeout; a
//! later datagram from the same peer gets a fresh link.

use super::{next_link_id, DataHandler, Link, LinkId, LinkStatus, StatusCell};
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct UdpLink {
    id: LinkId,
    label: String,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    status: StatusCell,
    handler: Mutex<Option<DataHandler>>,
    last_rx: Mutex<Instant>,
}

impl UdpLink {
    pub(crate) fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id: next_link_id(),
            label: format!("udp:{}", peer),
            peer,
            socket,
            status: StatusCell::new(LinkStatus::Connected),
            handler: Mutex::new(None),
            last_rx: Mutex::new(Instant::now()),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Deliver one inbound datagram (called from the manager's receive loop).
    pub(crate) fn ingest(&self, bytes: &[u8]) {
        *self.last_rx.lock() = Instant::now();
        let mut handler = self.handler.lock();
        if let Some(handler) = handler.as_mut() {
            handler(bytes);
        }
    }

    /// True once nothing has arrived for `timeout`.
    pub(crate) fn expired(&self, timeout: Duration) -> bool {
        self.last_rx.lock().elapsed() > timeout
    }

    /// Inactivity expiry: report `Closed` (not `Failed`; the peer may well
    /// come back, as a new link).
    pub(crate) fn expire(&self) {
        if self.status.advance(LinkStatus::Closed) {
            log::info!("{}: inactive, closing", self.label);
        }
    }
}

impl Link for UdpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn status(&self) -> LinkStatus {
        self.status.get()
    }

    fn write(&self, bytes: &[u8]) {
        if self.status.get().is_terminal() {
            return;
        }
        if let Err(e) = self.socket.send_to(bytes, self.peer) {
            log::warn!("{}: send error: {}", self.label, e);
            self.status.advance(LinkStatus::Failed);
        }
    }

    fn set_data_handler(&self, handler: DataHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn close(&self) {
        self.status.advance(LinkStatus::Closed);
    }
}
