//! Transport channels
//!
//! A [`Link`] is the uniform duplex byte pipe both transport managers mint:
//! a status observable, a fire-and-forget write, a chunked inbound-data
//! handler, and an idempotent close. No framing is assumed at this layer;
//! the device connection reassembles frames on top.
//!
//! Contract highlights:
//! - inbound delivery is serialized per link (one I/O thread per serial link,
//!   one receive thread for all UDP links),
//! - `write` on a terminal link is a silent no-op,
//! - status only moves forward; `Failed` and `Closed` are final.

mod mock;
mod serial;
mod serial_manager;
mod udp;
mod udp_manager;

pub use mock::MockLink;
pub use serial::SerialLink;
pub use serial_manager::SerialManager;
pub use udp::UdpLink;
pub use udp_manager::{UdpManager, UdpManagerConfig};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique channel identity.
pub type LinkId = u64;

pub(crate) fn next_link_id() -> LinkId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a channel (and, by projection, of a device connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Waiting,
    Connected,
    Failed,
    Closed,
}

impl LinkStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Failed | LinkStatus::Closed)
    }
}

/// Handler for inbound byte chunks. Chunks are contiguous and possibly
/// partial; delivery is serialized per link.
pub type DataHandler = Box<dyn FnMut(&[u8]) + Send>;

/// The channel capability.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    /// Human-readable endpoint name (port path or peer address).
    fn label(&self) -> &str;

    fn status(&self) -> LinkStatus;

    /// Queue bytes for transmission. Silent no-op once the link is terminal;
    /// transport errors demote the link rather than surfacing here.
    fn write(&self, bytes: &[u8]);

    /// Install the inbound-data handler, replacing any previous one.
    fn set_data_handler(&self, handler: DataHandler);

    /// Idempotent; the link reports `Closed` afterwards.
    fn close(&self);
}

/// Lifecycle announcements from a transport manager.
pub enum LinkEvent {
    /// A channel reached `Connected` and is ready to be wrapped.
    Established(Arc<dyn Link>),
    /// A previously announced channel is gone.
    Lost(LinkId),
}

/// Monotonic status holder shared by the link implementations.
pub(crate) struct StatusCell {
    inner: Mutex<LinkStatus>,
}

impl StatusCell {
    pub fn new(initial: LinkStatus) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> LinkStatus {
        *self.inner.lock()
    }

    /// Move to `to` unless already terminal. Returns true if the status
    /// actually changed.
    pub fn advance(&self, to: LinkStatus) -> bool {
        let mut status = self.inner.lock();
        if status.is_terminal() || *status == to {
            return false;
        }
        *status = to;
        true
    }
}
