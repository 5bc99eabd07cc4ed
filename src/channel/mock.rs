//! In-memory channel for unit tests

use super::{next_link_id, DataHandler, Link, LinkId, LinkStatus, StatusCell};
use parking_lot::Mutex;
use std::sync::Arc;

/// Test double for a transport channel.
///
/// Tests inject inbound bytes with [`MockLink::inject`] (delivered to the
/// installed handler on the calling thread, mirroring the serialized-delivery
/// contract) and inspect everything the code under test wrote.
pub struct MockLink {
    id: LinkId,
    label: String,
    status: StatusCell,
    handler: Mutex<Option<DataHandler>>,
    written: Mutex<Vec<u8>>,
}

impl MockLink {
    /// A link that is already `Connected`.
    pub fn connected(label: &str) -> Arc<Self> {
        Arc::new(Self {
            id: next_link_id(),
            label: label.to_string(),
            status: StatusCell::new(LinkStatus::Connected),
            handler: Mutex::new(None),
            written: Mutex::new(Vec::new()),
        })
    }

    /// Deliver inbound bytes to the installed handler.
    pub fn inject(&self, bytes: &[u8]) {
        let mut handler = self.handler.lock();
        if let Some(handler) = handler.as_mut() {
            handler(bytes);
        }
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// Drain and return everything written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.written.lock())
    }

    /// Simulate a transport failure.
    pub fn fail(&self) {
        self.status.advance(LinkStatus::Failed);
    }
}

impl Link for MockLink {
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
        self.written.lock().extend_from_slice(bytes);
    }

    fn set_data_handler(&self, handler: DataHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn close(&self) {
        self.status.advance(LinkStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_noop_when_terminal() {
        let link = MockLink::connected("mock0");
        link.write(b"abc");
        link.close();
        link.write(b"def");
        assert_eq!(link.written(), b"abc");
    }

    #[test]
    fn test_inject_reaches_handler() {
        let link = MockLink::connected("mock0");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        link.set_data_handler(Box::new(move |bytes| {
            sink.lock().extend_from_slice(bytes);
        }));
        link.inject(b"xy");
        link.inject(b"z");
        assert_eq!(&*seen.lock(), b"xyz");
    }
}
