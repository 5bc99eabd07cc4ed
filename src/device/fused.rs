//! Fused device
//!
//! A robot reachable over both serial and UDP is still one robot. The fused
//! device groups every live connection that identified with the same
//! identifier, keeps the first-inserted survivor as the active one, and
//! forwards the active connection's typed events to its own subscribers.
//! When the active member is removed, the next in insertion order is promoted
//! and rebound atomically, so subscribers never see a gap or a duplicate
//! handler.
//!
//! The fused device owns no channel: members belong to the connection
//! manager, which mutates membership under its own tick.

use super::connection::{DeviceConnection, DeviceEvent};
use crate::events::{Signal, Subscription};
use crate::protocol::HostCommand;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct Members {
    /// Insertion-ordered; index 0 is the active connection
    list: Vec<Arc<DeviceConnection>>,
    /// Event forwarding bound to the active member; at most one at a time
    forward: Option<Subscription>,
}

pub struct FusedDevice {
    identifier: String,
    members: Mutex<Members>,
    events: Signal<DeviceEvent>,
}

impl FusedDevice {
    pub fn new(identifier: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            members: Mutex::new(Members {
                list: Vec::new(),
                forward: None,
            }),
            events: Signal::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Forwarded event stream of whichever member is active.
    pub fn events(&self) -> &Signal<DeviceEvent> {
        &self.events
    }

    /// Append a member; the first member becomes active and gets the event
    /// forwarding bound to it.
    pub fn add(self: &Arc<Self>, connection: Arc<DeviceConnection>) {
        let mut members = self.members.lock();
        let was_empty = members.list.is_empty();
        members.list.push(Arc::clone(&connection));
        if was_empty {
            members.forward = Some(self.bind(&connection));
            log::info!(
                "Device {:?}: active connection is {}",
                self.identifier,
                connection.link_label()
            );
        } else {
            log::info!(
                "Device {:?}: standby connection via {}",
                self.identifier,
                connection.link_label()
            );
        }
    }

    /// Remove a member. If it was the active one, promote the next in line.
    /// Returns true when no member remains.
    pub fn remove(self: &Arc<Self>, connection: &Arc<DeviceConnection>) -> bool {
        let mut members = self.members.lock();
        let Some(at) = members
            .list
            .iter()
            .position(|m| Arc::ptr_eq(m, connection))
        else {
            return members.list.is_empty();
        };
        members.list.remove(at);
        if at == 0 {
            members.forward = None;
            if let Some(next) = members.list.first().cloned() {
                members.forward = Some(self.bind(&next));
                log::info!(
                    "Device {:?}: failed over to {}",
                    self.identifier,
                    next.link_label()
                );
            }
        }
        members.list.is_empty()
    }

    fn bind(self: &Arc<Self>, connection: &Arc<DeviceConnection>) -> Subscription {
        let fused: Weak<FusedDevice> = Arc::downgrade(self);
        connection.events().connect(move |event| {
            if let Some(fused) = fused.upgrade() {
                fused.events.emit(event);
            }
        })
    }

    fn active(&self) -> Option<Arc<DeviceConnection>> {
        self.members.lock().list.first().cloned()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().list.is_empty()
    }

    // Projections from the active member; inert defaults with no members.

    pub fn oscillator_count(&self) -> u8 {
        self.active().map(|c| c.oscillator_count()).unwrap_or(0)
    }

    pub fn arm_hues(&self) -> Vec<u16> {
        self.active().map(|c| c.arm_hues()).unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        self.active().map(|c| c.is_locked()).unwrap_or(false)
    }

    /// Write through the active member; silent no-op with no members.
    pub fn send(&self, command: &HostCommand) {
        if let Some(active) = self.active() {
            active.send(command);
        }
    }
}
