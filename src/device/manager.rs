//! Connection manager
//!
//! Composes the serial and UDP discovery managers and turns their channel
//! lifecycle into a device directory:
//!
//! - every established channel is wrapped in a [`DeviceConnection`] (which
//!   immediately challenges it to identify),
//! - a grooming tick promotes identified connections into fused devices and
//!   disposes the ones that failed validation,
//! - channel losses unwind the affected connection, destroying the fused
//!   device when its last member departs.
//!
//! The UDP manager's poll message is the same framed identification request a
//! wrapped channel would send, so devices answer the broadcast directly.

use super::connection::{DeviceConnection, DeviceEvent};
use super::fused::FusedDevice;
use crate::channel::{LinkEvent, LinkId, LinkStatus, SerialManager, UdpManager, UdpManagerConfig};
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::events::Subscription;
use crate::protocol::{host_key, HostCommand};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Device directory announcements, consumed by the session manager.
pub enum DirectoryEvent {
    /// First connection for this identifier went live
    Connected(Arc<FusedDevice>),
    /// Last connection for this identifier is gone
    Lost(String),
    /// The device's soft-lock flag flipped
    LockChanged { identifier: String, locked: bool },
}

/// Cadence of the waiting-list grooming pass
const GROOM_INTERVAL: Duration = Duration::from_secs(1);

pub struct ConnectionManager {
    shutdown: Arc<AtomicBool>,
    tick_handle: Option<JoinHandle<()>>,
    serial: SerialManager,
    udp: UdpManager,
}

impl ConnectionManager {
    /// Start discovery on both transports. Directory events are delivered on
    /// the returned receiver.
    pub fn start(config: &DiscoveryConfig) -> Result<(Self, Receiver<DirectoryEvent>)> {
        let (link_tx, link_rx) = bounded::<LinkEvent>(64);
        let (dir_tx, dir_rx) = bounded::<DirectoryEvent>(64);

        let serial = SerialManager::start(
            config.serial_baud,
            config.poll_interval(),
            link_tx.clone(),
        );
        let udp = UdpManager::start(
            UdpManagerConfig {
                device_port: config.udp_port,
                poll_message: HostCommand::Identify(host_key()).to_frame(),
                poll_interval: config.poll_interval(),
                inactivity_timeout: config.udp_inactivity_timeout(),
            },
            link_tx,
        )?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let tick_shutdown = Arc::clone(&shutdown);
        let tick_handle = thread::Builder::new()
            .name("device-directory".to_string())
            .spawn(move || directory_loop(link_rx, dir_tx, tick_shutdown))?;

        Ok((
            Self {
                shutdown,
                tick_handle: Some(tick_handle),
                serial,
                udp,
            },
            dir_rx,
        ))
    }

    pub fn stop(&mut self) {
        // Transports first, so no new channels arrive while unwinding
        self.serial.stop();
        self.udp.stop();
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.tick_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Directory {
    events: Sender<DirectoryEvent>,
    /// Connections still proving themselves
    waiting: Vec<Arc<DeviceConnection>>,
    /// Every live connection, keyed by its channel
    by_link: HashMap<LinkId, Arc<DeviceConnection>>,
    /// Fused devices keyed by identifier, with their lock-watch subscriptions
    fused: HashMap<String, (Arc<FusedDevice>, Subscription)>,
}

fn directory_loop(
    links: Receiver<LinkEvent>,
    events: Sender<DirectoryEvent>,
    shutdown: Arc<AtomicBool>,
) {
    log::debug!("Device directory thread started");
    let mut directory = Directory {
        events,
        waiting: Vec::new(),
        by_link: HashMap::new(),
        fused: HashMap::new(),
    };
    let mut next_groom = Instant::now() + GROOM_INTERVAL;

    while !shutdown.load(Ordering::Relaxed) {
        let wait = next_groom
            .saturating_duration_since(Instant::now())
            .min(Duration::from_millis(200));
        match links.recv_timeout(wait) {
            Ok(LinkEvent::Established(link)) => {
                log::info!("Channel established: {}", link.label());
                let connection = DeviceConnection::new(link);
                directory.by_link.insert(connection.link_id(), Arc::clone(&connection));
                directory.waiting.push(connection);
            }
            Ok(LinkEvent::Lost(link_id)) => directory.channel_lost(link_id),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_groom {
            directory.groom();
            next_groom = Instant::now() + GROOM_INTERVAL;
        }
    }

    // Unwind everything still live
    for (_, connection) in directory.by_link.drain() {
        connection.close();
    }
    log::debug!("Device directory thread exiting");
}

impl Directory {
    /// Age the waiting list: promote the identified, drop the dead.
    fn groom(&mut self) {
        let pending = std::mem::take(&mut self.waiting);
        for connection in pending {
            match connection.status() {
                LinkStatus::Connected => self.fuse(connection),
                LinkStatus::Failed | LinkStatus::Closed => {
                    self.by_link.remove(&connection.link_id());
                    connection.close();
                }
                _ => self.waiting.push(connection),
            }
        }
    }

    /// Insert an identified connection into its fused device, creating the
    /// device (and announcing it) on first sight of the identifier.
    fn fuse(&mut self, connection: Arc<DeviceConnection>) {
        let Some(identifier) = connection.identifier() else {
            // Connected implies an identifier; treat the contrary as a dead race
            self.by_link.remove(&connection.link_id());
            connection.close();
            return;
        };
        if let Some((fused, _)) = self.fused.get(&identifier) {
            fused.add(connection);
            return;
        }

        let fused = FusedDevice::new(&identifier);
        fused.add(connection);
        let watch = {
            let events = self.events.clone();
            let identifier = identifier.clone();
            fused.events().connect(move |event| {
                if let DeviceEvent::LockChanged(locked) = event {
                    let _ = events.send(DirectoryEvent::LockChanged {
                        identifier: identifier.clone(),
                        locked: *locked,
                    });
                }
            })
        };
        self.fused
            .insert(identifier.clone(), (Arc::clone(&fused), watch));
        log::info!("Device connected: {:?}", identifier);
        let _ = self.events.send(DirectoryEvent::Connected(fused));
    }

    fn channel_lost(&mut self, link_id: LinkId) {
        let Some(connection) = self.by_link.remove(&link_id) else {
            return;
        };
        log::info!("Channel lost: {}", connection.link_label());
        self.waiting.retain(|c| !Arc::ptr_eq(c, &connection));
        connection.close();

        let Some(identifier) = connection.identifier() else {
            return;
        };
        let Some((fused, _)) = self.fused.get(&identifier) else {
            return;
        };
        let fused = Arc::clone(fused);
        if fused.remove(&connection) {
            self.fused.remove(&identifier);
            log::info!("Device lost: {:?}", identifier);
            let _ = self.events.send(DirectoryEvent::Lost(identifier));
        }
    }
}
