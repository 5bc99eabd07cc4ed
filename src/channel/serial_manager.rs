//! Serial discovery manager
//!
//! Diff-polls the OS port enumeration once per poll interval:
//!
//! - a newly enumerated port gets a [`SerialLink`] in `Waiting` (it has 3 s
//!   to open before the link reports `Failed`),
//! - a waiting link that reaches `Connected` is announced as established,
//! - a waiting link that dies is disposed quietly,
//! - an established port that drops out of the enumeration (or whose link
//!   hits an I/O failure) is closed and announced as lost.

use super::{Link, LinkEvent, LinkStatus, SerialLink};
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct SerialManager {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SerialManager {
    /// Start the enumeration poll thread. Established/lost links are
    /// announced on `events`.
    pub fn start(baud: u32, poll_interval: Duration, events: Sender<LinkEvent>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("serial-scan".to_string())
            .spawn(move || poll_loop(baud, poll_interval, events, thread_shutdown))
            .expect("failed to spawn serial scan thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    baud: u32,
    poll_interval: Duration,
    events: Sender<LinkEvent>,
    shutdown: Arc<AtomicBool>,
) {
    log::debug!("Serial scan thread started");
    let mut tracked: HashMap<String, Arc<SerialLink>> = HashMap::new();
    let mut waiting: HashSet<String> = HashSet::new();

    while !shutdown.load(Ordering::Relaxed) {
        let present = enumerate_ports();

        // New ports get a link attempt
        for name in &present {
            if !tracked.contains_key(name) {
                log::info!("Serial port appeared: {}", name);
                tracked.insert(name.clone(), SerialLink::open(name, baud));
                waiting.insert(name.clone());
            }
        }

        // Groom tracked ports
        let names: Vec<String> = tracked.keys().cloned().collect();
        for name in names {
            let link = Arc::clone(&tracked[&name]);
            if waiting.contains(&name) {
                match link.status() {
                    LinkStatus::Connected => {
                        waiting.remove(&name);
                        let _ = events.send(LinkEvent::Established(link as Arc<dyn Link>));
                    }
                    LinkStatus::Failed | LinkStatus::Closed => {
                        // Never announced; dispose quietly
                        link.close();
                        waiting.remove(&name);
                        tracked.remove(&name);
                    }
                    _ => {}
                }
            } else if !present.contains(&name) || link.status().is_terminal() {
                log::info!("Serial port lost: {}", name);
                link.close();
                let _ = events.send(LinkEvent::Lost(link.id()));
                tracked.remove(&name);
            }
        }

        thread::sleep(poll_interval);
    }

    for (_, link) in tracked {
        link.close();
    }
    log::debug!("Serial scan thread exiting");
}

/// Enumerate candidate port names.
fn enumerate_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .filter(keep_port)
            .map(|p| p.port_name)
            .collect(),
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// Windows keeps a COM name enumerable for a while after the USB device
/// behind it is gone; the device-instance metadata disappears first, so
/// intersecting with it drops the phantoms.
#[cfg(windows)]
fn keep_port(info: &serialport::SerialPortInfo) -> bool {
    !matches!(info.port_type, serialport::SerialPortType::Unknown)
}

#[cfg(not(windows))]
fn keep_port(_info: &serialport::SerialPortInfo) -> bool {
    true
}
