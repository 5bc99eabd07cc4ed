//! UDP discovery manager
//!
//! One broadcast-enabled socket, bound to an ephemeral port, serves every
//! UDP link. Two threads:
//!
//! - **poll**: every poll interval, send the configured poll message to the
//!   directed broadcast address of each non-loopback IPv4 interface, and
//!   expire links whose peers have gone silent;
//! - **receive**: dispatch each inbound datagram to its per-peer link,
//!   minting (and announcing) a new link on first sight of a peer.
//!
//! Discovery is broadcast-only: EDMO robots sit on the same L2 segment as
//! the host, and routed discovery is out of scope.

use super::{Link, LinkEvent, UdpLink};
use crate::error::Result;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receive timeout; bounds shutdown latency of the receive thread
const RECV_TIMEOUT: Duration = Duration::from_millis(200);
/// Largest datagram we accept; EDMO frames are far smaller
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone)]
pub struct UdpManagerConfig {
    /// Destination port for discovery broadcasts (the port devices listen on)
    pub device_port: u16,
    /// Bytes broadcast every poll tick (a pre-framed identification request)
    pub poll_message: Vec<u8>,
    /// Broadcast cadence
    pub poll_interval: Duration,
    /// How long a peer may stay silent before its link is expired
    pub inactivity_timeout: Duration,
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, Arc<UdpLink>>>>;

pub struct UdpManager {
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
    poll_handle: Option<JoinHandle<()>>,
    recv_handle: Option<JoinHandle<()>>,
}

impl UdpManager {
    /// Bind the shared socket and start the poll and receive threads.
    /// Established/lost links are announced on `events`.
    pub fn start(config: UdpManagerConfig, events: Sender<LinkEvent>) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let socket = Arc::new(socket);
        log::info!(
            "UDP discovery socket bound to {} (polling port {})",
            socket.local_addr()?,
            config.device_port
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));

        let poll_handle = {
            let socket = Arc::clone(&socket);
            let shutdown = Arc::clone(&shutdown);
            let peers = Arc::clone(&peers);
            let events = events.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("udp-poll".to_string())
                .spawn(move || poll_loop(socket, shutdown, peers, events, config))?
        };

        let recv_handle = {
            let socket = Arc::clone(&socket);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("udp-recv".to_string())
                .spawn(move || recv_loop(socket, shutdown, peers, events))?
        };

        Ok(Self {
            socket,
            shutdown,
            poll_handle: Some(poll_handle),
            recv_handle: Some(recv_handle),
        })
    }

    /// Local address of the shared discovery socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.recv_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Directed broadcast address of every non-loopback IPv4 interface:
/// unicast address with the host bits forced to one.
fn broadcast_endpoints(port: u16) -> Vec<SocketAddr> {
    let mut endpoints = Vec::new();
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces {
                if interface.is_loopback() {
                    continue;
                }
                if let if_addrs::IfAddr::V4(v4) = interface.addr {
                    let ip = u32::from(v4.ip);
                    let mask = u32::from(v4.netmask);
                    let broadcast = Ipv4Addr::from(ip | !mask);
                    endpoints.push(SocketAddr::from((broadcast, port)));
                }
            }
        }
        Err(e) => log::warn!("Interface enumeration failed: {}", e),
    }
    endpoints
}

fn poll_loop(
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
    peers: PeerMap,
    events: Sender<LinkEvent>,
    config: UdpManagerConfig,
) {
    log::debug!("UDP poll thread started");
    while !shutdown.load(Ordering::Relaxed) {
        for endpoint in broadcast_endpoints(config.device_port) {
            if let Err(e) = socket.send_to(&config.poll_message, endpoint) {
                // Some interfaces (VPN tunnels, link-local) refuse broadcast;
                // they are recomputed and skipped again next tick.
                log::debug!("Broadcast to {} failed: {}", endpoint, e);
            }
        }

        // Sweep silent peers, plus links a failed write already demoted
        let swept: Vec<Arc<UdpLink>> = {
            let mut peers = peers.lock();
            let dead: Vec<SocketAddr> = peers
                .iter()
                .filter(|(_, link)| {
                    link.expired(config.inactivity_timeout) || link.status().is_terminal()
                })
                .map(|(addr, _)| *addr)
                .collect();
            dead.iter().filter_map(|addr| peers.remove(addr)).collect()
        };
        for link in swept {
            link.expire();
            let _ = events.send(LinkEvent::Lost(link.id()));
        }

        thread::sleep(config.poll_interval);
    }
    log::debug!("UDP poll thread exiting");
}

fn recv_loop(
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
    peers: PeerMap,
    events: Sender<LinkEvent>,
) {
    log::debug!("UDP receive thread started");
    let mut buf = [0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let link = {
                    let mut peers = peers.lock();
                    let live = peers
                        .get(&peer)
                        .filter(|link| !link.status().is_terminal())
                        .cloned();
                    match live {
                        Some(link) => link,
                        None => {
                            let link = UdpLink::new(Arc::clone(&socket), peer);
                            peers.insert(peer, Arc::clone(&link));
                            log::info!("UDP peer discovered: {}", peer);
                            let _ =
                                events.send(LinkEvent::Established(Arc::clone(&link) as Arc<dyn Link>));
                            link
                        }
                    }
                };
                link.ingest(&buf[..n]);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("UDP receive error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    log::debug!("UDP receive thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LinkStatus;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_datagrams_demultiplex_by_peer() {
        let (tx, rx) = unbounded();
        let config = UdpManagerConfig {
            device_port: 1, // nothing is polled at port 1 on loopback tests
            poll_message: Vec::new(),
            poll_interval: Duration::from_millis(50),
            inactivity_timeout: Duration::from_secs(10),
        };
        let mut manager = UdpManager::start(config, tx).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], manager.local_addr().unwrap().port()));

        let peer_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer_a.send_to(b"one", target).unwrap();
        peer_a.send_to(b"two", target).unwrap();
        peer_b.send_to(b"three", target).unwrap();

        // Two distinct peers, two Established announcements; the repeat
        // datagram from peer A reuses its link.
        let mut established = 0;
        for _ in 0..2 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                LinkEvent::Established(link) => {
                    assert_eq!(link.status(), LinkStatus::Connected);
                    established += 1;
                }
                LinkEvent::Lost(_) => panic!("unexpected loss"),
            }
        }
        assert_eq!(established, 2);
        assert!(rx.try_recv().is_err());
        manager.stop();
    }

    #[test]
    fn test_broadcast_endpoint_math() {
        // 192.168.1.57/24 -> 192.168.1.255
        let ip = u32::from(Ipv4Addr::new(192, 168, 1, 57));
        let mask = u32::from(Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(Ipv4Addr::from(ip | !mask), Ipv4Addr::new(192, 168, 1, 255));

        // 10.0.5.9/16 -> 10.0.255.255
        let ip = u32::from(Ipv4Addr::new(10, 0, 5, 9));
        let mask = u32::from(Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(Ipv4Addr::from(ip | !mask), Ipv4Addr::new(10, 0, 255, 255));
    }
}
