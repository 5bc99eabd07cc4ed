//! Device connection state machine
//!
//! Wraps one channel and decides whether an EDMO robot is on the other end.
//! Construction immediately writes a framed identification request carrying
//! the host key; a background validator gives the device 3 s to answer before
//! failing the connection and closing the channel.
//!
//! Inbound bytes run through the reframer; decoded packets are dispatched as
//! typed [`DeviceEvent`]s in reframe order. Decode failures never change the
//! connection status: the protocol is self-synchronizing, so a bad body is
//! surfaced as [`DeviceEvent::Unknown`] and parsing continues with the next
//! frame.

use crate::channel::{Link, LinkId, LinkStatus, StatusCell};
use crate::events::Signal;
use crate::protocol::packets::IdentifyReply;
use crate::protocol::{host_key, DevicePacket, FrameAssembler, HostCommand, ImuRecord, OscillatorState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// How long a device has to answer the identification request
const IDENTIFY_DEADLINE: Duration = Duration::from_secs(3);
/// Validator poll step; also bounds how quickly `Connected` is observed
const VALIDATE_TICK: Duration = Duration::from_millis(50);

/// Typed event stream of a device connection.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Device clock sample
    Time(u32),
    /// One oscillator's reported state
    Oscillation { index: u8, state: OscillatorState },
    /// Aggregate IMU record
    Imu(ImuRecord),
    /// The soft-lock flag flipped
    LockChanged(bool),
    /// Unparseable or unrecognized payload, passed through raw
    Unknown(Vec<u8>),
}

#[derive(Default)]
struct Identity {
    identifier: Option<String>,
    oscillator_count: u8,
    arm_hues: Vec<u16>,
    locked: bool,
}

pub struct DeviceConnection {
    link: Arc<dyn Link>,
    identity: Mutex<Identity>,
    /// Connection-level status; the public status() also folds in the
    /// channel's terminal states.
    own_status: StatusCell,
    assembler: Mutex<FrameAssembler>,
    events: Signal<DeviceEvent>,
    shutdown: Arc<AtomicBool>,
}

impl DeviceConnection {
    /// Wrap a channel: install the data handler, send `Identify`, start the
    /// validator.
    pub fn new(link: Arc<dyn Link>) -> Arc<Self> {
        let conn = Arc::new(Self {
            link,
            identity: Mutex::new(Identity::default()),
            own_status: StatusCell::new(LinkStatus::Waiting),
            assembler: Mutex::new(FrameAssembler::new()),
            events: Signal::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let sink: Weak<DeviceConnection> = Arc::downgrade(&conn);
        conn.link.set_data_handler(Box::new(move |bytes| {
            if let Some(conn) = sink.upgrade() {
                conn.ingest(bytes);
            }
        }));

        conn.send(&HostCommand::Identify(host_key()));

        let validated: Weak<DeviceConnection> = Arc::downgrade(&conn);
        let _ = thread::Builder::new()
            .name("device-validate".to_string())
            .spawn(move || validate_loop(validated));

        conn
    }

    /// Aggregate status: the channel's terminal state wins, otherwise the
    /// connection's own.
    pub fn status(&self) -> LinkStatus {
        match self.link.status() {
            s @ (LinkStatus::Failed | LinkStatus::Closed) => s,
            _ => self.own_status.get(),
        }
    }

    pub fn identifier(&self) -> Option<String> {
        self.identity.lock().identifier.clone()
    }

    pub fn oscillator_count(&self) -> u8 {
        self.identity.lock().oscillator_count
    }

    pub fn arm_hues(&self) -> Vec<u16> {
        self.identity.lock().arm_hues.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.identity.lock().locked
    }

    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn link_label(&self) -> String {
        self.link.label().to_string()
    }

    pub fn events(&self) -> &Signal<DeviceEvent> {
        &self.events
    }

    /// Serialize, escape, frame, and write a command through the channel.
    pub fn send(&self, command: &HostCommand) {
        self.link.write(&command.to_frame());
    }

    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.own_status.advance(LinkStatus::Closed);
        self.link.close();
    }

    /// Channel data handler: reframe, then dispatch each completed payload.
    fn ingest(&self, bytes: &[u8]) {
        let mut payloads = Vec::new();
        self.assembler.lock().push(bytes, |payload| payloads.push(payload));
        for payload in payloads {
            self.dispatch(&payload);
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        let cached_count = self.identity.lock().oscillator_count as usize;
        match DevicePacket::parse(payload, cached_count) {
            Ok(DevicePacket::Identify(reply)) => self.apply_identity(reply),
            Ok(DevicePacket::Time(time)) => self.events.emit(&DeviceEvent::Time(time)),
            Ok(DevicePacket::Motor { index, state }) => {
                self.events.emit(&DeviceEvent::Oscillation { index, state })
            }
            Ok(DevicePacket::Imu(record)) => self.events.emit(&DeviceEvent::Imu(record)),
            Ok(DevicePacket::All { time, states, imu }) => {
                self.events.emit(&DeviceEvent::Time(time));
                for (index, state) in states.into_iter().enumerate() {
                    self.events.emit(&DeviceEvent::Oscillation {
                        index: index as u8,
                        state,
                    });
                }
                self.events.emit(&DeviceEvent::Imu(imu));
            }
            Err(e) => {
                log::debug!("{}: undecodable payload ({})", self.link.label(), e);
                self.events.emit(&DeviceEvent::Unknown(payload.to_vec()));
            }
        }
    }

    fn apply_identity(&self, reply: IdentifyReply) {
        let lock_changed = {
            let mut identity = self.identity.lock();
            let changed = identity.locked != reply.locked;
            identity.oscillator_count = reply.arm_hues.len() as u8;
            identity.arm_hues = reply.arm_hues;
            identity.locked = reply.locked;
            // Identifier last: once it is visible the rest is already coherent
            identity.identifier = Some(reply.identifier);
            changed
        };
        if lock_changed {
            self.events.emit(&DeviceEvent::LockChanged(self.is_locked()));
        }
    }
}

/// Wait for the identification reply; fail the connection if it never comes.
fn validate_loop(conn: Weak<DeviceConnection>) {
    let deadline = Instant::now() + IDENTIFY_DEADLINE;
    loop {
        thread::sleep(VALIDATE_TICK);
        let Some(conn) = conn.upgrade() else { return };
        if conn.shutdown.load(Ordering::Relaxed) || conn.link.status().is_terminal() {
            return;
        }
        if conn.identifier().is_some() {
            if conn.own_status.advance(LinkStatus::Connected) {
                log::info!(
                    "Device {:?} identified on {} ({} oscillators)",
                    conn.identifier().unwrap_or_default(),
                    conn.link.label(),
                    conn.oscillator_count()
                );
            }
            return;
        }
        if Instant::now() >= deadline {
            log::info!(
                "{}: no identification within {:?}, closing",
                conn.link.label(),
                IDENTIFY_DEADLINE
            );
            conn.own_status.advance(LinkStatus::Failed);
            conn.link.close();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockLink;
    use crate::protocol::frame;

    fn identify_payload(name: &str, hues: &[u16], locked: bool) -> Vec<u8> {
        let mut payload = vec![0u8]; // tag
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.push(hues.len() as u8);
        for hue in hues {
            payload.extend_from_slice(&hue.to_le_bytes());
        }
        payload.push(locked as u8);
        payload
    }

    #[test]
    fn test_identify_command_sent_on_construction() {
        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());
        let written = link.written();
        assert_eq!(&written[..2], b"ED");
        assert_eq!(conn.status(), LinkStatus::Waiting);
    }

    #[test]
    fn test_identification_happy_path() {
        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());

        // Deliver the reply byte-by-byte to exercise chunking
        let wire = frame(&identify_payload("Snake1", &[0, 120, 240, 360], false));
        for byte in wire {
            link.inject(&[byte]);
        }

        assert_eq!(conn.identifier().as_deref(), Some("Snake1"));
        assert_eq!(conn.oscillator_count(), 4);
        assert_eq!(conn.arm_hues(), [0, 120, 240, 360]);
        assert!(!conn.is_locked());

        // The validator promotes within a tick or two
        let deadline = Instant::now() + Duration::from_secs(1);
        while conn.status() != LinkStatus::Connected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(conn.status(), LinkStatus::Connected);
    }

    #[test]
    fn test_validation_timeout_fails_and_closes() {
        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !conn.status().is_terminal() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        // Own status failed, channel closed, aggregate stays terminal
        assert_eq!(link.status(), LinkStatus::Closed);
        assert!(conn.status().is_terminal());
    }

    #[test]
    fn test_resync_then_time_event() {
        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());

        let times = Arc::new(Mutex::new(Vec::new()));
        let unknowns = Arc::new(Mutex::new(0usize));
        let t = times.clone();
        let u = unknowns.clone();
        let _sub = conn.events().connect(move |event| match event {
            DeviceEvent::Time(v) => t.lock().push(*v),
            DeviceEvent::Unknown(_) => *u.lock() += 1,
            _ => {}
        });

        // Garbage, then a GetTime frame for 0xFF
        link.inject(&[0xFF, 0xFF, 0x45, 0x44, 0x02, 0xFF, 0x00, 0x00, 0x00, 0x4D, 0x4F]);

        assert_eq!(&*times.lock(), &[0xFF]);
        assert_eq!(*unknowns.lock(), 0);
    }

    #[test]
    fn test_lock_change_fires_event() {
        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());

        let locks = Arc::new(Mutex::new(Vec::new()));
        let l = locks.clone();
        let _sub = conn.events().connect(move |event| {
            if let DeviceEvent::LockChanged(v) = event {
                l.lock().push(*v);
            }
        });

        link.inject(&frame(&identify_payload("Worm2", &[10], false)));
        link.inject(&frame(&identify_payload("Worm2", &[10], true)));
        link.inject(&frame(&identify_payload("Worm2", &[10], true)));
        link.inject(&frame(&identify_payload("Worm2", &[10], false)));

        assert_eq!(&*locks.lock(), &[true, false]);
    }

    #[test]
    fn test_aggregate_packet_fans_out() {
        use crate::protocol::packets::{OscillatorParams, TAG_ALL_DATA};

        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());
        link.inject(&frame(&identify_payload("Snake1", &[0, 120], false)));

        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let _sub = conn.events().connect(move |event| {
            e.lock().push(match event {
                DeviceEvent::Time(_) => "time",
                DeviceEvent::Oscillation { .. } => "osc",
                DeviceEvent::Imu(_) => "imu",
                DeviceEvent::LockChanged(_) => "lock",
                DeviceEvent::Unknown(_) => "unknown",
            });
        });

        let mut payload = vec![TAG_ALL_DATA];
        payload.extend_from_slice(&42u32.to_le_bytes());
        for _ in 0..2 {
            OscillatorState {
                params: OscillatorParams::default(),
                phase: 0.0,
            }
            .write_to(&mut payload);
        }
        ImuRecord::default().write_to(&mut payload);
        link.inject(&frame(&payload));

        assert_eq!(&*events.lock(), &["time", "osc", "osc", "imu"]);
    }

    #[test]
    fn test_malformed_payload_is_surfaced_not_fatal() {
        let link = MockLink::connected("mock0");
        let conn = DeviceConnection::new(link.clone());

        let unknowns = Arc::new(Mutex::new(Vec::new()));
        let u = unknowns.clone();
        let _sub = conn.events().connect(move |event| {
            if let DeviceEvent::Unknown(bytes) = event {
                u.lock().push(bytes.clone());
            }
        });

        // Truncated time body
        link.inject(&frame(&[0x02, 0x01]));
        assert_eq!(&*unknowns.lock(), &[vec![0x02, 0x01]]);
        assert_eq!(conn.status(), LinkStatus::Waiting);
    }
}
