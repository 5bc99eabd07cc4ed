//! Serial channel
//!
//! Opens a named OS serial port at the configured baud (8-N-1, no flow
//! control) with DTR asserted. Several EDMO boards treat a DTR drop as a
//! reset request, so the line is raised immediately after open and held.
//!
//! Opening is retried on recoverable access errors: udev rules and USB
//! enumeration routinely make a port visible a moment before it is openable.

use super::{next_link_id, DataHandler, Link, LinkId, LinkStatus, StatusCell};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Retry cadence while the port refuses to open
const OPEN_RETRY: Duration = Duration::from_millis(500);
/// Give up opening after this long and report `Failed`
const OPEN_DEADLINE: Duration = Duration::from_secs(3);
/// Read timeout; bounds both delivery latency and close() latency
const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub struct SerialLink {
    id: LinkId,
    label: String,
    status: StatusCell,
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    handler: Arc<Mutex<Option<DataHandler>>>,
    shutdown: Arc<AtomicBool>,
    io_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialLink {
    /// Start opening `port_name`; returns immediately in `Waiting`.
    pub fn open(port_name: &str, baud: u32) -> Arc<Self> {
        let link = Arc::new(Self {
            id: next_link_id(),
            label: port_name.to_string(),
            status: StatusCell::new(LinkStatus::Waiting),
            port: Arc::new(Mutex::new(None)),
            handler: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
            io_handle: Mutex::new(None),
        });

        let io_link = Arc::clone(&link);
        let handle = thread::Builder::new()
            .name(format!("serial-{}", port_name.replace('/', "_")))
            .spawn(move || io_link.io_loop(baud))
            .expect("failed to spawn serial I/O thread");
        *link.io_handle.lock() = Some(handle);

        link
    }

    fn io_loop(&self, baud: u32) {
        if !self.connect(baud) {
            return;
        }
        self.read_loop();
    }

    /// Open the port, retrying within the deadline. Returns false on failure.
    fn connect(&self, baud: u32) -> bool {
        let deadline = Instant::now() + OPEN_DEADLINE;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            match serialport::new(&self.label, baud)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(READ_TIMEOUT)
                .open()
            {
                Ok(mut port) => {
                    if let Err(e) = port.write_data_terminal_ready(true) {
                        log::warn!("{}: failed to assert DTR: {}", self.label, e);
                    }
                    *self.port.lock() = Some(port);
                    if self.status.advance(LinkStatus::Connected) {
                        log::info!("Serial port {} open at {} baud", self.label, baud);
                    }
                    return true;
                }
                Err(e) if Instant::now() + OPEN_RETRY < deadline => {
                    log::debug!("{}: open failed ({}), retrying", self.label, e);
                    thread::sleep(OPEN_RETRY);
                }
                Err(e) => {
                    log::info!("{}: giving up after {:?}: {}", self.label, OPEN_DEADLINE, e);
                    self.status.advance(LinkStatus::Failed);
                    return false;
                }
            }
        }
    }

    fn read_loop(&self) {
        let mut buf = [0u8; 256];
        while !self.shutdown.load(Ordering::Relaxed) {
            let read = {
                let mut port = self.port.lock();
                let Some(port) = port.as_mut() else { break };
                port.read(&mut buf)
            };
            match read {
                Ok(0) => {}
                Ok(n) => {
                    let mut handler = self.handler.lock();
                    if let Some(handler) = handler.as_mut() {
                        handler(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::warn!("{}: read error: {}", self.label, e);
                    self.status.advance(LinkStatus::Failed);
                    break;
                }
            }
        }
        log::debug!("{}: I/O thread exiting", self.label);
    }
}

impl Link for SerialLink {
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
        let mut port = self.port.lock();
        if let Some(port) = port.as_mut() {
            if let Err(e) = port.write_all(bytes) {
                log::warn!("{}: write error: {}", self.label, e);
                self.status.advance(LinkStatus::Failed);
            }
        }
    }

    fn set_data_handler(&self, handler: DataHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn close(&self) {
        self.status.advance(LinkStatus::Closed);
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.io_handle.lock().take() {
            let _ = handle.join();
        }
    }
}
