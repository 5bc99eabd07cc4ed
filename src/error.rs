//! Error types for the EDMO hub
//!
//! # Error Recovery Strategies
//!
//! Different error classes require different handling:
//!
//! ## Protocol Errors (Log and Continue)
//!
//! - **`MalformedPayload`**: A decoded frame body did not match the expected
//!   layout for its tag. Never fatal: the framed protocol is self-synchronizing,
//!   so the connection surfaces the raw bytes as an unknown packet and keeps
//!   parsing subsequent frames.
//!
//! ## Transport Errors (Demote the Channel)
//!
//! - **`Serial`** / **`Io`** / **`ChannelIo`**: The underlying transport broke.
//!   The owning channel transitions to `Failed` or `Closed`; its manager removes
//!   it on the next grooming tick and a fused device fails over to another
//!   channel if one exists.
//!
//! - **`ValidationTimeout`**: A freshly established channel did not answer the
//!   identification request within the deadline. The channel is closed and
//!   forgotten; this is routine for serial ports that are not EDMO devices.
//!
//! ## Admission Errors (Contractual, Returned to Caller)
//!
//! - **`SessionClosed`**, **`SessionFull`**, **`NoSuchSession`**,
//!   **`LockedByOtherHost`**: the session manager's admission API returns these
//!   directly; the operator frontend decides how to present them.
//!
//! ## Configuration Errors (Fix and Restart)
//!
//! - **`Config`**: the TOML configuration is missing or invalid.

use thiserror::Error;

/// Errors that can occur in the EDMO hub
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Channel I/O failure: {0}")]
    ChannelIo(String),

    #[error("Device did not identify within the deadline")]
    ValidationTimeout,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Session has no free controller slot")]
    SessionFull,

    #[error("No session candidate named {0:?}")]
    NoSuchSession(String),

    #[error("Device {0:?} is locked by another host")]
    LockedByOtherHost(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Thread panic")]
    ThreadPanic,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a `MalformedPayload` carrying an expected/actual length pair.
    pub(crate) fn short_payload(what: &str, expected: usize, actual: usize) -> Self {
        Error::MalformedPayload(format!(
            "{}: expected {} bytes, got {}",
            what, expected, actual
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
