//! The framed EDMO wire protocol: delimiters + escape codec + typed packets.

pub mod framing;
pub mod packets;

pub use framing::{frame, FrameAssembler};
pub use packets::{
    DevicePacket, HostCommand, IdentifyReply, ImuRecord, OscillatorParams, OscillatorState, Quat,
    SensorSample, Vec3,
};

use std::sync::OnceLock;
use uuid::Uuid;

/// The process-wide host identity.
///
/// Sent as the `Identify` body and used by devices as the soft-lock key, so a
/// restarted poll from the same process re-takes its own lock while a second
/// host is refused. Minted once, on first use.
pub fn host_key() -> Uuid {
    static KEY: OnceLock<Uuid> = OnceLock::new();
    *KEY.get_or_init(Uuid::new_v4)
}
