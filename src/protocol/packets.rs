//! Typed packet layouts
//!
//! All multi-byte fields are little-endian; floats are IEEE-754 binary32.
//! Fixed-layout parses demand an exact body length and fail with
//! [`Error::MalformedPayload`] otherwise; a mismatched body is surfaced by
//! the connection as an unknown packet, never as a status change.
//!
//! Sensor samples carry 3 bytes of padding between `accuracy` and the data
//! block; the padding is part of the wire layout and is preserved on both
//! paths.

use crate::error::{Error, Result};
use uuid::Uuid;

// Packet tags (first unescaped payload byte)
pub const TAG_IDENTIFY: u8 = 0;
pub const TAG_SESSION_START: u8 = 1;
pub const TAG_GET_TIME: u8 = 2;
pub const TAG_UPDATE_OSCILLATOR: u8 = 3;
pub const TAG_MOTOR_DATA: u8 = 4;
pub const TAG_IMU_DATA: u8 = 5;
pub const TAG_SESSION_END: u8 = 6;
pub const TAG_ALL_DATA: u8 = 69;

/// Host-side default for a freshly allocated or reset oscillator.
///
/// Offset defaults to 90 so an idle arm centers its sweep; everything else
/// starts at zero.
pub const DEFAULT_OFFSET: f32 = 90.0;

// ============================================================================
// Oscillator parameters and state
// ============================================================================

/// The four host-settable oscillator parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillatorParams {
    pub frequency: f32,
    pub amplitude: f32,
    pub offset: f32,
    pub phase_shift: f32,
}

impl OscillatorParams {
    pub const WIRE_SIZE: usize = 16;

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.frequency.to_le_bytes());
        out.extend_from_slice(&self.amplitude.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.phase_shift.to_le_bytes());
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != Self::WIRE_SIZE {
            return Err(Error::short_payload(
                "oscillator params",
                Self::WIRE_SIZE,
                body.len(),
            ));
        }
        Ok(Self {
            frequency: f32_at(body, 0),
            amplitude: f32_at(body, 4),
            offset: f32_at(body, 8),
            phase_shift: f32_at(body, 12),
        })
    }
}

impl Default for OscillatorParams {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            amplitude: 0.0,
            offset: DEFAULT_OFFSET,
            phase_shift: 0.0,
        }
    }
}

/// Parameters plus the instantaneous phase the device reports back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillatorState {
    pub params: OscillatorParams,
    pub phase: f32,
}

impl OscillatorState {
    pub const WIRE_SIZE: usize = OscillatorParams::WIRE_SIZE + 4;

    pub fn write_to(&self, out: &mut Vec<u8>) {
        self.params.write_to(out);
        out.extend_from_slice(&self.phase.to_le_bytes());
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != Self::WIRE_SIZE {
            return Err(Error::short_payload(
                "oscillator state",
                Self::WIRE_SIZE,
                body.len(),
            ));
        }
        Ok(Self {
            params: OscillatorParams::parse(&body[..OscillatorParams::WIRE_SIZE])?,
            phase: f32_at(body, 16),
        })
    }
}

// ============================================================================
// IMU record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// One IMU modality reading: device timestamp, accuracy grade, data block.
///
/// The 3 padding bytes after `accuracy` come from the device firmware's
/// natural struct alignment; they are written as zero and skipped on parse.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorSample<T> {
    pub timestamp: u32,
    pub accuracy: u8,
    pub data: T,
}

const SAMPLE_HEADER_SIZE: usize = 8; // u32 timestamp + u8 accuracy + 3 pad

impl SensorSample<Vec3> {
    pub const WIRE_SIZE: usize = SAMPLE_HEADER_SIZE + 12;

    fn write_to(&self, out: &mut Vec<u8>) {
        write_sample_header(out, self.timestamp, self.accuracy);
        out.extend_from_slice(&self.data.x.to_le_bytes());
        out.extend_from_slice(&self.data.y.to_le_bytes());
        out.extend_from_slice(&self.data.z.to_le_bytes());
    }

    fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != Self::WIRE_SIZE {
            return Err(Error::short_payload("vec3 sample", Self::WIRE_SIZE, body.len()));
        }
        Ok(Self {
            timestamp: u32_at(body, 0),
            accuracy: body[4],
            data: Vec3 {
                x: f32_at(body, 8),
                y: f32_at(body, 12),
                z: f32_at(body, 16),
            },
        })
    }
}

impl SensorSample<Quat> {
    pub const WIRE_SIZE: usize = SAMPLE_HEADER_SIZE + 16;

    fn write_to(&self, out: &mut Vec<u8>) {
        write_sample_header(out, self.timestamp, self.accuracy);
        out.extend_from_slice(&self.data.x.to_le_bytes());
        out.extend_from_slice(&self.data.y.to_le_bytes());
        out.extend_from_slice(&self.data.z.to_le_bytes());
        out.extend_from_slice(&self.data.w.to_le_bytes());
    }

    fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != Self::WIRE_SIZE {
            return Err(Error::short_payload("quat sample", Self::WIRE_SIZE, body.len()));
        }
        Ok(Self {
            timestamp: u32_at(body, 0),
            accuracy: body[4],
            data: Quat {
                x: f32_at(body, 8),
                y: f32_at(body, 12),
                z: f32_at(body, 16),
                w: f32_at(body, 20),
            },
        })
    }
}

fn write_sample_header(out: &mut Vec<u8>, timestamp: u32, accuracy: u8) {
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.push(accuracy);
    out.extend_from_slice(&[0, 0, 0]);
}

/// The aggregate IMU record a device streams.
///
/// Modalities appear on the wire in this exact order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuRecord {
    pub gyroscope: SensorSample<Vec3>,
    pub accelerometer: SensorSample<Vec3>,
    pub magnetic_field: SensorSample<Vec3>,
    pub gravity: SensorSample<Vec3>,
    pub rotation: SensorSample<Quat>,
}

impl ImuRecord {
    pub const WIRE_SIZE: usize = 4 * SensorSample::<Vec3>::WIRE_SIZE + SensorSample::<Quat>::WIRE_SIZE;

    pub fn write_to(&self, out: &mut Vec<u8>) {
        self.gyroscope.write_to(out);
        self.accelerometer.write_to(out);
        self.magnetic_field.write_to(out);
        self.gravity.write_to(out);
        self.rotation.write_to(out);
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != Self::WIRE_SIZE {
            return Err(Error::short_payload("imu record", Self::WIRE_SIZE, body.len()));
        }
        const V: usize = SensorSample::<Vec3>::WIRE_SIZE;
        Ok(Self {
            gyroscope: SensorSample::<Vec3>::parse(&body[0..V])?,
            accelerometer: SensorSample::<Vec3>::parse(&body[V..2 * V])?,
            magnetic_field: SensorSample::<Vec3>::parse(&body[2 * V..3 * V])?,
            gravity: SensorSample::<Vec3>::parse(&body[3 * V..4 * V])?,
            rotation: SensorSample::<Quat>::parse(&body[4 * V..])?,
        })
    }
}

// ============================================================================
// Identification reply
// ============================================================================

/// Body of a device's reply to `Identify`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyReply {
    /// Device identifier, unique per robot by construction
    pub identifier: String,
    /// Per-arm display hue, one entry per oscillator (raw 0..=360)
    pub arm_hues: Vec<u16>,
    /// Another host already holds this device's soft lock
    pub locked: bool,
}

impl IdentifyReply {
    /// Parse `identifier · NUL · count · hue[count] · locked`.
    ///
    /// The identifier is variable-length, so the decoder scans for the first
    /// zero byte and then demands the fixed suffix to line up exactly.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let nul = body
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::MalformedPayload("identify: missing NUL".into()))?;
        if nul == 0 {
            return Err(Error::MalformedPayload("identify: empty identifier".into()));
        }
        let identifier = std::str::from_utf8(&body[..nul])
            .map_err(|_| Error::MalformedPayload("identify: non-ASCII identifier".into()))?
            .to_string();

        let rest = &body[nul + 1..];
        if rest.is_empty() {
            return Err(Error::MalformedPayload("identify: missing count".into()));
        }
        let count = rest[0] as usize;
        let expected = 1 + 2 * count + 1;
        if rest.len() != expected {
            return Err(Error::short_payload("identify suffix", expected, rest.len()));
        }
        let arm_hues = (0..count)
            .map(|i| u16::from_le_bytes([rest[1 + 2 * i], rest[2 + 2 * i]]))
            .collect();
        Ok(Self {
            identifier,
            arm_hues,
            locked: rest[expected - 1] == 1,
        })
    }
}

// ============================================================================
// Inbound dispatch
// ============================================================================

/// A fully decoded device-to-host packet.
#[derive(Debug, Clone, PartialEq)]
pub enum DevicePacket {
    Identify(IdentifyReply),
    Time(u32),
    Motor {
        index: u8,
        state: OscillatorState,
    },
    Imu(ImuRecord),
    /// The composite snapshot: time, one state per oscillator, IMU aggregate.
    All {
        time: u32,
        states: Vec<OscillatorState>,
        imu: ImuRecord,
    },
}

impl DevicePacket {
    /// Decode an unescaped payload (tag byte + body).
    ///
    /// `oscillator_count` is the host's cached count for this device; the
    /// composite packet's length is validated against it, so a count mismatch
    /// fails the whole aggregate.
    pub fn parse(payload: &[u8], oscillator_count: usize) -> Result<Self> {
        let (&tag, body) = payload
            .split_first()
            .ok_or_else(|| Error::MalformedPayload("empty payload".into()))?;
        match tag {
            TAG_IDENTIFY => Ok(DevicePacket::Identify(IdentifyReply::parse(body)?)),
            TAG_GET_TIME => {
                if body.len() != 4 {
                    return Err(Error::short_payload("time", 4, body.len()));
                }
                Ok(DevicePacket::Time(u32_at(body, 0)))
            }
            TAG_MOTOR_DATA => {
                if body.len() != 1 + OscillatorState::WIRE_SIZE {
                    return Err(Error::short_payload(
                        "motor data",
                        1 + OscillatorState::WIRE_SIZE,
                        body.len(),
                    ));
                }
                Ok(DevicePacket::Motor {
                    index: body[0],
                    state: OscillatorState::parse(&body[1..])?,
                })
            }
            TAG_IMU_DATA => Ok(DevicePacket::Imu(ImuRecord::parse(body)?)),
            TAG_ALL_DATA => {
                let expected = 4 + oscillator_count * OscillatorState::WIRE_SIZE + ImuRecord::WIRE_SIZE;
                if body.len() != expected {
                    return Err(Error::short_payload("aggregate data", expected, body.len()));
                }
                let time = u32_at(body, 0);
                let mut states = Vec::with_capacity(oscillator_count);
                let mut at = 4;
                for _ in 0..oscillator_count {
                    states.push(OscillatorState::parse(&body[at..at + OscillatorState::WIRE_SIZE])?);
                    at += OscillatorState::WIRE_SIZE;
                }
                let imu = ImuRecord::parse(&body[at..])?;
                Ok(DevicePacket::All { time, states, imu })
            }
            other => Err(Error::MalformedPayload(format!("unknown tag {}", other))),
        }
    }
}

// ============================================================================
// Outbound commands
// ============================================================================

/// A host-to-device command, serialized into a framed packet by
/// [`HostCommand::to_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Identification request; the UUID doubles as the soft-lock key.
    Identify(Uuid),
    /// Begin a session, resuming the device clock from the given time.
    SessionStart(u32),
    /// Ask the device for its current time.
    GetTime,
    /// Assert the host-side parameters for one oscillator.
    UpdateOscillator {
        index: u8,
        params: OscillatorParams,
    },
    /// End the session and release the soft lock.
    SessionEnd,
}

impl HostCommand {
    pub fn tag(&self) -> u8 {
        match self {
            HostCommand::Identify(_) => TAG_IDENTIFY,
            HostCommand::SessionStart(_) => TAG_SESSION_START,
            HostCommand::GetTime => TAG_GET_TIME,
            HostCommand::UpdateOscillator { .. } => TAG_UPDATE_OSCILLATOR,
            HostCommand::SessionEnd => TAG_SESSION_END,
        }
    }

    /// Serialize to the unescaped payload (tag byte + body).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.push(self.tag());
        match self {
            HostCommand::Identify(uuid) => out.extend_from_slice(uuid.as_bytes()),
            HostCommand::SessionStart(time) => out.extend_from_slice(&time.to_le_bytes()),
            HostCommand::GetTime | HostCommand::SessionEnd => {}
            HostCommand::UpdateOscillator { index, params } => {
                out.push(*index);
                params.write_to(&mut out);
            }
        }
        out
    }

    /// Serialize to complete wire bytes (header, escaped payload, footer).
    pub fn to_frame(&self) -> Vec<u8> {
        super::framing::frame(&self.to_payload())
    }
}

#[inline]
fn f32_at(body: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]])
}

#[inline]
fn u32_at(body: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(OscillatorParams::WIRE_SIZE, 16);
        assert_eq!(OscillatorState::WIRE_SIZE, 20);
        assert_eq!(SensorSample::<Vec3>::WIRE_SIZE, 20);
        assert_eq!(SensorSample::<Quat>::WIRE_SIZE, 24);
        assert_eq!(ImuRecord::WIRE_SIZE, 104);
    }

    #[test]
    fn test_params_round_trip() {
        let params = OscillatorParams {
            frequency: 1.5,
            amplitude: 40.0,
            offset: 90.0,
            phase_shift: 0.25,
        };
        let mut bytes = Vec::new();
        params.write_to(&mut bytes);
        assert_eq!(bytes.len(), OscillatorParams::WIRE_SIZE);
        assert_eq!(OscillatorParams::parse(&bytes).unwrap(), params);
    }

    #[test]
    fn test_params_default_offset() {
        let params = OscillatorParams::default();
        assert_eq!(params.frequency, 0.0);
        assert_eq!(params.amplitude, 0.0);
        assert_eq!(params.offset, 90.0);
        assert_eq!(params.phase_shift, 0.0);
    }

    #[test]
    fn test_state_round_trip() {
        let state = OscillatorState {
            params: OscillatorParams::default(),
            phase: 3.25,
        };
        let mut bytes = Vec::new();
        state.write_to(&mut bytes);
        assert_eq!(OscillatorState::parse(&bytes).unwrap(), state);
    }

    #[test]
    fn test_imu_round_trip_preserves_padding() {
        let mut record = ImuRecord::default();
        record.gyroscope = SensorSample {
            timestamp: 1234,
            accuracy: 3,
            data: Vec3 { x: 0.5, y: -0.5, z: 9.81 },
        };
        record.rotation = SensorSample {
            timestamp: 1235,
            accuracy: 2,
            data: Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 },
        };
        let mut bytes = Vec::new();
        record.write_to(&mut bytes);
        assert_eq!(bytes.len(), ImuRecord::WIRE_SIZE);
        // Padding bytes after accuracy are written as zero
        assert_eq!(&bytes[5..8], &[0, 0, 0]);
        assert_eq!(ImuRecord::parse(&bytes).unwrap(), record);
    }

    #[test]
    fn test_imu_rejects_wrong_length() {
        assert!(matches!(
            ImuRecord::parse(&[0u8; 103]),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_identify_reply_parse() {
        // "Snake1" NUL, 4 oscillators, hues 0/120/240/360, unlocked
        let body = [
            b'S', b'n', b'a', b'k', b'e', b'1', 0x00, 0x04, 0x00, 0x00, 0x78, 0x00, 0xF0,
            0x00, 0x68, 0x01, 0x00,
        ];
        let reply = IdentifyReply::parse(&body).unwrap();
        assert_eq!(reply.identifier, "Snake1");
        assert_eq!(reply.arm_hues, [0, 120, 240, 360]);
        assert!(!reply.locked);
    }

    #[test]
    fn test_identify_reply_rejects_empty_identifier() {
        let body = [0x00, 0x01, 0x10, 0x00, 0x00];
        assert!(matches!(
            IdentifyReply::parse(&body),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_identify_reply_rejects_hue_count_mismatch() {
        // Claims 4 hues but carries 2
        let body = [b'A', 0x00, 0x04, 0x00, 0x00, 0x78, 0x00, 0x00];
        assert!(IdentifyReply::parse(&body).is_err());
    }

    #[test]
    fn test_device_packet_time() {
        let packet = DevicePacket::parse(&[TAG_GET_TIME, 0xFF, 0x00, 0x00, 0x00], 0).unwrap();
        assert_eq!(packet, DevicePacket::Time(0xFF));
    }

    #[test]
    fn test_device_packet_all_data() {
        let count = 2;
        let mut body = vec![TAG_ALL_DATA];
        body.extend_from_slice(&777u32.to_le_bytes());
        for i in 0..count {
            OscillatorState {
                params: OscillatorParams {
                    frequency: i as f32,
                    ..OscillatorParams::default()
                },
                phase: 0.0,
            }
            .write_to(&mut body);
        }
        ImuRecord::default().write_to(&mut body);

        let packet = DevicePacket::parse(&body, count).unwrap();
        match packet {
            DevicePacket::All { time, states, .. } => {
                assert_eq!(time, 777);
                assert_eq!(states.len(), count);
                assert_eq!(states[1].params.frequency, 1.0);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_device_packet_all_data_count_mismatch() {
        let mut body = vec![TAG_ALL_DATA];
        body.extend_from_slice(&0u32.to_le_bytes());
        OscillatorState {
            params: OscillatorParams::default(),
            phase: 0.0,
        }
        .write_to(&mut body);
        ImuRecord::default().write_to(&mut body);

        // Host cached count says 3, payload carries 1
        assert!(DevicePacket::parse(&body, 3).is_err());
    }

    #[test]
    fn test_device_packet_unknown_tag() {
        assert!(DevicePacket::parse(&[0x7E, 1, 2, 3], 0).is_err());
    }

    #[test]
    fn test_identify_command_frame() {
        let uuid = Uuid::from_bytes([0xAB; 16]);
        let payload = HostCommand::Identify(uuid).to_payload();
        assert_eq!(payload.len(), 17);
        assert_eq!(payload[0], TAG_IDENTIFY);
        assert_eq!(&payload[1..], uuid.as_bytes());

        let frame = HostCommand::Identify(uuid).to_frame();
        assert_eq!(&frame[..2], b"ED");
        assert_eq!(&frame[frame.len() - 2..], b"MO");
    }

    #[test]
    fn test_update_oscillator_layout() {
        let cmd = HostCommand::UpdateOscillator {
            index: 2,
            params: OscillatorParams {
                frequency: 1.0,
                amplitude: 30.0,
                offset: 90.0,
                phase_shift: 180.0,
            },
        };
        let payload = cmd.to_payload();
        assert_eq!(payload.len(), 2 + OscillatorParams::WIRE_SIZE);
        assert_eq!(payload[0], TAG_UPDATE_OSCILLATOR);
        assert_eq!(payload[1], 2);
        assert_eq!(f32_at(&payload, 2), 1.0);
    }
}
