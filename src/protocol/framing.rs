//! Frame delimiting and escape encoding
//!
//! Packet format on the wire: `['E' 'D'] [escaped payload] ['M' 'O']`
//!
//! The first byte of the unescaped payload is the packet tag, the rest is the
//! tag-specific body (see [`crate::protocol::packets`]).
//!
//! # Escape encoding
//!
//! The delimiters are ordinary printable bytes, so the payload is escaped to
//! keep the framing unambiguous: a `\` (0x5C) is inserted before any byte that
//! would otherwise complete an `ED` or `MO` pair, and literal `\` bytes are
//! doubled. The decoder drops any `\` and takes the following byte verbatim.
//!
//! Two consequences worth knowing:
//! - `unescape(escape(p)) == p` for every payload, including payloads whose
//!   float bodies happen to contain 0x5C.
//! - The escaped form never contains `ED` or `MO` as adjacent bytes, so a
//!   receiver can resynchronize on the delimiters alone.

/// Frame header bytes (`"ED"`)
pub const HEADER: [u8; 2] = [b'E', b'D'];
/// Frame footer bytes (`"MO"`)
pub const FOOTER: [u8; 2] = [b'M', b'O'];
/// Escape byte (`'\'`)
pub const ESCAPE: u8 = b'\\';

/// Largest escaped payload the reframer will accumulate before resyncing.
///
/// The biggest legitimate frame is an aggregate-data packet from a device with
/// many oscillators; even at 32 oscillators the escaped payload stays under
/// 2 KiB. Anything larger is line noise that happened to contain a header.
const MAX_FRAME_SIZE: usize = 4096;

/// Escape a payload so it contains no `ED`/`MO` delimiter pairs.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    for &b in payload {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPE);
            continue;
        }
        if let Some(&prev) = out.last() {
            if (prev == b'E' && b == b'D') || (prev == b'M' && b == b'O') {
                out.push(ESCAPE);
            }
        }
        out.push(b);
    }
    out
}

/// Reverse [`escape`]: drop each `\` and take the following byte verbatim.
///
/// A trailing lone `\` is dropped.
pub fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESCAPE {
            if i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
            }
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// Wrap an unescaped payload into a complete wire frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let escaped = escape(payload);
    let mut out = Vec::with_capacity(escaped.len() + 4);
    out.extend_from_slice(&HEADER);
    out.extend_from_slice(&escaped);
    out.extend_from_slice(&FOOTER);
    out
}

/// Incremental reframer for a raw byte stream.
///
/// Feeds on arbitrary chunks (transports deliver whatever the OS hands them)
/// and yields complete unescaped payloads.
///
/// - a trailing `ED` always starts a new frame, discarding whatever was
///   buffered (this is the resync path for garbage and for frames cut short),
/// - outside a frame at most one byte is retained (the potential `E` of a
///   header split across chunks),
/// - a trailing `MO` inside a frame completes it.
pub struct FrameAssembler {
    buffer: Vec<u8>,
    in_frame: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            in_frame: false,
        }
    }

    /// Feed a chunk of raw bytes, invoking `sink` once per completed payload.
    pub fn push(&mut self, bytes: &[u8], mut sink: impl FnMut(Vec<u8>)) {
        for &b in bytes {
            self.buffer.push(b);
            let n = self.buffer.len();

            if n >= 2 && self.buffer[n - 2..] == HEADER {
                // Start of frame; anything before it was noise or a dead frame.
                self.buffer.clear();
                self.in_frame = true;
            } else if self.in_frame {
                if n >= 2 && self.buffer[n - 2..] == FOOTER {
                    let payload = unescape(&self.buffer[..n - 2]);
                    self.buffer.clear();
                    self.in_frame = false;
                    sink(payload);
                } else if n > MAX_FRAME_SIZE {
                    log::warn!("Oversized frame ({} bytes), resyncing", n);
                    self.buffer.clear();
                    self.in_frame = false;
                }
            } else if n > 1 {
                self.buffer.remove(0);
            }
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_known_bytes() {
        // "EDMO" then two arbitrary bytes then "ED" again
        let input = [0x45, 0x44, 0x4D, 0x4F, 0x01, 0x02, 0x45, 0x44];
        let escaped = escape(&input);
        assert_eq!(
            escaped,
            [0x45, 0x5C, 0x44, 0x4D, 0x5C, 0x4F, 0x01, 0x02, 0x45, 0x5C, 0x44]
        );
        assert_eq!(unescape(&escaped), input);
    }

    #[test]
    fn test_escaped_form_has_no_delimiters() {
        let inputs: [&[u8]; 4] = [
            b"EDMO",
            b"EEDDMMOO",
            &[0x45, 0x44, 0x45, 0x44, 0x4D, 0x4F],
            b"a perfectly ordinary payload",
        ];
        for input in inputs {
            let escaped = escape(input);
            for pair in escaped.windows(2) {
                assert_ne!(pair, HEADER, "header pair in {:02X?}", escaped);
                assert_ne!(pair, FOOTER, "footer pair in {:02X?}", escaped);
            }
        }
    }

    #[test]
    fn test_round_trip_all_byte_values() {
        // Every byte value adjacent to every delimiter-relevant byte,
        // backslashes included.
        let mut input = Vec::new();
        for b in 0..=255u8 {
            input.push(b'E');
            input.push(b);
            input.push(b'M');
            input.push(b);
            input.push(0x5C);
            input.push(b);
        }
        assert_eq!(unescape(&escape(&input)), input);
    }

    #[test]
    fn test_escape_idempotent_on_clean_payload() {
        // A payload with no delimiter pairs and no backslashes escapes to
        // itself, so escaping is idempotent on it.
        let input = b"DE OM plain bytes 123";
        let once = escape(input);
        assert_eq!(once, input);
        assert_eq!(escape(&once), once);
    }

    #[test]
    fn test_unescape_drops_trailing_escape() {
        assert_eq!(unescape(&[0x01, 0x5C]), [0x01]);
    }

    #[test]
    fn test_frame_wraps_payload() {
        let framed = frame(&[0x02, 0xFF]);
        assert_eq!(framed, [0x45, 0x44, 0x02, 0xFF, 0x4D, 0x4F]);
    }

    #[test]
    fn test_assembler_happy_path() {
        let mut asm = FrameAssembler::new();
        let mut frames = Vec::new();
        asm.push(&frame(&[0x02, 0xAA, 0xBB]), |p| frames.push(p));
        assert_eq!(frames, [[0x02, 0xAA, 0xBB]]);
    }

    #[test]
    fn test_assembler_resyncs_on_garbage() {
        let mut asm = FrameAssembler::new();
        let mut frames = Vec::new();
        // Leading noise, then a GetTime frame for t=0xFF
        let bytes = [0xFF, 0xFF, 0x45, 0x44, 0x02, 0xFF, 0x00, 0x00, 0x00, 0x4D, 0x4F];
        asm.push(&bytes, |p| frames.push(p));
        assert_eq!(frames, [[0x02, 0xFF, 0x00, 0x00, 0x00]]);
    }

    #[test]
    fn test_assembler_any_chunking() {
        let wire = frame(b"\x05payload with EDMO inside");
        for split in 1..wire.len() {
            let mut asm = FrameAssembler::new();
            let mut frames = Vec::new();
            asm.push(&wire[..split], |p| frames.push(p));
            asm.push(&wire[split..], |p| frames.push(p));
            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0], b"\x05payload with EDMO inside");
        }
    }

    #[test]
    fn test_assembler_header_restarts_frame() {
        let mut asm = FrameAssembler::new();
        let mut frames = Vec::new();
        // A frame that dies mid-way (new header appears), then a clean frame.
        let mut bytes = vec![0x45, 0x44, 0x01, 0x02, 0x03];
        bytes.extend_from_slice(&frame(&[0x02, 1, 0, 0, 0]));
        asm.push(&bytes, |p| frames.push(p));
        assert_eq!(frames, [[0x02, 1, 0, 0, 0]]);
    }

    #[test]
    fn test_assembler_back_to_back_frames() {
        let mut asm = FrameAssembler::new();
        let mut frames = Vec::new();
        let mut bytes = frame(&[0x02, 1, 0, 0, 0]);
        bytes.extend_from_slice(&frame(&[0x02, 2, 0, 0, 0]));
        asm.push(&bytes, |p| frames.push(p));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][1], 1);
        assert_eq!(frames[1][1], 2);
    }
}
