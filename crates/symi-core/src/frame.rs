//! Frame encoding/decoding
//!
//! Two layouts share one header byte and an XOR checksum over every
//! preceding byte of the frame:
//!
//! ```text
//! request  (opcode < 0x80):  0x53 | opcode | len | payload[len] | xor
//! response (opcode >= 0x80): 0x53 | opcode | status | len | payload[len] | xor
//! ```
//!
//! Decoding never fails on bad input. Noise is skipped byte by byte until the
//! next plausible header, so a single corrupted byte cannot stall the stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::protocol::{opcode, status, HEADER, MAX_PAYLOAD};

#[derive(Error, Debug)]
pub enum FrameError {
    /// Request-range opcode the gateway never accepts; the decoder would skip it
    #[error("unknown request opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// A complete frame whose checksum did not match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCorrupt {
    pub opcode: u8,
    pub expected: u8,
    pub actual: u8,
}

impl std::fmt::Display for FrameCorrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "corrupt frame opcode=0x{:02X}: checksum expected 0x{:02X}, got 0x{:02X}",
            self.opcode, self.expected, self.actual
        )
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    /// Present on response and event frames only
    pub status: Option<u8>,
    pub payload: Bytes,
}

impl Frame {
    /// Build a host → gateway frame
    pub fn request(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            status: None,
            payload: payload.into(),
        }
    }

    /// Build a gateway → host frame
    pub fn response(opcode: u8, status: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            status: Some(status),
            payload: payload.into(),
        }
    }

    pub fn is_response(&self) -> bool {
        opcode::is_response(self.opcode)
    }

    /// Status byte, treating request frames as successful
    pub fn status_code(&self) -> u8 {
        self.status.unwrap_or(status::SUCCESS)
    }

    /// Mesh address carried in the first two payload bytes (little-endian)
    /// of control acks, status events and control requests
    pub fn network_address(&self) -> Option<u16> {
        match self.payload.get(..2) {
            Some(&[lo, hi]) => Some(u16::from_le_bytes([lo, hi])),
            _ => None,
        }
    }

    /// Encoded size including header and checksum
    pub fn wire_size(&self) -> usize {
        let fixed = if self.is_response() { 5 } else { 4 };
        fixed + self.payload.len()
    }
}

/// Result of one decode step over a byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A valid frame occupying the first `consumed` bytes
    Frame { frame: Frame, consumed: usize },
    /// Not enough bytes yet; nothing consumed
    Incomplete,
    /// `consumed` bytes of noise or a corrupt frame start were dropped
    Skipped {
        consumed: usize,
        corrupt: Option<FrameCorrupt>,
    },
}

/// XOR of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// A header byte followed by this opcode could start a frame.
///
/// Unknown response-range opcodes stay plausible so newer firmware events
/// reach the classifier. Unknown request-range opcodes are never sent by
/// anyone and are treated as noise.
fn is_plausible_opcode(op: u8) -> bool {
    opcode::is_response(op) || opcode::REQUESTS.contains(&op)
}

/// Decode at most one frame from the front of `buf`
pub fn decode(buf: &[u8]) -> Decoded {
    let Some(&first) = buf.first() else {
        return Decoded::Incomplete;
    };

    if first != HEADER {
        let consumed = buf.iter().position(|&b| b == HEADER).unwrap_or(buf.len());
        return Decoded::Skipped {
            consumed,
            corrupt: None,
        };
    }

    let Some(&op) = buf.get(1) else {
        return Decoded::Incomplete;
    };
    if !is_plausible_opcode(op) {
        return Decoded::Skipped {
            consumed: 1,
            corrupt: None,
        };
    }

    let response = opcode::is_response(op);
    let len_idx = if response { 3 } else { 2 };
    let Some(&len) = buf.get(len_idx) else {
        return Decoded::Incomplete;
    };

    let payload_start = len_idx + 1;
    let payload_end = payload_start + usize::from(len);
    let total = payload_end + 1;
    if buf.len() < total {
        return Decoded::Incomplete;
    }

    let expected = checksum(&buf[..payload_end]);
    let actual = buf[payload_end];
    if expected != actual {
        // Drop only the header byte: the length may be the corrupted byte
        return Decoded::Skipped {
            consumed: 1,
            corrupt: Some(FrameCorrupt {
                opcode: op,
                expected,
                actual,
            }),
        };
    }

    let frame = Frame {
        opcode: op,
        status: response.then(|| buf[2]),
        payload: Bytes::copy_from_slice(&buf[payload_start..payload_end]),
    };
    Decoded::Frame {
        frame,
        consumed: total,
    }
}

/// Append the wire form of `frame` to `dst`.
///
/// Response-layout opcodes without a status are written with status 0. Only
/// opcodes [`decode`] accepts can be encoded.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if !is_plausible_opcode(frame.opcode) {
        return Err(FrameError::UnknownOpcode(frame.opcode));
    }
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let start = dst.len();
    dst.reserve(frame.wire_size());
    dst.put_u8(HEADER);
    dst.put_u8(frame.opcode);
    if frame.is_response() {
        dst.put_u8(frame.status_code());
    }
    dst.put_u8(frame.payload.len() as u8);
    dst.put_slice(&frame.payload);
    let check = checksum(&dst[start..]);
    dst.put_u8(check);
    Ok(())
}

/// Encode a request frame into a fresh buffer
pub fn encode(opcode: u8, payload: &[u8]) -> Result<Bytes> {
    let frame = Frame::request(opcode, Bytes::copy_from_slice(payload));
    let mut buf = BytesMut::with_capacity(frame.wire_size());
    encode_frame(&frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Stream codec for `FramedRead` / `FramedWrite`
#[derive(Debug, Default)]
pub struct FrameCodec {
    corrupt_frames: u64,
    skipped_bytes: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames dropped because of a checksum mismatch
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    /// Bytes dropped while resynchronizing
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match decode(src) {
                Decoded::Frame { frame, consumed } => {
                    let _ = src.split_to(consumed);
                    trace!(
                        opcode = format_args!("0x{:02X}", frame.opcode),
                        status = ?frame.status,
                        len = frame.payload.len(),
                        "Decoded frame"
                    );
                    return Ok(Some(frame));
                }
                Decoded::Incomplete => return Ok(None),
                Decoded::Skipped { consumed, corrupt } => {
                    let dropped = src.split_to(consumed);
                    self.skipped_bytes += consumed as u64;
                    if let Some(corrupt) = corrupt {
                        self.corrupt_frames += 1;
                        debug!(%corrupt, "Skipping corrupt frame start");
                    } else {
                        trace!(bytes = %hex::encode(&dropped), "Skipping noise");
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match Decoder::decode(self, src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "Discarding partial frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device-list entry captured from a real gateway
    const CAPTURED_LIST_ENTRY: [u8; 21] = [
        0x53, 0x92, 0x00, 0x10, 0x0B, 0x00, 0x1A, 0xD0, 0x7D, 0x3D, 0x44, 0x9C, 0x1B, 0x01, 0x7B,
        0x00, 0x14, 0x00, 0x00, 0x00, 0xFD,
    ];

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_captured_frame() {
        match decode(&CAPTURED_LIST_ENTRY) {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(consumed, CAPTURED_LIST_ENTRY.len());
                assert_eq!(frame.opcode, opcode::RESP_DEVICE_LIST);
                assert_eq!(frame.status, Some(status::SUCCESS));
                assert_eq!(frame.payload.len(), 16);
                assert_eq!(frame.payload[12], 0x14);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_encode_read_device_list() {
        let bytes = encode(opcode::READ_DEVICE_LIST, &[]).unwrap();
        assert_eq!(bytes.as_ref(), &[0x53, 0x12, 0x00, 0x53 ^ 0x12]);
    }

    #[test]
    fn test_roundtrip_every_encodable_opcode() {
        let mut accepted = 0;
        for op in 0..=u8::MAX {
            for len in [0usize, 1, 255] {
                let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let bytes = match encode(op, &payload) {
                    Ok(bytes) => bytes,
                    Err(FrameError::UnknownOpcode(rejected)) => {
                        assert_eq!(rejected, op);
                        assert!(!opcode::is_response(op));
                        continue;
                    }
                    Err(e) => panic!("opcode 0x{op:02X} len {len}: {e}"),
                };
                match decode(&bytes) {
                    Decoded::Frame { frame, consumed } => {
                        assert_eq!(consumed, bytes.len());
                        assert_eq!(frame.opcode, op);
                        assert_eq!(frame.status, opcode::is_response(op).then_some(0));
                        assert_eq!(frame.payload.as_ref(), payload.as_slice());
                    }
                    other => panic!("opcode 0x{op:02X} len {len}: {other:?}"),
                }
                if len == 0 {
                    accepted += 1;
                }
            }
        }
        assert_eq!(accepted, 128 + opcode::REQUESTS.len());
    }

    #[test]
    fn test_unknown_request_opcode_is_rejected() {
        assert!(matches!(
            encode(0x7F, &[1]),
            Err(FrameError::UnknownOpcode(0x7F))
        ));
        let frame = Frame::request(opcode::DEVICE_CONTROL, vec![0x42, 0x01, 0x02, 0x04]);
        assert_eq!(encoded(&frame).len(), frame.wire_size());
    }

    #[test]
    fn test_response_roundtrip_with_status() {
        let frame = Frame::response(opcode::RESP_SCAN, status::SCAN_DISCOVERY_EVENT, vec![0xC4; 16]);
        let buf = encoded(&frame);
        match decode(&buf) {
            Decoded::Frame { frame: decoded, .. } => assert_eq!(decoded, frame),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = encode(opcode::DEVICE_CONTROL, &[1, 2, 3]).unwrap();
        let b = encode(opcode::DEVICE_CONTROL, &[1, 2, 3]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_payload_too_large() {
        let result = encode(opcode::DEVICE_CONTROL, &[0u8; 256]);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { size: 256, .. })));
    }

    #[test]
    fn test_partial_frame_consumes_nothing() {
        for cut in 0..CAPTURED_LIST_ENTRY.len() {
            assert_eq!(decode(&CAPTURED_LIST_ENTRY[..cut]), Decoded::Incomplete, "cut at {cut}");
        }
    }

    #[test]
    fn test_noise_before_header_is_skipped() {
        let mut buf = vec![0x00, 0xFF, 0x12];
        buf.extend_from_slice(&CAPTURED_LIST_ENTRY);
        assert_eq!(
            decode(&buf),
            Decoded::Skipped {
                consumed: 3,
                corrupt: None
            }
        );
    }

    #[test]
    fn test_stray_header_byte_resyncs_without_corruption() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(HEADER);
        buf.extend_from_slice(&CAPTURED_LIST_ENTRY);

        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, opcode::RESP_DEVICE_LIST);
        assert_eq!(codec.corrupt_frames(), 0);
        assert_eq!(codec.skipped_bytes(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_corrupt_checksum_then_valid_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut bad = encode(opcode::DEVICE_CONTROL, &[0x01, 0x00, 0x02, 0x02])
            .unwrap()
            .to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&CAPTURED_LIST_ENTRY);

        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, opcode::RESP_DEVICE_LIST);
        assert_eq!(codec.corrupt_frames(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_inside_corrupt_payload_holds_later_frame() {
        // The corrupt frame's payload looks like a response header with
        // length 255, so the decoder waits for that many bytes
        let mut bad = encode(opcode::DEVICE_CONTROL, &[HEADER, opcode::RESP_DEVICE_LIST, 0x00, 0xFF])
            .unwrap()
            .to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&CAPTURED_LIST_ENTRY);

        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());
        assert_eq!(codec.corrupt_frames(), 1);
        assert_eq!(buf.len(), bad.len() - 3 + CAPTURED_LIST_ENTRY.len());

        // Enough trailing bytes to complete the bogus frame release it
        buf.extend_from_slice(&[0u8; 234]);
        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, opcode::RESP_DEVICE_LIST);
        assert_eq!(frame.payload.len(), 16);
        assert_eq!(codec.corrupt_frames(), 2);
    }

    #[test]
    fn test_codec_splits_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&CAPTURED_LIST_ENTRY);
        buf.extend_from_slice(&encoded(&Frame::response(opcode::RESP_DEVICE_LIST, 0, Bytes::new())));

        let first = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        let second = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(first.payload.len(), 16);
        assert!(second.payload.is_empty());
        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_response_opcode_is_decoded() {
        let frame = Frame::response(0xEE, 0x00, vec![1, 2]);
        let buf = encoded(&frame);
        assert!(matches!(decode(&buf), Decoded::Frame { .. }));
    }

    #[test]
    fn test_decode_eof_discards_partial() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&CAPTURED_LIST_ENTRY[..10]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_network_address() {
        let frame = Frame::response(opcode::RESP_DEVICE_CONTROL, 0, vec![0x34, 0x12, 0x02]);
        assert_eq!(frame.network_address(), Some(0x1234));
        assert_eq!(Frame::request(opcode::REBOOT, Bytes::new()).network_address(), None);
    }
}
