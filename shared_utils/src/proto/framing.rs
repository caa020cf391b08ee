//! Control channel framing for the CoentroVPN data channel offload.
//!
//! The kernel control path is a plain byte stream with no message
//! boundaries of its own. This module delimits control messages on top of
//! it and rejects anything that does not parse as a whole frame.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+----------------+----------------+
//! |    Magic (1)   |  Version (1)   |   Opcode (1)   |   Flags (1)    |
//! +----------------+----------------+----------------+----------------+
//! |                        Peer ID (4 bytes)                          |
//! +----------------+----------------+----------------+----------------+
//! |                        Length (4 bytes)                           |
//! +----------------+----------------+----------------+----------------+
//! |                        Payload (variable)                         |
//! +----------------+----------------+----------------+----------------+
//! |                        Checksum (4 bytes)                         |
//! +----------------+----------------+----------------+----------------+
//! ```
//!
//! - Magic: a fixed byte (0xD0) that marks the beginning of a frame
//! - Version: protocol version (currently 0x01)
//! - Opcode: the control operation or notification carried by the frame
//! - Flags: additional flags for special handling
//! - Peer ID: the peer the frame is addressed to or originates from (u32, big-endian)
//! - Length: length of the payload in bytes (u32, big-endian)
//! - Checksum: CRC32 of header and payload
//!
//! # Example Usage
//!
//! ```rust
//! use shared_utils::proto::framing::{ControlDecoder, ControlEncoder, ControlFrame, Opcode};
//!
//! let frame = ControlFrame::new(Opcode::Packet, 7, b"P_CONTROL".to_vec()).unwrap();
//! let encoded = ControlEncoder::new().encode(&frame);
//!
//! let mut decoder = ControlDecoder::new();
//! decoder.feed(&encoded);
//! assert_eq!(decoder.next_frame().unwrap(), Some(frame));
//! ```

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc32fast::Hasher;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

const FRAME_MAGIC: u8 = 0xD0;
const FRAME_VERSION: u8 = 0x01;
/// Magic (1) + Version (1) + Opcode (1) + Flags (1) + Peer ID (4) + Length (4)
pub const HEADER_SIZE: usize = 12;
pub const CHECKSUM_SIZE: usize = 4;
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;
/// Upper bound for any control payload.
pub const MAX_PAYLOAD_SIZE: usize = 65_535;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Invalid magic byte in frame header
    #[error("Invalid frame magic: expected 0x{expected:02X}, got 0x{actual:02X}")]
    InvalidMagic { expected: u8, actual: u8 },

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Opcode outside the known set
    #[error("Invalid opcode: 0x{0:02X}")]
    InvalidOpcode(u8),

    /// Frame payload too large
    #[error("Frame payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    /// Checksum verification failed
    #[error("Checksum verification failed: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The stream ended in the middle of a frame
    #[error("Truncated frame: {buffered} bytes left over at end of stream")]
    Truncated { buffered: usize },

    /// Payload does not match the layout its opcode requires
    #[error("Malformed {opcode:?} payload: {reason}")]
    MalformedPayload { opcode: Opcode, reason: String },
}

/// Control operations exchanged between the daemon and the kernel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Register a peer with the kernel
    NewPeer = 0x01,
    /// Remove a peer (daemon request)
    DelPeer = 0x02,
    /// Install key material into a slot
    NewKey = 0x03,
    /// Swap primary and secondary slots
    SwapKeys = 0x04,
    /// Zero and delete a key slot
    DelKey = 0x05,
    /// Control-channel packet for/from a peer
    Packet = 0x06,
    /// Kernel notification: peer was removed
    PeerDeleted = 0x10,
    /// Kernel notification: the active key is near exhaustion
    KeyExpired = 0x11,
}

impl Opcode {
    /// Convert a u8 to an Opcode
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Opcode::NewPeer),
            0x02 => Ok(Opcode::DelPeer),
            0x03 => Ok(Opcode::NewKey),
            0x04 => Ok(Opcode::SwapKeys),
            0x05 => Ok(Opcode::DelKey),
            0x06 => Ok(Opcode::Packet),
            0x10 => Ok(Opcode::PeerDeleted),
            0x11 => Ok(Opcode::KeyExpired),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Opcodes owned by the key slot state machine.
    pub fn is_key_op(self) -> bool {
        matches!(
            self,
            Opcode::NewKey | Opcode::SwapKeys | Opcode::DelKey | Opcode::KeyExpired
        )
    }
}

/// Flags that can be set on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub fn new() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(value: u8) -> Self {
        FrameFlags(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= 1 << bit;
    }

    pub fn is_set(&self, bit: u8) -> bool {
        (self.0 & (1 << bit)) != 0
    }
}

/// One framed control message.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub opcode: Opcode,
    pub flags: FrameFlags,
    pub peer_id: u32,
    pub payload: Vec<u8>,
}

impl ControlFrame {
    /// Create a new frame, rejecting oversized payloads up front.
    pub fn new(opcode: Opcode, peer_id: u32, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(ControlFrame {
            opcode,
            flags: FrameFlags::new(),
            peer_id,
            payload,
        })
    }

    /// Total size of the frame when encoded
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }
}

impl fmt::Debug for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key frames carry secrets; never print payload bytes.
        f.debug_struct("ControlFrame")
            .field("opcode", &self.opcode)
            .field("flags", &self.flags)
            .field("peer_id", &self.peer_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Encoder for control frames.
#[derive(Debug, Default)]
pub struct ControlEncoder;

impl ControlEncoder {
    pub fn new() -> Self {
        ControlEncoder
    }

    /// Encode a frame into a byte vector
    #[instrument(level = "trace", skip(self, frame), fields(opcode = ?frame.opcode, peer_id = frame.peer_id))]
    pub fn encode(&self, frame: &ControlFrame) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(frame.size());

        buffer.push(FRAME_MAGIC);
        buffer.push(FRAME_VERSION);
        buffer.push(frame.opcode.to_u8());
        buffer.push(frame.flags.to_u8());
        // Writes into a Vec cannot fail.
        let _ = buffer.write_u32::<BigEndian>(frame.peer_id);
        let _ = buffer.write_u32::<BigEndian>(frame.payload.len() as u32);
        buffer.extend_from_slice(&frame.payload);

        let mut hasher = Hasher::new();
        hasher.update(&buffer);
        let checksum = hasher.finalize();
        let _ = buffer.write_u32::<BigEndian>(checksum);

        trace!(
            total_size = buffer.len(),
            checksum = format!("0x{:08X}", checksum),
            "Control frame encoded"
        );

        buffer
    }
}

/// Incremental decoder for control frames.
///
/// Bytes are pushed with [`ControlDecoder::feed`] as they arrive from the
/// transport and complete frames are pulled with
/// [`ControlDecoder::next_frame`]. A frame whose checksum fails is dropped
/// on its own, since its length is known and the frames behind it are
/// intact. Header garbage (bad magic, version, opcode or length) leaves no
/// way to find the next frame boundary, so everything buffered is
/// discarded and the next call starts from a clean state.
#[derive(Debug)]
pub struct ControlDecoder {
    buffer: Vec<u8>,
    max_payload: usize,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Decoder with a tighter payload bound than [`MAX_PAYLOAD_SIZE`].
    pub fn with_max_payload(max_payload: usize) -> Self {
        ControlDecoder {
            buffer: Vec::new(),
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    /// Append raw bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        trace!(buffer_len = self.buffer.len(), "Appended data to decoder");
    }

    /// Pull the next complete frame, if one is buffered.
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a frame was decoded
    /// - Ok(None) if more bytes are needed
    /// - Err(error) if the next frame is malformed; see the type docs for
    ///   what is discarded
    pub fn next_frame(&mut self) -> Result<Option<ControlFrame>, FrameError> {
        match self.try_decode_frame() {
            Ok(frame) => Ok(frame),
            Err(e @ FrameError::ChecksumMismatch { .. }) => {
                warn!(error = %e, remaining = self.buffer.len(), "Dropping corrupt control frame");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, discarded = self.buffer.len(), "Rejecting malformed control frame");
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Signal end of stream. Leftover bytes mean the last frame was cut short.
    pub fn finish(&mut self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffered = self.buffer.len();
        self.buffer.clear();
        Err(FrameError::Truncated { buffered })
    }

    fn try_decode_frame(&mut self) -> Result<Option<ControlFrame>, FrameError> {
        // Validate the leading bytes as soon as they arrive so garbage is
        // rejected without waiting for a full header.
        if let Some(&magic) = self.buffer.first() {
            if magic != FRAME_MAGIC {
                return Err(FrameError::InvalidMagic {
                    expected: FRAME_MAGIC,
                    actual: magic,
                });
            }
        }
        if let Some(&version) = self.buffer.get(1) {
            if version != FRAME_VERSION {
                return Err(FrameError::UnsupportedVersion(version));
            }
        }
        if let Some(&opcode) = self.buffer.get(2) {
            Opcode::from_u8(opcode)?;
        }

        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let opcode = Opcode::from_u8(self.buffer[2])?;
        let flags = FrameFlags::from_u8(self.buffer[3]);
        let peer_id = BigEndian::read_u32(&self.buffer[4..8]);
        let payload_len = BigEndian::read_u32(&self.buffer[8..12]) as usize;

        if payload_len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        let total_size = HEADER_SIZE + payload_len + CHECKSUM_SIZE;
        if self.buffer.len() < total_size {
            return Ok(None);
        }

        let mut hasher = Hasher::new();
        hasher.update(&self.buffer[..HEADER_SIZE + payload_len]);
        let calculated = hasher.finalize();
        let carried = BigEndian::read_u32(&self.buffer[HEADER_SIZE + payload_len..total_size]);
        if calculated != carried {
            self.buffer.drain(..total_size);
            return Err(FrameError::ChecksumMismatch {
                expected: carried,
                actual: calculated,
            });
        }

        let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();
        self.buffer.drain(..total_size);

        debug!(opcode = ?opcode, peer_id, payload_len, "Decoded control frame");

        Ok(Some(ControlFrame {
            opcode,
            flags,
            peer_id,
            payload,
        }))
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for ControlDecoder {
    fn default() -> Self {
        Self::new()
    }
}
