//! Constants used across the HU packet protocol implementation.
//!
//! This module defines the reserved wire bytes, header delimiters, buffer
//! capacities and the signed status codes carried in every response.
//!
//! ## Key Concepts
//!
//! - **Markers**: single control bytes that open, separate, trail and close a frame.
//! - **Header**: the first record of a frame, `[id '@'] name [':' sequence]`.
//! - **Capacities**: fixed sizes for the per-session receive/transmit buffers and
//!   the argument vector. Frames that do not fit are dropped, never truncated.
//! - **Status codes**: negative integers following the errno convention, plus a
//!   private range for protocol specific failures.

/// Request start marker (ENQ).
pub const ENQ: u8 = 0x05;

/// Positive response start marker (ACK).
pub const ACK: u8 = 0x06;

/// Negative response start marker (NAK).
pub const NAK: u8 = 0x15;

/// End of frame marker (EOT).
pub const EOT: u8 = 0x04;

/// Marker that opens the hex-encoded CRC16 trailer (SUB).
pub const CRC_MARK: u8 = 0x1a;

/// Record separator between consecutive arguments (RS).
pub const RECORD_MARK: u8 = 0x1e;

/// Separates the correlation id from the command name in the header.
pub const ID_MARK: u8 = b'@';

/// Separates the command name from the sequence number in the header.
pub const SEQUENCE_MARK: u8 = b':';

/// Preset value for the CRC16 computation.
pub const CRC_PRESET: u16 = 0x0000;

/// Default capacity (in bytes) of a session's receive and transmit buffers.
///
/// A frame whose payload exceeds this size is dropped as a whole.
pub const PACKET_SIZE: usize = 1530;

/// Maximum number of arguments (header included) in a single frame.
pub const MAX_ARGS: usize = 64;

/// Number of bytes requested from a transport per `recv` call.
pub const RECV_CHUNK_SIZE: usize = 128;

/// Maximum number of disjoint arenas a pool keeps track of.
pub const MAX_ARENAS: usize = 8;

/// Signed status codes reported as the first record of every response.
///
/// Values follow the negative-errno convention used by the firmware;
/// protocol specific codes live above the errno range.
pub mod status {
    /// Success.
    pub const OK: i32 = 0;
    /// I/O error reported by a storage collaborator.
    pub const EIO: i32 = -5;
    /// Not enough pool memory to serve the request.
    pub const ENOMEM: i32 = -12;
    /// Missing or malformed argument.
    pub const EINVAL: i32 = -22;
    /// Operation not supported on this target.
    pub const ENOTSUP: i32 = -134;
    /// The request carried a CRC trailer that did not match its content.
    pub const CRC_MISMATCH: i32 = -2000;
    /// The ascii85 payload could not be decoded.
    pub const ASCII85: i32 = -2001;
    /// The decoded payload size differs from the announced size.
    pub const DECODE_SIZE: i32 = -2002;
}
