//! Incremental frame parser for the HU packet protocol.
//!
//! This module turns an unbounded byte stream into complete frames. Bytes are
//! pushed one at a time into a [`FrameParser`], which copies the frame body into
//! its fixed receive buffer and records where every argument starts. When the
//! end marker arrives the parser exposes a borrowed [`Frame`] view: the header
//! split into id, name and sequence, the argument slices and the CRC verdict.
//!
//! ## Wire format
//!
//! ```text
//! START header (RS argument)* [SUB crc-hex] EOT
//! header = [id '@'] name [':' sequence]
//! ```
//!
//! `START` is [`ENQ`] for requests, [`ACK`] or [`NAK`] for responses.
//!
//! ## Resynchronisation
//!
//! Bytes outside a frame are ignored. A frame that overflows the buffer or the
//! argument vector is dropped whole and the parser waits for the next start
//! marker. Nothing is ever written past the buffer.
//!
//! For building outgoing frames, see [`reply::Reply`].

pub mod reply;

use heapless::Vec;

use crate::consts::{ACK, CRC_MARK, ENQ, EOT, ID_MARK, MAX_ARGS, NAK, RECORD_MARK, SEQUENCE_MARK};
use crate::crc::{crc16, parse_crc};

/// The three kinds of frame, told apart by their start marker.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum FrameKind {
    /// A command sent by the peer, opened by [`ENQ`].
    Request,
    /// A positive answer to a request this device sent, opened by [`ACK`].
    Ack,
    /// A negative answer to a request this device sent, opened by [`NAK`].
    Nak,
}

impl FrameKind {
    /// Maps a start marker to its frame kind.
    pub const fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            ENQ => Some(Self::Request),
            ACK => Some(Self::Ack),
            NAK => Some(Self::Nak),
            _ => None,
        }
    }

    /// The start marker written for this kind.
    pub const fn marker(self) -> u8 {
        match self {
            Self::Request => ENQ,
            Self::Ack => ACK,
            Self::Nak => NAK,
        }
    }

    /// Whether the frame answers a request (ACK or NAK).
    pub const fn is_response(self) -> bool {
        !matches!(self, Self::Request)
    }
}

/// Outcome of the CRC check of a completed frame.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum CrcStatus {
    /// The frame had no CRC trailer.
    Absent,
    /// The trailer matched the frame content.
    Matched,
    /// The trailer was malformed or did not match.
    Mismatched,
}

impl CrcStatus {
    /// Whether the frame carried a CRC trailer at all.
    pub const fn is_present(self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Correlation fields of a frame: `[id '@'] name [':' sequence]`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Header<'a> {
    /// Optional correlation id (bus address on RS485/CAN links).
    pub id: Option<&'a [u8]>,
    /// Command or response name.
    pub name: &'a [u8],
    /// Optional sequence number (datagram transports).
    pub sequence: Option<&'a [u8]>,
}

impl<'a> Header<'a> {
    /// Builds a header from its text parts.
    pub const fn new(id: Option<&'a str>, name: &'a str, sequence: Option<&'a str>) -> Self {
        Self {
            id: match id {
                Some(id) => Some(id.as_bytes()),
                None => None,
            },
            name: name.as_bytes(),
            sequence: match sequence {
                Some(sequence) => Some(sequence.as_bytes()),
                None => None,
            },
        }
    }

    /// Splits the first record of a frame into id, name and sequence.
    ///
    /// The id ends at the first `'@'`; the sequence starts after the first
    /// `':'` that follows it.
    pub fn parse(record: &'a [u8]) -> Self {
        let (id, rest) = match split_once(record, ID_MARK) {
            Some((id, rest)) => (Some(id), rest),
            None => (None, record),
        };
        let (name, sequence) = match split_once(rest, SEQUENCE_MARK) {
            Some((name, sequence)) => (name, Some(sequence)),
            None => (rest, None),
        };
        Self { id, name, sequence }
    }
}

fn split_once(bytes: &[u8], mark: u8) -> Option<(&[u8], &[u8])> {
    let at = bytes.iter().position(|&b| b == mark)?;
    Some((&bytes[..at], &bytes[at + 1..]))
}

/// A completed frame, borrowed from the parser's receive buffer.
///
/// Argument 0 is the command name (header stripped); positional arguments
/// start at index 1.
#[derive(Debug)]
pub struct Frame<'a> {
    kind: FrameKind,
    header: Header<'a>,
    args: Vec<&'a [u8], MAX_ARGS>,
    crc: CrcStatus,
}

impl<'a> Frame<'a> {
    /// Request, ACK or NAK.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// The decoded header.
    pub fn header(&self) -> Header<'a> {
        self.header
    }

    /// The command or response name.
    pub fn name(&self) -> &'a [u8] {
        self.header.name
    }

    /// The correlation id, if the header carried one.
    pub fn id(&self) -> Option<&'a [u8]> {
        self.header.id
    }

    /// The sequence number, if the header carried one.
    pub fn sequence(&self) -> Option<&'a [u8]> {
        self.header.sequence
    }

    /// CRC verdict for this frame.
    pub fn crc(&self) -> CrcStatus {
        self.crc
    }

    /// Number of arguments, the name included.
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// All arguments, the name first.
    pub fn args(&self) -> &[&'a [u8]] {
        &self.args
    }

    /// Raw bytes of argument `index`.
    pub fn arg(&self, index: usize) -> Option<&'a [u8]> {
        self.args.get(index).copied()
    }

    /// Argument `index` as UTF-8 text.
    pub fn arg_str(&self, index: usize) -> Option<&'a str> {
        core::str::from_utf8(self.arg(index)?).ok()
    }

    /// Argument `index` parsed as an unsigned hexadecimal number.
    ///
    /// Only hex digits are accepted, no sign.
    pub fn arg_hex(&self, index: usize) -> Option<u32> {
        u32::from_str_radix(self.unsigned(index)?, 16).ok()
    }

    /// Argument `index` parsed as a signed decimal number.
    ///
    /// A leading `-` is the only sign accepted.
    pub fn arg_int(&self, index: usize) -> Option<i32> {
        self.unsigned(index)?.parse().ok()
    }

    /// Argument text, refused when it carries a `+` sign.
    fn unsigned(&self, index: usize) -> Option<&'a str> {
        self.arg_str(index).filter(|text| !text.starts_with('+'))
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum State {
    Idle,
    Active(usize),
    Complete(usize),
}

/// Byte-at-a-time frame reassembler with an `N` byte receive buffer.
///
/// ## Example
///
/// ```rust
/// use hupacket::frame::{FrameKind, FrameParser};
///
/// let mut parser: FrameParser<64> = FrameParser::new();
/// let complete = b"\x051@erase\x1eslot0\x04"
///     .iter()
///     .fold(false, |_, &b| parser.push(b));
/// assert!(complete);
///
/// let frame = parser.frame().unwrap();
/// assert_eq!(frame.kind(), FrameKind::Request);
/// assert_eq!(frame.name(), b"erase");
/// assert_eq!(frame.arg(1), Some(&b"slot0"[..]));
/// ```
#[derive(Debug)]
pub struct FrameParser<const N: usize> {
    buf: [u8; N],
    state: State,
    kind: FrameKind,
    /// Offset where each argument begins; the byte before every entry past
    /// the first is its record separator.
    starts: Vec<usize, MAX_ARGS>,
    /// Offset of the first CRC hex digit.
    crc_start: Option<usize>,
    dropped: u32,
}

impl<const N: usize> Default for FrameParser<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameParser<N> {
    /// Creates an idle parser.
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            state: State::Idle,
            kind: FrameKind::Request,
            starts: Vec::new(),
            crc_start: None,
            dropped: 0,
        }
    }

    /// Returns the parser to idle, discarding any partial or completed frame.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.starts.clear();
        self.crc_start = None;
    }

    /// Whether a frame is being collected.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Number of frames dropped because they overflowed or were malformed.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Feeds one byte. Returns `true` when it completed a frame.
    ///
    /// The completed frame stays available through [`frame()`](Self::frame)
    /// until the next call to `push` or [`reset()`](Self::reset).
    pub fn push(&mut self, byte: u8) -> bool {
        let cursor = match self.state {
            State::Active(cursor) => cursor,
            State::Idle | State::Complete(_) => {
                match FrameKind::from_marker(byte) {
                    Some(kind) => self.begin(kind),
                    // Noise between frames.
                    None => self.state = State::Idle,
                }
                return false;
            }
        };

        match byte {
            EOT => {
                self.state = State::Complete(cursor);
                true
            }
            CRC_MARK => {
                if self.crc_start.is_some() {
                    self.drop_frame("second crc marker");
                } else {
                    self.crc_start = Some(cursor);
                }
                false
            }
            RECORD_MARK => {
                if self.crc_start.is_some() {
                    self.drop_frame("record separator inside crc trailer");
                } else if self.starts.push(cursor + 1).is_err() {
                    self.drop_frame("argument vector overflow");
                } else {
                    self.store(cursor, byte);
                }
                false
            }
            _ => {
                self.store(cursor, byte);
                false
            }
        }
    }

    fn begin(&mut self, kind: FrameKind) {
        self.reset();
        self.kind = kind;
        self.state = State::Active(0);
        // Capacity is MAX_ARGS > 0, the first push cannot fail.
        let _ = self.starts.push(0);
    }

    fn store(&mut self, cursor: usize, byte: u8) {
        match self.buf.get_mut(cursor) {
            Some(slot) => {
                *slot = byte;
                self.state = State::Active(cursor + 1);
            }
            None => self.drop_frame("receive buffer overflow"),
        }
    }

    fn drop_frame(&mut self, reason: &'static str) {
        warn!("dropping frame: {}", reason);
        self.dropped = self.dropped.wrapping_add(1);
        self.reset();
    }

    /// The completed frame, if the last pushed byte finished one.
    pub fn frame(&self) -> Option<Frame<'_>> {
        let State::Complete(len) = self.state else {
            return None;
        };
        let payload_end = self.crc_start.unwrap_or(len);

        let crc = match self.crc_start {
            None => CrcStatus::Absent,
            Some(start) => {
                let calculated = crc16(&self.buf[..payload_end]);
                match parse_crc(&self.buf[start..len]) {
                    Some(received) if received == calculated => CrcStatus::Matched,
                    _ => {
                        debug!("crc mismatch: calculated {}", calculated);
                        CrcStatus::Mismatched
                    }
                }
            }
        };

        let mut args: Vec<&[u8], MAX_ARGS> = Vec::new();
        for (i, &start) in self.starts.iter().enumerate() {
            let end = match self.starts.get(i + 1) {
                Some(&next) => next - 1,
                None => payload_end,
            };
            // Same capacity as `starts`.
            let _ = args.push(&self.buf[start..end]);
        }

        let header = Header::parse(args.first().copied().unwrap_or_default());
        if let Some(first) = args.first_mut() {
            *first = header.name;
        }

        Some(Frame {
            kind: self.kind,
            header,
            args,
            crc,
        })
    }
}
