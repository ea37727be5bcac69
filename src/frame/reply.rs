//! Outgoing frame construction.
//!
//! A [`Reply`] writes into the session's transmit buffer. Every reply starts
//! with [`Reply::reset`] (usually through [`Reply::ack`] or [`Reply::nak`]),
//! which writes the start marker and echoes the header of the frame being
//! answered so the peer can correlate it. Handlers then add fields with the
//! `record_*` primitives and finish with [`Reply::send`].
//!
//! Nothing reaches the transport until `send`; a reply that outgrew the buffer
//! is refused as a whole.

use core::fmt::{self, Write};

use crate::consts::{CRC_MARK, EOT, ID_MARK, RECORD_MARK, SEQUENCE_MARK, status};
use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::frame::{FrameKind, Header};

/// Destination of finished frames.
pub(crate) trait Sink {
    /// Writes the whole frame, returning the number of bytes sent.
    fn send_frame(&mut self, bytes: &[u8]) -> Result<usize>;
}

/// Builder for one outgoing frame.
pub struct Reply<'a> {
    buf: &'a mut [u8],
    len: usize,
    overflow: bool,
    header: Header<'a>,
    crc: bool,
    sink: &'a mut dyn Sink,
}

impl fmt::Debug for Reply<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("buf", &&self.buf[..self.len])
            .field("overflow", &self.overflow)
            .field("header", &self.header)
            .field("crc", &self.crc)
            .finish_non_exhaustive()
    }
}

impl<'a> Reply<'a> {
    pub(crate) fn new(
        buf: &'a mut [u8],
        header: Header<'a>,
        crc: bool,
        sink: &'a mut dyn Sink,
    ) -> Self {
        Self {
            buf,
            len: 0,
            overflow: false,
            header,
            crc,
            sink,
        }
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whether a CRC trailer will be appended by [`send`](Self::send).
    pub fn has_crc(&self) -> bool {
        self.crc
    }

    /// Clears the buffer, then writes the start marker for `kind` followed by
    /// the echoed header `[id '@'] name [':' sequence]`.
    pub fn reset(&mut self, kind: FrameKind) {
        self.len = 0;
        self.overflow = false;
        self.push(kind.marker());
        let Header { id, name, sequence } = self.header;
        if let Some(id) = id {
            self.append_bytes(id);
            self.push(ID_MARK);
        }
        self.append_bytes(name);
        if let Some(sequence) = sequence {
            self.push(SEQUENCE_MARK);
            self.append_bytes(sequence);
        }
    }

    /// Starts a positive response with status [`status::OK`].
    pub fn ack(&mut self) {
        self.reset(FrameKind::Ack);
        self.record_int(status::OK);
    }

    /// Starts a negative response carrying `code`.
    pub fn nak(&mut self, code: i32) {
        self.reset(FrameKind::Nak);
        self.record_int(code);
    }

    /// Starts an ACK for `Ok` or a NAK with the error code.
    pub fn status(&mut self, result: core::result::Result<(), i32>) {
        match result {
            Ok(()) => self.ack(),
            Err(code) => self.nak(code),
        }
    }

    fn push(&mut self, byte: u8) {
        self.append_bytes(&[byte]);
    }

    /// Appends raw bytes.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        match self.buf.get_mut(self.len..self.len + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                self.len += bytes.len();
            }
            None => self.overflow = true,
        }
    }

    /// Appends text.
    pub fn append_str(&mut self, s: &str) {
        self.append_bytes(s.as_bytes());
    }

    /// Appends a single byte; NUL is ignored.
    pub fn append_char(&mut self, ch: u8) {
        if ch != 0 {
            self.push(ch);
        }
    }

    /// Appends a decimal integer.
    pub fn append_int(&mut self, value: i32) {
        let _ = write!(self, "{value}");
    }

    /// Appends an unsigned upper-case hexadecimal integer.
    pub fn append_hex(&mut self, value: u32) {
        let _ = write!(self, "{value:X}");
    }

    /// Appends a record separator then raw bytes.
    pub fn record_bytes(&mut self, bytes: &[u8]) {
        self.push(RECORD_MARK);
        self.append_bytes(bytes);
    }

    /// Appends a record separator then text.
    pub fn record_str(&mut self, s: &str) {
        self.record_bytes(s.as_bytes());
    }

    /// Appends a record separator then a decimal integer.
    pub fn record_int(&mut self, value: i32) {
        self.push(RECORD_MARK);
        self.append_int(value);
    }

    /// Appends a record separator then a hexadecimal integer.
    pub fn record_hex(&mut self, value: u32) {
        self.push(RECORD_MARK);
        self.append_hex(value);
    }

    /// Closes the frame and hands it to the transport.
    ///
    /// When the answered request carried a CRC trailer, a trailer computed over
    /// everything after the start marker is appended before the end marker.
    /// The builder is empty afterwards.
    ///
    /// # Errors
    /// - [`Error::TxOverflow`] if the frame did not fit; nothing is sent.
    /// - [`Error::Transport`] / [`Error::ShortWrite`] from the transport.
    pub fn send(&mut self) -> Result<usize> {
        if self.crc && self.len > 0 {
            let crc = crc16(&self.buf[1..self.len]);
            self.push(CRC_MARK);
            let _ = write!(self, "{crc:04X}");
        }
        self.push(EOT);

        let len = core::mem::take(&mut self.len);
        if core::mem::take(&mut self.overflow) {
            warn!("reply of {} bytes does not fit, dropped", len);
            return Err(Error::TxOverflow);
        }
        trace!("sending {} bytes", len);
        self.sink.send_frame(&self.buf[..len])
    }
}

impl Write for Reply<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s);
        Ok(())
    }
}
