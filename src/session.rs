//! Per-connection protocol sessions.
//!
//! A [`Session`] binds one byte [`Transport`] to a [`FrameParser`], a transmit
//! buffer, a shared [`Registry`] and a user context `C`. Received bytes are
//! parsed as they arrive; each completed frame is checked, looked up and handed
//! to its handler before the next byte is consumed.
//!
//! Sessions are driven either by pushing bytes with [`Session::feed`] (for
//! interrupt or async drivers that already own the data) or by letting the
//! session pull from its transport with [`Session::poll`] and
//! [`Session::run`].
//!
//! ## Example
//!
//! ```rust
//! use hupacket::frame::{Frame, reply::Reply};
//! use hupacket::registry::{Command, Registry};
//! use hupacket::session::{Session, Transport};
//!
//! #[derive(Default)]
//! struct Loopback {
//!     sent: Vec<u8>,
//! }
//!
//! impl Transport for Loopback {
//!     type Error = ();
//!     fn recv(&mut self, _buf: &mut [u8]) -> nb::Result<usize, ()> {
//!         Err(nb::Error::WouldBlock)
//!     }
//!     fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, ()> {
//!         self.sent.extend_from_slice(bytes);
//!         Ok(bytes.len())
//!     }
//! }
//!
//! fn ping(_: &Frame<'_>, reply: &mut Reply<'_>, _: &mut ()) {
//!     reply.ack();
//!     let _ = reply.send();
//! }
//!
//! static REGISTRY: Registry<()> = Registry::new(&[Command::new("ping", ping)], &[]);
//!
//! let mut session: Session<_, ()> = Session::new(Loopback::default(), &REGISTRY, ());
//! assert_eq!(session.feed(b"\x05ping\x04"), 1);
//! assert_eq!(session.transport().sent, b"\x06ping\x1e0\x04");
//! ```

use embedded_hal::delay::DelayNs;

use crate::consts::{PACKET_SIZE, RECV_CHUNK_SIZE, status};
use crate::error::{Error, Result};
use crate::frame::reply::{Reply, Sink};
use crate::frame::{CrcStatus, FrameKind, FrameParser, Header};
use crate::registry::Registry;

/// A byte transport: serial port, datagram socket, USB CDC bridge.
///
/// Both directions follow the `nb` convention: `WouldBlock` means "nothing
/// yet, try again", `Other` is a hard failure.
pub trait Transport {
    /// Driver specific error.
    type Error;

    /// Reads available bytes into `buf`, returning how many were read.
    ///
    /// `Ok(0)` is treated like `WouldBlock`.
    fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error>;

    /// Writes a prefix of `bytes`, returning how many were accepted.
    fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, Self::Error>;
}

impl<T: Transport> Sink for T {
    fn send_frame(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match nb::block!(self.send(&bytes[written..])) {
                Ok(0) => {
                    warn!("transport stalled after {} of {} bytes", written, bytes.len());
                    return Err(Error::ShortWrite {
                        written,
                        expected: bytes.len(),
                    });
                }
                Ok(n) => written += n,
                Err(_) => {
                    error!("transport send failed after {} bytes", written);
                    return Err(Error::Transport);
                }
            }
        }
        Ok(written)
    }
}

/// Frame counters of a session.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct SessionStats {
    /// Frames handed to a handler.
    pub dispatched: u32,
    /// Complete frames whose name had no handler.
    pub unknown: u32,
    /// Requests refused because their CRC trailer did not match.
    pub crc_errors: u32,
    /// Frames dropped while being received (overflow, malformed trailer).
    pub dropped: u32,
}

/// One protocol endpoint over one transport.
///
/// `N` sizes both the receive and the transmit buffer.
#[derive(Debug)]
pub struct Session<T, C: 'static, const N: usize = PACKET_SIZE> {
    transport: T,
    registry: &'static Registry<C>,
    context: C,
    parser: FrameParser<N>,
    tx: [u8; N],
    stats: SessionStats,
}

impl<T: Transport, C: 'static, const N: usize> Session<T, C, N> {
    /// Creates an idle session.
    pub fn new(transport: T, registry: &'static Registry<C>, context: C) -> Self {
        Self {
            transport,
            registry,
            context,
            parser: FrameParser::new(),
            tx: [0; N],
            stats: SessionStats::default(),
        }
    }

    /// Parses `bytes`, dispatching every frame they complete.
    ///
    /// Returns the number of completed frames, including those that were
    /// refused or had no handler.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let mut completed = 0;
        for &byte in bytes {
            if self.parser.push(byte) {
                completed += 1;
                self.dispatch();
            }
        }
        completed
    }

    fn dispatch(&mut self) {
        let Self {
            transport,
            registry,
            context,
            parser,
            tx,
            stats,
        } = self;

        if let Some(frame) = parser.frame() {
            let kind = frame.kind();
            let name = core::str::from_utf8(frame.name()).unwrap_or("?");

            if kind == FrameKind::Request && frame.crc() == CrcStatus::Mismatched {
                stats.crc_errors = stats.crc_errors.wrapping_add(1);
                warn!("crc mismatch on request {}", name);
                let mut reply = Reply::new(&mut tx[..], frame.header(), true, transport);
                reply.nak(status::CRC_MISMATCH);
                if reply.send().is_err() {
                    error!("failed to send crc nak for {}", name);
                }
            } else if let Some(handler) = registry.find(kind, frame.name()) {
                stats.dispatched = stats.dispatched.wrapping_add(1);
                trace!("dispatching {}", name);
                let crc = frame.crc().is_present();
                let mut reply = Reply::new(&mut tx[..], frame.header(), crc, transport);
                handler(&frame, &mut reply, context);
            } else {
                stats.unknown = stats.unknown.wrapping_add(1);
                debug!("no handler for {}", name);
            }
        }

        parser.reset();
    }

    /// Reads one chunk from the transport and feeds it.
    ///
    /// Returns the number of completed frames, or `WouldBlock` when the
    /// transport had nothing to offer.
    ///
    /// # Errors
    /// [`Error::Transport`] if the transport failed.
    pub fn poll(&mut self) -> nb::Result<usize, Error> {
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        match self.transport.recv(&mut chunk) {
            Ok(0) | Err(nb::Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Ok(n) => Ok(self.feed(&chunk[..n.min(RECV_CHUNK_SIZE)])),
            Err(nb::Error::Other(_)) => {
                error!("transport receive failed");
                Err(nb::Error::Other(Error::Transport))
            }
        }
    }

    /// Blocking receive loop.
    ///
    /// Polls the transport, sleeping `poll_us` microseconds whenever no data is
    /// available. Only returns when the transport fails, with the error that
    /// ended the loop.
    pub fn run<D: DelayNs>(&mut self, delay: &mut D, poll_us: u32) -> Error {
        loop {
            match self.poll() {
                Ok(_) => {}
                Err(nb::Error::WouldBlock) => delay.delay_us(poll_us),
                Err(nb::Error::Other(e)) => return e,
            }
        }
    }

    /// Sends a request initiated by this device.
    ///
    /// The frame is opened with the request marker and `header`; `build`
    /// appends the records. Answers arrive later through the registry's
    /// response table.
    ///
    /// # Errors
    /// Same as [`Reply::send`].
    pub fn send_request<F>(&mut self, header: Header<'_>, crc: bool, build: F) -> Result<usize>
    where
        F: FnOnce(&mut Reply<'_>),
    {
        let mut reply = Reply::new(&mut self.tx[..], header, crc, &mut self.transport);
        reply.reset(FrameKind::Request);
        build(&mut reply);
        reply.send()
    }

    /// Frame counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dropped: self.parser.dropped(),
            ..self.stats
        }
    }

    /// The user context handed to handlers.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Mutable access to the user context.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consumes the session, returning its transport and context.
    pub fn into_parts(self) -> (T, C) {
        (self.transport, self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{CRC_MARK, ENQ, EOT};
    use crate::crc::crc16;
    use crate::frame::Frame;
    use crate::registry::Command;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Default)]
    struct Mock {
        incoming: VecDeque<nb::Result<Vec<u8>, ()>>,
        sent: Vec<u8>,
        /// Maximum bytes accepted per `send` call.
        accept: Option<usize>,
    }

    impl Mock {
        fn with_chunks(chunks: &[&[u8]]) -> Self {
            Self {
                incoming: chunks.iter().map(|c| Ok(c.to_vec())).collect(),
                ..Self::default()
            }
        }
    }

    impl Transport for Mock {
        type Error = ();

        fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, ()> {
            match self.incoming.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(nb::Error::Other(())),
            }
        }

        fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, ()> {
            let n = self.accept.map_or(bytes.len(), |a| a.min(bytes.len()));
            self.sent.extend_from_slice(&bytes[..n]);
            Ok(n)
        }
    }

    #[derive(Default, Debug)]
    struct Ctx {
        hits: u32,
        last_crc: Option<CrcStatus>,
        last_send: Option<Result<usize>>,
    }

    fn echo(frame: &Frame<'_>, reply: &mut Reply<'_>, ctx: &mut Ctx) {
        ctx.hits += 1;
        reply.ack();
        for arg in &frame.args()[1..] {
            reply.record_bytes(arg);
        }
        ctx.last_send = Some(reply.send());
    }

    fn pong(frame: &Frame<'_>, _: &mut Reply<'_>, ctx: &mut Ctx) {
        ctx.hits += 1;
        ctx.last_crc = Some(frame.crc());
    }

    static REGISTRY: Registry<Ctx> = Registry::new(
        &[Command::new("echo", echo)],
        &[Command::new("ping", pong)],
    );

    fn session(transport: Mock) -> Session<Mock, Ctx, 64> {
        Session::new(transport, &REGISTRY, Ctx::default())
    }

    fn framed(marker: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![marker];
        out.extend_from_slice(body);
        out.push(CRC_MARK);
        out.extend_from_slice(format!("{:04X}", crc16(body)).as_bytes());
        out.push(EOT);
        out
    }

    #[test]
    fn test_request_is_dispatched_and_answered() {
        let mut s = session(Mock::default());
        assert_eq!(s.feed(b"noise\x054@echo:9\x1ea\x1eb\x04"), 1);
        assert_eq!(s.context().hits, 1);
        assert_eq!(s.context().last_send, Some(Ok(16)));
        assert_eq!(s.transport().sent, b"\x064@echo:9\x1e0\x1ea\x1eb\x04");
        assert_eq!(s.stats().dispatched, 1);
    }

    #[test]
    fn test_unknown_command_is_silent() {
        let mut s = session(Mock::default());
        assert_eq!(s.feed(b"\x05nope\x1e1\x04"), 1);
        // Response names are looked up in the response table only.
        assert_eq!(s.feed(b"\x06echo\x1e0\x04"), 1);
        assert!(s.transport().sent.is_empty());
        assert_eq!(s.context().hits, 0);
        assert_eq!(s.stats().unknown, 2);
    }

    #[test]
    fn test_request_crc_mismatch_is_refused() {
        let mut s = session(Mock::default());
        let mut bytes = framed(ENQ, b"2@echo\x1ex");
        bytes[1] = b'3';
        assert_eq!(s.feed(&bytes), 1);
        assert_eq!(s.context().hits, 0);
        assert_eq!(s.stats().crc_errors, 1);

        let body = b"3@echo\x1e-2000";
        assert_eq!(s.transport().sent, framed(crate::consts::NAK, body));
    }

    #[test]
    fn test_request_crc_is_mirrored() {
        let mut s = session(Mock::default());
        assert_eq!(s.feed(&framed(ENQ, b"echo\x1ex")), 1);
        assert_eq!(s.context().hits, 1);
        assert_eq!(s.transport().sent, framed(crate::consts::ACK, b"echo\x1e0\x1ex"));
    }

    #[test]
    fn test_response_crc_mismatch_is_dispatched() {
        let mut s = session(Mock::default());
        let mut bytes = framed(crate::consts::ACK, b"ping\x1e0");
        let last_digit = bytes.len() - 2;
        bytes[last_digit] = if bytes[last_digit] == b'0' { b'1' } else { b'0' };
        assert_eq!(s.feed(&bytes), 1);
        assert_eq!(s.context().hits, 1);
        assert_eq!(s.context().last_crc, Some(CrcStatus::Mismatched));
        assert!(s.transport().sent.is_empty());
    }

    #[test]
    fn test_response_crc_match_is_reported() {
        let mut s = session(Mock::default());
        assert_eq!(s.feed(&framed(crate::consts::ACK, b"5@ping:2\x1e0")), 1);
        assert_eq!(s.context().hits, 1);
        assert_eq!(s.context().last_crc, Some(CrcStatus::Matched));
        assert_eq!(s.stats().crc_errors, 0);
        assert!(s.transport().sent.is_empty());
    }

    #[test]
    fn test_counters_wrap() {
        let mut s = session(Mock::default());
        s.stats.dispatched = u32::MAX;
        s.stats.unknown = u32::MAX;
        s.stats.crc_errors = u32::MAX;
        let mut bad = framed(ENQ, b"echo");
        bad[1] = b'x';
        assert_eq!(s.feed(b"\x05echo\x04\x05nope\x04"), 2);
        assert_eq!(s.feed(&bad), 1);
        assert_eq!(
            s.stats(),
            SessionStats {
                dispatched: 0,
                unknown: 0,
                crc_errors: 0,
                dropped: 0,
            }
        );
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut s = session(Mock::default());
        let mut bytes = vec![ENQ];
        bytes.extend_from_slice(b"echo\x1e");
        bytes.extend(std::iter::repeat_n(b'x', 100));
        bytes.push(EOT);
        assert_eq!(s.feed(&bytes), 0);
        assert_eq!(s.stats().dropped, 1);

        assert_eq!(s.feed(b"\x05echo\x04"), 1);
        assert_eq!(s.context().hits, 1);
    }

    #[test]
    fn test_run_until_transport_fails() {
        let mut transport = Mock::with_chunks(&[b"\x05ec", b"ho\x1e1\x04\x05echo"]);
        transport.incoming.insert(1, Err(nb::Error::WouldBlock));
        transport.incoming.insert(1, Ok(Vec::new()));
        transport.incoming.push_back(Ok(b"\x1e2\x04".to_vec()));

        let mut s = session(transport);
        let mut delay = NoopDelay::new();
        assert_eq!(s.run(&mut delay, 100), Error::Transport);
        assert_eq!(s.context().hits, 2);
        assert_eq!(s.transport().sent, b"\x06echo\x1e0\x1e1\x04\x06echo\x1e0\x1e2\x04");
    }

    #[test]
    fn test_poll_would_block() {
        let mut transport = Mock::default();
        transport.incoming.push_back(Err(nb::Error::WouldBlock));
        transport.incoming.push_back(Ok(Vec::new()));
        let mut s = session(transport);
        assert_eq!(s.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(s.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(s.poll(), Err(nb::Error::Other(Error::Transport)));
    }

    #[test]
    fn test_partial_writes_are_completed() {
        let mut transport = Mock::default();
        transport.accept = Some(3);
        let mut s = session(transport);
        assert_eq!(s.feed(b"\x05echo\x1eabcdef\x04"), 1);
        assert_eq!(s.transport().sent, b"\x06echo\x1e0\x1eabcdef\x04");
    }

    #[test]
    fn test_stalled_transport_reports_short_write() {
        let mut transport = Mock::default();
        transport.accept = Some(0);
        let mut s = session(transport);
        assert_eq!(s.feed(b"\x05echo\x04"), 1);
        assert_eq!(
            s.context().last_send,
            Some(Err(Error::ShortWrite {
                written: 0,
                expected: 8
            }))
        );
    }

    #[test]
    fn test_send_request() {
        let mut s = session(Mock::default());
        let sent = s.send_request(Header::new(Some("7"), "ping", Some("1")), false, |r| {
            r.record_str("hello");
        });
        assert_eq!(sent, Ok(16));
        assert_eq!(s.transport().sent, b"\x057@ping:1\x1ehello\x04");

        // The answer goes to the response table.
        assert_eq!(s.feed(b"\x067@ping:1\x1e0\x04"), 1);
        assert_eq!(s.context().last_crc, Some(CrcStatus::Absent));

        let (transport, ctx) = s.into_parts();
        assert_eq!(ctx.hits, 1);
        assert_eq!(transport.sent.len(), 16);
    }
}
