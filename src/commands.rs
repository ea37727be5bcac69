//! Firmware maintenance commands.
//!
//! Handlers for the request names every controller answers to: flash
//! partition maintenance (`erase`, `wrprt`, `flash`), identification (`ver`,
//! `slot`) and `reboot`. They are generic over a [`Firmware`] context, which
//! stands for the board specific collaborators: flash partitions, the ascii85
//! decoder, bootloader metadata, the reboot timer and the shared pool.
//!
//! | Request | Arguments                                   | Fields after status          |
//! |---------|---------------------------------------------|------------------------------|
//! | `erase` | partition                                   | partition                    |
//! | `wrprt` | partition, level (decimal)                  | partition                    |
//! | `flash` | partition, offset (hex), length (hex), data | partition, offset, length    |
//! | `ver`   |                                             | app, kernel, build stamp     |
//! | `reboot`|                                             |                              |
//! | `slot`  |                                             | active slot                  |
//!
//! Missing or malformed arguments answer [`status::EINVAL`]. Collaborator
//! failures answer the code the collaborator returned.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hupacket::commands;
//! use hupacket::registry::{Command, Registry};
//!
//! const REQUESTS: [Command<Board>; 6] = commands::table::<Board>();
//! static REGISTRY: Registry<Board> = Registry::new(&REQUESTS, &[]);
//! ```

use core::ops::RangeInclusive;

use crate::consts::status;
use crate::frame::Frame;
use crate::frame::reply::Reply;
use crate::pool::LockedPool;
use crate::registry::Command;

/// Board services the maintenance commands rely on.
///
/// Every fallible method reports failure as a negative status code, which is
/// sent back to the peer unchanged.
pub trait Firmware {
    /// Erases the whole partition named `partition`.
    fn erase(&mut self, partition: &str) -> Result<(), i32>;

    /// Sets the write protection level of `partition`.
    fn write_protect(&mut self, partition: &str, level: i32) -> Result<(), i32>;

    /// Writes `data` at `offset` inside `partition`.
    fn write(&mut self, partition: &str, offset: u32, data: &[u8]) -> Result<(), i32>;

    /// Decodes ascii85 `text` into `out`, returning the decoded length.
    ///
    /// A payload that does not fit in `out` must be reported as an error,
    /// usually [`status::DECODE_SIZE`]; malformed text as [`status::ASCII85`].
    fn decode_ascii85(&self, text: &[u8], out: &mut [u8]) -> Result<usize, i32>;

    /// Pool that backs temporary decode buffers.
    fn pool(&self) -> &'static LockedPool;

    /// Application version string.
    fn app_version(&self) -> &str;

    /// Kernel version string.
    fn kernel_version(&self) -> &str;

    /// Build date and time.
    fn build_stamp(&self) -> &str;

    /// Image slot the bootloader started.
    fn active_slot(&self) -> Result<u8, i32>;

    /// Arms a delayed reset so the acknowledgement can still be sent.
    fn schedule_reboot(&mut self);
}

/// Request table with every command of this module.
pub const fn table<F: Firmware + 'static>() -> [Command<F>; 6] {
    [
        Command::new("erase", erase::<F>),
        Command::new("wrprt", wrprt::<F>),
        Command::new("flash", flash::<F>),
        Command::new("ver", ver::<F>),
        Command::new("reboot", reboot::<F>),
        Command::new("slot", slot::<F>),
    ]
}

/// Appends the arguments in `range` that the request actually carried.
fn echo(frame: &Frame<'_>, reply: &mut Reply<'_>, range: RangeInclusive<usize>) {
    for arg in range.filter_map(|i| frame.arg(i)) {
        reply.record_bytes(arg);
    }
}

fn finish(reply: &mut Reply<'_>, name: &str) {
    if let Err(e) = reply.send() {
        error!("{} reply not sent: {}", name, e);
    }
}

/// `erase partition`
pub fn erase<F: Firmware>(frame: &Frame<'_>, reply: &mut Reply<'_>, fw: &mut F) {
    let result = match frame.arg_str(1) {
        Some(partition) => fw.erase(partition),
        None => Err(status::EINVAL),
    };
    if let Err(code) = result {
        warn!("erase failed: {}", code);
    }
    reply.status(result);
    echo(frame, reply, 1..=1);
    finish(reply, "erase");
}

/// `wrprt partition level`
pub fn wrprt<F: Firmware>(frame: &Frame<'_>, reply: &mut Reply<'_>, fw: &mut F) {
    let result = match (frame.arg_str(1), frame.arg_int(2)) {
        (Some(partition), Some(level)) => fw.write_protect(partition, level),
        _ => Err(status::EINVAL),
    };
    reply.status(result);
    echo(frame, reply, 1..=1);
    finish(reply, "wrprt");
}

/// `flash partition offset length data`
///
/// The ascii85 payload is decoded into a zeroed block from the firmware pool,
/// which is released before the reply is sent.
pub fn flash<F: Firmware>(frame: &Frame<'_>, reply: &mut Reply<'_>, fw: &mut F) {
    let args = (
        frame.arg_str(1),
        frame.arg_hex(2),
        frame.arg_hex(3),
        frame.arg(4),
    );
    let result = match args {
        (Some(partition), Some(offset), Some(length), Some(data)) => {
            program(fw, partition, offset, length as usize, data)
        }
        _ => Err(status::EINVAL),
    };
    if let Err(code) = result {
        warn!("flash failed: {}", code);
    }
    reply.status(result);
    echo(frame, reply, 1..=3);
    finish(reply, "flash");
}

fn program<F: Firmware>(
    fw: &mut F,
    partition: &str,
    offset: u32,
    length: usize,
    text: &[u8],
) -> Result<(), i32> {
    if length == 0 {
        return Err(status::EINVAL);
    }
    let pool = fw.pool();
    let Some(block) = pool.allocate_zeroed(length, 1) else {
        warn!("no pool memory for {} bytes", length);
        return Err(status::ENOMEM);
    };
    // The block is `length` bytes, zeroed, and owned here until freed below.
    let out = unsafe { core::slice::from_raw_parts_mut(block.as_ptr(), length) };
    let result = match fw.decode_ascii85(text, out) {
        Ok(decoded) if decoded == length => fw.write(partition, offset, out),
        Ok(decoded) => {
            debug!("decoded {} bytes, expected {}", decoded, length);
            Err(status::DECODE_SIZE)
        }
        Err(code) => Err(code),
    };
    unsafe { pool.free(block) };
    result
}

/// `ver`
pub fn ver<F: Firmware>(_frame: &Frame<'_>, reply: &mut Reply<'_>, fw: &mut F) {
    reply.ack();
    reply.record_str(fw.app_version());
    reply.record_str(fw.kernel_version());
    reply.record_str(fw.build_stamp());
    finish(reply, "ver");
}

/// `reboot`
pub fn reboot<F: Firmware>(_frame: &Frame<'_>, reply: &mut Reply<'_>, fw: &mut F) {
    fw.schedule_reboot();
    reply.ack();
    finish(reply, "reboot");
}

/// `slot`
pub fn slot<F: Firmware>(_frame: &Frame<'_>, reply: &mut Reply<'_>, fw: &mut F) {
    match fw.active_slot() {
        Ok(slot) => {
            reply.ack();
            reply.record_int(i32::from(slot));
        }
        Err(code) => reply.nak(code),
    }
    finish(reply, "slot");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{CRC_MARK, EOT};
    use crate::crc::crc16;
    use crate::registry::Registry;
    use crate::session::{Session, Transport};
    use std::boxed::Box;
    use std::string::{String, ToString};
    use std::vec;
    use std::vec::Vec;

    #[derive(Default)]
    struct Wire {
        sent: Vec<u8>,
    }

    impl Transport for Wire {
        type Error = ();

        fn recv(&mut self, _buf: &mut [u8]) -> nb::Result<usize, ()> {
            Err(nb::Error::WouldBlock)
        }

        fn send(&mut self, bytes: &[u8]) -> nb::Result<usize, ()> {
            self.sent.extend_from_slice(bytes);
            Ok(bytes.len())
        }
    }

    struct Board {
        pool: &'static LockedPool,
        erase_result: Result<(), i32>,
        erased: Vec<String>,
        protected: Vec<(String, i32)>,
        written: Vec<(String, u32, Vec<u8>)>,
        slot: Result<u8, i32>,
        reboots: u32,
    }

    impl Board {
        fn new(pool_words: usize) -> Self {
            let pool: &'static LockedPool = Box::leak(Box::new(LockedPool::new()));
            let mem: &'static mut [usize] = Box::leak(vec![0usize; pool_words].into_boxed_slice());
            let range = mem.as_mut_ptr_range();
            assert!(unsafe { pool.init(range.start.cast(), range.end.cast()) });
            Self {
                pool,
                erase_result: Ok(()),
                erased: Vec::new(),
                protected: Vec::new(),
                written: Vec::new(),
                slot: Ok(1),
                reboots: 0,
            }
        }
    }

    impl Firmware for Board {
        fn erase(&mut self, partition: &str) -> Result<(), i32> {
            self.erased.push(partition.to_string());
            self.erase_result
        }

        fn write_protect(&mut self, partition: &str, level: i32) -> Result<(), i32> {
            self.protected.push((partition.to_string(), level));
            Ok(())
        }

        fn write(&mut self, partition: &str, offset: u32, data: &[u8]) -> Result<(), i32> {
            self.written.push((partition.to_string(), offset, data.to_vec()));
            Ok(())
        }

        /// Stand-in decoder: the text between `<~` and `~>` is the payload.
        fn decode_ascii85(&self, text: &[u8], out: &mut [u8]) -> Result<usize, i32> {
            let inner = text
                .strip_prefix(b"<~")
                .and_then(|t| t.strip_suffix(b"~>"))
                .ok_or(status::ASCII85)?;
            let dst = out.get_mut(..inner.len()).ok_or(status::DECODE_SIZE)?;
            dst.copy_from_slice(inner);
            Ok(inner.len())
        }

        fn pool(&self) -> &'static LockedPool {
            self.pool
        }

        fn app_version(&self) -> &str {
            "1.2.3"
        }

        fn kernel_version(&self) -> &str {
            "3.7.0"
        }

        fn build_stamp(&self) -> &str {
            "Jan  1 2025 00:00:00"
        }

        fn active_slot(&self) -> Result<u8, i32> {
            self.slot
        }

        fn schedule_reboot(&mut self) {
            self.reboots += 1;
        }
    }

    const REQUESTS: [Command<Board>; 6] = table::<Board>();
    static REGISTRY: Registry<Board> = Registry::new(&REQUESTS, &[]);

    fn session(board: Board) -> Session<Wire, Board, 256> {
        Session::new(Wire::default(), &REGISTRY, board)
    }

    fn exchange(board: Board, request: &[u8]) -> (Vec<u8>, Board) {
        let mut s = session(board);
        assert_eq!(s.feed(request), 1);
        let (wire, board) = s.into_parts();
        (wire.sent, board)
    }

    #[test]
    fn test_erase_acknowledged() {
        let (sent, board) = exchange(Board::new(64), b"\x051@erase\x1eslot0\x04");
        assert_eq!(sent, b"\x061@erase\x1e0\x1eslot0\x04");
        assert_eq!(board.erased, ["slot0"]);
    }

    #[test]
    fn test_erase_failure_is_negative_acknowledged() {
        let mut board = Board::new(64);
        board.erase_result = Err(status::EIO);
        let (sent, _) = exchange(board, b"\x051@erase\x1eslot0\x04");
        assert_eq!(sent, b"\x151@erase\x1e-5\x1eslot0\x04");
    }

    #[test]
    fn test_missing_argument_is_invalid() {
        let (sent, board) = exchange(Board::new(64), b"\x05erase\x04");
        assert_eq!(sent, b"\x15erase\x1e-22\x04");
        assert!(board.erased.is_empty());

        let (sent, board) = exchange(Board::new(64), b"\x05wrprt\x1eslot1\x1ehigh\x04");
        assert_eq!(sent, b"\x15wrprt\x1e-22\x1eslot1\x04");
        assert!(board.protected.is_empty());
    }

    #[test]
    fn test_write_protect() {
        let (sent, board) = exchange(Board::new(64), b"\x05wrprt\x1eslot1\x1e2\x04");
        assert_eq!(sent, b"\x06wrprt\x1e0\x1eslot1\x04");
        assert_eq!(board.protected, [("slot1".to_string(), 2)]);
    }

    #[test]
    fn test_flash_writes_decoded_payload() {
        let (sent, board) = exchange(
            Board::new(64),
            b"\x0519@flash:21345\x1eslot0\x1e10000\x1e5\x1e<~hello~>\x04",
        );
        assert_eq!(sent, b"\x0619@flash:21345\x1e0\x1eslot0\x1e10000\x1e5\x04");
        assert_eq!(board.written, [("slot0".to_string(), 0x10000, b"hello".to_vec())]);

        let stats = board.pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    fn test_flash_reply_mirrors_crc() {
        let body = b"2@flash\x1eslot1\x1e0\x1e3\x1e<~abc~>";
        let mut request = vec![crate::consts::ENQ];
        request.extend_from_slice(body);
        request.push(CRC_MARK);
        request.extend_from_slice(format!("{:04X}", crc16(body)).as_bytes());
        request.push(EOT);

        let (sent, board) = exchange(Board::new(64), &request);
        let reply_body = b"2@flash\x1e0\x1eslot1\x1e0\x1e3";
        let mut expected = vec![crate::consts::ACK];
        expected.extend_from_slice(reply_body);
        expected.push(CRC_MARK);
        expected.extend_from_slice(format!("{:04X}", crc16(reply_body)).as_bytes());
        expected.push(EOT);
        assert_eq!(sent, expected);
        assert_eq!(board.written.len(), 1);
    }

    #[test]
    fn test_flash_size_mismatch() {
        let (sent, board) = exchange(
            Board::new(64),
            b"\x05flash\x1eslot0\x1e0\x1e6\x1e<~hello~>\x04",
        );
        assert_eq!(sent, b"\x15flash\x1e-2002\x1eslot0\x1e0\x1e6\x04");
        assert!(board.written.is_empty());
        assert_eq!(board.pool.stats().frees, 1);
    }

    #[test]
    fn test_flash_bad_payload() {
        let (sent, _) = exchange(Board::new(64), b"\x05flash\x1eslot0\x1e0\x1e2\x1ehi\x04");
        assert_eq!(sent, b"\x15flash\x1e-2001\x1eslot0\x1e0\x1e2\x04");
    }

    #[test]
    fn test_flash_pool_exhaustion() {
        let (sent, board) = exchange(
            Board::new(64),
            b"\x05flash\x1eslot0\x1e0\x1eFFFFF\x1e<~x~>\x04",
        );
        assert_eq!(sent, b"\x15flash\x1e-12\x1eslot0\x1e0\x1eFFFFF\x04");
        assert_eq!(board.pool.stats().allocations, 0);
    }

    #[test]
    fn test_flash_malformed_numbers() {
        let (sent, board) = exchange(
            Board::new(64),
            b"\x05flash\x1eslot0\x1ezz\x1e5\x1e<~hello~>\x04",
        );
        assert_eq!(sent, b"\x15flash\x1e-22\x1eslot0\x1ezz\x1e5\x04");
        assert!(board.written.is_empty());
    }

    #[test]
    fn test_version() {
        let (sent, _) = exchange(Board::new(64), b"\x05ver\x04");
        assert_eq!(sent, b"\x06ver\x1e0\x1e1.2.3\x1e3.7.0\x1eJan  1 2025 00:00:00\x04");
    }

    #[test]
    fn test_reboot() {
        let (sent, board) = exchange(Board::new(64), b"\x05reboot:4\x04");
        assert_eq!(sent, b"\x06reboot:4\x1e0\x04");
        assert_eq!(board.reboots, 1);
    }

    #[test]
    fn test_slot() {
        let (sent, _) = exchange(Board::new(64), b"\x05slot\x04");
        assert_eq!(sent, b"\x06slot\x1e0\x1e1\x04");

        let mut board = Board::new(64);
        board.slot = Err(status::ENOTSUP);
        let (sent, _) = exchange(board, b"\x05slot\x04");
        assert_eq!(sent, b"\x15slot\x1e-134\x04");
    }
}
