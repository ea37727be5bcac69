//! Error type shared by the session and reply paths.
//!
//! Protocol-level failures that the peer must see (bad arguments, storage
//! failures, CRC mismatch) travel as signed status codes inside a normal
//! response, see [`crate::consts::status`]. This type only covers failures
//! local to the device.

use thiserror::Error;

/// Local failures of a session.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Error {
    /// The transport reported a hard error on `recv` or `send`.
    #[error("transport failure")]
    Transport,

    /// A reply did not fit in the transmit buffer and was not sent.
    #[error("transmit buffer overflow")]
    TxOverflow,

    /// The transport accepted fewer bytes than the frame holds.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes accepted before the transport stalled.
        written: usize,
        /// Size of the frame.
        expected: usize,
    },
}

/// Result type alias using the crate [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
