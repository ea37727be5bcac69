//! # hupacket
//!
//! A portable, no_std core for controller firmware speaking the HU packet
//! protocol: a line-oriented command/response protocol carried over
//! interchangeable byte transports (UART, UDP socket, USB CDC).
//!
//! The crate provides the two pieces of such firmware that carry real design
//! decisions:
//! - a **framing and dispatch engine** that rebuilds frames from an unbounded
//!   byte stream, checks their CRC16, splits header and arguments in place and
//!   calls the registered handler
//! - a **pool allocator**, first-fit over one or more fixed memory arenas, for
//!   targets whose memory is split in banks a general heap cannot span
//!
//! ## Crate features
//! | Feature      | Description |
//! |--------------|-------------|
//! | `std`        | Disables `#![no_std]` and provides the host `critical-section` implementation |
//! | `defmt-0-3`  | Uses `defmt` logging and derives `defmt::Format` on public types |
//! | `log`        | Uses `log` logging |
//!
//! ## Wire format
//!
//! ```text
//! START header (RS argument)* [SUB crc16-hex] EOT
//! header = [id '@'] name [':' sequence]
//! ```
//!
//! `START` is ENQ for a request, ACK or NAK for a response. Every request gets
//! exactly one response, echoing its header, or none at all (unknown command,
//! framing error). See [`frame`] and [`consts`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hupacket::commands;
//! use hupacket::pool::LockedPool;
//! use hupacket::registry::{Command, Registry};
//! use hupacket::session::Session;
//!
//! static POOL: LockedPool = LockedPool::new();
//! const REQUESTS: [Command<Board>; 6] = commands::table::<Board>();
//! static REGISTRY: Registry<Board> = Registry::new(&REQUESTS, &[]);
//!
//! unsafe { POOL.init(DTCM_START, DTCM_END) };
//! let mut session: Session<_, _> = Session::new(uart, &REGISTRY, Board::new(&POOL));
//! let err = session.run(&mut delay, 500);
//! ```
//!
//! ## Integration Notes
//!
//! - Run one [`session::Session`] per transport, each on its own thread or
//!   task. Sessions are never shared.
//! - Registries are `'static` tables built before the loops start.
//! - The pool is shared by every session through [`pool::LockedPool`].
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded environments.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub use critical_section;
pub use heapless;

#[macro_use]
mod fmt;

pub mod commands;
pub mod consts;
pub mod crc;
pub mod error;
pub mod frame;
pub mod pool;
pub mod registry;
pub mod session;

pub use error::{Error, Result};
