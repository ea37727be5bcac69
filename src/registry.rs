//! Static dispatch tables mapping frame names to handlers.
//!
//! A [`Registry`] holds two read-only tables: one for requests sent by the
//! peer and one for responses to requests this device sent. Tables are plain
//! `'static` slices, usually `const` items, so a single registry can be shared
//! by every transport thread without locking.
//!
//! ## Example
//!
//! ```rust
//! use hupacket::frame::{Frame, reply::Reply};
//! use hupacket::registry::{Command, Registry};
//!
//! struct App {
//!     pings: u32,
//! }
//!
//! fn ping(_frame: &Frame<'_>, reply: &mut Reply<'_>, app: &mut App) {
//!     app.pings += 1;
//!     reply.ack();
//!     let _ = reply.send();
//! }
//!
//! static REGISTRY: Registry<App> = Registry::new(&[Command::new("ping", ping)], &[]);
//! assert!(REGISTRY.request(b"ping").is_some());
//! assert!(REGISTRY.response(b"ping").is_none());
//! ```

use core::fmt;

use crate::frame::reply::Reply;
use crate::frame::{Frame, FrameKind};

/// Signature shared by request and response handlers.
///
/// The handler receives the decoded frame, a reply builder bound to the
/// session's transmit buffer and transport, and the session's user context.
/// Request handlers are expected to answer through the reply; response
/// handlers usually only inspect the frame (and [`Frame::crc`]).
pub type Handler<C> = fn(&Frame<'_>, &mut Reply<'_>, &mut C);

/// One `(name, handler)` entry.
pub struct Command<C: 'static> {
    name: &'static str,
    handler: Handler<C>,
}

impl<C: 'static> Command<C> {
    /// Creates an entry.
    pub const fn new(name: &'static str, handler: Handler<C>) -> Self {
        Self { name, handler }
    }

    /// The frame name this entry answers to.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The handler function.
    pub const fn handler(&self) -> Handler<C> {
        self.handler
    }
}

impl<C: 'static> fmt::Debug for Command<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("name", &self.name).finish()
    }
}

/// Request and response tables.
pub struct Registry<C: 'static> {
    requests: &'static [Command<C>],
    responses: &'static [Command<C>],
}

impl<C: 'static> Registry<C> {
    /// Builds a registry from its two tables.
    pub const fn new(requests: &'static [Command<C>], responses: &'static [Command<C>]) -> Self {
        Self {
            requests,
            responses,
        }
    }

    /// Looks up a request handler.
    pub fn request(&self, name: &[u8]) -> Option<Handler<C>> {
        lookup(self.requests, name)
    }

    /// Looks up a response handler.
    pub fn response(&self, name: &[u8]) -> Option<Handler<C>> {
        lookup(self.responses, name)
    }

    /// Looks up the handler for a frame of `kind` named `name`.
    pub fn find(&self, kind: FrameKind, name: &[u8]) -> Option<Handler<C>> {
        if kind.is_response() {
            self.response(name)
        } else {
            self.request(name)
        }
    }
}

fn lookup<C: 'static>(table: &[Command<C>], name: &[u8]) -> Option<Handler<C>> {
    table
        .iter()
        .find(|cmd| cmd.name.as_bytes() == name)
        .map(|cmd| cmd.handler)
}

impl<C: 'static> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("requests", &self.requests)
            .field("responses", &self.responses)
            .finish()
    }
}
