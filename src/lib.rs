//! A message-oriented IPC library: typed, self-describing messages over
//! stream and datagram sockets, modeled on `libpomp`.
//!
//! Three layers, each its own module:
//!
//! - [`wire`] — the binary codec. A printf-style format string drives
//!   encoding and decoding of a self-describing payload: integers, floats,
//!   strings, buffers, and out-of-band file descriptors, all wrapped in a
//!   12-byte frame header ([`wire::Message`]).
//! - [`connection`] — per-peer framing on top of a nonblocking socket: a
//!   read-side state machine that reassembles frames out of partial reads,
//!   a write queue that tolerates partial writes, and ancillary-data fd
//!   passing over `sendmsg`/`recvmsg`.
//! - [`context`] — the event-driven orchestrator: listen, connect, and bind
//!   dispatchers running on one [`reactor::EventLoop`], with idempotent
//!   stop, cross-thread wakeup, and unicast/broadcast sends.
//!
//! [`addr::Address`] is the `inet:`/`inet6:`/`unix:` address syntax shared
//! by all three entry points into [`context::Context`].

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

pub mod addr;
pub mod connection;
pub mod context;
pub mod error;
mod reactor;
pub mod wire;

pub use addr::Address;
pub use context::{Config, Context, ContextKind, Event};
pub use error::{Error, Result};
pub use wire::Message;
