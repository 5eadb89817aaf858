//! The wire codec: a self-describing binary encoding driven by a
//! printf-style format string (spec.md §4.1–§4.3, §6).
//!
//! Structured the way the teacher splits `protocol/serde.rs` (the
//! tag-reader/writer pair) from `protocol.rs` (the framing around it):
//! this module owns the [`Tag`] table, the [`Buffer`] that backs a
//! payload, the [`format`] scanner, and the [`Encoder`]/[`Decoder`] pair;
//! [`Message`] wraps them with the 12-byte frame header.

mod buffer;
mod codec;
pub mod format;
mod message;

pub use buffer::{Buffer, BufferBuilder, ReceivedFd};
pub use codec::{DecodedValue, Decoder, Encoder, Value};
pub use message::{Message, MessageState};

use enum_primitive_derive::Primitive;

/// Magic number at the start of every frame header (`"POMP"` read as a
/// little-endian `u32`).
pub const MAGIC: u32 = 0x504F4D50;

/// Size in bytes of the frame header: magic + msgid + size, all `u32`.
pub const HEADER_SIZE: usize = 12;

/// Largest total frame size (header included) the framer will accept,
/// spec.md §4.4.
pub const HARD_CAP: u32 = 256 * 1024 * 1024;

/// Largest string or buffer the encoder will accept, spec.md §4.2.
pub const MAX_STRING_LEN: usize = 65535;

/// The single-byte wire discriminator preceding every record's body.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum Tag {
    /// `i8`
    I8 = 1,
    /// `u8`
    U8 = 2,
    /// `i16`, little-endian
    I16 = 3,
    /// `u16`, little-endian
    U16 = 4,
    /// `i32`, little-endian
    I32 = 5,
    /// `u32`, little-endian
    U32 = 6,
    /// `i64`, little-endian
    I64 = 7,
    /// `u64`, little-endian
    U64 = 8,
    /// `u32` length (including trailing NUL) followed by the bytes
    Str = 9,
    /// `u32` length followed by the bytes
    Buf = 10,
    /// IEEE-754 binary32, little-endian
    F32 = 11,
    /// IEEE-754 binary64, little-endian
    F64 = 12,
    /// `u32 = 0` placeholder; the real descriptor travels as ancillary data
    Fd = 13,
}
