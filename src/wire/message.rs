//! The message envelope: a 12-byte frame header plus a self-describing
//! payload (spec.md §3, §4.3, §6).
//!
//! The header is patched into the front of the same [`Buffer`] that holds
//! the encoded payload, the way the teacher's `encode_command_message`
//! reserves `DESCRIPTOR_SIZE` bytes up front and seeks back to fill them in
//! once the payload length is known (`protocol.rs`). Keeping header and
//! payload in one buffer is what lets a server broadcast fan out the exact
//! same frame bytes to every connection without a copy.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use byteorder::{ByteOrder, LittleEndian};

use super::buffer::{Buffer, BufferBuilder};
use super::codec::{DecodedValue, Decoder, Encoder, Value};
use super::format::{self, DirectiveKind};
use super::{HARD_CAP, HEADER_SIZE, MAGIC};
use crate::error::Error;

/// A message's place in its own lifecycle (spec.md §3).
///
/// `Reading` is the state a message constructed directly from a complete
/// wire frame starts in (the connection framer never passes a received
/// frame through `Writing`); `Finished` is the state a message built
/// locally ends up in after [`Message::finish`]. Both permit reads; only
/// `Writing` permits further writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// No payload allocated yet.
    Empty,
    /// Accepting `write`/`write_argv` calls; not yet readable.
    Writing,
    /// Built locally and finalized; readable, not writable.
    Finished,
    /// Constructed from a wire frame; readable, not writable.
    Reading,
}

/// An IPC message: a 32-bit id plus a typed, self-describing payload.
#[derive(Debug)]
pub struct Message {
    msgid: u32,
    state: MessageState,
    builder: Option<BufferBuilder>,
    frame: Option<Buffer>,
}

impl Message {
    /// Begins building a new message with the given id. Reserves the
    /// 12-byte header up front, to be patched by [`finish`](Self::finish).
    pub fn init(msgid: u32) -> Self {
        let mut builder = BufferBuilder::with_capacity(HEADER_SIZE + 16);
        builder.extend_from_slice(&[0u8; HEADER_SIZE]);

        Self {
            msgid,
            state: MessageState::Writing,
            builder: Some(builder),
            frame: None,
        }
    }

    /// Parses a complete wire frame (header included) into a message ready
    /// to be read. Used by the connection framer once a full frame has
    /// been reassembled from the socket, and by datagram receive.
    ///
    /// Validates the magic number and that the declared size matches the
    /// buffer's actual length, per spec.md §4.4.
    pub fn from_frame(frame: Buffer) -> Result<Self, Error> {
        let bytes = frame.as_slice();
        if bytes.len() < HEADER_SIZE {
            return Err(Error::ProtocolError(format!(
                "frame of {} bytes is shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            )));
        }

        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != MAGIC {
            return Err(Error::ProtocolError(format!("bad magic 0x{magic:08x}")));
        }

        let msgid = LittleEndian::read_u32(&bytes[4..8]);
        let size = LittleEndian::read_u32(&bytes[8..12]);
        if size as usize != bytes.len() {
            return Err(Error::ProtocolError(format!(
                "header declares size {size} but frame is {} bytes",
                bytes.len()
            )));
        }
        if size > HARD_CAP {
            return Err(Error::ProtocolError(format!("frame size {size} exceeds hard cap {HARD_CAP}")));
        }

        Ok(Self {
            msgid,
            state: MessageState::Reading,
            builder: None,
            frame: Some(frame),
        })
    }

    /// The message id.
    pub fn id(&self) -> u32 {
        self.msgid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Total frame size in bytes, including the 12-byte header. Only
    /// meaningful once `Finished` or `Reading`.
    pub fn size(&self) -> usize {
        self.frame.as_ref().map(Buffer::len).unwrap_or(0)
    }

    /// Encodes `fmt`/`values` and appends the result to the payload. May be
    /// called more than once before [`finish`](Self::finish); each call
    /// appends further tagged records.
    pub fn write(&mut self, fmt: &str, values: Vec<Value>) -> Result<(), Error> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("message is not in the Writing state".into()))?;
        if self.state != MessageState::Writing {
            return Err(Error::InvalidArgument("message is not in the Writing state".into()));
        }

        Encoder::encode_into(builder, fmt, values)
    }

    /// A string-argument form of [`write`](Self::write), used by tooling
    /// that has argv-style string arguments rather than typed Rust values
    /// (spec.md §4.3).
    ///
    /// Integers parse with `0x`-prefixed hex or plain decimal; floats use
    /// `f32`/`f64`'s locale-independent parser; `%x` takes a plain decimal
    /// fd number; a `%p`/`%mp` buffer directive consumes two argv entries,
    /// a decimal byte length (validated against the second entry) and the
    /// raw bytes themselves.
    pub fn write_argv(&mut self, fmt: &str, argv: &[String]) -> Result<(), Error> {
        let directives = format::scan(fmt)?;
        let mut values = Vec::with_capacity(directives.len());
        let mut it = argv.iter();

        for dir in directives {
            let value = parse_argv_value(dir, &mut it)?;
            values.push(value);
        }

        if it.next().is_some() {
            return Err(Error::InvalidArgument("more argv entries than format directives".into()));
        }

        self.write(fmt, values)
    }

    /// Finalizes the message: patches the header with the final size and
    /// magic, and transitions `Writing` → `Finished`.
    pub fn finish(&mut self) -> Result<(), Error> {
        let mut builder = self
            .builder
            .take()
            .ok_or_else(|| Error::InvalidArgument("message is not in the Writing state".into()))?;
        if self.state != MessageState::Writing {
            return Err(Error::InvalidArgument("message is not in the Writing state".into()));
        }

        let size = builder.len() as u32;
        if size > HARD_CAP {
            return Err(Error::TooLarge(format!("message size {size} exceeds hard cap {HARD_CAP}")));
        }

        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], MAGIC);
        LittleEndian::write_u32(&mut header[4..8], self.msgid);
        LittleEndian::write_u32(&mut header[8..12], size);
        builder.patch(0, &header);

        self.frame = Some(builder.freeze());
        self.state = MessageState::Finished;
        Ok(())
    }

    /// Drops the payload (closing any owned fds) and returns to `Empty`.
    pub fn clear(&mut self) {
        self.builder = None;
        self.frame = None;
        self.state = MessageState::Empty;
    }

    /// Decodes `fmt`'s directives from the payload. Valid only in
    /// `Finished` or `Reading`.
    pub fn read(&self, fmt: &str) -> Result<Vec<DecodedValue<'_>>, Error> {
        let frame = self
            .frame
            .as_ref()
            .filter(|_| matches!(self.state, MessageState::Finished | MessageState::Reading))
            .ok_or_else(|| Error::InvalidArgument("message is not in a readable state".into()))?;

        let mut decoder = Decoder::new_at(frame, HEADER_SIZE);
        decoder.decode(fmt)
    }

    /// The underlying frame buffer (header included), for handing to the
    /// connection write queue. `None` until [`finish`](Self::finish) or
    /// [`from_frame`](Self::from_frame) has run.
    pub fn as_frame(&self) -> Option<&Buffer> {
        self.frame.as_ref()
    }

    /// Takes ownership of the underlying frame buffer, consuming the
    /// message. Used when enqueuing a message for send.
    pub fn into_frame(self) -> Option<Buffer> {
        self.frame
    }
}

fn parse_argv_value<'a>(
    dir: DirectiveKind,
    argv: &mut impl Iterator<Item = &'a String>,
) -> Result<Value, Error> {
    let next = |argv: &mut dyn Iterator<Item = &'a String>| {
        argv.next()
            .ok_or_else(|| Error::InvalidArgument("not enough argv entries for format".into()))
    };

    Ok(match dir {
        DirectiveKind::I8 => Value::I8(parse_c_int(next(argv)?)? as i8),
        DirectiveKind::U8 => Value::U8(parse_c_int(next(argv)?)? as u8),
        DirectiveKind::I16 => Value::I16(parse_c_int(next(argv)?)? as i16),
        DirectiveKind::U16 => Value::U16(parse_c_int(next(argv)?)? as u16),
        DirectiveKind::I32 => Value::I32(parse_c_int(next(argv)?)? as i32),
        DirectiveKind::U32 => Value::U32(parse_c_int(next(argv)?)? as u32),
        DirectiveKind::I64 => Value::I64(parse_c_int(next(argv)?)?),
        DirectiveKind::U64 => Value::U64(parse_c_int(next(argv)?)? as u64),
        DirectiveKind::F32 => Value::F32(
            next(argv)?
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("invalid float: {e}")))?,
        ),
        DirectiveKind::F64 => Value::F64(
            next(argv)?
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("invalid float: {e}")))?,
        ),
        DirectiveKind::Str | DirectiveKind::CStr => {
            let s = next(argv)?;
            Value::Str(std::ffi::CString::new(s.as_str()).map_err(|e| {
                Error::InvalidArgument(format!("string argument contains an embedded NUL: {e}"))
            })?)
        }
        DirectiveKind::Buf | DirectiveKind::CBuf => {
            let len_str = next(argv)?;
            let data = next(argv)?;
            let declared: usize = len_str
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("invalid buffer length: {e}")))?;
            if declared != data.len() {
                return Err(Error::InvalidArgument(format!(
                    "declared buffer length {declared} does not match argument of {} bytes",
                    data.len()
                )));
            }
            Value::Buf(data.as_bytes().to_vec())
        }
        DirectiveKind::Fd => {
            let s = next(argv)?;
            let raw: RawFd = s
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("invalid fd number: {e}")))?;
            if raw < 0 {
                return Err(Error::InvalidArgument(format!("negative fd {raw}")));
            }
            // Safety: the caller is handing us an fd number it owns and
            // intends to transfer; ownership passes to the `Value::Fd` from
            // here on, same as every other path that produces one.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            Value::Fd(fd)
        }
    })
}

/// Parses an integer the way `strtol(..., 0)` would: `0x`/`0X` selects hex,
/// otherwise decimal (spec.md §4.3's "bases 10/16/0").
fn parse_c_int(s: &str) -> Result<i64, Error> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (radix, digits) = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => (16, hex),
        None => (10, digits),
    };

    let magnitude = i64::from_str_radix(digits, radix)
        .map_err(|e| Error::InvalidArgument(format!("invalid integer \"{s}\": {e}")))?;

    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_write_finish_read_roundtrip() {
        let mut msg = Message::init(42);
        msg.write("%u%s", vec![Value::U32(10), Value::Str(std::ffi::CString::new("PING").unwrap())])
            .unwrap();
        msg.finish().unwrap();

        assert_eq!(msg.size(), msg.as_frame().unwrap().len());
        assert_eq!(msg.size(), HEADER_SIZE + 1 + 4 + 1 + 4 + 5);

        let vals = msg.read("%u%s").unwrap();
        assert!(matches!(vals[0], DecodedValue::U32(10)));
        assert!(matches!(&vals[1], DecodedValue::CStr(s) if s.to_str().unwrap() == "PING"));
    }

    #[test]
    fn from_frame_rejects_bad_magic() {
        let mut builder = BufferBuilder::new();
        builder.extend_from_slice(&[0u8; HEADER_SIZE]);
        let frame = builder.freeze();
        assert!(Message::from_frame(frame).is_err());
    }

    #[test]
    fn from_frame_rejects_size_mismatch() {
        let mut msg = Message::init(1);
        msg.write("%u", vec![Value::U32(1)]).unwrap();
        msg.finish().unwrap();
        let frame = msg.into_frame().unwrap();

        let mut bytes = frame.as_slice().to_vec();
        LittleEndian::write_u32(&mut bytes[8..12], 9999);
        let mut corrupt = BufferBuilder::new();
        corrupt.extend_from_slice(&bytes);
        assert!(Message::from_frame(corrupt.freeze()).is_err());
    }

    #[test]
    fn write_after_finish_fails() {
        let mut msg = Message::init(1);
        msg.finish().unwrap();
        assert!(msg.write("%u", vec![Value::U32(1)]).is_err());
    }

    #[test]
    fn write_argv_roundtrip() {
        let mut msg = Message::init(7);
        msg.write_argv(
            "%i%f%s%mp%u",
            &[
                "-1".to_string(),
                "3.5".to_string(),
                "hello".to_string(),
                "5".to_string(),
                "hello".to_string(),
            ],
        )
        .unwrap();
        msg.finish().unwrap();

        let vals = msg.read("%i%f%s%mp%u").unwrap();
        assert!(matches!(vals[0], DecodedValue::I32(-1)));
        assert!(matches!(vals[1], DecodedValue::F32(f) if (f - 3.5).abs() < f32::EPSILON));
        assert!(matches!(&vals[2], DecodedValue::CStr(s) if s.to_str().unwrap() == "hello"));
        assert!(matches!(&vals[3], DecodedValue::Buf(b) if b == b"hello"));
    }

    #[test]
    fn write_argv_hex_integer() {
        let mut msg = Message::init(1);
        msg.write_argv("%u", &["0x2A".to_string()]).unwrap();
        msg.finish().unwrap();
        let vals = msg.read("%u").unwrap();
        assert!(matches!(vals[0], DecodedValue::U32(42)));
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut msg = Message::init(1);
        msg.write("%u", vec![Value::U32(1)]).unwrap();
        msg.finish().unwrap();
        msg.clear();
        assert_eq!(msg.state(), MessageState::Empty);
        assert!(msg.as_frame().is_none());
    }
}
