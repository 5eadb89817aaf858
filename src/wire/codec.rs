//! The typed encoder/decoder pair, verifying the format string against the
//! tags actually present on the wire (spec.md §4.2).
//!
//! Grounded in the teacher's `TagStructWriter`/`TagStructReader`
//! (`protocol/serde.rs`): one write/read method per wire type, driven here
//! by [`format::DirectiveKind`] instead of a static Rust type, since the
//! payload is a heterogeneous argument list rather than a fixed struct.

use std::ffi::{CStr, CString};
use std::os::fd::OwnedFd;

use byteorder::{ByteOrder, LittleEndian};

use super::buffer::{Buffer, BufferBuilder, ReceivedFd};
use super::format::{self, DirectiveKind};
use super::{Tag, MAX_STRING_LEN};
use crate::error::Error;

/// One value to encode. Mirrors the directive kinds in
/// [`format::DirectiveKind`], collapsing the view/owned split that only
/// matters on decode.
#[derive(Debug)]
pub enum Value {
    /// `%hhd`/`%hhi`
    I8(i8),
    /// `%hhu`
    U8(u8),
    /// `%hd`/`%hi`
    I16(i16),
    /// `%hu`
    U16(u16),
    /// `%d`/`%i`
    I32(i32),
    /// `%u`
    U32(u32),
    /// `%lld`/`%lli`, or `%ld`/`%li` on a 64-bit host
    I64(i64),
    /// `%llu`, or `%lu` on a 64-bit host
    U64(u64),
    /// `%f`
    F32(f32),
    /// `%lf`
    F64(f64),
    /// `%s`/`%ms`
    Str(CString),
    /// `%p%u`/`%mp%u`
    Buf(Vec<u8>),
    /// a bare `%x`
    Fd(OwnedFd),
}

/// A value decoded from a payload.
///
/// `Str`/`Buf` are owned, allocated copies (`%ms`/`%mp%u`); `CStr`/`CBuf`
/// are zero-copy views borrowed from the originating [`Buffer`]
/// (`%s`/`%p%u`), per spec.md §4.2.
#[derive(Debug)]
pub enum DecodedValue<'a> {
    /// `%hhd`/`%hhi`
    I8(i8),
    /// `%hhu`
    U8(u8),
    /// `%hd`/`%hi`
    I16(i16),
    /// `%hu`
    U16(u16),
    /// `%d`/`%i`
    I32(i32),
    /// `%u`
    U32(u32),
    /// `%lld`/`%lli`, or `%ld`/`%li` on a 64-bit host
    I64(i64),
    /// `%llu`, or `%lu` on a 64-bit host
    U64(u64),
    /// `%f`
    F32(f32),
    /// `%lf`
    F64(f64),
    /// `%ms` — owned, decoded string
    Str(CString),
    /// `%s` — zero-copy view of a decoded string
    CStr(&'a CStr),
    /// `%mp%u` — owned, decoded buffer
    Buf(Vec<u8>),
    /// `%p%u` — zero-copy view of a decoded buffer
    CBuf(&'a [u8]),
    /// a bare `%x` — a borrowed descriptor, owned by the message until it's
    /// dropped; clone it with [`ReceivedFd::try_clone`] to keep it longer
    Fd(ReceivedFd<'a>),
}

/// Encodes a format string plus its matching argument list into a fresh
/// [`Buffer`].
pub struct Encoder;

impl Encoder {
    /// Encodes `fmt` and `values` into a new buffer. `values` must have
    /// exactly as many entries as `fmt` has directives, in the same order.
    pub fn encode(fmt: &str, values: Vec<Value>) -> Result<Buffer, Error> {
        let mut builder = BufferBuilder::new();
        Self::encode_into(&mut builder, fmt, values)?;
        Ok(builder.freeze())
    }

    /// Like [`encode`](Self::encode), but appends to an existing
    /// [`BufferBuilder`] (used by [`Message`](super::Message) to encode a
    /// payload directly after its reserved header).
    pub fn encode_into(builder: &mut BufferBuilder, fmt: &str, values: Vec<Value>) -> Result<(), Error> {
        let directives = format::scan(fmt)?;
        if directives.len() != values.len() {
            return Err(Error::InvalidArgument(format!(
                "format \"{fmt}\" has {} directive(s) but {} value(s) were given",
                directives.len(),
                values.len()
            )));
        }

        for (dir, val) in directives.into_iter().zip(values.into_iter()) {
            encode_one(builder, dir, val)?;
        }

        Ok(())
    }
}

fn encode_one(b: &mut BufferBuilder, dir: DirectiveKind, val: Value) -> Result<(), Error> {
    use DirectiveKind as D;
    use Value as V;

    match (dir, val) {
        (D::I8, V::I8(v)) => {
            b.push(Tag::I8 as u8);
            b.push(v as u8);
        }
        (D::U8, V::U8(v)) => {
            b.push(Tag::U8 as u8);
            b.push(v);
        }
        (D::I16, V::I16(v)) => {
            b.push(Tag::I16 as u8);
            let mut buf = [0u8; 2];
            LittleEndian::write_i16(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::U16, V::U16(v)) => {
            b.push(Tag::U16 as u8);
            let mut buf = [0u8; 2];
            LittleEndian::write_u16(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::I32, V::I32(v)) => {
            b.push(Tag::I32 as u8);
            let mut buf = [0u8; 4];
            LittleEndian::write_i32(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::U32, V::U32(v)) => {
            b.push(Tag::U32 as u8);
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::I64, V::I64(v)) => {
            b.push(Tag::I64 as u8);
            let mut buf = [0u8; 8];
            LittleEndian::write_i64(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::U64, V::U64(v)) => {
            b.push(Tag::U64 as u8);
            let mut buf = [0u8; 8];
            LittleEndian::write_u64(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::F32, V::F32(v)) => {
            b.push(Tag::F32 as u8);
            let mut buf = [0u8; 4];
            LittleEndian::write_f32(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::F64, V::F64(v)) => {
            b.push(Tag::F64 as u8);
            let mut buf = [0u8; 8];
            LittleEndian::write_f64(&mut buf, v);
            b.extend_from_slice(&buf);
        }
        (D::Str | D::CStr, V::Str(s)) => {
            let bytes = s.as_bytes_with_nul();
            if bytes.len() > MAX_STRING_LEN {
                return Err(Error::TooLarge(format!(
                    "string of {} bytes exceeds the {MAX_STRING_LEN}-byte limit",
                    bytes.len()
                )));
            }
            b.push(Tag::Str as u8);
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, bytes.len() as u32);
            b.extend_from_slice(&len);
            b.extend_from_slice(bytes);
        }
        (D::Buf | D::CBuf, V::Buf(buf)) => {
            b.push(Tag::Buf as u8);
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, buf.len() as u32);
            b.extend_from_slice(&len);
            b.extend_from_slice(&buf);
        }
        (D::Fd, V::Fd(fd)) => {
            b.push(Tag::Fd as u8);
            b.extend_from_slice(&[0u8; 4]);
            b.push_fd(fd);
        }
        (dir, val) => {
            return Err(Error::InvalidArgument(format!(
                "directive {dir:?} does not accept value {val:?}"
            )))
        }
    }

    Ok(())
}

/// Decodes a format string's worth of values out of a [`Buffer`], failing
/// fast the moment a wire tag doesn't match the directive that expects it.
pub struct Decoder<'a> {
    buf: &'a Buffer,
    bytes: &'a [u8],
    pos: usize,
    next_fd: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over `buf`, starting at the beginning of the
    /// payload.
    pub fn new(buf: &'a Buffer) -> Self {
        Self::new_at(buf, 0)
    }

    /// Creates a decoder over `buf`, starting at `offset` bytes in. Used by
    /// [`Message::read`](super::Message::read) to skip the frame header.
    pub fn new_at(buf: &'a Buffer, offset: usize) -> Self {
        Self {
            buf,
            bytes: &buf.as_slice()[offset..],
            pos: 0,
            next_fd: 0,
        }
    }

    /// Decodes `fmt`'s directives in order, returning one [`DecodedValue`]
    /// per directive.
    ///
    /// Fails with [`Error::TypeMismatch`] the moment a wire tag disagrees
    /// with the directive expecting it, with [`Error::InvalidData`] if the
    /// payload runs out of bytes or a string/fd count is malformed, and
    /// never reads past the end of the payload.
    pub fn decode(&mut self, fmt: &str) -> Result<Vec<DecodedValue<'a>>, Error> {
        let directives = format::scan(fmt)?;
        let mut out = Vec::with_capacity(directives.len());
        for dir in directives {
            out.push(self.decode_one(dir)?);
        }
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| underrun())?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or_else(underrun)?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(underrun)?;
        self.pos = end;
        Ok(slice)
    }

    fn expect_tag(&mut self, expected: Tag, directive: &str) -> Result<(), Error> {
        let raw = self.read_u8()?;
        let found: Option<Tag> = num_traits::FromPrimitive::from_u8(raw);
        match found {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(Error::TypeMismatch {
                expected: format!("{directive} ({expected:?})"),
                found: format!("{t:?}"),
            }),
            None => Err(Error::InvalidData(format!("unrecognized tag byte 0x{raw:02x}"))),
        }
    }

    fn decode_one(&mut self, dir: DirectiveKind) -> Result<DecodedValue<'a>, Error> {
        use DirectiveKind as D;

        Ok(match dir {
            D::I8 => {
                self.expect_tag(Tag::I8, "%hhd")?;
                DecodedValue::I8(self.read_u8()? as i8)
            }
            D::U8 => {
                self.expect_tag(Tag::U8, "%hhu")?;
                DecodedValue::U8(self.read_u8()?)
            }
            D::I16 => {
                self.expect_tag(Tag::I16, "%hd")?;
                DecodedValue::I16(LittleEndian::read_i16(self.read_bytes(2)?))
            }
            D::U16 => {
                self.expect_tag(Tag::U16, "%hu")?;
                DecodedValue::U16(LittleEndian::read_u16(self.read_bytes(2)?))
            }
            D::I32 => {
                self.expect_tag(Tag::I32, "%d")?;
                DecodedValue::I32(LittleEndian::read_i32(self.read_bytes(4)?))
            }
            D::U32 => {
                self.expect_tag(Tag::U32, "%u")?;
                DecodedValue::U32(LittleEndian::read_u32(self.read_bytes(4)?))
            }
            D::I64 => {
                self.expect_tag(Tag::I64, "%lld")?;
                DecodedValue::I64(LittleEndian::read_i64(self.read_bytes(8)?))
            }
            D::U64 => {
                self.expect_tag(Tag::U64, "%llu")?;
                DecodedValue::U64(LittleEndian::read_u64(self.read_bytes(8)?))
            }
            D::F32 => {
                self.expect_tag(Tag::F32, "%f")?;
                DecodedValue::F32(LittleEndian::read_f32(self.read_bytes(4)?))
            }
            D::F64 => {
                self.expect_tag(Tag::F64, "%lf")?;
                DecodedValue::F64(LittleEndian::read_f64(self.read_bytes(8)?))
            }
            D::Str => {
                self.expect_tag(Tag::Str, "%ms")?;
                DecodedValue::Str(
                    CString::from_vec_with_nul(self.decode_cstring_bytes()?.to_vec())
                        .expect("decode_cstring_bytes validates a single trailing NUL"),
                )
            }
            D::CStr => {
                self.expect_tag(Tag::Str, "%s")?;
                let bytes = self.decode_cstring_bytes()?;
                DecodedValue::CStr(CStr::from_bytes_with_nul(bytes).map_err(|e| {
                    Error::InvalidData(format!("string is not validly NUL-terminated: {e}"))
                })?)
            }
            D::Buf => {
                self.expect_tag(Tag::Buf, "%mp%u")?;
                let bytes = self.decode_buf_bytes()?;
                DecodedValue::Buf(bytes.to_vec())
            }
            D::CBuf => {
                self.expect_tag(Tag::Buf, "%p%u")?;
                DecodedValue::CBuf(self.decode_buf_bytes()?)
            }
            D::Fd => {
                self.expect_tag(Tag::Fd, "%x")?;
                let _placeholder = self.read_bytes(4)?;
                let fd = self
                    .buf
                    .fd(self.next_fd)
                    .ok_or_else(|| Error::InvalidData("fewer ancillary fds than %x directives".into()))?;
                self.next_fd += 1;
                DecodedValue::Fd(fd)
            }
        })
    }

    fn decode_cstring_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
        if len == 0 {
            return Err(Error::InvalidData("string length of 0 cannot include a NUL terminator".into()));
        }
        let bytes = self.read_bytes(len)?;
        if bytes[len - 1] != 0 {
            return Err(Error::InvalidData("string is missing its NUL terminator".into()));
        }
        if bytes[..len - 1].contains(&0) {
            return Err(Error::InvalidData("string contains an embedded NUL".into()));
        }
        Ok(bytes)
    }

    fn decode_buf_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = LittleEndian::read_u32(self.read_bytes(4)?) as usize;
        self.read_bytes(len)
    }
}

fn underrun() -> Error {
    Error::InvalidData("unexpected end of payload".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn roundtrip(fmt: &str, values: Vec<Value>) -> Buffer {
        Encoder::encode(fmt, values).unwrap()
    }

    #[test]
    fn integers_roundtrip() {
        let buf = roundtrip(
            "%hhd%hhu%hd%hu%d%u%lld%llu",
            vec![
                Value::I8(-5),
                Value::U8(5),
                Value::I16(-1000),
                Value::U16(1000),
                Value::I32(-100000),
                Value::U32(100000),
                Value::I64(-1),
                Value::U64(u64::MAX),
            ],
        );

        let mut d = Decoder::new(&buf);
        let vals = d.decode("%hhd%hhu%hd%hu%d%u%lld%llu").unwrap();
        assert!(matches!(vals[0], DecodedValue::I8(-5)));
        assert!(matches!(vals[1], DecodedValue::U8(5)));
        assert!(matches!(vals[2], DecodedValue::I16(-1000)));
        assert!(matches!(vals[3], DecodedValue::U16(1000)));
        assert!(matches!(vals[4], DecodedValue::I32(-100000)));
        assert!(matches!(vals[5], DecodedValue::U32(100000)));
        assert!(matches!(vals[6], DecodedValue::I64(-1)));
        assert!(matches!(vals[7], DecodedValue::U64(u64::MAX)));
    }

    #[test]
    fn string_roundtrips() {
        let buf = roundtrip("%s", vec![Value::Str(CString::new("PING").unwrap())]);
        let mut d = Decoder::new(&buf);
        let vals = d.decode("%s").unwrap();
        assert!(matches!(&vals[0], DecodedValue::CStr(s) if s.to_str().unwrap() == "PING"));
    }

    #[test]
    fn empty_string_roundtrips() {
        let buf = roundtrip("%s", vec![Value::Str(CString::new("").unwrap())]);
        let mut d = Decoder::new(&buf);
        let vals = d.decode("%s").unwrap();
        assert!(matches!(&vals[0], DecodedValue::CStr(s) if s.to_bytes().is_empty()));
    }

    #[test]
    fn max_length_string_roundtrips() {
        let body = "a".repeat(MAX_STRING_LEN - 1);
        let s = CString::new(body).unwrap();
        assert_eq!(s.as_bytes_with_nul().len(), MAX_STRING_LEN);
        let buf = roundtrip("%s", vec![Value::Str(s)]);
        let mut d = Decoder::new(&buf);
        assert_eq!(d.decode("%s").unwrap().len(), 1);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let body = "a".repeat(MAX_STRING_LEN);
        let s = CString::new(body).unwrap();
        let err = Encoder::encode("%s", vec![Value::Str(s)]).unwrap_err();
        assert!(matches!(err, Error::TooLarge(_)));
    }

    #[test]
    fn buffer_roundtrips() {
        let buf = roundtrip("%p%u", vec![Value::Buf(vec![1, 2, 3, 4])]);
        let mut d = Decoder::new(&buf);
        let vals = d.decode("%p%u").unwrap();
        assert!(matches!(&vals[0], DecodedValue::CBuf(b) if *b == [1, 2, 3, 4]));
    }

    #[test]
    fn zero_length_buffer_roundtrips() {
        let buf = roundtrip("%p%u", vec![Value::Buf(vec![])]);
        let mut d = Decoder::new(&buf);
        let vals = d.decode("%p%u").unwrap();
        assert!(matches!(&vals[0], DecodedValue::CBuf(b) if b.is_empty()));
    }

    #[test]
    fn type_mismatch_is_detected() {
        use assert_matches::assert_matches;
        let buf = roundtrip("%u", vec![Value::U32(42)]);
        let mut d = Decoder::new(&buf);
        let err = d.decode("%s").unwrap_err();
        assert_matches!(err, Error::TypeMismatch { .. });
    }

    #[test]
    fn decode_never_reads_past_payload_end() {
        use assert_matches::assert_matches;
        let buf = roundtrip("%u", vec![Value::U32(1)]);
        let mut d = Decoder::new(&buf);
        let err = d.decode("%u%u").unwrap_err();
        assert_matches!(err, Error::InvalidData(_));
    }

    #[test]
    fn fd_roundtrips() {
        // This exercises only the codec's tag/placeholder bookkeeping: the
        // buffer built here plays both "sender" and "receiver" roles,
        // since actually transporting the fd out of band is the connection
        // framer's job (see `connection` module tests for that).
        use std::os::fd::{AsRawFd, OwnedFd};
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let owned: OwnedFd = a.into();
        let sent_raw = owned.as_raw_fd();

        let buf = roundtrip("%x", vec![Value::Fd(owned)]);

        let mut decoder = Decoder::new(&buf);
        let vals = decoder.decode("%x").unwrap();
        match &vals[0] {
            DecodedValue::Fd(fd) => assert_eq!(fd.as_raw_fd(), sent_raw),
            _ => panic!("expected fd"),
        }
    }

    #[test]
    fn missing_fd_is_invalid_data() {
        // An FD tag on the wire with no ancillary descriptor actually
        // attached, as if the peer's out-of-band SCM_RIGHTS data never
        // arrived.
        let mut b = BufferBuilder::new();
        b.push(Tag::Fd as u8);
        b.extend_from_slice(&[0u8; 4]);
        let buf = b.freeze();

        let mut decoder = Decoder::new(&buf);
        let err = decoder.decode("%x").unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }
}
