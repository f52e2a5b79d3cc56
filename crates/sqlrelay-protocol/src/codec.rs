//! Length-prefixed record codec
//!
//! A reader and writer over blocking streams. All integers are
//! big-endian. The writer buffers into memory and flushes only at
//! explicit points (the end of a response), never per field.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};

/// Errors raised by the codec itself
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The peer closed mid-record
    #[error("short read: connection closed mid-record")]
    ShortRead,

    /// A length-prefixed field exceeded its configured maximum
    #[error("oversize field: {field} is {len} bytes, maximum {max}")]
    Oversize {
        field: &'static str,
        len: u64,
        max: u64,
    },

    /// An unknown tag value where an enum was expected
    #[error("unknown {kind} tag {value}")]
    UnknownTag { kind: &'static str, value: u16 },

    /// Text field was not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Underlying transport error
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::ShortRead
        } else {
            CodecError::Io(err)
        }
    }
}

/// Reads protocol fields from a blocking stream
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        self.inner.read_exact(buf).map_err(CodecError::from_read)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read `len` raw bytes, refusing anything over `max`
    pub fn read_bytes(
        &mut self,
        field: &'static str,
        len: u64,
        max: u64,
    ) -> Result<Vec<u8>, CodecError> {
        if max > 0 && len > max {
            return Err(CodecError::Oversize { field, len, max });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// u32-length-prefixed byte field
    pub fn read_lbytes(&mut self, field: &'static str, max: u64) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as u64;
        self.read_bytes(field, len, max)
    }

    /// u32-length-prefixed UTF-8 string
    pub fn read_lstring(&mut self, field: &'static str, max: u64) -> Result<String, CodecError> {
        let bytes = self.read_lbytes(field, max)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8(field))
    }

    /// The u16 opcode header of every client command; `Ok(None)` means the
    /// client closed cleanly between commands
    pub fn read_opcode(&mut self) -> Result<Option<crate::consts::Opcode>, CodecError> {
        let mut b = [0u8; 2];
        match self.inner.read_exact(&mut b) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(CodecError::Io(e)),
        }
        let value = u16::from_be_bytes(b);
        crate::consts::Opcode::from_u16(value)
            .map(Some)
            .ok_or(CodecError::UnknownTag {
                kind: "opcode",
                value,
            })
    }
}

/// Buffers protocol fields and flushes whole responses at once
pub struct ProtocolWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Bytes currently buffered and unflushed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_u64(v.to_bits());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// u32-length-prefixed byte field
    pub fn write_lbytes(&mut self, v: &[u8]) {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// u32-length-prefixed string
    pub fn write_lstring(&mut self, v: &str) {
        self.write_lbytes(v.as_bytes());
    }

    /// Push everything buffered to the transport
    pub fn flush(&mut self) -> Result<(), CodecError> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(write: impl FnOnce(&mut ProtocolWriter<Vec<u8>>)) -> ProtocolReader<Cursor<Vec<u8>>> {
        let mut w = ProtocolWriter::new(Vec::new());
        write(&mut w);
        w.flush().unwrap();
        let bytes = w.into_parts();
        ProtocolReader::new(Cursor::new(bytes))
    }

    impl ProtocolWriter<Vec<u8>> {
        fn into_parts(self) -> Vec<u8> {
            self.inner
        }
    }

    #[test]
    fn integers_round_trip_big_endian() {
        let mut w = ProtocolWriter::new(Vec::new());
        w.write_u16(0x0102);
        w.write_u32(0x01020304);
        w.write_u64(0x0102030405060708);
        w.write_i64(-42);
        w.flush().unwrap();
        let bytes = w.into_parts();
        assert_eq!(&bytes[..2], &[1, 2]);

        let mut r = ProtocolReader::new(Cursor::new(bytes));
        assert_eq!(r.read_u16().unwrap(), 0x0102);
        assert_eq!(r.read_u32().unwrap(), 0x01020304);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(r.read_i64().unwrap(), -42);
    }

    #[test]
    fn double_bits_preserved() {
        let mut r = round_trip(|w| w.write_f64(3.125e-7));
        assert_eq!(r.read_f64().unwrap().to_bits(), 3.125e-7f64.to_bits());
    }

    #[test]
    fn lstring_round_trip() {
        let mut r = round_trip(|w| w.write_lstring("select 1"));
        assert_eq!(r.read_lstring("q", 1024).unwrap(), "select 1");
    }

    #[test]
    fn oversize_field_is_refused() {
        let mut r = round_trip(|w| w.write_lstring("0123456789"));
        match r.read_lstring("q", 5) {
            Err(CodecError::Oversize { field, len, max }) => {
                assert_eq!(field, "q");
                assert_eq!(len, 10);
                assert_eq!(max, 5);
            }
            other => panic!("expected oversize, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn short_read_is_distinguished() {
        let mut r = ProtocolReader::new(Cursor::new(vec![0u8, 0, 0, 9, b'x']));
        match r.read_lstring("q", 64) {
            Err(CodecError::ShortRead) => {}
            other => panic!("expected short read, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn clean_close_between_commands() {
        let mut r = ProtocolReader::new(Cursor::new(Vec::new()));
        assert!(r.read_opcode().unwrap().is_none());
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let mut r = ProtocolReader::new(Cursor::new(vec![0xff, 0xff]));
        assert!(matches!(
            r.read_opcode(),
            Err(CodecError::UnknownTag { kind: "opcode", .. })
        ));
    }
}
