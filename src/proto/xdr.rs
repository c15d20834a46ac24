//! Big-endian, length-prefixed primitive encoding shared by every wire
//! message this crate decodes or builds. Not a byte-for-byte RFC 1014 XDR
//! codec (no union/struct derive, no 4-byte alignment padding) — just
//! enough of the same shape (u32-prefixed opaque/strings, big-endian
//! integers) to decode the handful of procedures the protocol glue speaks.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_OPAQUE: usize = 1 << 20;

pub fn read_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(|e| Error::InvalidArgument(e.to_string()))
}

pub fn read_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(|e| Error::InvalidArgument(e.to_string()))
}

pub fn read_bool(src: &mut impl Read) -> Result<bool> {
    Ok(read_u32(src)? != 0)
}

pub fn read_opaque(src: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u32(src)? as usize;
    if len > MAX_OPAQUE {
        return Err(Error::InvalidArgument("opaque field too large".into()));
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    Ok(buf)
}

pub fn read_string(src: &mut impl Read) -> Result<String> {
    String::from_utf8(read_opaque(src)?).map_err(|e| Error::InvalidArgument(e.to_string()))
}

pub fn read_handle(src: &mut impl Read) -> Result<crate::handle::FileHandle> {
    Ok(crate::handle::FileHandle::new(read_opaque(src)?))
}

pub fn write_u32(dst: &mut impl Write, v: u32) -> io::Result<()> {
    dst.write_u32::<BigEndian>(v)
}

pub fn write_u64(dst: &mut impl Write, v: u64) -> io::Result<()> {
    dst.write_u64::<BigEndian>(v)
}

pub fn write_bool(dst: &mut impl Write, v: bool) -> io::Result<()> {
    write_u32(dst, v as u32)
}

pub fn write_opaque(dst: &mut impl Write, data: &[u8]) -> io::Result<()> {
    write_u32(dst, data.len() as u32)?;
    dst.write_all(data)
}

pub fn write_string(dst: &mut impl Write, s: &str) -> io::Result<()> {
    write_opaque(dst, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn opaque_round_trips() {
        let mut buf = Vec::new();
        write_opaque(&mut buf, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_opaque(&mut cursor).unwrap(), b"hello");
    }

    #[test]
    fn oversized_opaque_is_rejected() {
        let mut buf = Vec::new();
        write_u32(&mut buf, (MAX_OPAQUE + 1) as u32).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_opaque(&mut cursor).is_err());
    }
}
