//! Checked little-endian field access on top of `bytes`.
//!
//! `Buf::get_*` panics on short input; every read here checks the remaining
//! length first and reports a malformed frame instead.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

fn ensure(buf: &[u8], needed: usize, field: &str) -> ProtocolResult<()> {
    if buf.len() < needed {
        return Err(ProtocolError::malformed(format!(
            "truncated {field}: need {needed} bytes, {} left",
            buf.len()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut &[u8], field: &str) -> ProtocolResult<u8> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut &[u8], field: &str) -> ProtocolResult<u16> {
    ensure(buf, 2, field)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut &[u8], field: &str) -> ProtocolResult<u32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut &[u8], field: &str) -> ProtocolResult<u64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn get_i32(buf: &mut &[u8], field: &str) -> ProtocolResult<i32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_i32_le())
}

pub(crate) fn get_i64(buf: &mut &[u8], field: &str) -> ProtocolResult<i64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_i64_le())
}

/// Splits off the next `len` bytes.
pub(crate) fn get_slice<'a>(buf: &mut &'a [u8], len: usize, field: &str) -> ProtocolResult<&'a [u8]> {
    ensure(buf, len, field)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Consumes the rest of the buffer as a NUL-terminated UTF-8 string.
pub(crate) fn get_trailing_str(buf: &mut &[u8], field: &str) -> ProtocolResult<String> {
    let rest = std::mem::take(buf);
    let Some((&0, body)) = rest.split_last() else {
        return Err(ProtocolError::malformed(format!("{field} is not NUL-terminated")));
    };
    if body.contains(&0) {
        return Err(ProtocolError::malformed(format!("{field} contains an interior NUL")));
    }
    String::from_utf8(body.to_vec())
        .map_err(|_| ProtocolError::malformed(format!("{field} is not valid UTF-8")))
}

/// Appends `value` followed by a terminating NUL.
pub(crate) fn put_trailing_str(buf: &mut BytesMut, value: &str, field: &str) -> ProtocolResult<()> {
    if value.as_bytes().contains(&0) {
        return Err(ProtocolError::invalid_argument(format!(
            "{field} contains an interior NUL"
        )));
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Fails unless every byte has been consumed.
pub(crate) fn finish(buf: &[u8], what: &str) -> ProtocolResult<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::malformed(format!(
            "{} trailing bytes after {what}",
            buf.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_are_errors() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(get_u32(&mut buf, "tag").is_err());
        assert_eq!(get_u16(&mut buf, "port").unwrap(), 0x0201);
        assert_eq!(get_u8(&mut buf, "family").unwrap(), 3);
        assert!(get_u8(&mut buf, "family").is_err());
    }

    #[test]
    fn trailing_strings() {
        let mut out = BytesMut::new();
        put_trailing_str(&mut out, "héllo", "name").unwrap();
        let mut buf: &[u8] = &out;
        assert_eq!(get_trailing_str(&mut buf, "name").unwrap(), "héllo");
        assert!(buf.is_empty());

        let mut empty = BytesMut::new();
        put_trailing_str(&mut empty, "", "text").unwrap();
        assert_eq!(&empty[..], &[0]);

        assert!(put_trailing_str(&mut BytesMut::new(), "a\0b", "name").is_err());

        let mut unterminated: &[u8] = b"abc";
        assert!(get_trailing_str(&mut unterminated, "name").is_err());

        let mut interior: &[u8] = b"a\0b\0";
        assert!(get_trailing_str(&mut interior, "name").is_err());
    }
}
