//! XDR (RFC 4506) primitives for procedure payloads.
//!
//! The full catalogue of payload structs is emitted by an external schema
//! compiler; this module is the small runtime it targets. Everything is
//! big-endian and padded to four-byte boundaries. Decoders always produce
//! owned values so nothing borrows from the receive buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Longest variable-length string a payload may carry.
pub const STRING_MAX: usize = 65536;

/// Types that can marshal themselves into a payload.
pub trait XdrEncode {
    fn encode(&self, buf: &mut BytesMut);
}

/// Types that can unmarshal themselves from a payload.
pub trait XdrDecode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

fn short(what: &str) -> Error {
    Error::Protocol(format!("payload truncated reading {what}"))
}

pub fn put_u32(buf: &mut BytesMut, v: u32) {
    buf.put_u32(v);
}

pub fn put_i32(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

pub fn put_u64(buf: &mut BytesMut, v: u64) {
    buf.put_u64(v);
}

pub fn put_i64(buf: &mut BytesMut, v: i64) {
    buf.put_i64(v);
}

pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u32(v as u32);
}

/// Counted string with zero padding up to the next four-byte boundary.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_opaque(buf, s.as_bytes());
}

/// Optional string, encoded as a boolean discriminant plus the value.
pub fn put_string_opt(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            put_bool(buf, true);
            put_string(buf, s);
        }
        None => put_bool(buf, false),
    }
}

/// Variable-length opaque data with length word and padding.
pub fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    let pad = (4 - data.len() % 4) % 4;
    buf.put_bytes(0, pad);
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(short("u32"));
    }
    Ok(buf.get_u32())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(short("i32"));
    }
    Ok(buf.get_i32())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(short("u64"));
    }
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(short("i64"));
    }
    Ok(buf.get_i64())
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u32(buf)? != 0)
}

pub fn get_opaque(buf: &mut Bytes) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    if len > STRING_MAX {
        return Err(Error::Protocol(format!(
            "opaque field of {len} bytes exceeds limit"
        )));
    }
    let padded = len + (4 - len % 4) % 4;
    if buf.remaining() < padded {
        return Err(short("opaque"));
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    buf.advance(padded - len);
    Ok(data)
}

pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_opaque(buf)?;
    String::from_utf8(raw).map_err(|e| Error::Protocol(format!("string not utf-8: {e}")))
}

pub fn get_string_opt(buf: &mut Bytes) -> Result<Option<String>> {
    if get_bool(buf)? {
        Ok(Some(get_string(buf)?))
    } else {
        Ok(None)
    }
}

/// Counted array of u32 values (used by id-list replies).
pub fn get_u32_array(buf: &mut Bytes, max: usize) -> Result<Vec<u32>> {
    let n = get_u32(buf)? as usize;
    if n > max {
        return Err(Error::Protocol(format!("array of {n} entries exceeds {max}")));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(get_u32(buf)?);
    }
    Ok(out)
}

pub fn put_u32_array(buf: &mut BytesMut, vals: &[u32]) {
    buf.put_u32(vals.len() as u32);
    for v in vals {
        buf.put_u32(*v);
    }
}

/// The empty payload.
impl XdrEncode for () {
    fn encode(&self, _buf: &mut BytesMut) {}
}

impl XdrDecode for () {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(())
    }
}
