//! The CBOR subset used by v7 bundle blocks: unsigned integers, byte
//! strings, definite and indefinite arrays, booleans.

use crate::error::{BpError, BpResult};
use bytes::{Buf, BufMut, BytesMut};

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_SIMPLE: u8 = 7;

pub const INDEFINITE_ARRAY: u8 = 0x9F;
pub const BREAK: u8 = 0xFF;

fn put_head(buf: &mut BytesMut, major: u8, value: u64) {
    let major = major << 5;
    if value < 24 {
        buf.put_u8(major | value as u8);
    } else if value <= u8::MAX as u64 {
        buf.put_u8(major | 24);
        buf.put_u8(value as u8);
    } else if value <= u16::MAX as u64 {
        buf.put_u8(major | 25);
        buf.put_u16(value as u16);
    } else if value <= u32::MAX as u64 {
        buf.put_u8(major | 26);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(major | 27);
        buf.put_u64(value);
    }
}

fn get_head(buf: &mut impl Buf, expected_major: u8) -> BpResult<u64> {
    if !buf.has_remaining() {
        return Err(BpError::BundleParse("cbor truncated"));
    }
    let initial = buf.get_u8();
    if initial >> 5 != expected_major {
        return Err(BpError::BundleParse("unexpected cbor major type"));
    }
    let additional = initial & 0x1F;
    Ok(match additional {
        0..=23 => u64::from(additional),
        24 => {
            if buf.remaining() < 1 {
                return Err(BpError::BundleParse("cbor truncated"));
            }
            u64::from(buf.get_u8())
        }
        25 => {
            if buf.remaining() < 2 {
                return Err(BpError::BundleParse("cbor truncated"));
            }
            u64::from(buf.get_u16())
        }
        26 => {
            if buf.remaining() < 4 {
                return Err(BpError::BundleParse("cbor truncated"));
            }
            u64::from(buf.get_u32())
        }
        27 => {
            if buf.remaining() < 8 {
                return Err(BpError::BundleParse("cbor truncated"));
            }
            buf.get_u64()
        }
        _ => return Err(BpError::BundleParse("unsupported cbor additional info")),
    })
}

pub fn put_uint(buf: &mut BytesMut, value: u64) {
    put_head(buf, MAJOR_UINT, value);
}

pub fn get_uint(buf: &mut impl Buf) -> BpResult<u64> {
    get_head(buf, MAJOR_UINT)
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_head(buf, MAJOR_BYTES, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn get_bytes(buf: &mut impl Buf) -> BpResult<Vec<u8>> {
    let len = get_head(buf, MAJOR_BYTES)? as usize;
    if buf.remaining() < len {
        return Err(BpError::BundleParse("cbor byte string truncated"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn put_array_head(buf: &mut BytesMut, len: usize) {
    put_head(buf, MAJOR_ARRAY, len as u64);
}

pub fn get_array_head(buf: &mut impl Buf) -> BpResult<usize> {
    Ok(get_head(buf, MAJOR_ARRAY)? as usize)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8((MAJOR_SIMPLE << 5) | if value { 21 } else { 20 });
}

pub fn get_bool(buf: &mut impl Buf) -> BpResult<bool> {
    if !buf.has_remaining() {
        return Err(BpError::BundleParse("cbor truncated"));
    }
    match buf.get_u8() {
        0xF4 => Ok(false),
        0xF5 => Ok(true),
        _ => Err(BpError::BundleParse("expected cbor boolean")),
    }
}
