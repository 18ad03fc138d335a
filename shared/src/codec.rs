//! Byte-level wire codec shared by message payloads and save files.
//!
//! Values are little-endian with no type tags; the schema is implicit in the
//! message type, so payloads are read as a sequential stream of typed values.
//! Every decode advances a caller-supplied cursor by exactly the bytes it
//! consumed. Both ends of the wire run this same codec, which makes malformed
//! input a protocol bug rather than a runtime condition: decode functions
//! panic instead of returning errors.

use glam::{Quat, Vec3};

/// Longest encodable string: the wire length prefix is a single byte.
pub const MAX_STRING_LEN: usize = 255;

/// Consumes exactly `n` bytes, panicking if the buffer is short.
fn take<'a>(buf: &'a [u8], cursor: &mut usize, n: usize) -> &'a [u8] {
    let end = *cursor + n;
    if end > buf.len() {
        panic!(
            "protocol violation: needed {} bytes at offset {} but only {} remain",
            n,
            *cursor,
            buf.len() - *cursor
        );
    }
    let bytes = &buf[*cursor..end];
    *cursor = end;
    bytes
}

pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Writes a UTF-8 string as `[len: u8][bytes]`.
///
/// # Panics
/// Panics if the string is longer than [`MAX_STRING_LEN`] bytes; that is a
/// fatal encoding error, not a recoverable one.
pub fn write_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        panic!(
            "protocol violation: string of {} bytes exceeds the {}-byte wire limit",
            bytes.len(),
            MAX_STRING_LEN
        );
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

/// Writes a 3-vector as three consecutive `f32`s (x, y, z).
pub fn write_vec3(out: &mut Vec<u8>, value: Vec3) {
    write_f32(out, value.x);
    write_f32(out, value.y);
    write_f32(out, value.z);
}

/// Writes a quaternion as four consecutive `f32`s (x, y, z, w).
pub fn write_quat(out: &mut Vec<u8>, value: Quat) {
    write_f32(out, value.x);
    write_f32(out, value.y);
    write_f32(out, value.z);
    write_f32(out, value.w);
}

pub fn read_i32(buf: &[u8], cursor: &mut usize) -> i32 {
    let bytes = take(buf, cursor, 4);
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn read_f32(buf: &[u8], cursor: &mut usize) -> f32 {
    let bytes = take(buf, cursor, 4);
    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reads a `[len: u8][bytes]` string.
///
/// # Panics
/// Panics on truncated buffers or invalid UTF-8.
pub fn read_string(buf: &[u8], cursor: &mut usize) -> String {
    let len = take(buf, cursor, 1)[0] as usize;
    let bytes = take(buf, cursor, len);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(e) => panic!("protocol violation: string is not valid UTF-8: {}", e),
    }
}

pub fn read_vec3(buf: &[u8], cursor: &mut usize) -> Vec3 {
    let x = read_f32(buf, cursor);
    let y = read_f32(buf, cursor);
    let z = read_f32(buf, cursor);
    Vec3::new(x, y, z)
}

pub fn read_quat(buf: &[u8], cursor: &mut usize) -> Quat {
    let x = read_f32(buf, cursor);
    let y = read_f32(buf, cursor);
    let z = read_f32(buf, cursor);
    let w = read_f32(buf, cursor);
    Quat::from_xyzw(x, y, z, w)
}

/// Reads `n` raw bytes without interpretation (used for digest blocks and
/// field payloads whose layout the caller owns).
pub fn read_bytes<'a>(buf: &'a [u8], cursor: &mut usize, n: usize) -> &'a [u8] {
    take(buf, cursor, n)
}
