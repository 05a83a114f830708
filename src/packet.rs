use bytes::{BufMut, BytesMut};

use crate::id::Uid;

/// Growable byte buffer with a read cursor, used on every send/receive
/// boundary.
///
/// A packet is built by sequential field appends and consumed by sequential
/// reads in the same order the sender used; the protocol, not the codec, is
/// responsible for framing consistency. Integers are little-endian on the
/// wire, identifier bytes are raw with byte 0 first.
#[derive(Debug, Default)]
pub struct Packet {
    buf: BytesMut,
    offset: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps received bytes with the cursor at the start.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            offset: 0,
        }
    }

    /// All written bytes, independent of the cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Unread bytes from the cursor to the end.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_uid<const N: usize>(&mut self, id: &Uid<N>) {
        self.buf.put_slice(id.as_bytes());
    }

    /// Appends the string bytes followed by a single NUL terminator.
    pub fn put_str(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Copies up to `N` remaining bytes, zero-filling the rest. The cursor
    /// advances only over bytes actually present; callers are expected to
    /// rely on already-validated framing rather than EOF signaling.
    fn get_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        let available = (self.buf.len() - self.offset).min(N);
        out[..available].copy_from_slice(&self.buf[self.offset..self.offset + available]);
        self.offset += available;
        out
    }

    pub fn get_u8(&mut self) -> u8 {
        self.get_array::<1>()[0]
    }

    pub fn get_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.get_array())
    }

    pub fn get_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.get_array())
    }

    pub fn get_uid<const N: usize>(&mut self) -> Uid<N> {
        Uid(self.get_array())
    }

    /// Reads up to the NUL terminator (or the end), advancing past it.
    pub fn get_str(&mut self) -> String {
        let rest = &self.buf[self.offset..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.offset += (end + 1).min(rest.len());
        s
    }

    pub fn skip(&mut self, count: usize) {
        self.offset = (self.offset + count).min(self.buf.len());
    }
}
