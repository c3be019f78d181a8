//! Length-prefixed byte framing and the big-endian integer codec.
//!
//! All integers on the wire are network byte order. An SFTP packet is
//! `u32 length | u8 type | u32 id | payload`, where `length` counts every
//! byte after itself. [`PacketBuilder`] assembles one packet into an owned
//! buffer; [`FrameReader`] accumulates bytes from the wire and yields
//! complete packets, compacting leftovers for the next call.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::error::{ProtoError, Result};

/// Header fields common to every SFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet length, not counting the length field itself.
    pub length: u32,
    pub packet_type: u8,
    pub id: u32,
}

impl PacketHeader {
    pub const WIRE_SIZE: usize = 4 + 1 + 4;

    /// Bytes of payload that follow the header on the wire.
    pub fn payload_len(&self) -> usize {
        self.length as usize - 1 - 4
    }
}

/// Builds a single length-prefixed SFTP packet into an owned buffer.
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    /// Starts a new packet of the given type and id; the length prefix is
    /// patched in by [`PacketBuilder::finish`].
    pub fn new(packet_type: u8, id: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.write_u32::<BigEndian>(0).unwrap(); // placeholder length
        buf.write_u8(packet_type).unwrap();
        buf.write_u32::<BigEndian>(id).unwrap();
        Self { buf }
    }

    pub fn push_u8(&mut self, v: u8) -> &mut Self {
        self.buf.write_u8(v).unwrap();
        self
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.buf.write_u32::<BigEndian>(v).unwrap();
        self
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.buf.write_u64::<BigEndian>(v).unwrap();
        self
    }

    /// Pushes a raw byte run with no length prefix.
    pub fn push_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Pushes a 4-byte big-endian length followed by the bytes themselves.
    pub fn push_buf(&mut self, bytes: &[u8]) -> &mut Self {
        self.push_u32(bytes.len() as u32);
        self.push_raw(bytes)
    }

    /// Pushes a length-prefixed UTF-8 string (SFTP strings are just
    /// length-prefixed byte runs).
    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_buf(s.as_bytes())
    }

    /// Finalizes the packet, patching the length prefix, and returns the
    /// complete wire buffer.
    pub fn finish(mut self) -> Vec<u8> {
        let length = (self.buf.len() - 4) as u32;
        (&mut self.buf[0..4])
            .write_u32::<BigEndian>(length)
            .unwrap();
        self.buf
    }
}

/// A cursor-based reader for popping primitives back out of a packet
/// payload, mirroring [`PacketBuilder`]'s push operations.
pub struct PacketReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PacketReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(payload),
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    pub fn pop_u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| too_short(1))
    }

    pub fn pop_u32(&mut self) -> Result<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(|_| too_short(4))
    }

    pub fn pop_u64(&mut self) -> Result<u64> {
        self.cursor.read_u64::<BigEndian>().map_err(|_| too_short(8))
    }

    pub fn pop_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| too_short(len))?;
        Ok(out)
    }

    /// Pops a 4-byte length prefix followed by that many bytes.
    pub fn pop_buf(&mut self) -> Result<Vec<u8>> {
        let len = self.pop_u32()? as usize;
        self.pop_raw(len)
    }

    pub fn pop_str(&mut self) -> Result<String> {
        let bytes = self.pop_buf()?;
        String::from_utf8(bytes).map_err(|_| ProtoError::InvalidAttrs("not valid utf-8"))
    }
}

fn too_short(need: usize) -> ProtoError {
    ProtoError::Truncated { need, have: 0 }
}

/// Maximum accepted packet length, guarding against a hostile/buggy peer
/// inflating the length prefix and exhausting memory.
pub const MAX_PACKET_LEN: u32 = 16 * 1024 * 1024;

/// Accumulates bytes read off the wire and yields complete packets.
///
/// Excess bytes past a complete packet are compacted and kept for the
/// next call rather than discarded.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends freshly-read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A packet is complete once at least `length + 4` bytes have arrived.
    pub fn is_complete(&self) -> bool {
        if self.buf.len() < 4 {
            return false;
        }
        let length = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        self.buf.len() >= length as usize + 4
    }

    /// Pops the next complete packet, if any, returning its header and
    /// payload. Compacts the remaining buffer in place.
    pub fn pop_packet(&mut self) -> Result<Option<(PacketHeader, Vec<u8>)>> {
        if self.buf.len() < PacketHeader::WIRE_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        if length > MAX_PACKET_LEN {
            return Err(ProtoError::TooLarge {
                size: length,
                max: MAX_PACKET_LEN,
            });
        }
        let total = length as usize + 4;
        if self.buf.len() < total {
            return Ok(None);
        }

        let packet_type = self.buf[4];
        let id = u32::from_be_bytes(self.buf[5..9].try_into().unwrap());
        let header = PacketHeader {
            length,
            packet_type,
            id,
        };
        let payload = self.buf[PacketHeader::WIRE_SIZE..total].to_vec();

        // Compact: drop the consumed packet, keep whatever follows.
        self.buf.drain(0..total);

        Ok(Some((header, payload)))
    }
}

/// Writes a full packet buffer to any `Write`, looping over partial writes.
/// Returns the number of bytes written (always `buf.len()` on success).
pub fn write_all_packet<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<usize> {
    w.write_all(buf)?;
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let mut b = PacketBuilder::new(42, 7);
        b.push_u8(0xAB)
            .push_u32(0xDEADBEEF)
            .push_u64(0x0123456789ABCDEF)
            .push_buf(b"hello world");
        let wire = b.finish();

        let header_len = u32::from_be_bytes(wire[0..4].try_into().unwrap());
        assert_eq!(header_len as usize, wire.len() - 4);
        assert_eq!(wire[4], 42);
        assert_eq!(u32::from_be_bytes(wire[5..9].try_into().unwrap()), 7);

        let mut r = PacketReader::new(&wire[PacketHeader::WIRE_SIZE..]);
        assert_eq!(r.pop_u8().unwrap(), 0xAB);
        assert_eq!(r.pop_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.pop_u64().unwrap(), 0x0123456789ABCDEF);
        assert_eq!(r.pop_buf().unwrap(), b"hello world");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn big_endian_first_byte() {
        let mut b = PacketBuilder::new(1, 0);
        b.push_u32(0x01020304);
        let wire = b.finish();
        // First pushed byte after the 9-byte header is the MSB.
        assert_eq!(wire[PacketHeader::WIRE_SIZE], 0x01);
    }

    #[test]
    fn frame_reader_compacts_excess() {
        let mut b1 = PacketBuilder::new(3, 1);
        b1.push_u8(1);
        let p1 = b1.finish();
        let mut b2 = PacketBuilder::new(3, 2);
        b2.push_u8(2);
        let p2 = b2.finish();

        let mut fr = FrameReader::new();
        let mut combined = p1.clone();
        combined.extend_from_slice(&p2);
        // Feed byte-by-byte-ish in two chunks to exercise partial feeds.
        fr.feed(&combined[..combined.len() - 2]);
        assert!(fr.pop_packet().unwrap().is_some());
        assert!(fr.pop_packet().unwrap().is_none());
        fr.feed(&combined[combined.len() - 2..]);
        let (header, payload) = fr.pop_packet().unwrap().unwrap();
        assert_eq!(header.id, 2);
        assert_eq!(payload, vec![2]);
    }

    #[test]
    fn rejects_oversized_packet() {
        let mut fr = FrameReader::new();
        let mut huge = Vec::new();
        huge.extend_from_slice(&(MAX_PACKET_LEN + 1).to_be_bytes());
        fr.feed(&huge);
        assert!(matches!(
            fr.pop_packet(),
            Err(ProtoError::TooLarge { .. })
        ));
    }
}
