// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `packed` module serializes packed on-disk structures through a format descriptor.
//!
//! Every on-disk structure in the format mixes 16-, 32-, and 64-bit fields without padding, in
//! either byte order. Rather than hand-writing a reader and writer per structure, a format
//! descriptor string drives one reader/writer pair for all of them. Descriptor characters:
//!
//! * `S` — a 16-bit field
//! * `L` — a 32-bit field
//! * `D` — a 64-bit field
//! * `1`..`9` — skip that many bytes
//! * `4` — may also be read or written as a four-byte opaque field
//!
//! All access is over length-checked slices; a descriptor that walks off the end of the buffer
//! is an error, never a wild read.

use crate::errors::{decode_error, encode_error, Result};

/// The byte order of the packed image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Total byte length described by a format descriptor.
pub fn packed_length(format: &str) -> usize {
    format
        .bytes()
        .map(|f| match f {
            b'S' => 2,
            b'L' => 4,
            b'D' => 8,
            b'0'..=b'9' => usize::from(f - b'0'),
            _ => 0,
        })
        .sum()
}

/// A field-at-a-time reader over a packed structure image.
pub struct PackedReader<'a> {
    data: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> PackedReader<'a> {
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        PackedReader { data, pos: 0, order }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < count {
            return decode_error("packed structure shorter than its descriptor");
        }

        self.pos += count;
        Ok(&self.data[self.pos - count..self.pos])
    }

    /// Skips bytes described by a digit descriptor character.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    /// Reads an opaque four-byte field (descriptor `4`).
    pub fn quad(&mut self) -> Result<[u8; 4]> {
        let bytes = self.take(4)?;
        let mut quad = [0u8; 4];
        quad.copy_from_slice(bytes);
        Ok(quad)
    }

    /// Reads a 16-bit field (descriptor `S`).
    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        let bytes = [bytes[0], bytes[1]];

        Ok(match self.order {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        })
    }

    /// Reads a 32-bit field (descriptor `L`).
    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];

        Ok(match self.order {
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
        })
    }

    /// Reads a 64-bit field (descriptor `D`).
    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);

        Ok(match self.order {
            ByteOrder::LittleEndian => u64::from_le_bytes(b),
            ByteOrder::BigEndian => u64::from_be_bytes(b),
        })
    }

    /// Current offset into the image.
    pub fn pos(&self) -> usize {
        self.pos
    }
}

/// A field-at-a-time writer building a packed structure image.
pub struct PackedWriter<'a> {
    data: &'a mut [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> PackedWriter<'a> {
    pub fn new(data: &'a mut [u8], order: ByteOrder) -> Self {
        PackedWriter { data, pos: 0, order }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.data.len() - self.pos < bytes.len() {
            return encode_error("packed structure buffer too small for its descriptor");
        }

        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Writes zeroes for a digit descriptor character.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.put(&[0])?;
        }

        Ok(())
    }

    /// Writes an opaque four-byte field (descriptor `4`).
    pub fn quad(&mut self, quad: [u8; 4]) -> Result<()> {
        self.put(&quad)
    }

    /// Writes a 16-bit field (descriptor `S`).
    pub fn u16(&mut self, value: u16) -> Result<()> {
        match self.order {
            ByteOrder::LittleEndian => self.put(&value.to_le_bytes()),
            ByteOrder::BigEndian => self.put(&value.to_be_bytes()),
        }
    }

    /// Writes a 32-bit field (descriptor `L`).
    pub fn u32(&mut self, value: u32) -> Result<()> {
        match self.order {
            ByteOrder::LittleEndian => self.put(&value.to_le_bytes()),
            ByteOrder::BigEndian => self.put(&value.to_be_bytes()),
        }
    }

    /// Writes a 64-bit field (descriptor `D`).
    pub fn u64(&mut self, value: u64) -> Result<()> {
        match self.order {
            ByteOrder::LittleEndian => self.put(&value.to_le_bytes()),
            ByteOrder::BigEndian => self.put(&value.to_be_bytes()),
        }
    }

    /// Current offset into the image.
    pub fn pos(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::{packed_length, ByteOrder, PackedReader, PackedWriter};

    #[test]
    fn verify_packed_length() {
        assert_eq!(packed_length("4LS2LLLLL"), 32);
        assert_eq!(packed_length("SSLLSSSSLS"), 26);
        assert_eq!(packed_length("4L"), 8);
        assert_eq!(packed_length("D3"), 11);
    }

    #[test]
    fn verify_roundtrip_le() {
        let mut image = [0u8; 16];

        let mut w = PackedWriter::new(&mut image, ByteOrder::LittleEndian);
        w.quad(*b"wvpk").unwrap();
        w.u32(0x01020304).unwrap();
        w.u16(0x0402).unwrap();
        w.skip(2).unwrap();
        w.u32(0xdeadbeef).unwrap();
        assert_eq!(w.pos(), 16);

        assert_eq!(&image[0..4], b"wvpk");
        assert_eq!(image[4], 0x04);
        assert_eq!(image[8], 0x02);

        let mut r = PackedReader::new(&image, ByteOrder::LittleEndian);
        assert_eq!(&r.quad().unwrap(), b"wvpk");
        assert_eq!(r.u32().unwrap(), 0x01020304);
        assert_eq!(r.u16().unwrap(), 0x0402);
        r.skip(2).unwrap();
        assert_eq!(r.u32().unwrap(), 0xdeadbeef);
    }

    #[test]
    fn verify_roundtrip_be() {
        let mut image = [0u8; 8];

        let mut w = PackedWriter::new(&mut image, ByteOrder::BigEndian);
        w.u16(0x1234).unwrap();
        w.u32(0x56789abc).unwrap();
        w.u16(0xdef0).unwrap();

        assert_eq!(image, [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0]);

        let mut r = PackedReader::new(&image, ByteOrder::BigEndian);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0x56789abc);
        assert_eq!(r.u16().unwrap(), 0xdef0);
    }

    #[test]
    fn verify_bounds_checked() {
        let image = [0u8; 3];
        let mut r = PackedReader::new(&image, ByteOrder::LittleEndian);

        assert!(r.u16().is_ok());
        assert!(r.u32().is_err());

        let mut image = [0u8; 3];
        let mut w = PackedWriter::new(&mut image, ByteOrder::BigEndian);
        assert!(w.u16(1).is_ok());
        assert!(w.u32(2).is_err());
    }
}
