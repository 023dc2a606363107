// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `header` module defines the 32-byte WavPack block header.

use bitflags::bitflags;

use wavpack_core::errors::{decode_error, Result};
use wavpack_core::io::packed::{ByteOrder, PackedReader, PackedWriter};
use wavpack_core::io::MediaSourceStream;

use crate::{MAX_STREAM_VERS, MIN_STREAM_VERS};

/// The block header magic, "wvpk".
pub const BLOCK_MAGIC: [u8; 4] = *b"wvpk";

/// Format descriptor for the on-disk header layout.
pub const HEADER_FORMAT: &str = "4LS2LLLLL";

/// Number of bytes a scanning reader may skip before giving up on finding a header.
pub const HEADER_SCAN_LIMIT: u64 = 1024 * 1024;

/// Least-significant bit of the shift field within the flags word.
pub const SHIFT_LSB: u32 = 13;
/// Least-significant bit of the magnitude field within the flags word.
pub const MAG_LSB: u32 = 18;
/// Least-significant bit of the sample-rate index within the flags word.
pub const SRATE_LSB: u32 = 23;

/// The table of standard sampling rates; an index of 15 means the rate is carried in a
/// SAMPLE_RATE metadata sub-block instead.
pub const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192000,
];

bitflags! {
    /// Per-block parameter flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Two-bit field holding bytes-per-sample minus one.
        const BYTES_STORED   = 0x3;
        /// The block carries one channel.
        const MONO           = 0x4;
        /// Hybrid (lossy, or lossless with a correction stream) mode.
        const HYBRID         = 0x8;
        /// The stereo channels were passed through the joint-stereo transform.
        const JOINT_STEREO   = 0x10;
        /// Cross-channel decorrelation terms are permitted.
        const CROSS_DECORR   = 0x20;
        /// Hybrid noise shaping is active.
        const HYBRID_SHAPE   = 0x40;
        /// Samples are IEEE 32-bit floats reconstructed via the wvx stream.
        const FLOAT_DATA     = 0x80;
        /// Samples are integers wider than 24 bits reconstructed via the wvx stream.
        const INT32_DATA     = 0x100;
        /// The hybrid bitrate term is noise-level relative (kbps style) rather than
        /// bits-per-sample.
        const HYBRID_BITRATE = 0x200;
        /// Stereo hybrid bitrate is balanced between the channels.
        const HYBRID_BALANCE = 0x400;
        /// First block of a multichannel frame.
        const INITIAL_BLOCK  = 0x800;
        /// Last block of a multichannel frame.
        const FINAL_BLOCK    = 0x1000;
        /// Five-bit field holding the right-shift applied to samples before packing.
        const SHIFT_MASK     = 0x1f << 13;
        /// Five-bit field holding the maximum sample magnitude in bits, minus one.
        const MAG_MASK       = 0x1f << 18;
        /// Four-bit index into the standard sample-rate table.
        const SRATE_MASK     = 0xf << 23;
        /// Reserved; ignored when encountered.
        const IGNORED        = 0x0800_0000;
        /// The block carries a BLOCK_CHECKSUM metadata sub-block.
        const HAS_CHECKSUM   = 0x1000_0000;
        /// The refined IIR noise-shaping formulation is in use.
        const NEW_SHAPING    = 0x2000_0000;
        /// A stereo block whose two channels carried identical data, encoded as mono.
        const FALSE_STEREO   = 0x4000_0000;
        /// The block carries range-coded DSD audio.
        const DSD            = 0x8000_0000;
    }
}

impl BlockFlags {
    /// True for blocks that decode a single channel of data, whether genuinely mono or a
    /// false-stereo pair.
    #[inline(always)]
    pub fn is_mono_data(self) -> bool {
        self.intersects(BlockFlags::MONO | BlockFlags::FALSE_STEREO)
    }
}

/// The fixed header leading every WavPack block.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockHeader {
    /// Stream format version, 0x402 to 0x410.
    pub version: u16,
    /// Payload size in bytes, not counting the magic and this field (total block bytes minus 8).
    pub ck_size: u32,
    /// Total composite samples in the logical file, when known. Only meaningful in blocks that
    /// carry it (generally the first).
    pub total_samples: Option<u64>,
    /// Index of the first composite sample in this block (40-bit).
    pub block_index: u64,
    /// Composite samples in this block; zero denotes a metadata-only block.
    pub block_samples: u32,
    /// Per-block parameter flags.
    pub flags: BlockFlags,
    /// Checksum over the decoded samples of this block (or the code stream, for DSD).
    pub crc: u32,
}

impl BlockHeader {
    /// On-disk size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Parses a header from a 32-byte image, validating the magic.
    pub fn read(buf: &[u8; BlockHeader::SIZE]) -> Result<BlockHeader> {
        let mut reader = PackedReader::new(buf, ByteOrder::LittleEndian);

        if reader.quad()? != BLOCK_MAGIC {
            return decode_error("wavpack: block header magic missing");
        }

        let ck_size = reader.u32()?;
        let version = reader.u16()?;

        // Since version 0x410 the two reserved track/index bytes carry the high-order bits of
        // the block index and total sample count for large files.
        let block_index_u8 = buf[10];
        let total_samples_u8 = buf[11];
        reader.skip(2)?;

        let total_samples_u32 = reader.u32()?;
        let block_index_u32 = reader.u32()?;
        let block_samples = reader.u32()?;
        let flags = BlockFlags::from_bits_retain(reader.u32()?);
        let crc = reader.u32()?;

        // An all-ones low word marks an unknown length. Otherwise the stored value carries one
        // extra count per 2^32 so that large totals never collide with the unknown marker.
        let total_samples = if total_samples_u32 == u32::MAX {
            None
        }
        else {
            let stored = u64::from(total_samples_u32) + (u64::from(total_samples_u8) << 32);
            Some(stored - u64::from(total_samples_u8))
        };

        Ok(BlockHeader {
            version,
            ck_size,
            total_samples,
            block_index: u64::from(block_index_u32) + (u64::from(block_index_u8) << 32),
            block_samples,
            flags,
            crc,
        })
    }

    /// Serializes the header into a 32-byte image.
    pub fn write(&self, buf: &mut [u8; BlockHeader::SIZE]) {
        // The image is exactly BlockHeader::SIZE bytes, so none of the writes below can fail.
        let mut writer = PackedWriter::new(buf, ByteOrder::LittleEndian);

        let (total_samples_u32, total_samples_u8) = match self.total_samples {
            None => (u32::MAX, 0),
            Some(count) => {
                let stored = count + (count / 0xffff_ffff);
                (stored as u32, (stored >> 32) as u8)
            }
        };

        let _ = writer.quad(BLOCK_MAGIC);
        let _ = writer.u32(self.ck_size);
        let _ = writer.u16(self.version);
        let _ = writer.skip(2);
        let _ = writer.u32(total_samples_u32);
        let _ = writer.u32(self.block_index as u32);
        let _ = writer.u32(self.block_samples);
        let _ = writer.u32(self.flags.bits());
        let _ = writer.u32(self.crc);

        buf[10] = (self.block_index >> 32) as u8;
        buf[11] = total_samples_u8;
    }

    /// Bytes-per-sample stored in this block, 1 to 4.
    #[inline(always)]
    pub fn bytes_stored(&self) -> u32 {
        (self.flags.bits() & BlockFlags::BYTES_STORED.bits()) + 1
    }

    /// Right-shift applied to samples before packing.
    #[inline(always)]
    pub fn shift(&self) -> u32 {
        (self.flags.bits() & BlockFlags::SHIFT_MASK.bits()) >> SHIFT_LSB
    }

    /// Maximum sample magnitude in bits, minus one.
    #[inline(always)]
    pub fn mag(&self) -> u32 {
        (self.flags.bits() & BlockFlags::MAG_MASK.bits()) >> MAG_LSB
    }

    /// Index into the standard sample-rate table; 15 defers to SAMPLE_RATE metadata.
    #[inline(always)]
    pub fn srate_index(&self) -> u32 {
        (self.flags.bits() & BlockFlags::SRATE_MASK.bits()) >> SRATE_LSB
    }

    /// The sampling rate from the header flags, or `None` when it must come from metadata.
    pub fn sample_rate(&self) -> Option<u32> {
        match self.srate_index() {
            idx if (idx as usize) < SAMPLE_RATES.len() => Some(SAMPLE_RATES[idx as usize]),
            _ => None,
        }
    }

    /// Number of channels coded in this block.
    #[inline(always)]
    pub fn num_channels(&self) -> u32 {
        if self.flags.contains(BlockFlags::MONO) {
            1
        }
        else {
            2
        }
    }
}

/// Validity predicates applied to a candidate 32-byte header during scanning. These accept all
/// real headers while rejecting almost all random data: magic, an even payload size below 2^24
/// and at least 24, a 4.x version within the supported range, and zeroed reserved selector
/// bytes (under 3 for the first, which tolerates old tracked files).
pub fn looks_like_header(buf: &[u8; BlockHeader::SIZE]) -> bool {
    buf[0..4] == BLOCK_MAGIC
        && buf[4] & 1 == 0
        && buf[6] < 16
        && buf[7] == 0
        && (buf[6] > 0 || buf[5] > 0 || buf[4] >= 24)
        && buf[9] == 4
        && buf[8] >= (MIN_STREAM_VERS & 0xff) as u8
        && buf[8] <= (MAX_STREAM_VERS & 0xff) as u8
        && buf[10] < 3
        && buf[11] == 0
}

/// Reads from the current position until a valid header is found, returning it along with the
/// number of bytes skipped. Gives up after [`HEADER_SCAN_LIMIT`] skipped bytes or at
/// end-of-stream, returning `None`. Seeking is not required.
pub fn read_next_header(reader: &mut MediaSourceStream) -> Result<Option<(BlockHeader, u64)>> {
    let mut buffer = [0u8; BlockHeader::SIZE];
    let mut have = 0usize;
    let mut skipped = 0u64;

    loop {
        if reader.read_some(&mut buffer[have..])? < BlockHeader::SIZE - have {
            return Ok(None);
        }

        if looks_like_header(&buffer) {
            return Ok(Some((BlockHeader::read(&buffer)?, skipped)));
        }

        // Not a header. Drop bytes up to the next possible magic and refill.
        let next = buffer[1..].iter().position(|&b| b == b'w').map_or(BlockHeader::SIZE, |p| p + 1);

        skipped += next as u64;

        if skipped > HEADER_SCAN_LIMIT {
            return Ok(None);
        }

        buffer.copy_within(next.., 0);
        have = BlockHeader::SIZE - next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use wavpack_core::io::MediaSourceStream;

    fn test_header() -> BlockHeader {
        BlockHeader {
            version: 0x407,
            ck_size: 24 + 42,
            total_samples: Some(88200),
            block_index: 0,
            block_samples: 22050,
            flags: BlockFlags::from_bits_retain(1)
                | BlockFlags::JOINT_STEREO
                | BlockFlags::CROSS_DECORR
                | BlockFlags::from_bits_retain(9 << SRATE_LSB)
                | BlockFlags::from_bits_retain(16 << MAG_LSB)
                | BlockFlags::INITIAL_BLOCK
                | BlockFlags::FINAL_BLOCK,
            crc: 0xdead_beef,
        }
    }

    #[test]
    fn verify_header_roundtrip() {
        let header = test_header();

        let mut image = [0u8; BlockHeader::SIZE];
        header.write(&mut image);

        assert!(looks_like_header(&image));

        let parsed = BlockHeader::read(&image).unwrap();
        assert_eq!(parsed.version, 0x407);
        assert_eq!(parsed.ck_size, 66);
        assert_eq!(parsed.total_samples, Some(88200));
        assert_eq!(parsed.block_samples, 22050);
        assert_eq!(parsed.flags, header.flags);
        assert_eq!(parsed.crc, 0xdead_beef);
        assert_eq!(parsed.sample_rate(), Some(44100));
        assert_eq!(parsed.bytes_stored(), 2);
        assert_eq!(parsed.mag(), 16);
    }

    #[test]
    fn verify_large_file_fields() {
        let mut header = test_header();
        header.block_index = 5 << 32 | 1234;
        header.total_samples = Some((1 << 40) - 257);

        let mut image = [0u8; BlockHeader::SIZE];
        header.write(&mut image);

        let parsed = BlockHeader::read(&image).unwrap();
        assert_eq!(parsed.block_index, 5 << 32 | 1234);
        assert_eq!(parsed.total_samples, Some((1 << 40) - 257));

        header.total_samples = None;
        header.write(&mut image);
        assert_eq!(BlockHeader::read(&image).unwrap().total_samples, None);
    }

    #[test]
    fn verify_resync_scan() {
        let mut image = [0u8; BlockHeader::SIZE];
        test_header().write(&mut image);

        // Garbage laced with decoy magic bytes ahead of the real header.
        let mut stream = vec![b'w'; 17];
        stream.extend_from_slice(b"wvpkwv");
        stream.extend_from_slice(&image);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(stream)));
        let (header, skipped) = read_next_header(&mut mss).unwrap().unwrap();

        assert_eq!(skipped, 23);
        assert_eq!(header.block_samples, 22050);
    }

    #[test]
    fn verify_scan_limit() {
        let mut stream = vec![0u8; HEADER_SCAN_LIMIT as usize + 64];
        let len = stream.len();
        test_header().write((&mut stream[len - 32..]).try_into().unwrap());

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(stream)));
        assert!(read_next_header(&mut mss).unwrap().is_none());
    }
}
