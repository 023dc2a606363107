// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `decoder` module provides the high-level API for reading WavPack files.
//!
//! The decoder locates blocks in the supplied reader, assembles the one or more streams that
//! make up each multichannel frame (pairing correction blocks from a second reader when one
//! was provided), decodes them, and interleaves the result into the caller's buffer. Errors
//! within a block are contained: the damaged range decodes to silence and a CRC-error counter
//! ticks, per the container's recovery model.

use bitflags::bitflags;

use log::{debug, warn};

use wavpack_core::errors::{seek_error, unsupported_error, Result, SeekErrorKind};
use wavpack_core::io::{MediaSource, MediaSourceStream};

use crate::dsd::DsdDecimator;
use crate::header::{read_next_header, BlockFlags, BlockHeader};
use crate::metadata::verify_block;
use crate::unpack::{ContextInfo, Stream};
use crate::{MAX_STREAM_VERS, MIN_STREAM_VERS};

bitflags! {
    /// Options for opening a file.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Read the correction stream when one is supplied.
        const WVC         = 0x1;
        /// Collect wrapper (RIFF header/trailer) bytes for the caller.
        const WRAPPER     = 0x4;
        /// Open only the first stream of a multichannel file (no downmix).
        const TWO_CH_MAX  = 0x8;
        /// Normalize floating-point output to the +/-1.0 convention.
        const NORMALIZE   = 0x10;
        /// Decode blocks as they come with no regard for stream position (pipes).
        const STREAMING   = 0x20;
        /// Return DSD audio as raw bytes (eight DSD bits per "sample").
        const DSD_NATIVE  = 0x100;
        /// Return DSD audio as 24-bit PCM, decimated 8x.
        const DSD_AS_PCM  = 0x200;
        /// Skip block-checksum verification before decoding.
        const NO_CHECKSUM = 0x800;
    }
}

bitflags! {
    /// Qualities of an open file.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Mode: u32 {
        const WVC       = 0x1;
        const LOSSLESS  = 0x2;
        const HYBRID    = 0x4;
        const FLOAT     = 0x8;
        const HIGH      = 0x20;
        const FAST      = 0x40;
        const EXTRA     = 0x80;
        const VERY_HIGH = 0x400;
        const MD5       = 0x800;
        const DSD       = 0x1000;
    }
}

/// Options for [`WavpackDecoder::open`].
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    pub flags: OpenFlags,
    /// Exponent offset applied during float normalization.
    pub norm_offset: i32,
}

/// Largest forward gap between blocks that is bridged with silence before the file is
/// declared broken.
const MAX_GAP_SAMPLES: u64 = 262_144;

/// Metadata-only blocks tolerated while searching for the first audio.
const MAX_LEADING_META_BLOCKS: u32 = 16;

/// The WavPack unpacker.
pub struct WavpackDecoder {
    reader: MediaSourceStream,
    wvc_reader: Option<MediaSourceStream>,
    streams: Vec<Stream>,
    ctx: ContextInfo,
    open_flags: OpenFlags,
    norm_offset: i32,
    total_samples: Option<u64>,
    initial_index: u64,
    reduced_channels: Option<u32>,
    sample_rate: u32,
    bits_per_sample: u32,
    bytes_per_sample: u32,
    float_norm_exp: u8,
    version: u16,
    crc_errors: u32,
    wvc_flag: bool,
    file_len: Option<u64>,
    file2_len: Option<u64>,
    error_message: String,
    decimator: Option<DsdDecimator>,
}

impl WavpackDecoder {
    /// Opens a WavPack stream for reading, with an optional correction stream.
    pub fn open(
        source: Box<dyn MediaSource>,
        wvc_source: Option<Box<dyn MediaSource>>,
        options: &OpenOptions,
    ) -> Result<WavpackDecoder> {
        let mut decoder = WavpackDecoder {
            reader: MediaSourceStream::new(source),
            wvc_reader: None,
            streams: vec![Stream::default()],
            ctx: ContextInfo {
                collect_wrapper: options.flags.contains(OpenFlags::WRAPPER),
                ..Default::default()
            },
            open_flags: options.flags,
            norm_offset: options.norm_offset,
            total_samples: None,
            initial_index: 0,
            reduced_channels: None,
            sample_rate: 0,
            bits_per_sample: 0,
            bytes_per_sample: 0,
            float_norm_exp: 0,
            version: 0,
            crc_errors: 0,
            wvc_flag: false,
            file_len: None,
            file2_len: None,
            error_message: String::new(),
            decimator: None,
        };

        decoder.file_len = decoder.reader.byte_len();

        if options.flags.contains(OpenFlags::WVC) {
            decoder.wvc_reader = wvc_source.map(MediaSourceStream::new);
        }

        let mut meta_blocks = 0u32;

        loop {
            let (header, _) = match read_next_header(&mut decoder.reader)? {
                Some(found) => found,
                None => return unsupported_error("wavpack: no valid block header found"),
            };

            if header.version < MIN_STREAM_VERS || header.version > MAX_STREAM_VERS {
                return unsupported_error("wavpack: stream version below 0x402");
            }

            let blockbuff = decoder.read_block_body(&header, false)?;
            let stream = &mut decoder.streams[0];

            stream.header = header;
            stream.blockbuff = blockbuff;
            stream.block2buff = Vec::new();
            stream.init_done = false;

            if !options.flags.contains(OpenFlags::NO_CHECKSUM)
                && !verify_block(&decoder.streams[0].blockbuff)
            {
                return unsupported_error("wavpack: first block fails its checksum");
            }

            let stream = &mut decoder.streams[0];

            if stream.header.block_samples > 0
                && !options.flags.contains(OpenFlags::STREAMING)
            {
                if stream.header.block_index != 0 || stream.header.total_samples.is_none() {
                    decoder.initial_index = stream.header.block_index;
                    stream.header.block_index = 0;

                    if decoder.reader.is_seekable() {
                        let pos_save = decoder.reader.pos();
                        let final_index = decoder.seek_final_index()?;

                        if let Some(final_index) = final_index {
                            decoder.total_samples =
                                Some(final_index.saturating_sub(decoder.initial_index));
                        }

                        decoder.reader.seek_abs(pos_save)?;
                    }
                }
                else {
                    decoder.total_samples = decoder.streams[0].header.total_samples;
                }
            }

            let stream = &mut decoder.streams[0];

            if decoder.wvc_reader.is_some()
                && stream.header.block_samples > 0
                && stream.header.flags.contains(BlockFlags::HYBRID)
            {
                decoder.file2_len = decoder.wvc_reader.as_ref().unwrap().byte_len();
                decoder.wvc_flag = true;
            }

            if decoder.wvc_flag && !decoder.read_wvc_block(0)? {
                return unsupported_error("wavpack: not compatible with the correction file");
            }

            let stream = &mut decoder.streams[0];

            if !stream.unpack_init(&mut decoder.ctx) {
                return unsupported_error("wavpack: first block could not be initialized");
            }

            stream.init_done = true;

            if decoder.streams[0].header.block_samples > 0 {
                break;
            }

            meta_blocks += 1;

            if meta_blocks > MAX_LEADING_META_BLOCKS {
                return unsupported_error("wavpack: no audio blocks found");
            }
        }

        let stream = &decoder.streams[0];
        let header = stream.header;

        decoder.version = header.version;
        decoder.ctx.config_flags &= !0xffu32;
        decoder.ctx.config_flags |= header.flags.bits() & 0xff;
        decoder.bytes_per_sample = header.bytes_stored();
        decoder.bits_per_sample = header.bytes_stored() * 8 - header.shift();
        decoder.float_norm_exp = if header.flags.contains(BlockFlags::FLOAT_DATA) {
            stream.float_norm_exp()
        }
        else {
            0
        };

        decoder.sample_rate = match header.sample_rate() {
            Some(rate) => rate,
            None => decoder.ctx.meta_sample_rate.unwrap_or(44100),
        };

        if decoder.ctx.num_channels == 0 {
            decoder.ctx.num_channels = header.num_channels();
            decoder.ctx.channel_mask = 0x5 - decoder.ctx.num_channels;
        }

        if options.flags.contains(OpenFlags::TWO_CH_MAX)
            && !header.flags.contains(BlockFlags::FINAL_BLOCK)
        {
            decoder.reduced_channels = Some(header.num_channels());
        }

        if header.flags.contains(BlockFlags::DSD) {
            if options.flags.contains(OpenFlags::DSD_AS_PCM) {
                let channels =
                    decoder.reduced_channels.unwrap_or(decoder.ctx.num_channels) as usize;
                decoder.decimator = Some(DsdDecimator::new(channels));
                decoder.bytes_per_sample = 3;
                decoder.bits_per_sample = 24;
            }
            else if options.flags.contains(OpenFlags::DSD_NATIVE) {
                decoder.bytes_per_sample = 1;
                decoder.bits_per_sample = 8;
            }
            else {
                return unsupported_error("wavpack: DSD file requires a DSD open mode");
            }
        }

        Ok(decoder)
    }

    /// Reads the body of a block whose header was just consumed, returning the complete block
    /// image (header plus payload).
    fn read_block_body(&mut self, header: &BlockHeader, wvc: bool) -> Result<Vec<u8>> {
        let total = header.ck_size as usize + 8;
        let mut block = vec![0u8; total];

        let mut image = [0u8; BlockHeader::SIZE];
        header.write(&mut image);
        block[..BlockHeader::SIZE].copy_from_slice(&image);

        let reader =
            if wvc { self.wvc_reader.as_mut().unwrap() } else { &mut self.reader };

        reader.read_exact(&mut block[BlockHeader::SIZE..])?;
        Ok(block)
    }

    /// Scans the tail of the file for the final audio block to learn the true length.
    fn seek_final_index(&mut self) -> Result<Option<u64>> {
        let mut result = None;

        if let Some(len) = self.file_len {
            if len > 1_200_000 {
                self.reader.seek_from_end(-1_048_576)?;
            }
            else {
                self.reader.seek_abs(0)?;
            }
        }
        else {
            return Ok(None);
        }

        while let Some((header, _)) = read_next_header(&mut self.reader)? {
            if self.reader.skip(u64::from(header.ck_size) - 24).is_err() {
                break;
            }

            if header.block_samples > 0 && header.flags.contains(BlockFlags::FINAL_BLOCK) {
                result = Some(header.block_index + u64::from(header.block_samples));
            }
        }

        Ok(result)
    }

    /// Rates a candidate correction-block header against the main block: 0 match, 1 keep
    /// scanning forward, -1 back up and retry on a later main block.
    fn match_wvc_header(wv: &BlockHeader, wvc: &BlockHeader) -> i32 {
        if wv.block_index == wvc.block_index && wv.block_samples == wvc.block_samples {
            if wv.flags == wvc.flags {
                return 0;
            }

            let weigh = |flags: BlockFlags| {
                let mut weight = 0;

                if flags.contains(BlockFlags::INITIAL_BLOCK) {
                    weight -= 1;
                }

                if flags.contains(BlockFlags::FINAL_BLOCK) {
                    weight += 1;
                }

                weight
            };

            return if weigh(wvc.flags) - weigh(wv.flags) < 0 { 1 } else { -1 };
        }

        if wvc.block_index < wv.block_index {
            1
        }
        else {
            -1
        }
    }

    /// Reads the correction block matching the current main block of stream `index`. When the
    /// correction stream has skipped ahead the block is left for later and decoding proceeds
    /// lossily; a false return means the correction stream is unusable.
    fn read_wvc_block(&mut self, index: usize) -> Result<bool> {
        loop {
            let candidate = {
                let reader = self.wvc_reader.as_mut().unwrap();

                match read_next_header(reader)? {
                    Some((header, _)) => header,
                    None => {
                        self.streams[index].wvc_skip = true;
                        self.crc_errors += 1;
                        return Ok(false);
                    }
                }
            };

            let mut candidate = candidate;

            if self.open_flags.contains(OpenFlags::STREAMING) {
                candidate.block_index = self.streams[index].sample_index;
            }
            else {
                candidate.block_index = candidate.block_index.saturating_sub(self.initial_index);
            }

            match Self::match_wvc_header(&self.streams[index].header, &candidate) {
                0 => {
                    let block = self.read_block_body(&candidate, true)?;

                    if !self.open_flags.contains(OpenFlags::NO_CHECKSUM) && !verify_block(&block)
                    {
                        self.streams[index].wvc_skip = true;
                        self.crc_errors += 1;
                        return Ok(false);
                    }

                    let stream = &mut self.streams[index];
                    stream.block2buff = block;
                    stream.wvc_skip = false;
                    stream.header = candidate;
                    return Ok(true);
                }
                -1 => {
                    self.streams[index].wvc_skip = true;
                    self.wvc_reader.as_mut().unwrap().seek_rel(-32)?;
                    self.crc_errors += 1;
                    return Ok(true);
                }
                _ => {
                    debug!("skipping stale correction block");
                }
            }
        }
    }

    /// Drops any per-frame streams and the current block buffers, keeping context state.
    fn free_streams(&mut self) {
        self.streams.truncate(1);

        let stream = &mut self.streams[0];
        stream.blockbuff = Vec::new();
        stream.block2buff = Vec::new();
        stream.init_done = false;
    }

    /// Reads the next main block into stream `index` (appending a new stream slot when
    /// needed), pairing it with a correction block when applicable. Returns false at
    /// end-of-stream or on a fatal read problem.
    fn read_stream_block(&mut self, index: usize) -> Result<bool> {
        debug_assert!(index <= self.streams.len());

        if index == self.streams.len() {
            self.streams.push(Stream::default());
        }

        let (mut header, _) = match read_next_header(&mut self.reader)? {
            Some(found) => found,
            None => return Ok(false),
        };

        if self.open_flags.contains(OpenFlags::STREAMING) {
            let resume = self.streams[index].sample_index;
            header.block_index = resume;
        }
        else {
            header.block_index = header.block_index.saturating_sub(self.initial_index);
        }

        let block = match self.read_block_body(&header, false) {
            Ok(block) => block,
            Err(_) => {
                self.error_message = "can't read all of last block!".to_string();
                return Ok(false);
            }
        };

        let checksum_ok = self.open_flags.contains(OpenFlags::NO_CHECKSUM) || verify_block(&block);

        let stream = &mut self.streams[index];
        stream.header = header;
        stream.blockbuff = block;
        stream.block2buff = Vec::new();
        stream.init_done = false;
        stream.wvc_skip = false;

        if !checksum_ok {
            warn!("block checksum failure");
            stream.mute_error = true;
            stream.init_done = true;
            stream.sample_index = header.block_index;
            self.crc_errors += 1;
        }

        if header.block_samples > 0 && self.wvc_flag {
            self.read_wvc_block(index)?;
        }

        Ok(true)
    }

    /// Unpacks up to `samples` composite samples of all channels, interleaved, returning the
    /// number produced. A short count only happens at the end of the stream.
    pub fn unpack_samples(&mut self, buffer: &mut [i32], samples: u32) -> u32 {
        let num_channels = self.reduced_channels.unwrap_or(self.ctx.num_channels) as usize;
        let mut remaining = samples as usize;
        let mut out_pos = 0usize;

        debug_assert!(buffer.len() >= samples as usize * num_channels);

        'outer: while remaining > 0 {
            // Move to the next frame when the current one is exhausted (or was never read).
            let need_block = {
                let stream = &self.streams[0];
                stream.header.block_samples == 0
                    || !stream.header.flags.contains(BlockFlags::INITIAL_BLOCK)
                    || stream.sample_index >= stream.block_end()
            };

            if need_block {
                if self.ctx.wrapper.len() >= crate::MAX_WRAPPER_BYTES {
                    break;
                }

                self.free_streams();

                match self.read_stream_block(0) {
                    Ok(true) => {}
                    _ => break,
                }

                let stream = &mut self.streams[0];

                // Only frame-defining blocks participate in the sequencing check; blocks of a
                // frame being skipped (reduced-channel decodes) are not discontinuities.
                if stream.header.block_samples > 0
                    && stream.header.flags.contains(BlockFlags::INITIAL_BLOCK)
                    && stream.sample_index != stream.header.block_index
                {
                    let ahead = stream.header.block_index.saturating_sub(stream.sample_index);

                    if ahead > MAX_GAP_SAMPLES {
                        self.error_message = "discontinuity found, aborting file!".to_string();
                        break;
                    }

                    self.crc_errors += 1;
                }

                if stream.header.block_samples == 0 {
                    // A metadata-only block: absorb its content and continue scanning.
                    if !stream.init_done && !stream.unpack_init(&mut self.ctx) {
                        self.crc_errors += 1;
                    }

                    stream.init_done = true;
                    continue;
                }
            }

            let stream = &mut self.streams[0];

            if stream.header.block_samples == 0
                || !stream.header.flags.contains(BlockFlags::INITIAL_BLOCK)
                || stream.sample_index >= stream.block_end()
            {
                continue;
            }

            // Bridge a forward gap with silence.
            if stream.sample_index < stream.header.block_index {
                let gap = (stream.header.block_index - stream.sample_index) as usize;
                let fill = gap.min(remaining);

                for value in buffer[out_pos..out_pos + fill * num_channels].iter_mut() {
                    *value = 0;
                }

                stream.sample_index += fill as u64;
                out_pos += fill * num_channels;
                remaining -= fill;
                continue;
            }

            let chunk = ((stream.block_end() - stream.sample_index) as usize).min(remaining);

            if !stream.init_done && !stream.unpack_init(&mut self.ctx) {
                self.crc_errors += 1;
            }

            stream.init_done = true;

            let final_frame_block =
                self.streams[0].header.flags.contains(BlockFlags::FINAL_BLOCK);

            if self.reduced_channels.is_none() && !final_frame_block {
                if !self.unpack_frame_chunk(&mut buffer[out_pos..], chunk, num_channels) {
                    self.error_message = "can't read all of last block!".to_string();
                    break 'outer;
                }
            }
            else {
                let stream = &mut self.streams[0];
                stream.unpack_samples(&mut self.ctx, &mut buffer[out_pos..], chunk);
            }

            self.finish_chunk(&mut buffer[out_pos..out_pos + chunk * num_channels], num_channels);

            out_pos += chunk * num_channels;
            remaining -= chunk;

            // At the end of a frame, verify every stream's audio CRC, attempting a modest
            // realignment on seekable inputs so one bad block doesn't cascade.
            if self.streams[0].block_done() {
                let mut crc_error = false;

                for stream in self.streams.iter() {
                    if stream.wvc_skip {
                        debug!("block decoded without its correction data");
                    }

                    if stream.mute_error || !stream.check_crc() {
                        crc_error = true;
                    }
                }

                if crc_error {
                    if self.reader.is_seekable() {
                        let rseek = (self.streams[0].header.ck_size / 3).min(16384);
                        let _ = self.reader.seek_rel(-i64::from(rseek));
                    }

                    if let Some(wvc_reader) = self.wvc_reader.as_mut() {
                        if wvc_reader.is_seekable() && !self.streams[0].block2buff.is_empty() {
                            let _ = wvc_reader.seek_rel(-16384);
                        }
                    }

                    self.crc_errors += 1;
                }
            }

            if let Some(total) = self.total_samples {
                if self.streams[0].sample_index == total {
                    break;
                }
            }
        }

        (samples as usize - remaining) as u32
    }

    /// Decodes one chunk of a multichannel frame: every stream of the frame contributes its
    /// channels at the proper interleave offsets, with additional streams read from the file
    /// on first use. Returns false when the frame cannot be completed.
    fn unpack_frame_chunk(&mut self, out: &mut [i32], chunk: usize, num_channels: usize) -> bool {
        let mut temp = vec![0i32; chunk * 2];
        let mut offset = 0usize;
        let mut stream_index = 0usize;

        loop {
            if stream_index == self.streams.len() {
                // The frame needs another stream; its first block follows in the file. All
                // blocks of a frame must cover the same sample range.
                let resume = self.streams[0].header.block_index;
                let resume_samples = self.streams[0].header.block_samples;

                match self.read_stream_block(stream_index) {
                    Ok(true) => {}
                    _ => return false,
                }

                let stream = &mut self.streams[stream_index];

                if !self.open_flags.contains(OpenFlags::STREAMING)
                    && (stream.header.block_index != resume
                        || stream.header.block_samples != resume_samples)
                {
                    return false;
                }

                if !stream.init_done && !stream.unpack_init(&mut self.ctx) {
                    self.crc_errors += 1;
                }

                stream.init_done = true;
            }

            let stream = &mut self.streams[stream_index];
            let stream_channels = stream.header.num_channels() as usize;

            stream.unpack_samples(&mut self.ctx, &mut temp, chunk);

            if stream_channels == 1 {
                for i in 0..chunk {
                    out[i * num_channels + offset] = temp[i];
                }

                offset += 1;
            }
            else if offset == num_channels - 1 {
                // A stereo stream with only one output slot left; keep the first channel.
                for i in 0..chunk {
                    out[i * num_channels + offset] = temp[i * 2];
                }

                self.crc_errors += 1;
                offset += 1;
            }
            else {
                for i in 0..chunk {
                    out[i * num_channels + offset] = temp[i * 2];
                    out[i * num_channels + offset + 1] = temp[i * 2 + 1];
                }

                offset += 2;
            }

            let final_block = self.streams[stream_index].header.flags.contains(BlockFlags::FINAL_BLOCK);

            if final_block || offset >= num_channels || stream_index + 1 >= self.ctx.max_streams {
                return true;
            }

            stream_index += 1;
        }
    }

    /// Post-decode processing of an interleaved chunk: float normalization or DSD decimation.
    fn finish_chunk(&mut self, chunk: &mut [i32], num_channels: usize) {
        if self.open_flags.contains(OpenFlags::NORMALIZE) && self.float_norm_exp != 0 {
            let delta_exp = 127 - i32::from(self.float_norm_exp) + self.norm_offset;
            crate::floats::float_normalize(chunk, delta_exp);
        }

        if let Some(decimator) = self.decimator.as_mut() {
            decimator.run(chunk, num_channels);
        }
    }

    /// Seeks to the given composite sample index. After a successful return the next
    /// [`WavpackDecoder::unpack_samples`] call starts at exactly that sample.
    pub fn seek_sample(&mut self, target: u64) -> Result<()> {
        if self.open_flags.contains(OpenFlags::STREAMING) || !self.reader.is_seekable() {
            return seek_error(SeekErrorKind::Unseekable);
        }

        if let Some(total) = self.total_samples {
            if target >= total {
                return seek_error(SeekErrorKind::OutOfRange);
            }
        }

        // Fast path: the target lies in the frame already in memory, at or after its start.
        let in_current_frame = {
            let stream = &self.streams[0];
            stream.header.block_samples > 0
                && stream.header.flags.contains(BlockFlags::INITIAL_BLOCK)
                && target >= stream.header.block_index
                && target < stream.block_end()
        };

        let frame_start;

        if in_current_frame {
            frame_start = self.streams[0].header.block_index;

            for stream in self.streams.iter_mut() {
                if !stream.unpack_init(&mut self.ctx) {
                    self.crc_errors += 1;
                }

                stream.init_done = true;
            }
        }
        else {
            let (block_pos, block_index) = self.find_header_for_sample(target)?;

            self.free_streams();
            self.reader.seek_abs(block_pos)?;

            if let Some(wvc_reader) = self.wvc_reader.as_mut() {
                // Correction blocks parallel the main stream; rewinding to the start and
                // rescanning keeps the pairing logic simple and correct.
                wvc_reader.seek_abs(0)?;
            }

            let stream = &mut self.streams[0];
            stream.header.block_samples = 0;
            frame_start = block_index;
        }

        // Decode and discard up to the target.
        for stream in self.streams.iter_mut() {
            stream.sample_index = frame_start;
        }

        let mut discard = target - frame_start;
        let channels = self.reduced_channels.unwrap_or(self.ctx.num_channels) as usize;
        let mut scratch = vec![0i32; 4096 * channels];

        if let Some(decimator) = self.decimator.as_mut() {
            decimator.reset();
        }

        while discard > 0 {
            let step = discard.min(4096) as u32;
            let unpacked = self.unpack_samples(&mut scratch, step);

            if unpacked == 0 {
                return seek_error(SeekErrorKind::OutOfRange);
            }

            discard -= u64::from(unpacked);
        }

        Ok(())
    }

    /// Locates the header of the frame containing `target`, returning its file position and
    /// first sample index. The average block density aims the initial scan when the file
    /// length is known.
    fn find_header_for_sample(&mut self, target: u64) -> Result<(u64, u64)> {
        // Estimate a starting position from the file length and total samples, backing off
        // geometrically whenever the scan lands past the target.
        let mut backoff = 1 << 20;

        let mut start = match (self.file_len, self.total_samples) {
            (Some(len), Some(total)) if total > 0 => {
                (len.saturating_mul(target) / total).saturating_sub(1 << 20)
            }
            _ => 0,
        };

        loop {
            self.reader.seek_abs(start)?;

            let mut found = None;

            while let Some((mut header, _)) = read_next_header(&mut self.reader)? {
                header.block_index -= self.initial_index.min(header.block_index);

                let pos = self.reader.pos() - BlockHeader::SIZE as u64;

                if header.block_samples > 0
                    && header.flags.contains(BlockFlags::INITIAL_BLOCK)
                {
                    if header.block_index > target {
                        break;
                    }

                    if target < header.block_index + u64::from(header.block_samples) {
                        found = Some((pos, header.block_index));
                        break;
                    }
                }

                if self.reader.skip(u64::from(header.ck_size) - 24).is_err() {
                    break;
                }
            }

            if let Some(found) = found {
                return Ok(found);
            }

            if start == 0 {
                return seek_error(SeekErrorKind::OutOfRange);
            }

            start = start.saturating_sub(backoff);
            backoff <<= 1;
        }
    }

    /// The total number of composite samples, when known.
    pub fn num_samples(&self) -> Option<u64> {
        self.total_samples
    }

    /// The sampling rate of the decoded output. For DSD files this is the byte rate (the
    /// 8x-decimated PCM rate).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate * self.ctx.dsd_multiplier
    }

    /// The native sampling rate: the actual DSD bit rate for DSD files, otherwise the same as
    /// [`WavpackDecoder::sample_rate`].
    pub fn native_sample_rate(&self) -> u32 {
        if self.is_dsd() {
            self.sample_rate() * 8
        }
        else {
            self.sample_rate()
        }
    }

    fn is_dsd(&self) -> bool {
        self.ctx.dsd_multiplier > 1
            || self.streams[0].header.flags.contains(BlockFlags::DSD)
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    pub fn bytes_per_sample(&self) -> u32 {
        self.bytes_per_sample
    }

    pub fn num_channels(&self) -> u32 {
        self.ctx.num_channels
    }

    /// The Microsoft-style channel mask.
    pub fn channel_mask(&self) -> u32 {
        self.ctx.channel_mask
    }

    /// Channel identities beyond the Microsoft mask, when the file carries them.
    pub fn channel_identities(&self) -> Option<&[u8]> {
        self.ctx.channel_identities.as_deref()
    }

    /// The channel count actually decoded when the file was opened with
    /// [`OpenFlags::TWO_CH_MAX`].
    pub fn reduced_channels(&self) -> Option<u32> {
        self.reduced_channels
    }

    /// The float normalization exponent of the source data (127 for +/-1.0), zero for
    /// integer audio.
    pub fn float_norm_exp(&self) -> u8 {
        self.float_norm_exp
    }

    /// The stream format version of the open file.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The index of the next sample to be unpacked.
    pub fn sample_index(&self) -> u64 {
        self.streams.first().map_or(0, |stream| stream.sample_index)
    }

    /// Composite samples in the current frame.
    pub fn num_samples_in_frame(&self) -> u32 {
        self.streams.first().map_or(0, |stream| stream.header.block_samples)
    }

    /// CRC (and other per-block) errors encountered so far.
    pub fn num_errors(&self) -> u32 {
        self.crc_errors
    }

    /// True when any decoded block was lossy (hybrid without correction, or damaged side
    /// data).
    pub fn lossy_blocks(&self) -> bool {
        self.ctx.lossy_blocks
    }

    /// The last fatal error, for diagnostics.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// A summary of the qualities of the open file.
    pub fn mode(&self) -> Mode {
        let mut mode = Mode::empty();
        let config = self.ctx.config_flags;

        if config & 0x8 != 0 {
            mode |= Mode::HYBRID;
        }
        else {
            mode |= Mode::LOSSLESS;
        }

        if self.wvc_flag {
            mode |= Mode::LOSSLESS | Mode::WVC;
        }

        if self.ctx.lossy_blocks {
            mode &= !Mode::LOSSLESS;
        }

        if config & 0x80 != 0 {
            mode |= Mode::FLOAT;
        }

        if config & 0x800 != 0 {
            mode |= Mode::HIGH;
        }

        if config & 0x1000 != 0 {
            mode |= Mode::VERY_HIGH | Mode::HIGH;
        }

        if config & 0x200 != 0 {
            mode |= Mode::FAST;
        }

        if config & 0x2000000 != 0 {
            mode |= Mode::EXTRA;
        }

        if self.ctx.md5.is_some() || config & 0x8000000 != 0 {
            mode |= Mode::MD5;
        }

        if self.is_dsd() {
            mode |= Mode::DSD;
        }

        mode
    }

    /// The compression ratio so far (compressed bytes over raw PCM bytes), when computable.
    pub fn ratio(&self) -> Option<f64> {
        let total = self.total_samples?;
        let len = self.file_len? as f64 + self.file2_len.unwrap_or(0) as f64;
        let raw = total as f64
            * f64::from(self.ctx.num_channels)
            * f64::from(self.bytes_per_sample);

        if raw > 0.0 {
            Some(len / raw)
        }
        else {
            None
        }
    }

    /// The average bitrate in bits per second, optionally counting the correction stream.
    pub fn average_bitrate(&self, count_wvc: bool) -> Option<f64> {
        let total = self.total_samples?;

        if total == 0 {
            return None;
        }

        let mut bytes = self.file_len? as f64;

        if count_wvc {
            bytes += self.file2_len.unwrap_or(0) as f64;
        }

        let seconds = total as f64 / f64::from(self.sample_rate());
        Some(bytes * 8.0 / seconds)
    }

    /// Fraction of the file decoded so far, when the length is known.
    pub fn progress(&self) -> Option<f64> {
        let total = self.total_samples?;

        if total == 0 {
            return None;
        }

        Some(self.sample_index() as f64 / total as f64)
    }

    /// The length of the main file in bytes, when known.
    pub fn file_size(&self) -> Option<u64> {
        self.file_len
    }

    /// The stored MD5 digest of the source audio, seeking near the end of the file to find it
    /// when it has not been encountered yet.
    pub fn md5_sum(&mut self) -> Option<[u8; 16]> {
        if let Some(md5) = self.ctx.md5 {
            return Some(md5);
        }

        if !self.reader.is_seekable() {
            return None;
        }

        let pos_save = self.reader.pos();
        let found = self.scan_tail_metadata();
        let _ = self.reader.seek_abs(pos_save);

        found.unwrap_or(None)
    }

    fn scan_tail_metadata(&mut self) -> Result<Option<[u8; 16]>> {
        if let Some(len) = self.file_len {
            if len > 1_200_000 {
                self.reader.seek_from_end(-1_048_576)?;
            }
            else {
                self.reader.seek_abs(0)?;
            }
        }

        let collect = self.ctx.collect_wrapper;

        while let Some((header, _)) = read_next_header(&mut self.reader)? {
            let block = match self.read_block_body(&header, false) {
                Ok(block) => block,
                Err(_) => break,
            };

            let mut cursor = BlockHeader::SIZE;

            while let Ok(Some(item)) = crate::metadata::read_metadata(&block, &mut cursor) {
                if item.id == crate::metadata::ID_MD5_CHECKSUM && item.data.len() == 16 {
                    let mut md5 = [0u8; 16];
                    md5.copy_from_slice(item.data);
                    self.ctx.md5 = Some(md5);
                }
                else if item.id == crate::metadata::ID_RIFF_TRAILER
                    && collect
                    && self.ctx.wrapper.len() + item.data.len() < crate::MAX_WRAPPER_BYTES
                {
                    self.ctx.wrapper.extend_from_slice(item.data);
                }
            }
        }

        Ok(self.ctx.md5)
    }

    /// Forces a scan of the file tail so trailing wrapper bytes become available through
    /// [`WavpackDecoder::wrapper_data`]. Seekable files only.
    pub fn seek_trailing_wrapper(&mut self) {
        if !self.ctx.collect_wrapper || !self.reader.is_seekable() {
            return;
        }

        let pos_save = self.reader.pos();
        let _ = self.scan_tail_metadata();
        let _ = self.reader.seek_abs(pos_save);
    }

    /// Wrapper bytes (RIFF or other container headers/trailers) collected so far.
    pub fn wrapper_data(&self) -> &[u8] {
        &self.ctx.wrapper
    }

    /// Releases the collected wrapper bytes.
    pub fn free_wrapper(&mut self) {
        self.ctx.wrapper = Vec::new();
    }
}
