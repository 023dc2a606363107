// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `encoder` module provides the high-level API for creating WavPack files.
//!
//! The encoder deinterleaves the samples passed in by the application into one- or
//! two-channel streams (multichannel audio becomes several blocks per sample range),
//! accumulates a block's worth per stream, and hands every completed block to the
//! application through the [`BlockOutput`] trait. When a correction stream is requested,
//! each main block is paired with a correction block sent to the second output.

use bitflags::bitflags;

use log::debug;

use wavpack_core::errors::{config_error, encode_error, Error, Result};
use wavpack_core::io::packed::{ByteOrder, PackedWriter};

use crate::decorr::{DEFAULT_SPEC, FAST_SPEC, HIGH_SPEC, VERY_HIGH_SPEC};
use crate::header::{BlockFlags, BlockHeader, MAG_LSB, SAMPLE_RATES, SHIFT_LSB, SRATE_LSB};
use crate::metadata::{self, find_metadata};
use crate::pack::{PackExtras, PackState};
use crate::{CUR_STREAM_VERS, MAX_STREAMS, MAX_STREAM_VERS, MAX_WAVPACK_SAMPLES};

bitflags! {
    /// Encoder configuration options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConfigFlags: u32 {
        /// Hybrid mode; requires a target bitrate.
        const HYBRID_FLAG      = 0x8;
        /// Select joint stereo (with JOINT_OVERRIDE).
        const JOINT_STEREO     = 0x10;
        /// Allow no-delay cross-channel decorrelation.
        const CROSS_DECORR     = 0x20;
        /// Select hybrid noise shaping (with SHAPE_OVERRIDE).
        const HYBRID_SHAPE     = 0x40;
        /// Fast compression preset.
        const FAST_FLAG        = 0x200;
        /// High-quality compression preset.
        const HIGH_FLAG        = 0x800;
        /// Very-high-quality compression preset.
        const VERY_HIGH_FLAG   = 0x1000;
        /// The hybrid bitrate is in kilobits per second rather than bits per sample.
        const BITRATE_KBPS     = 0x2000;
        /// Derive the hybrid shaping weight automatically (set internally).
        const AUTO_SHAPING     = 0x4000;
        /// The shaping weight in the configuration overrides the default.
        const SHAPE_OVERRIDE   = 0x8000;
        /// The joint-stereo selection in the configuration overrides the default.
        const JOINT_OVERRIDE   = 0x10000;
        /// Produce a correction stream restoring losslessness (hybrid only).
        const CREATE_WVC       = 0x80000;
        /// Bias hybrid tuning toward correction-file compression.
        const OPTIMIZE_WVC     = 0x100000;
        /// Extra processing passes were used; recorded in the stream for mode reporting.
        const EXTRA_MODE       = 0x2000000;
        /// Suppress the wvx side stream for float and over-wide integer data (lossy).
        const SKIP_WVX         = 0x4000000;
        /// An MD5 checksum will be stored.
        const MD5_CHECKSUM     = 0x8000000;
        /// Encode channels not named by the channel mask as stereo pairs.
        const PAIR_UNDEF_CHANS = 0x20000000;
        /// Use the newer stream version that marks identical stereo channels as mono.
        const OPTIMIZE_MONO    = 0x80000000;
    }
}

/// Destination of a completed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTarget {
    /// The main (wv) file.
    Wv,
    /// The correction (wvc) file.
    Wvc,
}

/// Receiver for completed WavPack blocks. Returning false aborts the encode.
pub trait BlockOutput {
    fn write_block(&mut self, target: BlockTarget, block: &[u8]) -> bool;
}

impl<F> BlockOutput for F
where
    F: FnMut(BlockTarget, &[u8]) -> bool,
{
    fn write_block(&mut self, target: BlockTarget, block: &[u8]) -> bool {
        self(target, block)
    }
}

/// Encoding parameters, mirroring what a command-line front end would gather.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub flags: ConfigFlags,
    /// Hybrid bitrate, in bits per sample or kbps per BITRATE_KBPS.
    pub bitrate: f32,
    /// Hybrid noise-shaping weight override, -1.0 to 1.0.
    pub shaping_weight: f32,
    pub bits_per_sample: u32,
    pub bytes_per_sample: u32,
    pub num_channels: u32,
    /// Microsoft WAVEFORMATEX channel mask; zero derives the default for 1 or 2 channels.
    pub channel_mask: u32,
    pub sample_rate: u32,
    /// Forced samples per block; zero selects the default sizing.
    pub block_samples: u32,
    /// Nonzero marks the samples as 32-bit floats with the given normalization exponent
    /// (127 for the +/-1.0 convention).
    pub float_norm_exp: u8,
    /// Identities for channels outside the Microsoft mask, stored as CHANNEL_IDENTITIES.
    pub channel_identities: Option<Vec<u8>>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            flags: ConfigFlags::empty(),
            bitrate: 0.0,
            shaping_weight: 0.0,
            bits_per_sample: 16,
            bytes_per_sample: 2,
            num_channels: 2,
            channel_mask: 0,
            sample_rate: 44100,
            block_samples: 0,
            float_norm_exp: 0,
            channel_identities: None,
        }
    }
}

struct EncStream {
    state: PackState,
    buffer: Vec<i32>,
    channels: u32,
    channel_offset: usize,
}

/// The WavPack packer.
pub struct WavpackEncoder<O: BlockOutput> {
    out: O,
    config: EncoderConfig,
    streams: Vec<EncStream>,
    total_samples: Option<u64>,
    stream_version: u16,
    block_samples: u32,
    ave_block_samples: u32,
    max_samples: u32,
    acc_samples: u32,
    pending: Vec<(u8, Vec<u8>)>,
    pending_bytes: usize,
    riff_header_added: bool,
    riff_header_created: bool,
    riff_trailer_bytes: u64,
    wvc: bool,
    lossy_blocks: bool,
    file_len: u64,
    file2_len: u64,
    configured: bool,
    initialized: bool,
    error_message: String,
}

impl<O: BlockOutput> WavpackEncoder<O> {
    /// Opens a context for writing WavPack blocks through `out`.
    pub fn new(out: O) -> Self {
        WavpackEncoder {
            out,
            config: EncoderConfig::default(),
            streams: Vec::new(),
            total_samples: None,
            stream_version: CUR_STREAM_VERS,
            block_samples: 0,
            ave_block_samples: 0,
            max_samples: 0,
            acc_samples: 0,
            pending: Vec::new(),
            pending_bytes: 0,
            riff_header_added: false,
            riff_header_created: false,
            riff_trailer_bytes: 0,
            wvc: false,
            lossy_blocks: false,
            file_len: 0,
            file2_len: 0,
            configured: false,
            initialized: false,
            error_message: String::new(),
        }
    }

    /// The last fatal error, for diagnostics.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    fn fail(&mut self, message: &'static str) -> Error {
        self.error_message = message.to_string();
        Error::EncodeError(message)
    }

    /// Sets the encoding parameters. Must be called before any samples are sent; wrapper data
    /// may be queued beforehand. Pass the known total composite sample count, or `None` to
    /// patch the first block later via [`WavpackEncoder::update_num_samples`].
    pub fn set_configuration(
        &mut self,
        config: &EncoderConfig,
        total_samples: Option<u64>,
    ) -> Result<()> {
        if self.configured {
            return config_error("context is already configured");
        }

        if config.num_channels < 1 || config.num_channels as usize > MAX_STREAMS * 2 {
            return config_error("invalid channel count");
        }

        if config.bytes_per_sample < 1 || config.bytes_per_sample > 4 {
            return config_error("invalid bytes per sample");
        }

        if config.bits_per_sample < 1
            || config.bits_per_sample > 32
            || config.bits_per_sample > config.bytes_per_sample * 8
            || config.bits_per_sample + 8 <= config.bytes_per_sample * 8
        {
            return config_error("invalid bits per sample");
        }

        if config.sample_rate == 0 {
            return config_error("invalid sample rate");
        }

        if config.float_norm_exp != 0
            && (config.bytes_per_sample != 4 || config.bits_per_sample != 32)
        {
            return config_error("float data must be 32-bit");
        }

        if let Some(total) = total_samples {
            if total > MAX_WAVPACK_SAMPLES {
                return config_error("too many samples");
            }
        }

        if config.flags.contains(ConfigFlags::CREATE_WVC)
            && !config.flags.contains(ConfigFlags::HYBRID_FLAG)
        {
            return config_error("correction file requires hybrid mode");
        }

        if config.flags.contains(ConfigFlags::HYBRID_FLAG) && config.bitrate <= 0.0 {
            return config_error("hybrid mode requires a bitrate");
        }

        let mut config = config.clone();
        let mut flags = config.bytes_per_sample - 1;
        let mut shift = 0;
        let mut bps = 0u32;

        if config.float_norm_exp != 0 {
            flags |= BlockFlags::FLOAT_DATA.bits();
        }
        else {
            shift = config.bytes_per_sample * 8 - config.bits_per_sample;

            if config.bits_per_sample > 24 {
                flags |= BlockFlags::INT32_DATA.bits();
            }
        }

        let srate_index = SAMPLE_RATES
            .iter()
            .position(|&rate| rate == config.sample_rate)
            .unwrap_or(SAMPLE_RATES.len());

        flags |= (srate_index as u32) << SRATE_LSB;
        flags |= shift << SHIFT_LSB;

        if config.flags.contains(ConfigFlags::HYBRID_FLAG) {
            flags |= (BlockFlags::HYBRID
                | BlockFlags::HYBRID_BITRATE
                | BlockFlags::HYBRID_BALANCE)
                .bits();

            if !config.flags.contains(ConfigFlags::SHAPE_OVERRIDE) {
                config.flags |= ConfigFlags::HYBRID_SHAPE | ConfigFlags::AUTO_SHAPING;
                flags |= (BlockFlags::HYBRID_SHAPE | BlockFlags::NEW_SHAPING).bits();
            }
            else if config.flags.contains(ConfigFlags::HYBRID_SHAPE) {
                flags |= (BlockFlags::HYBRID_SHAPE | BlockFlags::NEW_SHAPING).bits();
            }

            if config.flags.contains(ConfigFlags::OPTIMIZE_WVC) {
                flags |= BlockFlags::CROSS_DECORR.bits();
            }

            bps = if config.flags.contains(ConfigFlags::BITRATE_KBPS) {
                let per_sample = f64::from(config.bitrate) * 256000.0
                    / f64::from(config.sample_rate)
                    / f64::from(config.num_channels);
                (per_sample + 0.5).floor() as u32
            }
            else {
                (f64::from(config.bitrate) * 256.0 + 0.5).floor() as u32
            };

            if bps > 64 << 8 {
                bps = 64 << 8;
            }
        }
        else {
            flags |= BlockFlags::CROSS_DECORR.bits();
        }

        let spec = if config.flags.contains(ConfigFlags::VERY_HIGH_FLAG) {
            &VERY_HIGH_SPEC
        }
        else if config.flags.contains(ConfigFlags::HIGH_FLAG) {
            &HIGH_SPEC
        }
        else if config.flags.contains(ConfigFlags::FAST_FLAG) {
            &FAST_SPEC
        }
        else {
            &DEFAULT_SPEC
        };

        let joint_stereo = if config.flags.contains(ConfigFlags::JOINT_OVERRIDE) {
            config.flags.contains(ConfigFlags::JOINT_STEREO)
        }
        else {
            spec.joint_stereo
        };

        if joint_stereo {
            flags |= BlockFlags::JOINT_STEREO.bits();
        }

        self.wvc = config.flags.contains(ConfigFlags::CREATE_WVC);

        self.stream_version = if config.flags.contains(ConfigFlags::OPTIMIZE_MONO) {
            MAX_STREAM_VERS
        }
        else {
            CUR_STREAM_VERS
        };

        if config.channel_mask == 0 && config.num_channels <= 2 {
            config.channel_mask = 0x5 - config.num_channels;
        }

                // Assign channels to streams: adjacent mask bits starting at a left-channel
        // position pair into stereo streams, everything else becomes a mono stream.
        let mut chan_mask = config.channel_mask;
        let mut num_chans = config.num_channels;
        let mut channel_offset = 0usize;

        while num_chans > 0 {
            let mut chans = 0u32;

            for pos in 1..=18u32 {
                let stereo_mask = 3u32 << (pos - 1);
                let mono_mask = 1u32 << (pos - 1);

                if chan_mask & stereo_mask == stereo_mask && mono_mask & 0x251 != 0 {
                    chan_mask &= !stereo_mask;
                    chans = 2;
                    break;
                }
                else if chan_mask & mono_mask != 0 {
                    chan_mask &= !mono_mask;
                    chans = 1;
                    break;
                }
            }

            if chans == 0 {
                chans = if config.flags.contains(ConfigFlags::PAIR_UNDEF_CHANS) && num_chans > 1 {
                    2
                }
                else {
                    1
                };
            }

            let chans = chans.min(num_chans);
            num_chans -= chans;

            if num_chans > 0 && self.streams.len() == MAX_STREAMS - 1 {
                return config_error("too many channels");
            }

            let mut state = PackState::new(spec);

            state.header.version = self.stream_version;
            state.header.total_samples = total_samples;
            state.header.flags = BlockFlags::from_bits_retain(flags);
            state.bits = bps;

            if self.streams.is_empty() {
                state.header.flags |= BlockFlags::INITIAL_BLOCK;
            }

            if num_chans == 0 {
                state.header.flags |= BlockFlags::FINAL_BLOCK;
            }

            if chans == 1 {
                let bits = state.header.flags.bits()
                    & !(BlockFlags::JOINT_STEREO | BlockFlags::CROSS_DECORR
                        | BlockFlags::HYBRID_BALANCE)
                        .bits();
                state.header.flags = BlockFlags::from_bits_retain(bits) | BlockFlags::MONO;
            }

            self.streams.push(EncStream {
                state,
                buffer: Vec::new(),
                channels: chans,
                channel_offset,
            });

            channel_offset += chans as usize;
        }

        self.total_samples = total_samples;
        self.config = config;
        self.configured = true;

        Ok(())
    }

    /// Queues opaque wrapper bytes (e.g. a RIFF header before the first samples, or a trailer
    /// after the last) for storage in the next block.
    pub fn add_wrapper(&mut self, data: &[u8]) -> Result<()> {
        let id = if self.sample_index() == 0 {
            self.riff_header_added = true;
            metadata::ID_RIFF_HEADER
        }
        else {
            self.riff_trailer_bytes += data.len() as u64;
            metadata::ID_RIFF_TRAILER
        };

        self.add_to_pending(id, data);
        Ok(())
    }

    /// Queues a caller-computed 16-byte MD5 digest of the source audio.
    pub fn store_md5_sum(&mut self, digest: [u8; 16]) -> Result<()> {
        self.add_to_pending(metadata::ID_MD5_CHECKSUM, &digest);
        Ok(())
    }

    fn add_to_pending(&mut self, id: u8, data: &[u8]) {
        self.pending_bytes += data.len();

        if let Some((last_id, payload)) = self.pending.last_mut() {
            if *last_id == id {
                payload.extend_from_slice(data);
                return;
            }
        }

        self.pending.push((id, data.to_vec()));
    }

    /// Prepares for packing: sizes the blocks, allocates the stream sample buffers, and
    /// initializes per-stream state. Call after [`WavpackEncoder::set_configuration`].
    pub fn pack_init(&mut self) -> Result<()> {
        if !self.configured {
            return config_error("context is not configured");
        }

        // An oversized metadata backlog goes out in its own block so it cannot crowd out the
        // audio in the first real one.
        if self.pending_bytes > 16384 {
            self.write_metadata_block()?;
        }

        self.block_samples = if self.config.flags.contains(ConfigFlags::HIGH_FLAG) {
            self.config.sample_rate
        }
        else if self.config.sample_rate % 2 == 0 {
            self.config.sample_rate / 2
        }
        else {
            self.config.sample_rate
        };

        while u64::from(self.block_samples) * u64::from(self.config.num_channels) > 150_000 {
            self.block_samples /= 2;
        }

        while u64::from(self.block_samples) * u64::from(self.config.num_channels) < 40_000 {
            self.block_samples *= 2;
        }

        if self.config.block_samples != 0 {
            self.block_samples = self.config.block_samples;
        }

        self.ave_block_samples = self.block_samples;
        self.max_samples = self.block_samples + (self.block_samples >> 1);

        let auto_shaping = self.config.flags.contains(ConfigFlags::AUTO_SHAPING);
        let sample_rate = self.config.sample_rate;
        let shaping_weight = self.config.shaping_weight;

        for stream in self.streams.iter_mut() {
            stream.buffer = vec![0i32; self.max_samples as usize * stream.channels as usize];

            let state = &mut stream.state;
            state.sample_index = 0;
            state.decorr.num_terms = 0;
            state.words.init();
            state.shaping = Default::default();

            if state.header.flags.contains(BlockFlags::HYBRID_SHAPE) {
                let weight = if auto_shaping {
                    if sample_rate < 64000 || state.header.flags.contains(BlockFlags::CROSS_DECORR)
                    {
                        -512
                    }
                    else {
                        1024
                    }
                }
                else {
                    let weight = (f64::from(shaping_weight) * 1024.0 + 0.5).floor() as i32;
                    weight.max(-1000)
                };

                state.shaping.shaping_acc = [weight << 16, weight << 16];
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// Accumulates interleaved composite samples, emitting completed blocks as enough
    /// accumulate. Sample values are right-justified 32-bit integers (or float bit patterns
    /// when configured for floats).
    pub fn pack_samples(&mut self, buffer: &[i32], sample_count: u32) -> Result<()> {
        if !self.initialized {
            return config_error("pack_init has not been called");
        }

        let nch = self.config.num_channels as usize;

        debug_assert!(buffer.len() >= sample_count as usize * nch);

        let mut consumed = 0usize;
        let mut remaining = sample_count;

        while remaining > 0 {
            if !self.riff_header_added && !self.riff_header_created {
                self.create_riff_header()?;
            }

            let samples_to_copy = remaining.min(self.max_samples - self.acc_samples);

            for stream in self.streams.iter_mut() {
                let dst_base = self.acc_samples as usize * stream.channels as usize;

                for i in 0..samples_to_copy as usize {
                    let src = consumed + i * nch + stream.channel_offset;

                    for ch in 0..stream.channels as usize {
                        stream.buffer[dst_base + i * stream.channels as usize + ch] =
                            buffer[src + ch];
                    }
                }
            }

            consumed += samples_to_copy as usize * nch;
            remaining -= samples_to_copy;
            self.acc_samples += samples_to_copy;

            if self.acc_samples == self.max_samples {
                self.pack_streams(self.block_samples)?;
            }
        }

        Ok(())
    }

    /// Flushes all accumulated samples into blocks (possibly short ones), then any queued
    /// metadata. Encoding may continue afterwards; this simply forces a block boundary.
    pub fn flush_samples(&mut self) -> Result<()> {
        while self.acc_samples > 0 {
            let block_samples = if self.acc_samples > self.block_samples {
                self.acc_samples / 2
            }
            else {
                self.acc_samples
            };

            self.pack_streams(block_samples)?;
        }

        if !self.pending.is_empty() {
            self.write_metadata_block()?;
        }

        Ok(())
    }

    /// Composite samples sent to the output so far.
    pub fn sample_index(&self) -> u64 {
        self.streams.first().map_or(0, |stream| stream.state.sample_index)
    }

    /// True when any block required lossy coding (hybrid without correction, or suppressed
    /// side data).
    pub fn lossy_blocks(&self) -> bool {
        self.lossy_blocks
    }

    /// Bytes written to the main output so far.
    pub fn file_size(&self) -> u64 {
        self.file_len
    }

    /// Bytes written to the correction output so far.
    pub fn correction_file_size(&self) -> u64 {
        self.file2_len
    }

    /// Patches an already-written first block with the final sample count, updating the
    /// fabricated RIFF header sizes when one was generated, and recomputing the block
    /// checksum. The application is responsible for re-writing the block to the file.
    pub fn update_num_samples(&self, first_block: &mut [u8]) -> Result<()> {
        if first_block.len() < BlockHeader::SIZE {
            return encode_error("block too small");
        }

        let image: &mut [u8; BlockHeader::SIZE] =
            (&mut first_block[..BlockHeader::SIZE]).try_into().unwrap();
        let mut header = BlockHeader::read(image)?;

        header.total_samples = Some(self.sample_index());
        header.write(image);

        if self.riff_header_created {
            if let Some((offset, size)) = find_metadata(first_block, metadata::ID_RIFF_HEADER) {
                let data_size = self.sample_index()
                    * u64::from(self.config.num_channels)
                    * u64::from(self.config.bytes_per_sample);

                patch_riff_sizes(
                    &mut first_block[offset..offset + size],
                    data_size,
                    self.riff_trailer_bytes,
                );
            }
        }

        // The trailing block checksum covers the header, so it must be refreshed last.
        refresh_block_checksum(first_block);

        Ok(())
    }

    fn pack_streams(&mut self, block_samples: u32) -> Result<()> {
        let num_streams = self.streams.len();
        let mut block_leading: Vec<(u8, Vec<u8>)> = self.pending.drain(..).collect();
        self.pending_bytes = 0;

        for index in 0..num_streams {
            let config_info = {
                let stream = &self.streams[index];
                let initial = stream.state.header.flags.contains(BlockFlags::INITIAL_BLOCK);

                if initial && stream.state.sample_index == 0 {
                    let flags = self.config.flags.bits();
                    Some(vec![(flags >> 8) as u8, (flags >> 16) as u8, (flags >> 24) as u8])
                }
                else {
                    None
                }
            };

            let channel_info = {
                let stream = &self.streams[index];
                let initial = stream.state.header.flags.contains(BlockFlags::INITIAL_BLOCK);

                if initial
                    && (self.config.num_channels > 2
                        || self.config.channel_mask != 0x5 - self.config.num_channels)
                {
                    let mut payload = vec![self.config.num_channels as u8];
                    let mut mask = self.config.channel_mask;

                    while mask != 0 {
                        payload.push(mask as u8);
                        mask >>= 8;
                    }

                    Some(payload)
                }
                else {
                    None
                }
            };

            if let (Some(identities), Some(_)) = (&self.config.channel_identities, &channel_info) {
                if self.streams[index].state.sample_index == 0 {
                    block_leading.push((metadata::ID_CHANNEL_IDENTITIES, identities.clone()));
                }
            }

            let sample_rate = {
                let stream = &self.streams[index];

                if stream.state.header.srate_index() == 15 && self.config.sample_rate != 44100 {
                    let rate = self.config.sample_rate;
                    Some(vec![rate as u8, (rate >> 8) as u8, (rate >> 16) as u8])
                }
                else {
                    None
                }
            };

            let mut extras = PackExtras {
                leading: std::mem::take(&mut block_leading),
                channel_info,
                config_info,
                sample_rate,
                wvc: self.wvc,
                skip_wvx: self.config.flags.contains(ConfigFlags::SKIP_WVX),
                float_norm_exp: self.config.float_norm_exp,
            };

            let stream = &mut self.streams[index];
            let channels = stream.channels as usize;

            // Reset the per-block header fields; the magnitude starts at the full width of
            // the stored samples and is refined during packing.
            let flags_bits = stream.state.header.flags.bits() & !BlockFlags::MAG_MASK.bits();
            let mag = ((flags_bits & BlockFlags::BYTES_STORED.bits()) * 8 + 7) << MAG_LSB;
            stream.state.header.flags = BlockFlags::from_bits_retain(flags_bits | mag);
            stream.state.header.block_index = stream.state.sample_index;
            stream.state.header.block_samples = block_samples;

            let data_len = block_samples as usize * channels;

            let packed = match stream.state.pack_block(&mut extras, &mut stream.buffer[..data_len])
            {
                Ok(packed) => packed,
                Err(err) => {
                    self.error_message = "output buffer overflowed".to_string();
                    return Err(err);
                }
            };

            if packed.lossy {
                self.lossy_blocks = true;
            }

            if !self.out.write_block(BlockTarget::Wv, &packed.wv) {
                return Err(self.fail("block output rejected wv block"));
            }

            self.file_len += packed.wv.len() as u64;

            if let Some(wvc) = packed.wvc {
                if !self.out.write_block(BlockTarget::Wvc, &wvc) {
                    return Err(self.fail("block output rejected wvc block"));
                }

                self.file2_len += wvc.len() as u64;
            }

            // Shift any accumulated overage down for the next block.
            let stream = &mut self.streams[index];
            let channels = stream.channels as usize;

            if self.acc_samples != block_samples {
                stream.buffer.copy_within(
                    block_samples as usize * channels..self.acc_samples as usize * channels,
                    0,
                );
            }
        }

        self.ave_block_samples = (self.ave_block_samples * 7 + block_samples + 4) >> 3;
        self.acc_samples -= block_samples;

        Ok(())
    }

    /// Fabricates a canonical RIFF/WAVE header for the configured format and queues it as
    /// wrapper metadata, for applications that did not supply their own.
    fn create_riff_header(&mut self) -> Result<()> {
        self.riff_header_created = true;

        let config = &self.config;
        let format: u16 = if config.float_norm_exp != 0 { 3 } else { 1 };

        if format == 3 && config.float_norm_exp != 127 {
            debug!("can't create valid RIFF wav header for non-normalized floating data");
            return Ok(());
        }

        let total_samples = self.total_samples.unwrap_or(
            0x7fff_f000 / (u64::from(config.bytes_per_sample) * u64::from(config.num_channels)),
        );

        let total_data_bytes = total_samples
            * u64::from(config.bytes_per_sample)
            * u64::from(config.num_channels);

        let extensible = config.num_channels > 2
            || config.channel_mask != 0x5_u32.wrapping_sub(config.num_channels);

        let wavhdr_size: usize = if extensible { 40 } else { 16 };

        // WaveHeader, serialized with its "SSLLSSSSLS" descriptor plus the subformat GUID.
        let mut wavhdr = [0u8; 40];
        {
            let mut writer = PackedWriter::new(&mut wavhdr, ByteOrder::LittleEndian);
            let bytes_per_second =
                config.sample_rate * config.num_channels * config.bytes_per_sample;
            let block_align = (config.bytes_per_sample * config.num_channels) as u16;

            let _ = writer.u16(if extensible { 0xfffe } else { format });
            let _ = writer.u16(config.num_channels as u16);
            let _ = writer.u32(config.sample_rate);
            let _ = writer.u32(bytes_per_second);
            let _ = writer.u16(block_align);
            let _ = writer.u16(if extensible {
                (config.bytes_per_sample * 8) as u16
            }
            else {
                config.bits_per_sample as u16
            });

            if extensible {
                let _ = writer.u16(22);
                let _ = writer.u16(config.bits_per_sample as u16);
                let _ = writer.u32(config.channel_mask);
                let _ = writer.u16(format);
            }
        }

        if extensible {
            // The fixed tail of the extensible subformat GUID.
            wavhdr[30] = 0x10;
            wavhdr[32] = 0x80;
            wavhdr[35] = 0xaa;
            wavhdr[36] = 0x00;
            wavhdr[37] = 0x38;
            wavhdr[38] = 0x9b;
            wavhdr[39] = 0x71;
        }

        let mut riffhdr = [0u8; 12];
        {
            let mut writer = PackedWriter::new(&mut riffhdr, ByteOrder::LittleEndian);
            let _ = writer.quad(*b"RIFF");
            let _ = writer
                .u32((4 + 8 + wavhdr_size as u64 + 8 + total_data_bytes).min(u32::MAX as u64) as u32);
            let _ = writer.quad(*b"WAVE");
        }

        let mut fmthdr = [0u8; 8];
        {
            let mut writer = PackedWriter::new(&mut fmthdr, ByteOrder::LittleEndian);
            let _ = writer.quad(*b"fmt ");
            let _ = writer.u32(wavhdr_size as u32);
        }

        let mut datahdr = [0u8; 8];
        {
            let mut writer = PackedWriter::new(&mut datahdr, ByteOrder::LittleEndian);
            let _ = writer.quad(*b"data");
            let _ = writer.u32(total_data_bytes.min(u32::MAX as u64) as u32);
        }

        self.add_to_pending(metadata::ID_RIFF_HEADER, &riffhdr);
        self.add_to_pending(metadata::ID_RIFF_HEADER, &fmthdr);
        self.add_to_pending(metadata::ID_RIFF_HEADER, &wavhdr[..wavhdr_size]);
        self.add_to_pending(metadata::ID_RIFF_HEADER, &datahdr);

        Ok(())
    }

    /// Writes queued metadata out as a sample-less block.
    fn write_metadata_block(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let header = BlockHeader {
            version: self.stream_version,
            ck_size: BlockHeader::SIZE as u32 - 8,
            total_samples: self.total_samples,
            ..Default::default()
        };

        let mut image = [0u8; BlockHeader::SIZE];
        header.write(&mut image);
        let mut block = image.to_vec();

        let limit = BlockHeader::SIZE
            + self
                .pending
                .iter()
                .map(|(_, payload)| metadata::metadata_size(payload.len()))
                .sum::<usize>();

        for (id, payload) in self.pending.drain(..) {
            metadata::append_metadata(&mut block, limit, id, &payload)?;
        }

        self.pending_bytes = 0;

        if !self.out.write_block(BlockTarget::Wv, &block) {
            return Err(self.fail("block output rejected metadata block"));
        }

        self.file_len += block.len() as u64;
        Ok(())
    }
}

/// Rewrites the RIFF and data chunk sizes inside a fabricated wrapper payload.
fn patch_riff_sizes(wrapper: &mut [u8], data_size: u64, trailer_bytes: u64) {
    if wrapper.len() < 12 || &wrapper[0..4] != b"RIFF" {
        return;
    }

    let riff_size = wrapper.len() as u64 - 8 + data_size + trailer_bytes;
    wrapper[4..8].copy_from_slice(&(riff_size.min(u32::MAX as u64) as u32).to_le_bytes());

    // The data chunk header is the last eight bytes of the fabricated wrapper.
    let tail = wrapper.len() - 8;

    if &wrapper[tail..tail + 4] == b"data" {
        wrapper[tail + 4..]
            .copy_from_slice(&(data_size.min(u32::MAX as u64) as u32).to_le_bytes());
    }
}

/// Recomputes a trailing 4-byte BLOCK_CHECKSUM sub-block after the header was patched.
fn refresh_block_checksum(block: &mut [u8]) {
    if block.len() < BlockHeader::SIZE + 6 {
        return;
    }

    let csum_header = block.len() - 6;

    if block[csum_header] & metadata::ID_UNIQUE == metadata::ID_BLOCK_CHECKSUM
        && block[csum_header + 1] == 2
    {
        let mut csum = u32::MAX;

        for pair in block[..csum_header].chunks_exact(2) {
            csum = csum
                .wrapping_mul(3)
                .wrapping_add(u32::from(pair[0]))
                .wrapping_add(u32::from(pair[1]) << 8);
        }

        block[csum_header + 2..].copy_from_slice(&csum.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_config_validation() {
        let mut encoder = WavpackEncoder::new(|_target: BlockTarget, _block: &[u8]| true);

        let bad = EncoderConfig { bytes_per_sample: 5, ..Default::default() };
        assert!(encoder.set_configuration(&bad, None).is_err());

        // Seven bits in two bytes leaves a whole unused byte, which the format cannot express.
        let bad = EncoderConfig { bits_per_sample: 7, bytes_per_sample: 2, ..Default::default() };
        assert!(encoder.set_configuration(&bad, None).is_err());

        let bad = EncoderConfig {
            flags: ConfigFlags::CREATE_WVC,
            ..Default::default()
        };
        assert!(encoder.set_configuration(&bad, None).is_err());

        let good = EncoderConfig::default();
        assert!(encoder.set_configuration(&good, Some(1000)).is_ok());
        assert!(encoder.set_configuration(&good, Some(1000)).is_err());
    }

    #[test]
    fn verify_stream_layout_5_1() {
        let mut encoder = WavpackEncoder::new(|_target: BlockTarget, _block: &[u8]| true);

        // A standard 5.1 mask: FL FR FC LFE BL BR.
        let config = EncoderConfig {
            num_channels: 6,
            channel_mask: 0x3f,
            ..Default::default()
        };

        encoder.set_configuration(&config, None).unwrap();

        let layout: Vec<u32> = encoder.streams.iter().map(|s| s.channels).collect();
        assert_eq!(layout, [2, 1, 1, 2]);

        assert!(encoder.streams[0]
            .state
            .header
            .flags
            .contains(BlockFlags::INITIAL_BLOCK));
        assert!(encoder.streams[3].state.header.flags.contains(BlockFlags::FINAL_BLOCK));

        for stream in &encoder.streams[1..3] {
            assert!(stream.state.header.flags.contains(BlockFlags::MONO));
            assert!(!stream.state.header.flags.contains(BlockFlags::INITIAL_BLOCK));
            assert!(!stream.state.header.flags.contains(BlockFlags::FINAL_BLOCK));
        }
    }

    #[test]
    fn verify_block_sizing() {
        let mut encoder = WavpackEncoder::new(|_target: BlockTarget, _block: &[u8]| true);
        encoder.set_configuration(&EncoderConfig::default(), None).unwrap();
        encoder.pack_init().unwrap();

        // 44100/2 stereo keeps the total per block inside the 40k..150k window.
        assert_eq!(encoder.block_samples, 22050);

        let mut encoder = WavpackEncoder::new(|_target: BlockTarget, _block: &[u8]| true);
        let config =
            EncoderConfig { sample_rate: 192000, num_channels: 6, channel_mask: 0x3f, ..Default::default() };
        encoder.set_configuration(&config, None).unwrap();
        encoder.pack_init().unwrap();

        assert!(encoder.block_samples as u64 * 6 <= 150_000);
        assert!(encoder.block_samples as u64 * 6 >= 40_000);
    }
}
