// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `pack` module compresses one block of samples (mono or stereo) into a completed
//! WavPack block, and the matching correction block when one is requested.
//!
//! The layering mirrors the decode side: optional format reductions first (sample shift,
//! float alignment, wide-integer splitting), then the joint-stereo transform, the configured
//! decorrelation passes, and finally entropy coding. Lossless blocks run the decorrelator a
//! pass at a time over the whole buffer; hybrid blocks interleave prediction, quantization,
//! and reconstruction per sample so the adaptive state tracks what the decoder will see.

use wavpack_core::errors::Result;
use wavpack_core::io::bit::BitWriter;

use crate::decorr::{
    apply_weight, normalize_history, update_weight, update_weight_clip, DecorrPass, DecorrSpec,
    DecorrState, ShapingState, MAX_TERM,
};
use crate::floats::{scan_float_data, send_float_data, FloatState};
use crate::header::{BlockFlags, BlockHeader, MAG_LSB, SHIFT_LSB};
use crate::metadata::{self, append_block_checksum, append_metadata};
use crate::words::{count_bits, WordsState};

/// Reconstruction parameters for integer data wider than 24 bits, carried in the INT32_INFO
/// sub-block.
#[derive(Clone, Copy, Debug, Default)]
pub struct Int32State {
    /// Bits per sample diverted to the wvx stream.
    pub sent_bits: u8,
    /// Trailing zero bits removed from every sample.
    pub zeros: u8,
    /// Trailing one bits removed from every sample.
    pub ones: u8,
    /// Trailing duplicated bits removed from every sample.
    pub dups: u8,
    /// Checksum of the original samples, leading the wvx payload.
    pub crc: u32,
}

impl Int32State {
    pub fn write_int32_info(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.sent_bits, self.zeros, self.ones, self.dups]);
    }

    pub fn read_int32_info(&mut self, data: &[u8]) -> bool {
        if data.len() != 4 {
            return false;
        }

        self.sent_bits = data[0];
        self.zeros = data[1];
        self.ones = data[2];
        self.dups = data[3];
        true
    }

    pub fn total_shift(&self) -> u32 {
        u32::from(self.sent_bits)
            + u32::from(self.zeros)
            + u32::from(self.ones)
            + u32::from(self.dups)
    }
}

/// Everything the packer carries for one stream from block to block.
pub struct PackState {
    pub header: BlockHeader,
    pub decorr: DecorrState,
    pub words: WordsState,
    pub shaping: ShapingState,
    pub float_state: FloatState,
    pub int32_state: Int32State,
    pub spec: &'static DecorrSpec,
    pub sample_index: u64,
    /// Hybrid bitrate in 1/256 bits-per-sample units.
    pub bits: u32,
}

/// Extra per-block content supplied by the high-level packer.
#[derive(Default)]
pub struct PackExtras {
    /// Queued context metadata (wrappers, MD5) emitted right after the header.
    pub leading: Vec<(u8, Vec<u8>)>,
    pub channel_info: Option<Vec<u8>>,
    pub config_info: Option<Vec<u8>>,
    pub sample_rate: Option<Vec<u8>>,
    pub wvc: bool,
    pub skip_wvx: bool,
    pub float_norm_exp: u8,
}

/// A completed block pair.
pub struct PackedBlock {
    pub wv: Vec<u8>,
    pub wvc: Option<Vec<u8>>,
    pub lossy: bool,
}

fn start_block(header: &BlockHeader) -> Vec<u8> {
    let mut image = [0u8; BlockHeader::SIZE];
    let mut header = *header;
    header.ck_size = BlockHeader::SIZE as u32 - 8;
    header.write(&mut image);
    image.to_vec()
}

/// Appends a bitstream sub-block, prefixing `lead` (used for the wvx checksum) ahead of the
/// raw bitstream bytes.
fn append_bitstream(
    block: &mut Vec<u8>,
    limit: usize,
    id: u8,
    lead: &[u8],
    data: &[u8],
) -> Result<()> {
    if lead.is_empty() {
        append_metadata(block, limit, id, data)
    }
    else {
        let mut payload = Vec::with_capacity(lead.len() + data.len());
        payload.extend_from_slice(lead);
        payload.extend_from_slice(data);
        append_metadata(block, limit, id, &payload)
    }
}

impl PackState {
    pub fn new(spec: &'static DecorrSpec) -> Self {
        PackState {
            header: BlockHeader::default(),
            decorr: DecorrState::default(),
            words: WordsState::new(),
            shaping: ShapingState::default(),
            float_state: FloatState::default(),
            int32_state: Int32State::default(),
            spec,
            sample_index: 0,
            bits: 0,
        }
    }

    /// Instantiates the configured filter the first time a block is packed, substituting the
    /// cross-channel terms when the stream is mono or cross decorrelation is disabled.
    fn init_terms(&mut self) {
        let flags = self.header.flags;

        self.decorr = DecorrState::default();
        self.decorr.num_terms = self.spec.terms.len();

        for (pass, &term) in self.decorr.passes.iter_mut().zip(self.spec.terms) {
            pass.delta = self.spec.delta;

            pass.term = if term < 0 {
                if flags.is_mono_data() {
                    1
                }
                else if !flags.contains(BlockFlags::CROSS_DECORR) {
                    -3
                }
                else {
                    term
                }
            }
            else {
                term
            };
        }
    }

    /// Packs one block of samples. The buffer holds `block_samples` composite samples,
    /// interleaved for stereo, and is consumed as scratch.
    pub fn pack_block(&mut self, extras: &mut PackExtras, buffer: &mut [i32]) -> Result<PackedBlock> {
        let sample_count = self.header.block_samples as usize;
        let mut flags = self.header.flags;
        let mono = flags.is_mono_data();
        let channels = if mono { 1 } else { 2 };
        let data_count = sample_count * channels;

        debug_assert!(buffer.len() == data_count);

        let max_block_size = if flags.contains(BlockFlags::FLOAT_DATA) {
            sample_count * 16 + 4096
        }
        else {
            sample_count * 10 + 4096
        };

        // Remove the declared shift before anything else looks at the data.
        let shift = (flags.bits() & BlockFlags::SHIFT_MASK.bits()) >> SHIFT_LSB;

        if shift != 0 {
            for value in buffer.iter_mut() {
                *value >>= shift;
            }

            let mag = (flags.bits() & BlockFlags::MAG_MASK.bits()) >> MAG_LSB;
            let mut bits = flags.bits() & !BlockFlags::MAG_MASK.bits();

            if mag > shift {
                bits |= (mag - shift) << MAG_LSB;
            }

            flags = BlockFlags::from_bits_retain(bits);
        }

        // Side-stream preparation. Floats are aligned to integers (keeping the original bit
        // patterns for the wvx pass), and over-wide integers have their redundant and excess
        // low bits stripped. The side stream exists only for lossless destinations: the main
        // block when not hybrid, the correction block when it is.
        let wvx_allowed =
            !extras.skip_wvx && (!flags.contains(BlockFlags::HYBRID) || extras.wvc);

        let mut wvx_buf = Vec::new();
        let mut wvx_used = false;

        if flags.contains(BlockFlags::FLOAT_DATA) && sample_count > 0 {
            let originals = buffer.to_vec();
            let mag_bits =
                scan_float_data(&mut self.float_state, extras.float_norm_exp, buffer);

            flags = BlockFlags::from_bits_retain(
                (flags.bits() & !BlockFlags::MAG_MASK.bits()) | (mag_bits << MAG_LSB),
            );

            if self.float_state.needs_wvx() && wvx_allowed {
                wvx_buf = vec![0u8; max_block_size];
                let mut wvx = BitWriter::new(&mut wvx_buf);
                send_float_data(&self.float_state, &originals, &mut wvx);
                let used = wvx.close()?;
                wvx_buf.truncate(used);
                wvx_used = true;
            }
        }
        else if flags.contains(BlockFlags::INT32_DATA) && sample_count > 0 {
            let mag_bits = self.scan_int32_data(buffer, !wvx_allowed, &mut wvx_buf)?;

            flags = BlockFlags::from_bits_retain(
                (flags.bits() & !BlockFlags::MAG_MASK.bits()) | (mag_bits << MAG_LSB),
            );

            wvx_used = !wvx_buf.is_empty();
        }

        self.header.flags = flags;

        if self.decorr.num_terms == 0 {
            self.init_terms();
        }

        // Lossy results when wvx data was needed but suppressed.
        let mut lossy = wvx_needed_but_absent(self, flags, wvx_allowed);

        // Assemble the block prefixes before any audio is coded: the decorrelator, entropy,
        // and shaping metadata must describe the state the block *starts* from, and writing
        // them requantizes that state to exactly what the decoder will restore.
        self.header.crc = 0;
        let mut wv = start_block(&self.header);

        for (id, payload) in extras.leading.drain(..) {
            append_metadata(&mut wv, max_block_size, id, &payload)?;
        }

        if sample_count > 0 {
            let mut scratch = Vec::new();

            self.decorr.write_terms(&mut scratch);
            append_metadata(&mut wv, max_block_size, metadata::ID_DECORR_TERMS, &scratch)?;

            scratch.clear();
            self.decorr.write_weights(flags, &mut scratch);
            append_metadata(&mut wv, max_block_size, metadata::ID_DECORR_WEIGHTS, &scratch)?;

            scratch.clear();
            self.decorr.write_samples(flags, &mut scratch);
            append_metadata(&mut wv, max_block_size, metadata::ID_DECORR_SAMPLES, &scratch)?;

            scratch.clear();
            self.words.write_entropy_vars(flags, &mut scratch);
            append_metadata(&mut wv, max_block_size, metadata::ID_ENTROPY_VARS, &scratch)?;

            if let Some(payload) = extras.sample_rate.take() {
                append_metadata(&mut wv, max_block_size, metadata::ID_SAMPLE_RATE, &payload)?;
            }

            if flags.contains(BlockFlags::HYBRID) {
                scratch.clear();
                self.words.write_hybrid_profile(flags, self.bits, &mut scratch);
                append_metadata(&mut wv, max_block_size, metadata::ID_HYBRID_PROFILE, &scratch)?;
            }

            if flags.contains(BlockFlags::FLOAT_DATA) {
                scratch.clear();
                self.float_state.write_float_info(&mut scratch);
                append_metadata(&mut wv, max_block_size, metadata::ID_FLOAT_INFO, &scratch)?;
            }

            if flags.contains(BlockFlags::INT32_DATA) {
                scratch.clear();
                self.int32_state.write_int32_info(&mut scratch);
                append_metadata(&mut wv, max_block_size, metadata::ID_INT32_INFO, &scratch)?;
            }
        }

        if let Some(payload) = extras.channel_info.take() {
            append_metadata(&mut wv, max_block_size, metadata::ID_CHANNEL_INFO, &payload)?;
        }

        if let Some(payload) = extras.config_info.take() {
            append_metadata(&mut wv, max_block_size, metadata::ID_CONFIG_BLOCK, &payload)?;
        }

        let mut wvc_block = if extras.wvc {
            let mut block = start_block(&self.header);

            if sample_count > 0 && flags.contains(BlockFlags::HYBRID_SHAPE) {
                let mut scratch = Vec::new();
                self.shaping.write_shaping_info(flags, &mut scratch);
                append_metadata(&mut block, max_block_size, metadata::ID_SHAPING_WEIGHTS, &scratch)?;
            }

            Some(block)
        }
        else {
            None
        };

        // Code the audio through the decorrelator and entropy coder.
        let mut bs_buf = vec![0u8; max_block_size];
        let mut bs = BitWriter::new(&mut bs_buf);

        let mut wvc_bs_buf = if extras.wvc { vec![0u8; max_block_size] } else { Vec::new() };

        let crc;
        let crc2;

        if !flags.contains(BlockFlags::HYBRID) {
            crc = self.pack_lossless(flags, &mut bs, buffer, sample_count);
            crc2 = crc;
        }
        else {
            let mut wvc_bs = if extras.wvc { Some(BitWriter::new(&mut wvc_bs_buf)) } else { None };

            let (c, c2, was_lossy) =
                self.pack_hybrid(flags, &mut bs, wvc_bs.as_mut(), buffer, sample_count);

            crc = c;
            crc2 = c2;
            lossy |= was_lossy;

            if let Some(wvc_bs) = wvc_bs {
                let used = wvc_bs.close()?;
                wvc_bs_buf.truncate(used);
            }
        }

        self.words.flush_word(&mut bs);
        let used = bs.close()?;
        bs_buf.truncate(used);

        // Attach the bitstreams, patch in the audio CRCs, and seal both blocks.
        if sample_count > 0 {
            append_metadata(&mut wv, max_block_size, metadata::ID_WV_BITSTREAM, &bs_buf)?;
        }

        // The side stream rides in the main block for pure lossless, or in the correction
        // block for hybrid lossless.
        let wvx_crc = if flags.contains(BlockFlags::FLOAT_DATA) {
            self.float_state.crc
        }
        else {
            self.int32_state.crc
        };

        if wvx_used && !extras.wvc {
            append_bitstream(
                &mut wv,
                max_block_size,
                metadata::ID_WVX_BITSTREAM,
                &wvx_crc.to_le_bytes(),
                &wvx_buf,
            )?;
        }

        self.header.crc = crc;
        wv[28..32].copy_from_slice(&crc.to_le_bytes());
        append_block_checksum(&mut wv, max_block_size)?;

        let wvc = match wvc_block.take() {
            Some(mut block) => {
                if sample_count > 0 && !wvc_bs_buf.is_empty() {
                    append_metadata(
                        &mut block,
                        max_block_size,
                        metadata::ID_WVC_BITSTREAM,
                        &wvc_bs_buf,
                    )?;
                }

                if wvx_used {
                    append_bitstream(
                        &mut block,
                        max_block_size,
                        metadata::ID_WVX_BITSTREAM,
                        &wvx_crc.to_le_bytes(),
                        &wvx_buf,
                    )?;
                }

                block[28..32].copy_from_slice(&crc2.to_le_bytes());
                append_block_checksum(&mut block, max_block_size)?;
                Some(block)
            }
            None => None,
        };

        self.sample_index += sample_count as u64;
        Ok(PackedBlock { wv, wvc, lossy })
    }

    /// Strips redundant low bits common to every sample of over-wide integer data, diverting
    /// any remaining excess beyond 24 significant bits to the wvx stream.
    fn scan_int32_data(
        &mut self,
        buffer: &mut [i32],
        skip_wvx: bool,
        wvx_buf: &mut Vec<u8>,
    ) -> Result<u32> {
        let mut crc = 0xffff_ffffu32;
        let mut ordata = 0u32;
        let mut anddata = u32::MAX;
        let mut xordata = 0u32;

        for &value in buffer.iter() {
            let bits = value as u32;
            crc = crc
                .wrapping_mul(9)
                .wrapping_add((bits & 0xffff).wrapping_mul(3))
                .wrapping_add(bits >> 16);

            ordata |= bits;
            anddata &= bits;
            xordata |= bits ^ (bits << 1);
        }

        self.int32_state = Int32State { crc, ..Default::default() };

        if ordata != 0 && ordata & 1 == 0 {
            while ordata & 1 == 0 {
                self.int32_state.zeros += 1;
                ordata >>= 1;
            }
        }
        else if anddata & 1 != 0 {
            while self.int32_state.ones < 31 && anddata & 1 != 0 {
                self.int32_state.ones += 1;
                anddata >>= 1;
            }
        }
        else if xordata & 2 == 0 {
            while self.int32_state.dups < 31 && xordata & 2 == 0 {
                self.int32_state.dups += 1;
                xordata >>= 1;
            }
        }

        let zeros = self.int32_state.zeros;
        let ones = self.int32_state.ones;
        let dups = self.int32_state.dups;

        let mut mag_or = 0u32;

        for value in buffer.iter_mut() {
            if zeros != 0 {
                *value >>= zeros;
            }
            else if ones != 0 {
                *value = ((*value).wrapping_add(1) >> ones).wrapping_sub(1);
            }
            else if dups != 0 {
                let low = *value & 1;
                *value = ((*value).wrapping_add(low) >> dups).wrapping_sub(low);
            }

            mag_or |= (*value ^ (*value >> 31)) as u32;
        }

        let mut mag_bits = count_bits(mag_or);

        if mag_bits > 23 {
            self.int32_state.sent_bits = (mag_bits - 23) as u8;
            mag_bits = 23;

            if !skip_wvx {
                let sent = u32::from(self.int32_state.sent_bits);
                *wvx_buf = vec![0u8; buffer.len() * 4 + 16];
                let mut wvx = BitWriter::new(wvx_buf);

                for value in buffer.iter_mut() {
                    wvx.put_bits(*value as u32, sent);
                    *value >>= sent;
                }

                let used = wvx.close()?;
                wvx_buf.truncate(used);
            }
            else {
                for value in buffer.iter_mut() {
                    *value >>= u32::from(self.int32_state.sent_bits);
                }
            }
        }

        Ok(mag_bits)
    }

    /// The lossless path: the decorrelation passes run sequentially over the whole buffer and
    /// the residuals are entropy coded in one sweep. Returns the audio CRC.
    fn pack_lossless(
        &mut self,
        flags: BlockFlags,
        bs: &mut BitWriter<'_>,
        buffer: &mut [i32],
        sample_count: usize,
    ) -> u32 {
        let mut crc = 0xffff_ffffu32;

        if flags.is_mono_data() {
            let mut m = 0usize;

            for value in buffer.iter_mut().take(sample_count) {
                let mut code = *value;

                crc = crc.wrapping_mul(3).wrapping_add(code as u32);

                for pass in self.decorr.passes[..self.decorr.num_terms].iter_mut() {
                    let sam;

                    if pass.term > MAX_TERM {
                        sam = if pass.term & 1 != 0 {
                            pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1])
                        }
                        else {
                            pass.samples_a[0].wrapping_mul(3).wrapping_sub(pass.samples_a[1]) >> 1
                        };

                        pass.samples_a[1] = pass.samples_a[0];
                        pass.samples_a[0] = code;
                    }
                    else {
                        sam = pass.samples_a[m];
                        pass.samples_a[(m + pass.term as usize) & (MAX_TERM as usize - 1)] = code;
                    }

                    code = code.wrapping_sub(apply_weight(pass.weight_a, sam));
                    update_weight(&mut pass.weight_a, pass.delta, sam, code);
                }

                m = (m + 1) & (MAX_TERM as usize - 1);
                *value = code;
            }

            normalize_history(&mut self.decorr.passes[..self.decorr.num_terms], m);
        }
        else {
            for frame in buffer.chunks_exact(2).take(sample_count) {
                crc = crc
                    .wrapping_mul(9)
                    .wrapping_add((frame[0] as u32).wrapping_mul(3))
                    .wrapping_add(frame[1] as u32);
            }

            if flags.contains(BlockFlags::JOINT_STEREO) {
                for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                    frame[0] = frame[0].wrapping_sub(frame[1]);
                    frame[1] = frame[1].wrapping_add(frame[0] >> 1);
                }
            }

            for i in 0..self.decorr.num_terms {
                decorr_stereo_pass(&mut self.decorr.passes[i], buffer, sample_count);
            }
        }

        self.words.send_words_lossless(flags, bs, buffer, sample_count);

        crc
    }

    /// The hybrid path: per composite sample, noise shaping, forward prediction across all
    /// passes, quantization, and state reconstruction from the quantized residuals. Returns
    /// the lossy-reconstruction CRC, the exact-data CRC, and whether any sample was coded
    /// lossily.
    fn pack_hybrid(
        &mut self,
        flags: BlockFlags,
        bs: &mut BitWriter<'_>,
        mut wvc: Option<&mut BitWriter<'_>>,
        buffer: &mut [i32],
        sample_count: usize,
    ) -> (u32, u32, bool) {
        let mut crc = 0xffff_ffffu32;
        let mut crc2 = 0xffff_ffffu32;
        let mut lossy = false;
        let num_terms = self.decorr.num_terms;
        let shaping = flags.contains(BlockFlags::HYBRID_SHAPE);
        let new_shaping = flags.contains(BlockFlags::NEW_SHAPING);

        if flags.is_mono_data() {
            let mut m = 0usize;

            for i in 0..sample_count {
                let mut code = buffer[i];

                crc2 = crc2.wrapping_mul(3).wrapping_add(code as u32);

                if shaping {
                    self.shaping.shaping_acc[0] =
                        self.shaping.shaping_acc[0].wrapping_add(self.shaping.shaping_delta[0]);
                    let shaping_weight = self.shaping.shaping_acc[0] >> 16;
                    let mut temp = apply_weight(shaping_weight, self.shaping.error[0]).wrapping_neg();

                    if new_shaping && shaping_weight < 0 && temp != 0 {
                        if temp == self.shaping.error[0] {
                            temp = if temp < 0 { temp + 1 } else { temp - 1 };
                        }

                        self.shaping.error[0] = code.wrapping_neg();
                        code = code.wrapping_add(temp);
                    }
                    else {
                        code = code.wrapping_add(temp);
                        self.shaping.error[0] = code.wrapping_neg();
                    }
                }

                for pass in self.decorr.passes[..num_terms].iter_mut() {
                    if pass.term > MAX_TERM {
                        pass.sam_a = if pass.term & 1 != 0 {
                            pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1])
                        }
                        else {
                            pass.samples_a[0].wrapping_mul(3).wrapping_sub(pass.samples_a[1]) >> 1
                        };
                    }
                    else {
                        pass.sam_a = pass.samples_a[m];
                    }

                    pass.aweight_a = apply_weight(pass.weight_a, pass.sam_a);
                    code = code.wrapping_sub(pass.aweight_a);
                }

                let mut code = self.words.send_word(flags, bs, wvc.as_deref_mut(), code, 0);

                for pass in self.decorr.passes[..num_terms].iter_mut().rev() {
                    if pass.term > MAX_TERM {
                        update_weight(&mut pass.weight_a, pass.delta, pass.sam_a, code);
                        pass.samples_a[1] = pass.samples_a[0];
                        code = code.wrapping_add(pass.aweight_a);
                        pass.samples_a[0] = code;
                    }
                    else {
                        let sam = pass.samples_a[m];
                        update_weight(&mut pass.weight_a, pass.delta, sam, code);
                        code = code.wrapping_add(pass.aweight_a);
                        pass.samples_a[(m + pass.term as usize) & (MAX_TERM as usize - 1)] = code;
                    }
                }

                self.shaping.error[0] = self.shaping.error[0].wrapping_add(code);
                m = (m + 1) & (MAX_TERM as usize - 1);

                crc = crc.wrapping_mul(3).wrapping_add(code as u32);

                if crc != crc2 {
                    lossy = true;
                }
            }

            normalize_history(&mut self.decorr.passes[..num_terms], m);
        }
        else {
            let mut m = 0usize;

            for i in 0..sample_count {
                let mut left = buffer[i * 2];
                let mut right = buffer[i * 2 + 1];

                crc2 = crc2
                    .wrapping_mul(9)
                    .wrapping_add((left as u32).wrapping_mul(3))
                    .wrapping_add(right as u32);

                if shaping {
                    for (ch, value) in [&mut left, &mut right].into_iter().enumerate() {
                        self.shaping.shaping_acc[ch] = self.shaping.shaping_acc[ch]
                            .wrapping_add(self.shaping.shaping_delta[ch]);
                        let shaping_weight = self.shaping.shaping_acc[ch] >> 16;
                        let mut temp = apply_weight(shaping_weight, self.shaping.error[ch]).wrapping_neg();

                        if new_shaping && shaping_weight < 0 && temp != 0 {
                            if temp == self.shaping.error[ch] {
                                temp = if temp < 0 { temp + 1 } else { temp - 1 };
                            }

                            self.shaping.error[ch] = value.wrapping_neg();
                            *value = value.wrapping_add(temp);
                        }
                        else {
                            *value = value.wrapping_add(temp);
                            self.shaping.error[ch] = value.wrapping_neg();
                        }
                    }
                }

                if flags.contains(BlockFlags::JOINT_STEREO) {
                    left = left.wrapping_sub(right);
                    right = right.wrapping_add(left >> 1);
                }

                for pass in self.decorr.passes[..num_terms].iter_mut() {
                    if pass.term > MAX_TERM {
                        if pass.term & 1 != 0 {
                            pass.sam_a = pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1]);
                            pass.sam_b = pass.samples_b[0].wrapping_mul(2).wrapping_sub(pass.samples_b[1]);
                        }
                        else {
                            pass.sam_a =
                                pass.samples_a[0].wrapping_mul(3).wrapping_sub(pass.samples_a[1]) >> 1;
                            pass.sam_b =
                                pass.samples_b[0].wrapping_mul(3).wrapping_sub(pass.samples_b[1]) >> 1;
                        }

                        pass.aweight_a = apply_weight(pass.weight_a, pass.sam_a);
                        pass.aweight_b = apply_weight(pass.weight_b, pass.sam_b);
                        left = left.wrapping_sub(pass.aweight_a);
                        right = right.wrapping_sub(pass.aweight_b);
                    }
                    else if pass.term > 0 {
                        pass.sam_a = pass.samples_a[m];
                        pass.sam_b = pass.samples_b[m];
                        pass.aweight_a = apply_weight(pass.weight_a, pass.sam_a);
                        pass.aweight_b = apply_weight(pass.weight_b, pass.sam_b);
                        left = left.wrapping_sub(pass.aweight_a);
                        right = right.wrapping_sub(pass.aweight_b);
                    }
                    else {
                        if pass.term == -1 {
                            pass.samples_b[0] = left;
                        }
                        else if pass.term == -2 {
                            pass.samples_a[0] = right;
                        }

                        pass.sam_a = pass.samples_a[0];
                        pass.sam_b = pass.samples_b[0];
                        pass.aweight_a = apply_weight(pass.weight_a, pass.sam_a);
                        pass.aweight_b = apply_weight(pass.weight_b, pass.sam_b);
                        left = left.wrapping_sub(pass.aweight_a);
                        right = right.wrapping_sub(pass.aweight_b);
                    }
                }

                let mut left = self.words.send_word(flags, bs, wvc.as_deref_mut(), left, 0);
                let mut right = self.words.send_word(flags, bs, wvc.as_deref_mut(), right, 1);

                for pass in self.decorr.passes[..num_terms].iter_mut().rev() {
                    if pass.term > MAX_TERM {
                        update_weight(&mut pass.weight_a, pass.delta, pass.sam_a, left);
                        update_weight(&mut pass.weight_b, pass.delta, pass.sam_b, right);

                        pass.samples_a[1] = pass.samples_a[0];
                        pass.samples_b[1] = pass.samples_b[0];

                        left = left.wrapping_add(pass.aweight_a);
                        right = right.wrapping_add(pass.aweight_b);
                        pass.samples_a[0] = left;
                        pass.samples_b[0] = right;
                    }
                    else if pass.term > 0 {
                        let k = (m + pass.term as usize) & (MAX_TERM as usize - 1);

                        update_weight(&mut pass.weight_a, pass.delta, pass.samples_a[m], left);
                        left = left.wrapping_add(pass.aweight_a);
                        pass.samples_a[k] = left;

                        update_weight(&mut pass.weight_b, pass.delta, pass.samples_b[m], right);
                        right = right.wrapping_add(pass.aweight_b);
                        pass.samples_b[k] = right;
                    }
                    else {
                        if pass.term == -1 {
                            pass.samples_b[0] = left.wrapping_add(pass.aweight_a);
                            pass.aweight_b = apply_weight(pass.weight_b, pass.samples_b[0]);
                        }
                        else if pass.term == -2 {
                            pass.samples_a[0] = right.wrapping_add(pass.aweight_b);
                            pass.aweight_a = apply_weight(pass.weight_a, pass.samples_a[0]);
                        }

                        update_weight_clip(&mut pass.weight_a, pass.delta, pass.samples_a[0], left);
                        update_weight_clip(
                            &mut pass.weight_b,
                            pass.delta,
                            pass.samples_b[0],
                            right,
                        );
                        left = left.wrapping_add(pass.aweight_a);
                        right = right.wrapping_add(pass.aweight_b);
                        pass.samples_b[0] = left;
                        pass.samples_a[0] = right;
                    }
                }

                if flags.contains(BlockFlags::JOINT_STEREO) {
                    right = right.wrapping_sub(left >> 1);
                    left = left.wrapping_add(right);
                }

                self.shaping.error[0] = self.shaping.error[0].wrapping_add(left);
                self.shaping.error[1] = self.shaping.error[1].wrapping_add(right);
                m = (m + 1) & (MAX_TERM as usize - 1);

                crc = crc
                    .wrapping_mul(9)
                    .wrapping_add((left as u32).wrapping_mul(3))
                    .wrapping_add(right as u32);

                if crc != crc2 {
                    lossy = true;
                }
            }

            normalize_history(&mut self.decorr.passes[..num_terms], m);
        }

        (crc, crc2, lossy)
    }
}

fn wvx_needed_but_absent(state: &PackState, flags: BlockFlags, wvx_allowed: bool) -> bool {
    if wvx_allowed {
        return false;
    }

    if flags.contains(BlockFlags::FLOAT_DATA) {
        state.float_state.needs_wvx()
    }
    else if flags.contains(BlockFlags::INT32_DATA) {
        state.int32_state.sent_bits != 0
    }
    else {
        false
    }
}

/// One pass of the stereo decorrelation over a whole buffer of residuals-in-progress. The
/// history arrays for the delay terms are left in their normalized positions.
fn decorr_stereo_pass(pass: &mut DecorrPass, buffer: &mut [i32], sample_count: usize) {
    match pass.term {
        17 => {
            for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                let sam = pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1]);
                pass.samples_a[1] = pass.samples_a[0];
                pass.samples_a[0] = frame[0];
                let tmp = frame[0].wrapping_sub(apply_weight(pass.weight_a, sam));
                frame[0] = tmp;
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);

                let sam = pass.samples_b[0].wrapping_mul(2).wrapping_sub(pass.samples_b[1]);
                pass.samples_b[1] = pass.samples_b[0];
                pass.samples_b[0] = frame[1];
                let tmp = frame[1].wrapping_sub(apply_weight(pass.weight_b, sam));
                frame[1] = tmp;
                update_weight(&mut pass.weight_b, pass.delta, sam, tmp);
            }
        }
        18 => {
            for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                let sam = pass.samples_a[0]
                    .wrapping_add(pass.samples_a[0].wrapping_sub(pass.samples_a[1]) >> 1);
                pass.samples_a[1] = pass.samples_a[0];
                pass.samples_a[0] = frame[0];
                let tmp = frame[0].wrapping_sub(apply_weight(pass.weight_a, sam));
                frame[0] = tmp;
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);

                let sam = pass.samples_b[0]
                    .wrapping_add(pass.samples_b[0].wrapping_sub(pass.samples_b[1]) >> 1);
                pass.samples_b[1] = pass.samples_b[0];
                pass.samples_b[0] = frame[1];
                let tmp = frame[1].wrapping_sub(apply_weight(pass.weight_b, sam));
                frame[1] = tmp;
                update_weight(&mut pass.weight_b, pass.delta, sam, tmp);
            }
        }
        -1 => {
            for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                let sam_a = pass.samples_a[0];
                let sam_b = frame[0];
                let tmp = frame[0].wrapping_sub(apply_weight(pass.weight_a, sam_a));
                frame[0] = tmp;
                update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, tmp);

                pass.samples_a[0] = frame[1];
                let tmp = frame[1].wrapping_sub(apply_weight(pass.weight_b, sam_b));
                frame[1] = tmp;
                update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, tmp);
            }
        }
        -2 => {
            for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                let sam_b = pass.samples_b[0];
                let sam_a = frame[1];
                let tmp = frame[1].wrapping_sub(apply_weight(pass.weight_b, sam_b));
                frame[1] = tmp;
                update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, tmp);

                pass.samples_b[0] = frame[0];
                let tmp = frame[0].wrapping_sub(apply_weight(pass.weight_a, sam_a));
                frame[0] = tmp;
                update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, tmp);
            }
        }
        -3 => {
            for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                let sam_a = pass.samples_a[0];
                let sam_b = pass.samples_b[0];

                pass.samples_a[0] = frame[1];
                let tmp = frame[1].wrapping_sub(apply_weight(pass.weight_b, sam_b));
                frame[1] = tmp;
                update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, tmp);

                pass.samples_b[0] = frame[0];
                let tmp = frame[0].wrapping_sub(apply_weight(pass.weight_a, sam_a));
                frame[0] = tmp;
                update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, tmp);
            }
        }
        _ => {
            let mut m = 0usize;
            let mut k = (pass.term & (MAX_TERM - 1)) as usize;

            for frame in buffer.chunks_exact_mut(2).take(sample_count) {
                let sam = pass.samples_a[m];
                pass.samples_a[k] = frame[0];
                let tmp = frame[0].wrapping_sub(apply_weight(pass.weight_a, sam));
                frame[0] = tmp;
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);

                let sam = pass.samples_b[m];
                pass.samples_b[k] = frame[1];
                let tmp = frame[1].wrapping_sub(apply_weight(pass.weight_b, sam));
                frame[1] = tmp;
                update_weight(&mut pass.weight_b, pass.delta, sam, tmp);

                m = (m + 1) & (MAX_TERM as usize - 1);
                k = (k + 1) & (MAX_TERM as usize - 1);
            }

            let passes = std::slice::from_mut(pass);
            normalize_history(passes, m);
        }
    }
}
