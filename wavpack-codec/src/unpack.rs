// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `unpack` module decodes audio from a parsed block.
//!
//! A [`Stream`] owns the raw block (and matching correction block), the bitstream cursors
//! into them, and the adaptive state restored from the block's metadata. Decoding mirrors the
//! packer exactly: entropy decode, inverse decorrelation back to front, inverse joint stereo,
//! then the sample fixup (shift, wide-integer, or float reconstruction) from the wvx stream.
//! A metadata failure puts the stream in the MUTE state, where it produces silence for the
//! remainder of the block.

use log::warn;

use wavpack_core::io::bit::{BitReader, BitReaderState};

use crate::decorr::{
    apply_weight, normalize_history, update_weight, update_weight_clip, DecorrPass, DecorrState,
    ShapingState, MAX_TERM,
};
use crate::dsd::DsdState;
use crate::floats::{float_values, float_values_nowvx, FloatState};
use crate::header::{BlockFlags, BlockHeader};
use crate::metadata::{self, read_metadata, ID_OPTIONAL_DATA};
use crate::pack::Int32State;
use crate::words::WordsState;
use crate::{MAX_STREAMS, OLD_MAX_STREAMS};

/// Context-wide information extracted from block metadata, shared by all streams.
pub struct ContextInfo {
    pub num_channels: u32,
    pub channel_mask: u32,
    pub max_streams: usize,
    pub meta_sample_rate: Option<u32>,
    pub config_flags: u32,
    pub md5: Option<[u8; 16]>,
    pub wrapper: Vec<u8>,
    pub collect_wrapper: bool,
    pub channel_identities: Option<Vec<u8>>,
    pub dsd_multiplier: u32,
    pub lossy_blocks: bool,
}

impl Default for ContextInfo {
    fn default() -> Self {
        ContextInfo {
            num_channels: 0,
            channel_mask: 0,
            max_streams: OLD_MAX_STREAMS,
            meta_sample_rate: None,
            config_flags: 0,
            md5: None,
            wrapper: Vec::new(),
            collect_wrapper: false,
            channel_identities: None,
            dsd_multiplier: 1,
            lossy_blocks: false,
        }
    }
}

/// A suspended bitstream position within one of the stream's block buffers.
#[derive(Clone, Copy)]
struct StreamCursor {
    in_wvc: bool,
    start: usize,
    end: usize,
    state: BitReaderState,
}

impl StreamCursor {
    fn new(in_wvc: bool, start: usize, end: usize) -> Self {
        StreamCursor { in_wvc, start, end, state: BitReaderState::default() }
    }
}

/// Per-stream decoder state: one or two channels of one block at a time.
pub struct Stream {
    pub header: BlockHeader,
    pub blockbuff: Vec<u8>,
    pub block2buff: Vec<u8>,
    wv: Option<StreamCursor>,
    wvc: Option<StreamCursor>,
    wvx: Option<StreamCursor>,
    crc_wvx: u32,
    crc_x: u32,
    decorr: DecorrState,
    words: WordsState,
    shaping: ShapingState,
    float_state: FloatState,
    int32_state: Int32State,
    dsd: Option<DsdState>,
    pub mute_error: bool,
    crc: u32,
    pub sample_index: u64,
    pub init_done: bool,
    pub wvc_skip: bool,
}

impl Default for Stream {
    fn default() -> Self {
        Stream {
            header: BlockHeader::default(),
            blockbuff: Vec::new(),
            block2buff: Vec::new(),
            wv: None,
            wvc: None,
            wvx: None,
            crc_wvx: 0,
            crc_x: 0xffff_ffff,
            decorr: DecorrState::default(),
            words: WordsState::new(),
            shaping: ShapingState::default(),
            float_state: FloatState::default(),
            int32_state: Int32State::default(),
            dsd: None,
            mute_error: false,
            crc: 0xffff_ffff,
            sample_index: 0,
            init_done: false,
            wvc_skip: false,
        }
    }
}

impl Stream {
    /// The float normalization exponent of the current block, when float data is present.
    pub fn float_norm_exp(&self) -> u8 {
        self.float_state.norm_exp
    }

    /// The index of the first sample past the current block.
    pub fn block_end(&self) -> u64 {
        self.header.block_index + u64::from(self.header.block_samples)
    }

    /// Initializes everything required to decode the block held in `blockbuff` (and
    /// `block2buff` when a correction block accompanies it), scanning all metadata including
    /// the bitstream sub-blocks. Returns false (and enters the MUTE state) on any fatal
    /// metadata error.
    pub fn unpack_init(&mut self, ctx: &mut ContextInfo) -> bool {
        self.mute_error = false;
        self.crc = 0xffff_ffff;
        self.crc_x = 0xffff_ffff;
        self.wv = None;
        self.wvc = None;
        self.wvx = None;
        self.decorr = DecorrState::default();
        self.words.init();
        self.shaping = ShapingState::default();
        self.float_state = FloatState::default();
        self.int32_state = Int32State::default();
        self.dsd = None;

        let flags = self.header.flags;

        // A block claiming to be both mono and false-stereo is self-contradictory.
        if flags.contains(BlockFlags::MONO | BlockFlags::FALSE_STEREO) {
            self.mute_error = true;
            return false;
        }

        if !self.scan_metadata(ctx, false) {
            self.mute_error = true;
            return false;
        }

        if self.header.block_samples > 0 && !self.block2buff.is_empty() {
            if !self.scan_metadata(ctx, true) {
                self.mute_error = true;
                return false;
            }
        }

        if self.header.block_samples > 0 {
            if flags.contains(BlockFlags::DSD) {
                if self.dsd.is_none() {
                    self.mute_error = true;
                    return false;
                }
            }
            else if self.wv.is_none() {
                if self.wvc.is_some() {
                    warn!("can't unpack correction files alone");
                }

                self.mute_error = true;
                return false;
            }

            if self.wvx.is_none() {
                if flags.contains(BlockFlags::INT32_DATA) && self.int32_state.sent_bits != 0 {
                    ctx.lossy_blocks = true;
                }

                if flags.contains(BlockFlags::FLOAT_DATA) && self.float_state.needs_wvx() {
                    ctx.lossy_blocks = true;
                }
            }

            self.sample_index = self.header.block_index;
        }

        true
    }

    fn scan_metadata(&mut self, ctx: &mut ContextInfo, in_wvc: bool) -> bool {
        let mut cursor = BlockHeader::SIZE;

        loop {
            let buffer = if in_wvc { &self.block2buff } else { &self.blockbuff };

            let (id, offset, len) = match read_metadata(buffer, &mut cursor) {
                Ok(Some(item)) => (item.id, item.offset, item.data.len()),
                Ok(None) => return true,
                Err(_) => return false,
            };

            if !self.process_metadata(ctx, in_wvc, id, offset, len) {
                return false;
            }
        }
    }

    fn process_metadata(
        &mut self,
        ctx: &mut ContextInfo,
        in_wvc: bool,
        id: u8,
        offset: usize,
        len: usize,
    ) -> bool {
        let flags = self.header.flags;
        let buffer: &[u8] = if in_wvc { &self.block2buff } else { &self.blockbuff };
        let data = &buffer[offset..offset + len];

        match id {
            metadata::ID_DUMMY | metadata::ID_ENCODER_INFO => true,
            metadata::ID_DECORR_TERMS => self.decorr.read_terms(flags, data),
            metadata::ID_DECORR_WEIGHTS => self.decorr.read_weights(flags, data),
            metadata::ID_DECORR_SAMPLES => self.decorr.read_samples(flags, data),
            metadata::ID_ENTROPY_VARS => self.words.read_entropy_vars(flags, data),
            metadata::ID_HYBRID_PROFILE => self.words.read_hybrid_profile(flags, data),
            metadata::ID_SHAPING_WEIGHTS => self.shaping.read_shaping_info(flags, data),
            metadata::ID_FLOAT_INFO => self.float_state.read_float_info(data),
            metadata::ID_INT32_INFO => self.int32_state.read_int32_info(data),
            metadata::ID_WV_BITSTREAM => {
                if len == 0 {
                    return false;
                }

                self.wv = Some(StreamCursor::new(in_wvc, offset, offset + len));
                true
            }
            metadata::ID_WVC_BITSTREAM => {
                if len == 0 {
                    return false;
                }

                self.wvc = Some(StreamCursor::new(in_wvc, offset, offset + len));
                true
            }
            metadata::ID_WVX_BITSTREAM => {
                if len <= 4 {
                    return false;
                }

                self.crc_wvx = u32::from_le_bytes(data[0..4].try_into().unwrap());
                self.wvx = Some(StreamCursor::new(in_wvc, offset + 4, offset + len));
                true
            }
            metadata::ID_DSD_BLOCK => {
                match DsdState::init(buffer, offset, len, flags, self.header.block_samples) {
                    Ok((state, multiplier)) => {
                        self.dsd = Some(state);
                        ctx.dsd_multiplier = multiplier;
                        true
                    }
                    Err(_) => false,
                }
            }
            metadata::ID_CHANNEL_INFO => read_channel_info(ctx, data),
            metadata::ID_CONFIG_BLOCK => {
                if data.len() >= 3 {
                    ctx.config_flags &= 0xff;
                    ctx.config_flags |= u32::from(data[0]) << 8;
                    ctx.config_flags |= u32::from(data[1]) << 16;
                    ctx.config_flags |= u32::from(data[2]) << 24;
                }

                true
            }
            metadata::ID_SAMPLE_RATE => {
                if data.len() == 3 {
                    ctx.meta_sample_rate = Some(
                        u32::from(data[0]) | u32::from(data[1]) << 8 | u32::from(data[2]) << 16,
                    );
                }

                true
            }
            metadata::ID_MD5_CHECKSUM | metadata::ID_ALT_MD5_CHECKSUM => {
                if data.len() == 16 {
                    let mut md5 = [0u8; 16];
                    md5.copy_from_slice(data);
                    ctx.md5 = Some(md5);
                }

                true
            }
            metadata::ID_RIFF_HEADER
            | metadata::ID_RIFF_TRAILER
            | metadata::ID_ALT_HEADER
            | metadata::ID_ALT_TRAILER => {
                if ctx.collect_wrapper
                    && ctx.wrapper.len() + len <= crate::MAX_WRAPPER_BYTES
                    && len > 0
                {
                    ctx.wrapper.extend_from_slice(data);
                }

                true
            }
            metadata::ID_CHANNEL_IDENTITIES => {
                ctx.channel_identities = Some(data.to_vec());
                true
            }
            metadata::ID_BLOCK_CHECKSUM | metadata::ID_NEW_CONFIG | metadata::ID_ALT_EXTENSION => {
                true
            }
            _ => {
                // Unknown ids are only fatal when they are not flagged optional.
                if id & ID_OPTIONAL_DATA == 0 {
                    warn!("unknown required metadata id 0x{:02x}", id);
                    false
                }
                else {
                    true
                }
            }
        }
    }

    /// True when the entire block has been consumed.
    pub fn block_done(&self) -> bool {
        self.sample_index >= self.block_end()
    }

    /// Compares the running audio checksum against the header. Only meaningful once the block
    /// has fully decoded.
    pub fn check_crc(&self) -> bool {
        self.crc == self.header.crc
    }

    /// True when the wvx checksum failed for this block (float or wide-integer data that did
    /// not reconstruct exactly).
    pub fn wvx_crc_failed(&self) -> bool {
        self.wvx.is_some() && self.crc_x != self.crc_wvx
    }

    /// Decodes up to `samples` composite samples into `buffer` (interleaved by the block's
    /// output channel count), returning the number produced. The MUTE state produces silence.
    pub fn unpack_samples(&mut self, ctx: &mut ContextInfo, buffer: &mut [i32], samples: usize) -> usize {
        let flags = self.header.flags;
        let out_channels = self.header.num_channels() as usize;
        let mono_data = flags.is_mono_data();
        let dec_channels = if mono_data { 1 } else { 2 };

        let remaining = self.block_end().saturating_sub(self.sample_index) as usize;
        let count = samples.min(remaining);

        if count == 0 {
            return 0;
        }

        if self.mute_error {
            for value in buffer[..count * out_channels].iter_mut() {
                *value = 0;
            }

            self.sample_index += count as u64;
            return count;
        }

        if flags.contains(BlockFlags::DSD) {
            self.unpack_dsd_samples(buffer, count);
        }
        else if flags.contains(BlockFlags::HYBRID) {
            self.unpack_hybrid_samples(ctx, buffer, count);
        }
        else {
            self.unpack_lossless_samples(buffer, count);
        }

        if self.mute_error {
            for value in buffer[..count * out_channels].iter_mut() {
                *value = 0;
            }

            self.sample_index += count as u64;
            return count;
        }

        if !flags.contains(BlockFlags::DSD) {
            self.fixup_samples(&mut buffer[..count * dec_channels]);
        }

        if flags.contains(BlockFlags::FALSE_STEREO) {
            for i in (0..count).rev() {
                let value = buffer[i];
                buffer[i * 2] = value;
                buffer[i * 2 + 1] = value;
            }
        }

        self.sample_index += count as u64;

        if self.block_done() && self.wvx_crc_failed() {
            ctx.lossy_blocks = true;
        }

        count
    }

    fn unpack_dsd_samples(&mut self, buffer: &mut [i32], count: usize) {
        let flags = self.header.flags;
        let dec_channels = if flags.is_mono_data() { 1 } else { 2 };

        let produced = match self.dsd.as_mut() {
            Some(dsd) => {
                dsd.decode(&self.blockbuff, flags, &mut buffer[..count * dec_channels], count, &mut self.crc)
            }
            None => 0,
        };

        if produced < count {
            self.mute_error = true;

            for value in buffer[produced * dec_channels..count * dec_channels].iter_mut() {
                *value = 0;
            }
        }
    }

    fn unpack_lossless_samples(&mut self, buffer: &mut [i32], count: usize) {
        let flags = self.header.flags;
        let mono_data = flags.is_mono_data();
        let dec_channels = if mono_data { 1 } else { 2 };
        let out = &mut buffer[..count * dec_channels];

        let cursor = match self.wv.as_mut() {
            Some(cursor) => cursor,
            None => {
                self.mute_error = true;
                return;
            }
        };

        let source: &[u8] =
            if cursor.in_wvc { &self.block2buff } else { &self.blockbuff };
        let mut reader = BitReader::resume(&source[cursor.start..cursor.end], cursor.state);

        let produced = self.words.get_words_lossless(flags, &mut reader, out, count);

        cursor.state = reader.save();

        if produced < count {
            self.mute_error = true;
            return;
        }

        for i in (0..self.decorr.num_terms).rev() {
            if mono_data {
                decorr_mono_pass_inverse(&mut self.decorr.passes[i], out);
            }
            else {
                decorr_stereo_pass_inverse(&mut self.decorr.passes[i], out);
            }
        }

        if !mono_data && flags.contains(BlockFlags::JOINT_STEREO) {
            for frame in out.chunks_exact_mut(2) {
                frame[1] = frame[1].wrapping_sub(frame[0] >> 1);
                frame[0] = frame[0].wrapping_add(frame[1]);
            }
        }

        accumulate_crc(&mut self.crc, out, mono_data);
    }

    fn unpack_hybrid_samples(&mut self, _ctx: &mut ContextInfo, buffer: &mut [i32], count: usize) {
        let flags = self.header.flags;
        let mono_data = flags.is_mono_data();
        let dec_channels = if mono_data { 1 } else { 2 };
        let out = &mut buffer[..count * dec_channels];

        let wv_cursor = match self.wv {
            Some(cursor) => cursor,
            None => {
                self.mute_error = true;
                return;
            }
        };

        let wv_source: &[u8] =
            if wv_cursor.in_wvc { &self.block2buff } else { &self.blockbuff };
        let mut wv_reader =
            BitReader::resume(&wv_source[wv_cursor.start..wv_cursor.end], wv_cursor.state);

        let wvc_cursor = self.wvc;
        let mut wvc_reader = wvc_cursor.map(|cursor| {
            let source: &[u8] = if cursor.in_wvc { &self.block2buff } else { &self.blockbuff };
            BitReader::resume(&source[cursor.start..cursor.end], cursor.state)
        });

        let exact = wvc_reader.is_some();
        let shaping_undo = exact && flags.contains(BlockFlags::HYBRID_SHAPE);
        let new_shaping = flags.contains(BlockFlags::NEW_SHAPING);
        let num_terms = self.decorr.num_terms;
        let mut failed = false;

        if mono_data {
            let mut m = 0usize;

            for value in out.iter_mut() {
                let (lossy, correction) =
                    match self.words.get_word(flags, &mut wv_reader, wvc_reader.as_mut(), 0) {
                        Some(word) => word,
                        None => {
                            failed = true;
                            break;
                        }
                    };

                let mut code = lossy;

                for pass in self.decorr.passes[..num_terms].iter_mut().rev() {
                    if pass.term > MAX_TERM {
                        let sam = if pass.term & 1 != 0 {
                            pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1])
                        }
                        else {
                            pass.samples_a[0].wrapping_mul(3).wrapping_sub(pass.samples_a[1]) >> 1
                        };

                        let aweight = apply_weight(pass.weight_a, sam);
                        update_weight(&mut pass.weight_a, pass.delta, sam, code);
                        pass.samples_a[1] = pass.samples_a[0];
                        code = code.wrapping_add(aweight);
                        pass.samples_a[0] = code;
                    }
                    else {
                        let sam = pass.samples_a[m];
                        let aweight = apply_weight(pass.weight_a, sam);
                        update_weight(&mut pass.weight_a, pass.delta, sam, code);
                        code = code.wrapping_add(aweight);
                        pass.samples_a[(m + pass.term as usize) & (MAX_TERM as usize - 1)] = code;
                    }
                }

                m = (m + 1) & (MAX_TERM as usize - 1);

                let lossy_out = code;
                let exact_out = code.wrapping_add(correction);

                let output = if shaping_undo {
                    self.shaping.shaping_acc[0] =
                        self.shaping.shaping_acc[0].wrapping_add(self.shaping.shaping_delta[0]);
                    let shaping_weight = self.shaping.shaping_acc[0] >> 16;
                    let mut temp = apply_weight(shaping_weight, self.shaping.error[0]).wrapping_neg();

                    let original;

                    if new_shaping && shaping_weight < 0 && temp != 0 {
                        if temp == self.shaping.error[0] {
                            temp = if temp < 0 { temp + 1 } else { temp - 1 };
                        }

                        original = exact_out.wrapping_sub(temp);
                        self.shaping.error[0] = original.wrapping_neg();
                    }
                    else {
                        original = exact_out.wrapping_sub(temp);
                        self.shaping.error[0] = exact_out.wrapping_neg();
                    }

                    self.shaping.error[0] = self.shaping.error[0].wrapping_add(lossy_out);
                    original
                }
                else if exact {
                    exact_out
                }
                else {
                    lossy_out
                };

                self.crc = self.crc.wrapping_mul(3).wrapping_add(output as u32);
                *value = output;
            }

            normalize_history(&mut self.decorr.passes[..num_terms], m);
        }
        else {
            let mut m = 0usize;

            for frame in out.chunks_exact_mut(2) {
                let (lossy_l, corr_l) =
                    match self.words.get_word(flags, &mut wv_reader, wvc_reader.as_mut(), 0) {
                        Some(word) => word,
                        None => {
                            failed = true;
                            break;
                        }
                    };

                let (lossy_r, corr_r) =
                    match self.words.get_word(flags, &mut wv_reader, wvc_reader.as_mut(), 1) {
                        Some(word) => word,
                        None => {
                            failed = true;
                            break;
                        }
                    };

                let mut left = lossy_l;
                let mut right = lossy_r;

                for pass in self.decorr.passes[..num_terms].iter_mut().rev() {
                    if pass.term > MAX_TERM {
                        let (sam_a, sam_b) = if pass.term & 1 != 0 {
                            (
                                pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1]),
                                pass.samples_b[0].wrapping_mul(2).wrapping_sub(pass.samples_b[1]),
                            )
                        }
                        else {
                            (
                                pass.samples_a[0].wrapping_mul(3).wrapping_sub(pass.samples_a[1])
                                    >> 1,
                                pass.samples_b[0].wrapping_mul(3).wrapping_sub(pass.samples_b[1])
                                    >> 1,
                            )
                        };

                        let aweight_a = apply_weight(pass.weight_a, sam_a);
                        let aweight_b = apply_weight(pass.weight_b, sam_b);

                        update_weight(&mut pass.weight_a, pass.delta, sam_a, left);
                        update_weight(&mut pass.weight_b, pass.delta, sam_b, right);

                        pass.samples_a[1] = pass.samples_a[0];
                        pass.samples_b[1] = pass.samples_b[0];

                        left = left.wrapping_add(aweight_a);
                        right = right.wrapping_add(aweight_b);
                        pass.samples_a[0] = left;
                        pass.samples_b[0] = right;
                    }
                    else if pass.term > 0 {
                        let k = (m + pass.term as usize) & (MAX_TERM as usize - 1);

                        let sam_a = pass.samples_a[m];
                        let aweight_a = apply_weight(pass.weight_a, sam_a);
                        update_weight(&mut pass.weight_a, pass.delta, sam_a, left);
                        left = left.wrapping_add(aweight_a);
                        pass.samples_a[k] = left;

                        let sam_b = pass.samples_b[m];
                        let aweight_b = apply_weight(pass.weight_b, sam_b);
                        update_weight(&mut pass.weight_b, pass.delta, sam_b, right);
                        right = right.wrapping_add(aweight_b);
                        pass.samples_b[k] = right;
                    }
                    else if pass.term == -1 {
                        let sam_a = pass.samples_a[0];
                        let aweight_a = apply_weight(pass.weight_a, sam_a);
                        update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, left);
                        left = left.wrapping_add(aweight_a);

                        // The B-channel predictor is this sample's reconstructed A value.
                        let sam_b = left;
                        let aweight_b = apply_weight(pass.weight_b, sam_b);
                        update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, right);
                        right = right.wrapping_add(aweight_b);

                        pass.samples_a[0] = right;
                        pass.samples_b[0] = left;
                    }
                    else if pass.term == -2 {
                        let sam_b = pass.samples_b[0];
                        let aweight_b = apply_weight(pass.weight_b, sam_b);
                        update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, right);
                        right = right.wrapping_add(aweight_b);

                        // Mirror of -1 with the channels swapped.
                        let sam_a = right;
                        let aweight_a = apply_weight(pass.weight_a, sam_a);
                        update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, left);
                        left = left.wrapping_add(aweight_a);

                        pass.samples_a[0] = right;
                        pass.samples_b[0] = left;
                    }
                    else {
                        let sam_a = pass.samples_a[0];
                        let sam_b = pass.samples_b[0];
                        let aweight_a = apply_weight(pass.weight_a, sam_a);
                        let aweight_b = apply_weight(pass.weight_b, sam_b);

                        update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, left);
                        update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, right);

                        left = left.wrapping_add(aweight_a);
                        right = right.wrapping_add(aweight_b);
                        pass.samples_a[0] = right;
                        pass.samples_b[0] = left;
                    }
                }

                m = (m + 1) & (MAX_TERM as usize - 1);

                // The correction passes through the linear chain unchanged, so the exact
                // values come from adding it to the lossy reconstruction.
                let mut exact_l = left.wrapping_add(corr_l);
                let mut exact_r = right.wrapping_add(corr_r);

                if flags.contains(BlockFlags::JOINT_STEREO) {
                    right = right.wrapping_sub(left >> 1);
                    left = left.wrapping_add(right);

                    exact_r = exact_r.wrapping_sub(exact_l >> 1);
                    exact_l = exact_l.wrapping_add(exact_r);
                }

                let (out_l, out_r) = if shaping_undo {
                    let mut outputs = [0i32; 2];

                    for (ch, (exact_v, lossy_v)) in
                        [(exact_l, left), (exact_r, right)].into_iter().enumerate()
                    {
                        self.shaping.shaping_acc[ch] = self.shaping.shaping_acc[ch]
                            .wrapping_add(self.shaping.shaping_delta[ch]);
                        let shaping_weight = self.shaping.shaping_acc[ch] >> 16;
                        let mut temp = apply_weight(shaping_weight, self.shaping.error[ch]).wrapping_neg();

                        let original;

                        if new_shaping && shaping_weight < 0 && temp != 0 {
                            if temp == self.shaping.error[ch] {
                                temp = if temp < 0 { temp + 1 } else { temp - 1 };
                            }

                            original = exact_v.wrapping_sub(temp);
                            self.shaping.error[ch] = original.wrapping_neg();
                        }
                        else {
                            original = exact_v.wrapping_sub(temp);
                            self.shaping.error[ch] = exact_v.wrapping_neg();
                        }

                        self.shaping.error[ch] = self.shaping.error[ch].wrapping_add(lossy_v);
                        outputs[ch] = original;
                    }

                    (outputs[0], outputs[1])
                }
                else if exact {
                    (exact_l, exact_r)
                }
                else {
                    (left, right)
                };

                self.crc = self
                    .crc
                    .wrapping_mul(9)
                    .wrapping_add((out_l as u32).wrapping_mul(3))
                    .wrapping_add(out_r as u32);

                frame[0] = out_l;
                frame[1] = out_r;
            }

            normalize_history(&mut self.decorr.passes[..num_terms], m);
        }

        if let Some(cursor) = self.wv.as_mut() {
            cursor.state = wv_reader.save();
        }

        if let (Some(cursor), Some(reader)) = (self.wvc.as_mut(), wvc_reader.as_ref()) {
            cursor.state = reader.save();
        }

        if failed {
            self.mute_error = true;
        }
    }

    /// Applies the post-decode sample fixup: wide-integer expansion, float reconstruction, or
    /// the declared output shift.
    fn fixup_samples(&mut self, out: &mut [i32]) {
        let flags = self.header.flags;
        let shift = self.header.shift();

        if flags.contains(BlockFlags::INT32_DATA) {
            let sent_bits = u32::from(self.int32_state.sent_bits);
            let zeros = u32::from(self.int32_state.zeros);
            let ones = u32::from(self.int32_state.ones);
            let dups = u32::from(self.int32_state.dups);

            let wvx_cursor = self.wvx;

            if let Some(cursor) = wvx_cursor {
                let source: &[u8] =
                    if cursor.in_wvc { &self.block2buff } else { &self.blockbuff };
                let mut reader = BitReader::resume(&source[cursor.start..cursor.end], cursor.state);

                for value in out.iter_mut() {
                    if sent_bits > 0 {
                        let data = reader.get_bits(sent_bits);
                        *value = (*value).wrapping_shl(sent_bits) | data as i32;
                    }

                    if zeros > 0 {
                        *value = (*value).wrapping_shl(zeros);
                    }
                    else if ones > 0 {
                        *value = (*value).wrapping_add(1).wrapping_shl(ones).wrapping_sub(1);
                    }
                    else if dups > 0 {
                        let low = *value & 1;
                        *value = (*value).wrapping_add(low).wrapping_shl(dups).wrapping_sub(low);
                    }

                    let bits = *value as u32;
                    self.crc_x = self
                        .crc_x
                        .wrapping_mul(9)
                        .wrapping_add((bits & 0xffff).wrapping_mul(3))
                        .wrapping_add(bits >> 16);
                }

                if let Some(cursor) = self.wvx.as_mut() {
                    cursor.state = reader.save();
                }
            }
            else if sent_bits > 0 {
                // The literal low bits are gone; approximate them with zeros, scaled back to
                // the right magnitude.
                let total = self.int32_state.total_shift();

                for value in out.iter_mut() {
                    *value = (*value).wrapping_shl(total);
                }
            }
            else {
                // The redundant-bit reductions are deterministic, so they expand exactly even
                // with no side stream.
                for value in out.iter_mut() {
                    if zeros > 0 {
                        *value = (*value).wrapping_shl(zeros);
                    }
                    else if ones > 0 {
                        *value = (*value).wrapping_add(1).wrapping_shl(ones).wrapping_sub(1);
                    }
                    else if dups > 0 {
                        let low = *value & 1;
                        *value = (*value).wrapping_add(low).wrapping_shl(dups).wrapping_sub(low);
                    }
                }
            }
        }

        if flags.contains(BlockFlags::FLOAT_DATA) {
            let wvx_cursor = self.wvx;

            if let Some(cursor) = wvx_cursor {
                let source: &[u8] =
                    if cursor.in_wvc { &self.block2buff } else { &self.blockbuff };
                let mut reader = BitReader::resume(&source[cursor.start..cursor.end], cursor.state);

                float_values(&self.float_state, out, &mut reader, &mut self.crc_x);

                if let Some(cursor) = self.wvx.as_mut() {
                    cursor.state = reader.save();
                }
            }
            else {
                float_values_nowvx(&self.float_state, out);
            }
        }
        else if shift != 0 {
            for value in out.iter_mut() {
                *value = (*value).wrapping_shl(shift);
            }
        }
    }
}

fn accumulate_crc(crc: &mut u32, out: &[i32], mono: bool) {
    if mono {
        for &value in out {
            *crc = crc.wrapping_mul(3).wrapping_add(value as u32);
        }
    }
    else {
        for frame in out.chunks_exact(2) {
            *crc = crc
                .wrapping_mul(9)
                .wrapping_add((frame[0] as u32).wrapping_mul(3))
                .wrapping_add(frame[1] as u32);
        }
    }
}

/// Reads the CHANNEL_INFO sub-block: channel count, optional stream count (six-byte form),
/// and the Microsoft channel mask.
fn read_channel_info(ctx: &mut ContextInfo, data: &[u8]) -> bool {
    if data.is_empty() || data.len() > 6 {
        return false;
    }

    if ctx.num_channels != 0 {
        return true;
    }

    if data.len() == 6 {
        ctx.num_channels = (u32::from(data[0]) | (u32::from(data[2] & 0xf) << 8)) + 1;
        ctx.max_streams = (usize::from(data[1]) | (usize::from(data[2] & 0xf0) << 4)) + 1;

        if (ctx.num_channels as usize) < ctx.max_streams || ctx.max_streams > MAX_STREAMS {
            return false;
        }

        ctx.channel_mask =
            u32::from(data[3]) | u32::from(data[4]) << 8 | u32::from(data[5]) << 16;
    }
    else {
        ctx.num_channels = u32::from(data[0]);

        let mut mask = 0u32;

        for (i, &byte) in data[1..].iter().enumerate() {
            mask |= u32::from(byte) << (i * 8);
        }

        ctx.channel_mask = mask;
    }

    if ctx.num_channels as usize > ctx.max_streams * 2 {
        return false;
    }

    true
}

/// The inverse of one mono decorrelation pass over a buffer of residuals.
fn decorr_mono_pass_inverse(pass: &mut DecorrPass, buffer: &mut [i32]) {
    match pass.term {
        17 => {
            for value in buffer.iter_mut() {
                let sam = pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1]);
                pass.samples_a[1] = pass.samples_a[0];

                let tmp = *value;
                let code = tmp.wrapping_add(apply_weight(pass.weight_a, sam));
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);
                pass.samples_a[0] = code;
                *value = code;
            }
        }
        18 => {
            for value in buffer.iter_mut() {
                let sam = pass.samples_a[0]
                    .wrapping_add(pass.samples_a[0].wrapping_sub(pass.samples_a[1]) >> 1);
                pass.samples_a[1] = pass.samples_a[0];

                let tmp = *value;
                let code = tmp.wrapping_add(apply_weight(pass.weight_a, sam));
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);
                pass.samples_a[0] = code;
                *value = code;
            }
        }
        _ => {
            let mut m = 0usize;
            let mut k = (pass.term & (MAX_TERM - 1)) as usize;

            for value in buffer.iter_mut() {
                let sam = pass.samples_a[m];

                let tmp = *value;
                let code = tmp.wrapping_add(apply_weight(pass.weight_a, sam));
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);
                pass.samples_a[k] = code;
                *value = code;

                m = (m + 1) & (MAX_TERM as usize - 1);
                k = (k + 1) & (MAX_TERM as usize - 1);
            }

            let passes = std::slice::from_mut(pass);
            normalize_history(passes, m);
        }
    }
}

/// The inverse of one stereo decorrelation pass over a buffer of interleaved residuals.
fn decorr_stereo_pass_inverse(pass: &mut DecorrPass, buffer: &mut [i32]) {
    match pass.term {
        17 => {
            for frame in buffer.chunks_exact_mut(2) {
                let sam = pass.samples_a[0].wrapping_mul(2).wrapping_sub(pass.samples_a[1]);
                pass.samples_a[1] = pass.samples_a[0];
                let tmp = frame[0];
                let code = tmp.wrapping_add(apply_weight(pass.weight_a, sam));
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);
                pass.samples_a[0] = code;
                frame[0] = code;

                let sam = pass.samples_b[0].wrapping_mul(2).wrapping_sub(pass.samples_b[1]);
                pass.samples_b[1] = pass.samples_b[0];
                let tmp = frame[1];
                let code = tmp.wrapping_add(apply_weight(pass.weight_b, sam));
                update_weight(&mut pass.weight_b, pass.delta, sam, tmp);
                pass.samples_b[0] = code;
                frame[1] = code;
            }
        }
        18 => {
            for frame in buffer.chunks_exact_mut(2) {
                let sam = pass.samples_a[0]
                    .wrapping_add(pass.samples_a[0].wrapping_sub(pass.samples_a[1]) >> 1);
                pass.samples_a[1] = pass.samples_a[0];
                let tmp = frame[0];
                let code = tmp.wrapping_add(apply_weight(pass.weight_a, sam));
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);
                pass.samples_a[0] = code;
                frame[0] = code;

                let sam = pass.samples_b[0]
                    .wrapping_add(pass.samples_b[0].wrapping_sub(pass.samples_b[1]) >> 1);
                pass.samples_b[1] = pass.samples_b[0];
                let tmp = frame[1];
                let code = tmp.wrapping_add(apply_weight(pass.weight_b, sam));
                update_weight(&mut pass.weight_b, pass.delta, sam, tmp);
                pass.samples_b[0] = code;
                frame[1] = code;
            }
        }
        -1 => {
            for frame in buffer.chunks_exact_mut(2) {
                let sam_a = pass.samples_a[0];
                let tmp = frame[0];
                let left = tmp.wrapping_add(apply_weight(pass.weight_a, sam_a));
                update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, tmp);
                frame[0] = left;

                let tmp = frame[1];
                let right = tmp.wrapping_add(apply_weight(pass.weight_b, left));
                update_weight_clip(&mut pass.weight_b, pass.delta, left, tmp);
                frame[1] = right;

                pass.samples_a[0] = right;
            }
        }
        -2 => {
            for frame in buffer.chunks_exact_mut(2) {
                let sam_b = pass.samples_b[0];
                let tmp = frame[1];
                let right = tmp.wrapping_add(apply_weight(pass.weight_b, sam_b));
                update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, tmp);
                frame[1] = right;

                let tmp = frame[0];
                let left = tmp.wrapping_add(apply_weight(pass.weight_a, right));
                update_weight_clip(&mut pass.weight_a, pass.delta, right, tmp);
                frame[0] = left;

                pass.samples_b[0] = left;
            }
        }
        -3 => {
            for frame in buffer.chunks_exact_mut(2) {
                let sam_a = pass.samples_a[0];
                let sam_b = pass.samples_b[0];

                let tmp = frame[0];
                let left = tmp.wrapping_add(apply_weight(pass.weight_a, sam_a));
                update_weight_clip(&mut pass.weight_a, pass.delta, sam_a, tmp);
                frame[0] = left;

                let tmp = frame[1];
                let right = tmp.wrapping_add(apply_weight(pass.weight_b, sam_b));
                update_weight_clip(&mut pass.weight_b, pass.delta, sam_b, tmp);
                frame[1] = right;

                pass.samples_a[0] = right;
                pass.samples_b[0] = left;
            }
        }
        _ => {
            let mut m = 0usize;
            let mut k = (pass.term & (MAX_TERM - 1)) as usize;

            for frame in buffer.chunks_exact_mut(2) {
                let sam = pass.samples_a[m];
                let tmp = frame[0];
                let code = tmp.wrapping_add(apply_weight(pass.weight_a, sam));
                update_weight(&mut pass.weight_a, pass.delta, sam, tmp);
                pass.samples_a[k] = code;
                frame[0] = code;

                let sam = pass.samples_b[m];
                let tmp = frame[1];
                let code = tmp.wrapping_add(apply_weight(pass.weight_b, sam));
                update_weight(&mut pass.weight_b, pass.delta, sam, tmp);
                pass.samples_b[k] = code;
                frame[1] = code;

                m = (m + 1) & (MAX_TERM as usize - 1);
                k = (k + 1) & (MAX_TERM as usize - 1);
            }

            let passes = std::slice::from_mut(pass);
            normalize_history(passes, m);
        }
    }
}
