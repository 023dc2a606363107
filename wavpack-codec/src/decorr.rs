// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `decorr` module holds the state of the adaptive decorrelation filter chain and the
//! metadata handlers that carry it between blocks.
//!
//! A block encodes up to sixteen sequential passes. Each pass predicts the current sample from
//! its term-specific history (a short within-channel delay, a linear extrapolation, or the
//! opposite channel), subtracts the weighted prediction, and adapts the weight from the signs
//! of the prediction and the residual. Terms, weights, and sample history ride in dedicated
//! sub-blocks so that each block decodes independently; the arrays here are kept in encode
//! order, with the inverse filter applying them back to front.

use wavpack_core::io::WordReader;

use crate::header::BlockFlags;
use crate::words::{restore_weight, store_weight, wp_exp2s, wp_log2s};
use crate::MAX_NTERMS;

/// Largest within-channel delay term; 17 and 18 select the extrapolating predictors.
pub const MAX_TERM: i32 = 8;

/// A preset decorrelation filter, selected by the fast/normal/high/very-high quality option.
pub struct DecorrSpec {
    pub joint_stereo: bool,
    pub delta: i32,
    pub terms: &'static [i32],
}

pub const FAST_SPEC: DecorrSpec = DecorrSpec { joint_stereo: true, delta: 2, terms: &[18, 17] };

pub const DEFAULT_SPEC: DecorrSpec =
    DecorrSpec { joint_stereo: true, delta: 2, terms: &[18, 18, 2, 17, 3] };

pub const HIGH_SPEC: DecorrSpec =
    DecorrSpec { joint_stereo: true, delta: 2, terms: &[18, 18, 18, -2, 2, 3, 5, -1, 17, 4] };

pub const VERY_HIGH_SPEC: DecorrSpec = DecorrSpec {
    joint_stereo: true,
    delta: 2,
    terms: &[18, 18, 2, 3, -2, 18, 2, 4, 7, 5, 3, 6, 8, -1, 18, 2],
};

/// One layer of the decorrelation filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecorrPass {
    pub term: i32,
    pub delta: i32,
    pub weight_a: i32,
    pub weight_b: i32,
    pub samples_a: [i32; MAX_TERM as usize],
    pub samples_b: [i32; MAX_TERM as usize],
    /// Scratch prediction and weighted prediction for the per-sample hybrid loops.
    pub sam_a: i32,
    pub sam_b: i32,
    pub aweight_a: i32,
    pub aweight_b: i32,
}

/// The filter chain for one stream, in encode order.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecorrState {
    pub passes: [DecorrPass; MAX_NTERMS],
    pub num_terms: usize,
}

/// The fixed-point weighted prediction. The wire format depends on this exact expression,
/// including two's-complement wrap of the intermediate arithmetic.
#[inline(always)]
pub fn apply_weight_f(weight: i32, sample: i32) -> i32 {
    (((sample & 0xffff).wrapping_mul(weight) >> 9)
        .wrapping_add(((sample & !0xffff) >> 9).wrapping_mul(weight))
        .wrapping_add(1))
        >> 1
}

/// Fast path of [`apply_weight_f`] for samples that fit in sixteen bits.
#[inline(always)]
pub fn apply_weight_i(weight: i32, sample: i32) -> i32 {
    weight.wrapping_mul(sample).wrapping_add(512) >> 10
}

#[inline(always)]
pub fn apply_weight(weight: i32, sample: i32) -> i32 {
    if sample as i16 as i32 == sample {
        apply_weight_i(weight, sample)
    }
    else {
        apply_weight_f(weight, sample)
    }
}

/// Adapts a weight by `delta` toward agreement of the prediction and residual signs.
#[inline(always)]
pub fn update_weight(weight: &mut i32, delta: i32, source: i32, result: i32) {
    if source != 0 && result != 0 {
        *weight = weight.wrapping_add((((source ^ result) >> 30) | 1).wrapping_mul(delta));
    }
}

/// Weight adaptation for the cross-channel terms, which clips at the nominal range instead of
/// relying on the working headroom.
#[inline(always)]
pub fn update_weight_clip(weight: &mut i32, delta: i32, source: i32, result: i32) {
    if source != 0 && result != 0 {
        if (source ^ result) < 0 {
            *weight -= delta;
            if *weight < -1024 {
                *weight = -1024;
            }
        }
        else {
            *weight += delta;
            if *weight > 1024 {
                *weight = 1024;
            }
        }
    }
}

/// Rotates the history of every delay-term pass so that the buffer cursor restarts at zero for
/// the next block.
pub fn normalize_history(passes: &mut [DecorrPass], m: usize) {
    if m == 0 {
        return;
    }

    for pass in passes.iter_mut() {
        if pass.term > 0 && pass.term <= MAX_TERM {
            let temp_a = pass.samples_a;
            let temp_b = pass.samples_b;

            for k in 0..MAX_TERM as usize {
                pass.samples_a[k] = temp_a[(m + k) & (MAX_TERM as usize - 1)];
                pass.samples_b[k] = temp_b[(m + k) & (MAX_TERM as usize - 1)];
            }
        }
    }
}

fn valid_term(term: i32, flags: BlockFlags) -> bool {
    let in_range =
        (term >= 1 && term <= MAX_TERM) || term == 17 || term == 18 || (term >= -3 && term <= -1);

    in_range && !(flags.is_mono_data() && term < 0)
}

impl DecorrState {
    /// Serializes the term/delta vector for the DECORR_TERMS sub-block.
    pub fn write_terms(&self, out: &mut Vec<u8>) {
        for pass in &self.passes[..self.num_terms] {
            out.push((((pass.term + 5) & 0x1f) | ((pass.delta << 5) & 0xe0)) as u8);
        }
    }

    /// Restores the term/delta vector from a DECORR_TERMS sub-block. Reserved term values and
    /// cross-channel terms in mono streams are rejected.
    pub fn read_terms(&mut self, flags: BlockFlags, data: &[u8]) -> bool {
        if data.len() > MAX_NTERMS {
            return false;
        }

        self.num_terms = data.len();

        for (pass, &byte) in self.passes.iter_mut().zip(data) {
            *pass = DecorrPass {
                term: i32::from(byte & 0x1f) - 5,
                delta: i32::from((byte >> 5) & 0x7),
                ..Default::default()
            };

            if !valid_term(pass.term, flags) {
                return false;
            }
        }

        true
    }

    /// Serializes the weights for the DECORR_WEIGHTS sub-block, dropping trailing passes whose
    /// stored form is zero and requantizing the retained weights so encoder and decoder
    /// continue from identical values.
    pub fn write_weights(&mut self, flags: BlockFlags, out: &mut Vec<u8>) {
        let mono = flags.is_mono_data();
        let mut count = self.num_terms;

        while count > 0 {
            let pass = &self.passes[count - 1];

            if store_weight(pass.weight_a) != 0 || (!mono && store_weight(pass.weight_b) != 0) {
                break;
            }

            count -= 1;
        }

        for i in 0..self.num_terms {
            let pass = &mut self.passes[i];

            if i < count {
                let stored = store_weight(pass.weight_a);
                pass.weight_a = restore_weight(stored);
                out.push(stored as u8);

                if !mono {
                    let stored = store_weight(pass.weight_b);
                    pass.weight_b = restore_weight(stored);
                    out.push(stored as u8);
                }
            }
            else {
                pass.weight_a = 0;
                pass.weight_b = 0;
            }
        }
    }

    /// Restores the weights from a DECORR_WEIGHTS sub-block; unspecified trailing weights are
    /// zero.
    pub fn read_weights(&mut self, flags: BlockFlags, data: &[u8]) -> bool {
        let mono = flags.is_mono_data();
        let count = if mono { data.len() } else { data.len() / 2 };

        if count > self.num_terms {
            return false;
        }

        for pass in self.passes[..self.num_terms].iter_mut() {
            pass.weight_a = 0;
            pass.weight_b = 0;
        }

        for (i, pass) in self.passes[..count].iter_mut().enumerate() {
            if mono {
                pass.weight_a = restore_weight(data[i] as i8);
            }
            else {
                pass.weight_a = restore_weight(data[i * 2] as i8);
                pass.weight_b = restore_weight(data[i * 2 + 1] as i8);
            }
        }

        true
    }

    /// Serializes the sample history for the DECORR_SAMPLES sub-block. Only the first pass's
    /// history is sent (later passes warm up from zero), stored as signed-log values and
    /// requantized locally.
    pub fn write_samples(&mut self, flags: BlockFlags, out: &mut Vec<u8>) {
        let mono = flags.is_mono_data();

        for i in 0..self.num_terms {
            let pass = &mut self.passes[i];

            if i > 0 {
                pass.samples_a = [0; MAX_TERM as usize];
                pass.samples_b = [0; MAX_TERM as usize];
                continue;
            }

            if pass.term > MAX_TERM {
                for k in 0..2 {
                    let log = wp_log2s(pass.samples_a[k]) as u16;
                    pass.samples_a[k] = wp_exp2s(i32::from(log as i16));
                    out.extend_from_slice(&log.to_le_bytes());
                }

                if !mono {
                    for k in 0..2 {
                        let log = wp_log2s(pass.samples_b[k]) as u16;
                        pass.samples_b[k] = wp_exp2s(i32::from(log as i16));
                        out.extend_from_slice(&log.to_le_bytes());
                    }
                }
            }
            else if pass.term < 0 {
                let log = wp_log2s(pass.samples_a[0]) as u16;
                pass.samples_a[0] = wp_exp2s(i32::from(log as i16));
                out.extend_from_slice(&log.to_le_bytes());

                let log = wp_log2s(pass.samples_b[0]) as u16;
                pass.samples_b[0] = wp_exp2s(i32::from(log as i16));
                out.extend_from_slice(&log.to_le_bytes());
            }
            else {
                for m in 0..pass.term as usize {
                    let log = wp_log2s(pass.samples_a[m]) as u16;
                    pass.samples_a[m] = wp_exp2s(i32::from(log as i16));
                    out.extend_from_slice(&log.to_le_bytes());

                    if !mono {
                        let log = wp_log2s(pass.samples_b[m]) as u16;
                        pass.samples_b[m] = wp_exp2s(i32::from(log as i16));
                        out.extend_from_slice(&log.to_le_bytes());
                    }
                }
            }
        }
    }

    /// Restores the sample history from a DECORR_SAMPLES sub-block. Terms must have been read
    /// first since they dictate the per-pass layout.
    pub fn read_samples(&mut self, flags: BlockFlags, data: &[u8]) -> bool {
        let mono = flags.is_mono_data();
        let mut reader = WordReader::new(data);

        for pass in self.passes[..self.num_terms].iter_mut() {
            pass.samples_a = [0; MAX_TERM as usize];
            pass.samples_b = [0; MAX_TERM as usize];
        }

        fn read_log(reader: &mut WordReader<'_>) -> Option<i32> {
            reader.word().map(|log| wp_exp2s(i32::from(log as i16)))
        }

        for pass in self.passes[..self.num_terms].iter_mut() {
            if reader.is_empty() {
                break;
            }

            if pass.term > MAX_TERM {
                for k in 0..2 {
                    match read_log(&mut reader) {
                        Some(value) => pass.samples_a[k] = value,
                        None => return false,
                    }
                }

                if !mono {
                    for k in 0..2 {
                        match read_log(&mut reader) {
                            Some(value) => pass.samples_b[k] = value,
                            None => return false,
                        }
                    }
                }
            }
            else if pass.term < 0 {
                match read_log(&mut reader) {
                    Some(value) => pass.samples_a[0] = value,
                    None => return false,
                }

                match read_log(&mut reader) {
                    Some(value) => pass.samples_b[0] = value,
                    None => return false,
                }
            }
            else {
                for m in 0..pass.term as usize {
                    match read_log(&mut reader) {
                        Some(value) => pass.samples_a[m] = value,
                        None => return false,
                    }

                    if !mono {
                        match read_log(&mut reader) {
                            Some(value) => pass.samples_b[m] = value,
                            None => return false,
                        }
                    }
                }
            }
        }

        reader.is_empty()
    }
}

/// Hybrid noise-shaping state carried between blocks via the SHAPING_WEIGHTS sub-block of the
/// correction stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShapingState {
    /// Accumulated quantization error, per channel.
    pub error: [i32; 2],
    /// Shaping weight accumulator (weight in the high sixteen bits), per channel.
    pub shaping_acc: [i32; 2],
    /// Per-sample ramp applied to the accumulator, per channel.
    pub shaping_delta: [i32; 2],
}

impl ShapingState {
    /// Serializes the shaping state, requantizing the local copies.
    pub fn write_shaping_info(&mut self, flags: BlockFlags, out: &mut Vec<u8>) {
        let mono = flags.is_mono_data();
        let channels = if mono { 1 } else { 2 };

        for ch in 0..channels {
            let log = wp_log2s(self.error[ch]) as u16;
            self.error[ch] = wp_exp2s(i32::from(log as i16));
            out.extend_from_slice(&log.to_le_bytes());

            let log = wp_log2s(self.shaping_acc[ch]) as u16;
            self.shaping_acc[ch] = wp_exp2s(i32::from(log as i16));
            out.extend_from_slice(&log.to_le_bytes());
        }

        if self.shaping_delta[0] != 0 || self.shaping_delta[1] != 0 {
            for ch in 0..channels {
                let log = wp_log2s(self.shaping_delta[ch]) as u16;
                self.shaping_delta[ch] = wp_exp2s(i32::from(log as i16));
                out.extend_from_slice(&log.to_le_bytes());
            }
        }
    }

    /// Restores the shaping state. The two-byte legacy form carries just the accumulators as
    /// stored weights.
    pub fn read_shaping_info(&mut self, flags: BlockFlags, data: &[u8]) -> bool {
        let mono = flags.is_mono_data();

        if data.len() == 2 {
            self.shaping_acc[0] = restore_weight(data[0] as i8) << 16;
            self.shaping_acc[1] = restore_weight(data[1] as i8) << 16;
            return true;
        }

        let need = if mono { 4 } else { 8 };

        if data.len() < need {
            return false;
        }

        let log_at = |pos: usize| -> i32 {
            wp_exp2s(i32::from(i16::from_le_bytes([data[pos], data[pos + 1]])))
        };

        self.error[0] = log_at(0);
        self.shaping_acc[0] = log_at(2);
        let mut pos = 4;

        if !mono {
            self.error[1] = log_at(4);
            self.shaping_acc[1] = log_at(6);
            pos = 8;
        }

        let delta_len = if mono { 2 } else { 4 };

        if data.len() == pos + delta_len {
            self.shaping_delta[0] = log_at(pos);

            if !mono {
                self.shaping_delta[1] = log_at(pos + 2);
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_apply_weight_expression() {
        // The 16-bit fast path must agree with the full-precision form over its whole domain.
        assert_eq!(apply_weight_f(1024, 1 << 20), 1 << 20);
        assert_eq!(apply_weight_f(-1024, 1 << 20), -(1 << 20));
        assert_eq!(apply_weight_f(512, 1000), 500);

        for &weight in &[-1024, -700, -1, 0, 1, 37, 512, 1024] {
            for &sample in &[-32768, -32767, -1, 0, 1, 100, 32767] {
                assert_eq!(
                    apply_weight_i(weight, sample),
                    apply_weight_f(weight, sample),
                    "weight {} sample {}",
                    weight,
                    sample
                );
            }
        }
    }

    #[test]
    fn verify_update_weight_direction() {
        let mut weight = 0;
        update_weight(&mut weight, 2, 100, 50);
        assert_eq!(weight, 2);

        update_weight(&mut weight, 2, -100, -50);
        assert_eq!(weight, 4);

        update_weight(&mut weight, 2, 100, -50);
        assert_eq!(weight, 2);

        // Zero prediction or residual leaves the weight alone.
        update_weight(&mut weight, 2, 0, 50);
        update_weight(&mut weight, 2, 100, 0);
        assert_eq!(weight, 2);

        let mut weight = 1023;
        update_weight_clip(&mut weight, 2, 10, 10);
        assert_eq!(weight, 1024);

        let mut weight = -1023;
        update_weight_clip(&mut weight, 2, 10, -10);
        assert_eq!(weight, -1024);
    }

    #[test]
    fn verify_terms_roundtrip() {
        let mut state = DecorrState::default();
        state.num_terms = HIGH_SPEC.terms.len();

        for (pass, &term) in state.passes.iter_mut().zip(HIGH_SPEC.terms) {
            pass.term = term;
            pass.delta = HIGH_SPEC.delta;
        }

        let mut out = Vec::new();
        state.write_terms(&mut out);

        let mut restored = DecorrState::default();
        assert!(restored.read_terms(BlockFlags::empty(), &out));
        assert_eq!(restored.num_terms, state.num_terms);

        for (a, b) in restored.passes.iter().zip(&state.passes).take(state.num_terms) {
            assert_eq!(a.term, b.term);
            assert_eq!(a.delta, b.delta);
        }

        // Cross-channel terms are not allowed in mono streams.
        assert!(!restored.read_terms(BlockFlags::MONO, &out));
    }

    #[test]
    fn verify_weights_samples_roundtrip() {
        let mut state = DecorrState::default();
        state.num_terms = 4;
        state.passes[0].term = 18;
        state.passes[1].term = 17;
        state.passes[2].term = 3;
        state.passes[3].term = -1;

        state.passes[0].weight_a = 431;
        state.passes[0].weight_b = -1000;
        state.passes[1].weight_a = -88;
        state.passes[2].weight_b = 1024;
        state.passes[0].samples_a = [12345, -678, 0, 0, 0, 0, 0, 0];
        state.passes[0].samples_b = [-99999, 4, 0, 0, 0, 0, 0, 0];

        let mut weights = Vec::new();
        state.write_weights(BlockFlags::empty(), &mut weights);

        let mut samples = Vec::new();
        state.write_samples(BlockFlags::empty(), &mut samples);

        // After writing, the local state holds the requantized values the decoder will see.
        let mut restored = state;

        assert!(restored.read_weights(BlockFlags::empty(), &weights));
        assert!(restored.read_samples(BlockFlags::empty(), &samples));

        for (a, b) in restored.passes.iter().zip(&state.passes).take(state.num_terms) {
            assert_eq!(a.weight_a, b.weight_a);
            assert_eq!(a.weight_b, b.weight_b);
            assert_eq!(a.samples_a, b.samples_a);
            assert_eq!(a.samples_b, b.samples_b);
        }

        // Truncated sample payloads must be rejected.
        assert!(!restored.read_samples(BlockFlags::empty(), &samples[..samples.len() - 1]));
    }
}
