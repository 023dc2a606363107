// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `floats` module handles IEEE 32-bit float data.
//!
//! No floating-point arithmetic is involved: samples are processed as raw bit patterns. The
//! mantissa (with its implicit one) is aligned to the block's maximum exponent to form the
//! integer that goes through the decorrelator, and everything that alignment discards --
//! shifted-out mantissa bits, subnormals, signed zeros, infinities and NaNs -- is carried in
//! the wvx side stream so the decoder can restore the exact bit pattern.

use wavpack_core::io::bit::{BitReader, BitWriter};

/// Shifted-out mantissa bits were all ones.
pub const FLOAT_SHIFT_ONES: u8 = 1;
/// Shifted-out mantissa bits were identical per sample; one bit each rides in wvx.
pub const FLOAT_SHIFT_SAME: u8 = 2;
/// Shifted-out mantissa bits are sent literally in wvx.
pub const FLOAT_SHIFT_SENT: u8 = 4;
/// Values that collapsed to integer zero were not all true zeros; wvx disambiguates.
pub const FLOAT_ZEROS_SENT: u8 = 8;
/// Negative zeros are present; their sign bit rides in wvx.
pub const FLOAT_NEG_ZEROS: u8 = 0x10;
/// Infinities or NaNs are present.
pub const FLOAT_EXCEPTIONS: u8 = 0x20;

#[inline(always)]
fn get_mantissa(bits: u32) -> u32 {
    bits & 0x7f_ffff
}

#[inline(always)]
fn get_exponent(bits: u32) -> u32 {
    (bits >> 23) & 0xff
}

#[inline(always)]
fn get_sign(bits: u32) -> u32 {
    bits >> 31
}

#[inline(always)]
fn make_float(sign: u32, exponent: u32, mantissa: u32) -> u32 {
    (sign << 31) | (exponent << 23) | (mantissa & 0x7f_ffff)
}

/// Per-block float reconstruction parameters, carried in the FLOAT_INFO sub-block.
#[derive(Clone, Copy, Debug, Default)]
pub struct FloatState {
    pub flags: u8,
    pub shift: u8,
    pub max_exp: u8,
    pub norm_exp: u8,
    /// Checksum of the original float bit patterns, leading the wvx payload.
    pub crc: u32,
}

impl FloatState {
    /// True when lossless reconstruction requires the wvx stream.
    pub fn needs_wvx(&self) -> bool {
        self.flags & (FLOAT_EXCEPTIONS | FLOAT_ZEROS_SENT | FLOAT_SHIFT_SENT | FLOAT_SHIFT_SAME)
            != 0
    }

    pub fn write_float_info(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.flags, self.shift, self.max_exp, self.norm_exp]);
    }

    pub fn read_float_info(&mut self, data: &[u8]) -> bool {
        if data.len() != 4 {
            return false;
        }

        self.flags = data[0];
        self.shift = data[1];
        self.max_exp = data[2];
        self.norm_exp = data[3];
        true
    }
}

/// Classifies a buffer of float bit patterns and converts it in place to the aligned integers
/// the decorrelator consumes. Returns the resulting magnitude in bits for the header flags.
/// The original bit patterns must be preserved separately if [`send_float_data`] is to follow.
pub fn scan_float_data(state: &mut FloatState, norm_exp: u8, values: &mut [i32]) -> u32 {
    let mut shifted_ones = 0u32;
    let mut shifted_zeros = 0u32;
    let mut shifted_both = 0u32;
    let mut false_zeros = 0u32;
    let mut neg_zeros = 0u32;
    let mut ordata = 0u32;
    let mut crc = 0xffff_ffffu32;
    let mut max_exp = 0u32;

    state.shift = 0;
    state.flags = 0;
    state.norm_exp = norm_exp;

    for &value in values.iter() {
        let bits = value as u32;

        crc = crc
            .wrapping_mul(27)
            .wrapping_add(get_mantissa(bits).wrapping_mul(9))
            .wrapping_add(get_exponent(bits).wrapping_mul(3))
            .wrapping_add(get_sign(bits));

        if get_exponent(bits) > max_exp && get_exponent(bits) < 255 {
            max_exp = get_exponent(bits);
        }
    }

    state.crc = crc;

    for value in values.iter_mut() {
        let bits = *value as u32;
        let shift_count;
        let mut mag;

        if get_exponent(bits) == 255 {
            state.flags |= FLOAT_EXCEPTIONS;
            mag = 0x100_0000;
            shift_count = 0;
        }
        else if get_exponent(bits) > 0 {
            shift_count = max_exp - get_exponent(bits);
            mag = 0x80_0000 + get_mantissa(bits);
        }
        else {
            shift_count = if max_exp > 0 { max_exp - 1 } else { 0 };
            mag = get_mantissa(bits);
        }

        if shift_count < 25 {
            mag >>= shift_count;
        }
        else {
            mag = 0;
        }

        if mag == 0 {
            if get_exponent(bits) != 0 || get_mantissa(bits) != 0 {
                false_zeros += 1;
            }
            else if get_sign(bits) != 0 {
                neg_zeros += 1;
            }
        }
        else if shift_count > 0 {
            let mask = (1u32 << shift_count) - 1;

            if get_mantissa(bits) & mask == 0 {
                shifted_zeros += 1;
            }
            else if get_mantissa(bits) & mask == mask {
                shifted_ones += 1;
            }
            else {
                shifted_both += 1;
            }
        }

        ordata |= mag;
        *value = if get_sign(bits) != 0 { -(mag as i32) } else { mag as i32 };
    }

    state.max_exp = max_exp as u8;

    if shifted_both != 0 {
        state.flags |= FLOAT_SHIFT_SENT;
    }
    else if shifted_ones != 0 && shifted_zeros == 0 {
        state.flags |= FLOAT_SHIFT_ONES;
    }
    else if shifted_ones != 0 && shifted_zeros != 0 {
        state.flags |= FLOAT_SHIFT_SAME;
    }
    else if ordata != 0 && ordata & 1 == 0 {
        while ordata & 1 == 0 {
            state.shift += 1;
            ordata >>= 1;
        }

        for value in values.iter_mut() {
            *value >>= state.shift;
        }
    }

    if false_zeros != 0 || neg_zeros != 0 {
        state.flags |= FLOAT_ZEROS_SENT;
    }

    if neg_zeros != 0 {
        state.flags |= FLOAT_NEG_ZEROS;
    }

    let mut mag_bits = 0;
    while ordata != 0 {
        mag_bits += 1;
        ordata >>= 1;
    }

    mag_bits
}

/// Emits the wvx side data for a buffer of original float bit patterns, following the
/// classification recorded by [`scan_float_data`].
pub fn send_float_data(state: &FloatState, values: &[i32], wvx: &mut BitWriter<'_>) {
    let max_exp = u32::from(state.max_exp);

    for &value in values {
        let bits = value as u32;
        let shift_count;
        let mut mag;

        if get_exponent(bits) == 255 {
            if get_mantissa(bits) != 0 {
                wvx.put_bit(1);
                wvx.put_bits(get_mantissa(bits), 23);
            }
            else {
                wvx.put_bit(0);
            }

            mag = 0x100_0000;
            shift_count = 0;
        }
        else if get_exponent(bits) > 0 {
            shift_count = max_exp - get_exponent(bits);
            mag = 0x80_0000 + get_mantissa(bits);
        }
        else {
            shift_count = if max_exp > 0 { max_exp - 1 } else { 0 };
            mag = get_mantissa(bits);
        }

        if shift_count < 25 {
            mag >>= shift_count;
        }
        else {
            mag = 0;
        }

        if mag == 0 {
            if state.flags & FLOAT_ZEROS_SENT != 0 {
                if get_exponent(bits) != 0 || get_mantissa(bits) != 0 {
                    wvx.put_bit(1);
                    wvx.put_bits(get_mantissa(bits), 23);

                    if max_exp >= 25 {
                        wvx.put_bits(get_exponent(bits), 8);
                    }

                    wvx.put_bit(get_sign(bits));
                }
                else {
                    wvx.put_bit(0);

                    if state.flags & FLOAT_NEG_ZEROS != 0 {
                        wvx.put_bit(get_sign(bits));
                    }
                }
            }
        }
        else if shift_count > 0 {
            if state.flags & FLOAT_SHIFT_SENT != 0 {
                wvx.put_bits(get_mantissa(bits) & ((1 << shift_count) - 1), shift_count);
            }
            else if state.flags & FLOAT_SHIFT_SAME != 0 {
                wvx.put_bit(get_mantissa(bits) & 1);
            }
        }
    }
}

/// Reconstructs float bit patterns in place from decoded integers and the wvx stream,
/// accumulating the float checksum (caller-seeded) for comparison against the stored one.
pub fn float_values(
    state: &FloatState,
    values: &mut [i32],
    wvx: &mut BitReader<'_>,
    crc: &mut u32,
) {
    for value in values.iter_mut() {
        let mut exp = u32::from(state.max_exp);
        let mut shift_count = 0;
        let mut out = 0u32;

        if *value == 0 {
            if state.flags & FLOAT_ZEROS_SENT != 0 {
                if wvx.get_bit() != 0 {
                    let mantissa = wvx.get_bits(23);
                    let exponent = if exp >= 25 { wvx.get_bits(8) } else { 0 };
                    out = make_float(wvx.get_bit(), exponent, mantissa);
                }
                else if state.flags & FLOAT_NEG_ZEROS != 0 {
                    out = make_float(wvx.get_bit(), 0, 0);
                }
            }
        }
        else {
            let mut mag = (*value).wrapping_shl(u32::from(state.shift)) as u32;
            let mut sign = 0;

            if (mag as i32) < 0 {
                mag = (mag as i32).wrapping_neg() as u32;
                sign = 1;
            }

            if mag == 0x100_0000 {
                let mantissa = if wvx.get_bit() != 0 { wvx.get_bits(23) } else { 0 };
                out = make_float(sign, 255, mantissa);
            }
            else {
                if exp > 0 {
                    while mag & 0x80_0000 == 0 {
                        exp -= 1;

                        if exp == 0 {
                            break;
                        }

                        shift_count += 1;
                        mag <<= 1;
                    }
                }

                if shift_count > 0 {
                    if state.flags & FLOAT_SHIFT_ONES != 0
                        || (state.flags & FLOAT_SHIFT_SAME != 0 && wvx.get_bit() != 0)
                    {
                        mag |= (1 << shift_count) - 1;
                    }
                    else if state.flags & FLOAT_SHIFT_SENT != 0 {
                        mag |= wvx.get_bits(shift_count) & ((1 << shift_count) - 1);
                    }
                }

                out = make_float(sign, exp, mag);
            }
        }

        *crc = crc
            .wrapping_mul(27)
            .wrapping_add(get_mantissa(out).wrapping_mul(9))
            .wrapping_add(get_exponent(out).wrapping_mul(3))
            .wrapping_add(get_sign(out));

        *value = out as i32;
    }
}

/// Approximate float reconstruction for when the wvx stream is absent (hybrid lossy decodes);
/// discarded detail is filled with the statistically likely bits.
pub fn float_values_nowvx(state: &FloatState, values: &mut [i32]) {
    for value in values.iter_mut() {
        let mut exp = u32::from(state.max_exp);
        let mut shift_count = 0;
        let mut out = 0u32;

        if *value != 0 {
            let mut mag = (*value).wrapping_shl(u32::from(state.shift)) as u32;
            let mut sign = 0;

            if (mag as i32) < 0 {
                mag = (mag as i32).wrapping_neg() as u32;
                sign = 1;
            }

            if mag >= 0x100_0000 {
                while mag & 0xf00_0000 != 0 {
                    mag >>= 1;
                    exp += 1;
                }
            }
            else if exp > 0 {
                while mag & 0x80_0000 == 0 {
                    exp -= 1;

                    if exp == 0 {
                        break;
                    }

                    shift_count += 1;
                    mag <<= 1;
                }
            }

            if shift_count > 0 && state.flags & FLOAT_SHIFT_ONES != 0 {
                mag |= (1 << shift_count) - 1;
            }

            out = make_float(sign, exp.min(255), mag);
        }

        *value = out as i32;
    }
}

/// Adjusts the exponents of float bit patterns by `delta_exp`, saturating at the format
/// limits. Used to normalize decoded floats to the +/-1.0 convention.
pub fn float_normalize(values: &mut [i32], delta_exp: i32) {
    if delta_exp == 0 {
        return;
    }

    for value in values.iter_mut() {
        let bits = *value as u32;
        let exp = get_exponent(bits) as i32;

        if exp == 0 || exp + delta_exp <= 0 {
            *value = 0;
        }
        else if exp == 255 {
            // Leave infinities and NaNs alone.
        }
        else if exp + delta_exp >= 255 {
            *value = make_float(get_sign(bits), 255, 0) as i32;
        }
        else {
            *value = make_float(get_sign(bits), (exp + delta_exp) as u32, get_mantissa(bits)) as i32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavpack_core::io::bit::{BitReader, BitWriter};

    fn roundtrip(patterns: &[f32]) {
        let original: Vec<i32> = patterns.iter().map(|f| f.to_bits() as i32).collect();
        let mut working = original.clone();

        let mut state = FloatState::default();
        scan_float_data(&mut state, 127, &mut working);

        let mut wvx_buf = vec![0u8; original.len() * 8 + 16];
        let mut wvx = BitWriter::new(&mut wvx_buf);
        send_float_data(&state, &original, &mut wvx);
        let written = wvx.close().unwrap();

        let stored_crc = state.crc;

        let mut wvx = BitReader::new(&wvx_buf[..written]);
        let mut crc = 0xffff_ffffu32;
        float_values(&state, &mut working, &mut wvx, &mut crc);

        assert!(!wvx.is_error());
        assert_eq!(crc, stored_crc, "float crc mismatch");

        for (restored, expected) in working.iter().zip(&original) {
            assert_eq!(
                *restored as u32, *expected as u32,
                "bit pattern {:08x} not restored",
                *expected as u32
            );
        }
    }

    #[test]
    fn verify_float_roundtrip_ordinary() {
        roundtrip(&[0.0, 1.0, -1.0, 0.5, -0.25, 123.456, -7890.123, 1.0e-3, 3.21e4]);
    }

    #[test]
    fn verify_float_roundtrip_edge_cases() {
        roundtrip(&[
            0.0,
            -0.0,
            f32::INFINITY,
            f32::NEG_INFINITY,
            f32::NAN,
            f32::MIN_POSITIVE,
            // Subnormals.
            f32::from_bits(1),
            f32::from_bits(0x0000_7fff),
            -f32::from_bits(0x0034_5678),
            f32::MAX,
            f32::MIN,
            1.0,
        ]);
    }

    #[test]
    fn verify_float_roundtrip_mixed_magnitudes() {
        // Wildly different exponents force shifted-bit side data.
        roundtrip(&[1.0e30, 1.0, 1.0e-30, -1.0e20, 0.1, 7.0e-40, -0.0, 655.35]);
    }

    #[test]
    fn verify_normalize() {
        let one = 1.0f32.to_bits() as i32;
        let mut values = [one];

        float_normalize(&mut values, 1);
        assert_eq!(f32::from_bits(values[0] as u32), 2.0);

        float_normalize(&mut values, -2);
        assert_eq!(f32::from_bits(values[0] as u32), 0.5);

        // Saturation to zero and infinity.
        let mut values = [one, one];
        float_normalize(&mut values[..1], -200);
        assert_eq!(values[0], 0);

        float_normalize(&mut values[1..], 200);
        assert_eq!(f32::from_bits(values[1] as u32), f32::INFINITY);
    }
}
