// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end encode/decode tests for the WavPack codec.

use std::io::Cursor;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use wavpack_codec::decoder::{OpenFlags, OpenOptions, WavpackDecoder};
use wavpack_codec::encoder::{BlockTarget, ConfigFlags, EncoderConfig, WavpackEncoder};
use wavpack_core::io::MediaSource;

/// Encodes the interleaved samples, returning the wv blocks (individually and concatenated)
/// and the concatenated wvc stream.
fn encode(
    config: &EncoderConfig,
    total_samples: Option<u64>,
    samples: &[i32],
) -> (Vec<Vec<u8>>, Vec<u8>, Vec<u8>) {
    let mut wv_blocks: Vec<Vec<u8>> = Vec::new();
    let mut wvc = Vec::new();

    {
        let mut encoder = WavpackEncoder::new(|target: BlockTarget, block: &[u8]| {
            match target {
                BlockTarget::Wv => wv_blocks.push(block.to_vec()),
                BlockTarget::Wvc => wvc.extend_from_slice(block),
            }
            true
        });

        encoder.set_configuration(config, total_samples).unwrap();
        encoder.pack_init().unwrap();

        let count = samples.len() as u32 / config.num_channels;
        encoder.pack_samples(samples, count).unwrap();
        encoder.flush_samples().unwrap();
    }

    let mut wv = Vec::new();
    for block in &wv_blocks {
        wv.extend_from_slice(block);
    }

    (wv_blocks, wv, wvc)
}

fn open_decoder(wv: &[u8], wvc: Option<&[u8]>, flags: OpenFlags) -> WavpackDecoder {
    let source = Box::new(Cursor::new(wv.to_vec()));
    let wvc_source =
        wvc.map(|bytes| Box::new(Cursor::new(bytes.to_vec())) as Box<dyn MediaSource>);

    WavpackDecoder::open(source, wvc_source, &OpenOptions { flags, norm_offset: 0 }).unwrap()
}

/// Decodes everything, returning the decoder (for querying counters) and the samples.
fn decode(wv: &[u8], wvc: Option<&[u8]>, flags: OpenFlags) -> (WavpackDecoder, Vec<i32>) {
    let mut decoder = open_decoder(wv, wvc, flags);
    let channels = decoder.reduced_channels().unwrap_or(decoder.num_channels()) as usize;

    let mut output = Vec::new();
    let mut buffer = vec![0i32; 4096 * channels];

    loop {
        let unpacked = decoder.unpack_samples(&mut buffer, 4096);

        if unpacked == 0 {
            break;
        }

        output.extend_from_slice(&buffer[..unpacked as usize * channels]);
    }

    (decoder, output)
}

fn noise(len: usize, bits: u32, seed: u64) -> Vec<i32> {
    let mut rng = SmallRng::seed_from_u64(seed);

    if bits == 32 {
        return (0..len).map(|_| rng.random::<i32>()).collect();
    }

    let limit = 1i32 << (bits - 1);
    (0..len).map(|_| rng.random_range(-limit..limit)).collect()
}

#[test]
fn scenario_silence_stereo() {
    // One second of 16-bit/44100/stereo silence, lossless defaults.
    let samples = vec![0i32; 88200 * 2];
    let config = EncoderConfig::default();

    let (blocks, wv, _) = encode(&config, Some(88200), &samples);

    // The default block sizing yields 22050-sample blocks.
    assert_eq!(blocks.len(), 4);

    // The stored CRC must match the value computed directly from the defining recurrence.
    let mut expected_crc = 0xffff_ffffu32;
    for _ in 0..22050 {
        expected_crc = expected_crc.wrapping_mul(9);
    }

    let stored_crc = u32::from_le_bytes(blocks[0][28..32].try_into().unwrap());
    assert_eq!(stored_crc, expected_crc);

    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(decoder.num_samples(), Some(88200));
    assert_eq!(decoder.sample_rate(), 44100);
    assert_eq!(decoder.bits_per_sample(), 16);
    assert_eq!(decoder.num_channels(), 2);
    assert_eq!(decoder.num_errors(), 0);
    assert_eq!(output, samples);
}

#[test]
fn scenario_ramp_mono() {
    // A signed ramp in mono 16-bit; term 17 prediction makes short work of it.
    let samples: Vec<i32> = (0..1000).collect();
    let config = EncoderConfig { num_channels: 1, ..Default::default() };

    let (_, wv, _) = encode(&config, Some(1000), &samples);
    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(output, samples);
    assert_eq!(decoder.num_errors(), 0);
    assert!(!decoder.lossy_blocks());
}

#[test]
fn verify_lossless_stereo_noise() {
    for bits in [8u32, 16, 24] {
        let samples = noise(8192 * 2, bits, 7 + u64::from(bits));

        let config = EncoderConfig {
            bits_per_sample: bits,
            bytes_per_sample: (bits + 7) / 8,
            ..Default::default()
        };

        let (_, wv, _) = encode(&config, Some(8192), &samples);
        let (decoder, output) = decode(&wv, None, OpenFlags::empty());

        assert_eq!(output, samples, "{} bit noise", bits);
        assert_eq!(decoder.num_errors(), 0);
    }
}

#[test]
fn verify_lossless_presets() {
    let samples: Vec<i32> = (0..4096 * 2)
        .map(|i| {
            let t = (i / 2) as f64 / 50.0;
            let phase = if i % 2 == 0 { 0.0 } else { 0.5 };
            ((t + phase).sin() * 10000.0) as i32
        })
        .collect();

    for flags in [
        ConfigFlags::FAST_FLAG,
        ConfigFlags::empty(),
        ConfigFlags::HIGH_FLAG,
        ConfigFlags::VERY_HIGH_FLAG,
    ] {
        let config = EncoderConfig { flags, ..Default::default() };

        let (_, wv, _) = encode(&config, Some(4096), &samples);
        let (_, output) = decode(&wv, None, OpenFlags::empty());

        assert_eq!(output, samples, "preset {:?}", flags);
    }
}

#[test]
fn scenario_hybrid_with_correction() {
    // 24-bit stereo noise, hybrid at 3.0 bits/sample with a correction stream.
    let samples = noise(4096 * 2, 24, 99);

    let config = EncoderConfig {
        flags: ConfigFlags::HYBRID_FLAG | ConfigFlags::CREATE_WVC,
        bitrate: 3.0,
        bits_per_sample: 24,
        bytes_per_sample: 3,
        ..Default::default()
    };

    let (_, wv, wvc) = encode(&config, Some(4096), &samples);

    assert!(!wvc.is_empty());

    // With the correction stream the decode is bit-exact.
    let (decoder, output) = decode(&wv, Some(&wvc), OpenFlags::WVC);
    assert_eq!(output, samples);
    assert_eq!(decoder.num_errors(), 0);
    assert!(decoder.mode().contains(wavpack_codec::decoder::Mode::WVC));

    // Without it the decode is lossy but bounded, and flagged as such.
    let (decoder, lossy) = decode(&wv, None, OpenFlags::empty());
    assert_eq!(lossy.len(), samples.len());
    assert!(decoder.lossy_blocks());

    let max_error = samples
        .iter()
        .zip(&lossy)
        .map(|(a, b)| (i64::from(*a) - i64::from(*b)).unsigned_abs())
        .max()
        .unwrap();

    assert!(max_error > 0, "3 bits/sample cannot be lossless for 24-bit noise");
    assert!(max_error < 1 << 23, "hybrid error exceeds the sample magnitude");

    // A higher bitrate must reduce the error on identical input.
    let config6 = EncoderConfig { bitrate: 6.0, ..config.clone() };
    let (_, wv6, _) = encode(&config6, Some(4096), &samples);
    let (_, lossy6) = decode(&wv6, None, OpenFlags::empty());

    let sum_error = |decoded: &[i32]| -> u64 {
        samples
            .iter()
            .zip(decoded)
            .map(|(a, b)| (i64::from(*a) - i64::from(*b)).unsigned_abs())
            .sum()
    };

    assert!(sum_error(&lossy6) < sum_error(&lossy));
}

#[test]
fn verify_hybrid_mono_silence_and_tone() {
    let mut samples = vec![0i32; 3000];
    samples.extend((0..3000).map(|i| ((i as f64 / 13.0).sin() * 3000.0) as i32));

    let config = EncoderConfig {
        flags: ConfigFlags::HYBRID_FLAG | ConfigFlags::CREATE_WVC,
        bitrate: 4.0,
        num_channels: 1,
        ..Default::default()
    };

    let (_, wv, wvc) = encode(&config, Some(6000), &samples);
    let (_, output) = decode(&wv, Some(&wvc), OpenFlags::WVC);

    assert_eq!(output, samples);
}

#[test]
fn verify_float_roundtrip() {
    // Invariant: float decoding restores the exact bit pattern, specials included.
    let mut rng = SmallRng::seed_from_u64(1234);
    let mut samples: Vec<i32> = (0..4000 * 2)
        .map(|_| {
            let value: f32 = rng.random_range(-1.0f32..1.0f32);
            value.to_bits() as i32
        })
        .collect();

    samples[17] = f32::INFINITY.to_bits() as i32;
    samples[18] = f32::NEG_INFINITY.to_bits() as i32;
    samples[19] = f32::NAN.to_bits() as i32;
    samples[20] = (-0.0f32).to_bits() as i32;
    samples[21] = 0;
    samples[22] = f32::from_bits(0x0000_1234).to_bits() as i32;

    let config = EncoderConfig {
        bits_per_sample: 32,
        bytes_per_sample: 4,
        float_norm_exp: 127,
        ..Default::default()
    };

    let (_, wv, _) = encode(&config, Some(4000), &samples);
    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert!(decoder.mode().contains(wavpack_codec::decoder::Mode::FLOAT));
    assert!(!decoder.lossy_blocks());
    assert_eq!(decoder.float_norm_exp(), 127);

    for (i, (restored, expected)) in output.iter().zip(&samples).enumerate() {
        assert_eq!(*restored as u32, *expected as u32, "float sample {}", i);
    }
}

#[test]
fn verify_int32_roundtrip() {
    // Full 32-bit data exercises the wvx split; scaled data exercises the common-zeros path.
    let full = noise(3000 * 2, 32, 5150);

    let config = EncoderConfig {
        bits_per_sample: 32,
        bytes_per_sample: 4,
        ..Default::default()
    };

    let (_, wv, _) = encode(&config, Some(3000), &full);
    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(output, full);
    assert!(!decoder.lossy_blocks());

    let scaled: Vec<i32> = noise(3000 * 2, 20, 51).iter().map(|v| v << 8).collect();
    let (_, wv, _) = encode(&config, Some(3000), &scaled);
    let (_, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(output, scaled);
}

#[test]
fn verify_joint_stereo_involution() {
    // Invariant: the joint-stereo transform and its inverse are exact for any 32-bit pair.
    let mut rng = SmallRng::seed_from_u64(42);

    for _ in 0..100_000 {
        let left: i32 = rng.random();
        let right: i32 = rng.random();

        let joint_l = left.wrapping_sub(right);
        let joint_r = right.wrapping_add(joint_l >> 1);

        let out_r = joint_r.wrapping_sub(joint_l >> 1);
        let out_l = joint_l.wrapping_add(out_r);

        assert_eq!((out_l, out_r), (left, right));
    }
}

#[test]
fn verify_header_resync() {
    let samples = noise(3000 * 2, 16, 31);
    let (_, wv, _) = encode(&EncoderConfig::default(), Some(3000), &samples);

    // Prepending garbage up to the scan limit still decodes identically.
    let mut prefixed = vec![0xa5u8; 100_000];
    prefixed.extend_from_slice(&wv);

    let (_, output) = decode(&prefixed, None, OpenFlags::empty());
    assert_eq!(output, samples);

    // One byte past the limit and the header is not found.
    let mut prefixed = vec![0xa5u8; (1 << 20) + 1];
    prefixed.extend_from_slice(&wv);

    let source = Box::new(Cursor::new(prefixed));
    assert!(WavpackDecoder::open(source, None, &OpenOptions::default()).is_err());
}

#[test]
fn scenario_corrupt_block() {
    // Corrupting one byte mid-stream silences that block and counts one error, without
    // changing the number of samples returned.
    let samples = noise(50000 * 2, 16, 77);
    let (blocks, _, _) = encode(&EncoderConfig::default(), Some(50000), &samples);

    assert!(blocks.len() >= 2);

    let mut corrupted = Vec::new();

    for (index, block) in blocks.iter().enumerate() {
        let mut block = block.clone();

        if index == 1 {
            // Flip a bit inside the second block's bitstream data.
            let mid = block.len() / 2;
            block[mid] ^= 0x04;
        }

        corrupted.extend_from_slice(&block);
    }

    let (decoder, output) = decode(&corrupted, None, OpenFlags::empty());

    assert_eq!(output.len(), samples.len());
    assert!(decoder.num_errors() >= 1);

    // The first block decodes intact.
    let first_len = 22050 * 2;
    assert_eq!(&output[..first_len], &samples[..first_len]);

    // The corrupted block comes back as silence.
    assert!(output[first_len..first_len + 22050 * 2].iter().all(|&v| v == 0));
}

#[test]
fn scenario_multichannel_5_1() {
    // Six channels in Microsoft order; the frame splits into stereo and mono streams.
    let channels = 6usize;
    let frames = 20000usize;
    let mut rng = SmallRng::seed_from_u64(61);

    let samples: Vec<i32> = (0..frames * channels)
        .map(|i| {
            let ch = i % channels;
            rng.random_range(-20000..20000) + ch as i32 * 100
        })
        .collect();

    let config = EncoderConfig {
        num_channels: 6,
        channel_mask: 0x3f,
        ..Default::default()
    };

    let (_, wv, _) = encode(&config, Some(frames as u64), &samples);

    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(decoder.num_channels(), 6);
    assert_eq!(decoder.channel_mask(), 0x3f);
    assert_eq!(decoder.num_errors(), 0);
    assert_eq!(output, samples);

    // Opening with the 2-channel limit decodes only the first (stereo) stream.
    let (decoder, front) = decode(&wv, None, OpenFlags::TWO_CH_MAX);

    assert_eq!(decoder.reduced_channels(), Some(2));
    assert_eq!(front.len(), frames * 2);

    for i in 0..frames {
        assert_eq!(front[i * 2], samples[i * channels]);
        assert_eq!(front[i * 2 + 1], samples[i * channels + 1]);
    }
}

#[test]
fn verify_seek_determinism() {
    let samples = noise(60000 * 2, 16, 404);
    let (_, wv, _) = encode(&EncoderConfig::default(), Some(60000), &samples);

    let (_, reference) = decode(&wv, None, OpenFlags::empty());
    assert_eq!(reference, samples);

    let mut decoder = open_decoder(&wv, None, OpenFlags::empty());

    for &target in &[0u64, 1, 22049, 22050, 22051, 30000, 44100, 59999, 5, 45000, 12345] {
        decoder.seek_sample(target).unwrap();

        let mut buffer = [0i32; 2];
        assert_eq!(decoder.unpack_samples(&mut buffer, 1), 1, "seek to {}", target);

        let index = target as usize * 2;
        assert_eq!(
            buffer,
            [reference[index], reference[index + 1]],
            "sample at seek target {}",
            target
        );
    }

    assert!(decoder.seek_sample(60000).is_err());
}

#[test]
fn verify_seek_rejected_when_streaming() {
    let samples = noise(3000 * 2, 16, 11);
    let (_, wv, _) = encode(&EncoderConfig::default(), Some(3000), &samples);

    let mut decoder = open_decoder(&wv, None, OpenFlags::STREAMING);
    assert!(decoder.seek_sample(100).is_err());
}

#[test]
fn verify_wrapper_and_md5() {
    let samples = noise(3000 * 2, 16, 21);

    let header_bytes: Vec<u8> = (0u16..300).map(|v| v as u8).collect();
    let trailer_bytes = vec![0xeeu8; 64];
    let digest = [7u8; 16];

    let mut wv = Vec::new();

    {
        let mut encoder = WavpackEncoder::new(|target: BlockTarget, block: &[u8]| {
            if target == BlockTarget::Wv {
                wv.extend_from_slice(block);
            }
            true
        });

        let config = EncoderConfig {
            flags: ConfigFlags::MD5_CHECKSUM | ConfigFlags::EXTRA_MODE,
            ..Default::default()
        };

        encoder.set_configuration(&config, Some(3000)).unwrap();
        encoder.add_wrapper(&header_bytes).unwrap();
        encoder.pack_init().unwrap();
        encoder.pack_samples(&samples, 3000).unwrap();
        encoder.flush_samples().unwrap();
        encoder.store_md5_sum(digest).unwrap();
        encoder.add_wrapper(&trailer_bytes).unwrap();
        encoder.flush_samples().unwrap();
    }

    let (mut decoder, output) = decode(&wv, None, OpenFlags::WRAPPER);

    assert_eq!(output, samples);

    // The trailer lives in a metadata block past the last audio, so it takes an explicit
    // tail scan to surface.
    decoder.seek_trailing_wrapper();

    let mut wrapper = header_bytes.clone();
    wrapper.extend_from_slice(&trailer_bytes);
    assert_eq!(decoder.wrapper_data(), &wrapper[..]);

    assert_eq!(decoder.md5_sum(), Some(digest));
    assert!(decoder.mode().contains(wavpack_codec::decoder::Mode::MD5));

    // The extra-processing marker rides the CONFIG_BLOCK bytes and comes back in the mode.
    assert!(decoder.mode().contains(wavpack_codec::decoder::Mode::EXTRA));

    decoder.free_wrapper();
    assert!(decoder.wrapper_data().is_empty());
}

#[test]
fn verify_update_num_samples() {
    use std::cell::RefCell;
    use std::rc::Rc;

    // Encode with an unknown length, then patch the first block afterwards.
    let samples = noise(30000, 16, 303);

    let blocks = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
    let sink = Rc::clone(&blocks);

    let mut encoder = WavpackEncoder::new(move |target: BlockTarget, block: &[u8]| {
        if target == BlockTarget::Wv {
            sink.borrow_mut().push(block.to_vec());
        }
        true
    });

    let config = EncoderConfig { num_channels: 1, ..Default::default() };

    encoder.set_configuration(&config, None).unwrap();
    encoder.pack_init().unwrap();
    encoder.pack_samples(&samples, 30000).unwrap();
    encoder.flush_samples().unwrap();

    let mut patched = blocks.borrow()[0].clone();
    encoder.update_num_samples(&mut patched).unwrap();

    // The patched block must still carry a valid checksum.
    assert!(wavpack_codec::metadata::verify_block(&patched));

    let mut wv = Vec::new();
    wv.extend_from_slice(&patched);

    for block in blocks.borrow().iter().skip(1) {
        wv.extend_from_slice(block);
    }

    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(decoder.num_samples(), Some(30000));
    assert_eq!(output, samples);
}

#[test]
fn verify_unknown_sample_rate_metadata() {
    // A rate outside the standard table rides in SAMPLE_RATE metadata.
    let samples = noise(44100, 16, 2);
    let config = EncoderConfig { num_channels: 1, sample_rate: 44101, ..Default::default() };

    let (_, wv, _) = encode(&config, Some(44100), &samples);
    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(decoder.sample_rate(), 44101);
    assert_eq!(output, samples);
}

#[test]
fn verify_streaming_decode() {
    use wavpack_core::io::ReadOnlySource;

    let samples = noise(30000 * 2, 16, 13);
    let (_, wv, _) = encode(&EncoderConfig::default(), Some(30000), &samples);

    // An unseekable source forces the streaming-friendly paths.
    let source = Box::new(ReadOnlySource::new(Cursor::new(wv)));
    let mut decoder =
        WavpackDecoder::open(source, None, &OpenOptions { flags: OpenFlags::STREAMING, norm_offset: 0 })
            .unwrap();

    let mut output = Vec::new();
    let mut buffer = vec![0i32; 4096 * 2];

    loop {
        let unpacked = decoder.unpack_samples(&mut buffer, 4096);

        if unpacked == 0 {
            break;
        }

        output.extend_from_slice(&buffer[..unpacked as usize * 2]);
    }

    assert_eq!(output, samples);
}

/// Builds a minimal DSD block (uncompressed mode) by hand, since the packer is PCM-only.
fn build_dsd_block(payload: &[u8], channels: u32, dsd_power: u8) -> Vec<u8> {
    use wavpack_codec::header::{BlockFlags, BlockHeader, SRATE_LSB};
    use wavpack_codec::metadata;

    let block_samples = payload.len() as u32 / channels;

    let mut flags = BlockFlags::DSD
        | BlockFlags::INITIAL_BLOCK
        | BlockFlags::FINAL_BLOCK
        | BlockFlags::from_bits_retain(9 << SRATE_LSB);

    if channels == 1 {
        flags |= BlockFlags::MONO;
    }

    let header = BlockHeader {
        version: 0x410,
        ck_size: BlockHeader::SIZE as u32 - 8,
        total_samples: Some(u64::from(block_samples)),
        block_index: 0,
        block_samples,
        flags,
        crc: {
            let mut crc = 0xffff_ffffu32;
            for &byte in payload {
                crc = crc.wrapping_mul(3).wrapping_add(u32::from(byte));
            }
            crc
        },
    };

    let mut image = [0u8; BlockHeader::SIZE];
    header.write(&mut image);
    let mut block = image.to_vec();

    let mut dsd_payload = vec![dsd_power, 0];
    dsd_payload.extend_from_slice(payload);

    metadata::append_metadata(&mut block, 1 << 20, metadata::ID_DSD_BLOCK, &dsd_payload).unwrap();
    metadata::append_block_checksum(&mut block, 1 << 20).unwrap();

    block
}

#[test]
fn scenario_dsd_as_pcm() {
    // A 2.8224 MHz stereo DSD source: base rate 44100 with an 8x multiplier. Decoded as PCM
    // the rate is 352800 Hz and the channel count is preserved.
    let mut rng = SmallRng::seed_from_u64(5);
    let payload: Vec<u8> = (0..4096).map(|_| rng.random()).collect();

    let block = build_dsd_block(&payload, 2, 3);

    let (decoder, output) = decode(&block, None, OpenFlags::DSD_AS_PCM);

    assert_eq!(decoder.sample_rate(), 352_800);
    assert_eq!(decoder.native_sample_rate(), 2_822_400);
    assert_eq!(decoder.num_channels(), 2);
    assert_eq!(decoder.bits_per_sample(), 24);
    assert_eq!(output.len(), payload.len());
    assert_eq!(decoder.num_errors(), 0);

    // The decimated output must stay within the 24-bit range.
    assert!(output.iter().all(|&v| v >= -(1 << 23) && v < (1 << 23)));
}

#[test]
fn scenario_dsd_native() {
    let payload: Vec<u8> = (0u16..2048).map(|v| (v ^ (v >> 3)) as u8).collect();
    let block = build_dsd_block(&payload, 1, 2);

    let (decoder, output) = decode(&block, None, OpenFlags::DSD_NATIVE);

    assert_eq!(decoder.sample_rate(), 44100 * 4);
    assert_eq!(decoder.bits_per_sample(), 8);
    assert_eq!(output.len(), payload.len());

    for (out, byte) in output.iter().zip(&payload) {
        assert_eq!(*out, i32::from(*byte));
    }

    // Opening a DSD file without choosing a DSD representation is refused.
    let source = Box::new(Cursor::new(block));
    assert!(WavpackDecoder::open(source, None, &OpenOptions::default()).is_err());
}

#[test]
fn verify_false_stereo_decode() {
    // A stereo block whose channels matched gets encoded as mono with FALSE_STEREO; build
    // one by re-flagging a mono encode.
    let samples: Vec<i32> = (0..3000).map(|i| ((i * 37) % 1000) - 500).collect();
    let config = EncoderConfig { num_channels: 1, ..Default::default() };

    let (blocks, _, _) = encode(&config, Some(3000), &samples);

    let mut wv = Vec::new();

    for block in &blocks {
        let mut block = block.clone();

        // Swap MONO for FALSE_STEREO and refresh the checksum.
        let mut flags = u32::from_le_bytes(block[24..28].try_into().unwrap());
        flags = (flags & !0x4) | 0x4000_0000;
        block[24..28].copy_from_slice(&flags.to_le_bytes());

        let csum_at = block.len() - 6;
        let mut csum = 0xffff_ffffu32;
        for pair in block[..csum_at].chunks_exact(2) {
            csum = csum
                .wrapping_mul(3)
                .wrapping_add(u32::from(pair[0]))
                .wrapping_add(u32::from(pair[1]) << 8);
        }
        block[csum_at + 2..].copy_from_slice(&csum.to_le_bytes());

        wv.extend_from_slice(&block);
    }

    let (decoder, output) = decode(&wv, None, OpenFlags::empty());

    assert_eq!(decoder.num_channels(), 2);
    assert_eq!(output.len(), samples.len() * 2);

    for (i, &value) in samples.iter().enumerate() {
        assert_eq!(output[i * 2], value);
        assert_eq!(output[i * 2 + 1], value);
    }
}
