/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Output sample formats and the conversion from the player's internal
//! 32-bit stereo lanes into the bytes the DAC wants, with optional TPDF
//! dither applied while the word length is being reduced.

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

pub type Frames = u64;

pub const OUTPUT_CHANNELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum OutputFormat {
    #[serde(rename = "S8")]
    S8,
    #[serde(rename = "U8")]
    U8,
    #[serde(rename = "S16_LE")]
    S16LE,
    #[serde(rename = "S16_BE")]
    S16BE,
    #[serde(rename = "S24_LE")]
    S24LE,
    #[serde(rename = "S24_BE")]
    S24BE,
    #[serde(rename = "S24_3LE")]
    S243LE,
    #[serde(rename = "S24_3BE")]
    S243BE,
    #[serde(rename = "S32_LE")]
    S32LE,
    #[serde(rename = "S32_BE")]
    S32BE,
}

impl OutputFormat {
    pub fn bit_depth(&self) -> u32 {
        match self {
            OutputFormat::S8 | OutputFormat::U8 => 8,
            OutputFormat::S16LE | OutputFormat::S16BE => 16,
            OutputFormat::S24LE
            | OutputFormat::S24BE
            | OutputFormat::S243LE
            | OutputFormat::S243BE => 24,
            OutputFormat::S32LE | OutputFormat::S32BE => 32,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            OutputFormat::S8 | OutputFormat::U8 => 1,
            OutputFormat::S16LE | OutputFormat::S16BE => 2,
            OutputFormat::S243LE | OutputFormat::S243BE => 3,
            OutputFormat::S24LE | OutputFormat::S24BE => 4,
            OutputFormat::S32LE | OutputFormat::S32BE => 4,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * OUTPUT_CHANNELS
    }

    /// Range of the TPDF random pair, one LSB of the output word measured on
    /// the 64-bit working scale.
    pub fn dither_mask(&self) -> i64 {
        (1i64 << (64 - self.bit_depth())) - 1
    }
}

/// Single-writer dither state. The player wraps it in a mutex and is the
/// only caller; the RNG is seeded once per session.
pub struct TpdfDither {
    rng: StdRng,
    previous: i64,
}

impl TpdfDither {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            previous: 0,
        }
    }

    /// The difference of two consecutive uniform samples has a triangular
    /// distribution of ± one output LSB.
    fn next(&mut self, mask: i64) -> i64 {
        let r: i64 = self.rng.random();
        let tpdf = (r & mask) - (self.previous & mask);
        self.previous = r;
        tpdf
    }
}

/// Convert 32-bit lanes into output bytes, appending to `out`.
///
/// Each lane is widened to the top of an i64, dithered if requested, then
/// truncated to the output word length. Saturation is unnecessary: the
/// dither amplitude fits in the bits being discarded.
pub fn pack_lanes(lanes: &[i32], format: OutputFormat, dither: Option<&mut TpdfDither>, out: &mut Vec<u8>) {
    let mask = format.dither_mask();
    let shift = 64 - format.bit_depth();
    let mut dither = dither;
    for &lane in lanes {
        let mut hyper = (lane as i64) << 32;
        if let Some(d) = dither.as_deref_mut() {
            hyper = hyper.wrapping_add(d.next(mask));
        }
        let sample = hyper >> shift;
        match format {
            OutputFormat::S8 => out.push(sample as i8 as u8),
            OutputFormat::U8 => out.push((sample as i8 as i16 + 128) as u8),
            OutputFormat::S16LE => out.extend_from_slice(&(sample as i16).to_le_bytes()),
            OutputFormat::S16BE => out.extend_from_slice(&(sample as i16).to_be_bytes()),
            // 24 bits LSB-aligned in a 32-bit container, sign extended
            OutputFormat::S24LE => out.extend_from_slice(&(sample as i32).to_le_bytes()),
            OutputFormat::S24BE => out.extend_from_slice(&(sample as i32).to_be_bytes()),
            OutputFormat::S243LE => {
                let s = sample as i32;
                out.extend_from_slice(&[s as u8, (s >> 8) as u8, (s >> 16) as u8]);
            }
            OutputFormat::S243BE => {
                let s = sample as i32;
                out.extend_from_slice(&[(s >> 16) as u8, (s >> 8) as u8, s as u8]);
            }
            OutputFormat::S32LE => out.extend_from_slice(&(sample as i32).to_le_bytes()),
            OutputFormat::S32BE => out.extend_from_slice(&(sample as i32).to_be_bytes()),
        }
    }
}

/// Produce `n_frames` of silence in the output format. With dither enabled
/// the frames are not literally zero, which is the point.
pub fn silence_frames(
    n_frames: usize,
    format: OutputFormat,
    dither: Option<&mut TpdfDither>,
    out: &mut Vec<u8>,
) {
    let lanes = vec![0i32; n_frames * OUTPUT_CHANNELS];
    pack_lanes(&lanes, format, dither, out);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dither_mask_matches_bit_depth() {
        assert_eq!(OutputFormat::S16LE.dither_mask(), (1i64 << 48) - 1);
        assert_eq!(OutputFormat::S32LE.dither_mask(), (1i64 << 32) - 1);
        assert_eq!(OutputFormat::S8.dither_mask(), (1i64 << 56) - 1);
    }

    #[test]
    fn s16_le_packs_without_dither() {
        let mut out = Vec::new();
        pack_lanes(&[0x7FFF_0000, -0x8000_0000], OutputFormat::S16LE, None, &mut out);
        assert_eq!(out, vec![0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn s24_3le_is_three_bytes_per_sample() {
        let mut out = Vec::new();
        pack_lanes(&[0x1234_5600], OutputFormat::S243LE, None, &mut out);
        assert_eq!(out, vec![0x56, 0x34, 0x12]);
    }

    #[test]
    fn silence_is_zero_without_dither() {
        let mut out = Vec::new();
        silence_frames(4, OutputFormat::S16LE, None, &mut out);
        assert_eq!(out, vec![0u8; 4 * 2 * 2]);
    }

    #[test]
    fn dithered_silence_stays_within_one_lsb() {
        let mut dither = TpdfDither::new(1);
        let mut out = Vec::new();
        silence_frames(64, OutputFormat::S16LE, Some(&mut dither), &mut out);
        for chunk in out.chunks(2) {
            let s = i16::from_le_bytes([chunk[0], chunk[1]]);
            assert!(s.abs() <= 1, "dither exceeded one LSB: {s}");
        }
    }
}
