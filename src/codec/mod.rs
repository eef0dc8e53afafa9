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

//! Decoders for the two audio stream flavors: ALAC (realtime, type 96) and
//! AAC-LC (buffered, type 103). Both emit interleaved signed 16-bit PCM.

pub mod aac;
pub mod adts;
pub mod alac;

use crate::config::FRAMES_PER_PACKET;

pub const INPUT_BYTES_PER_FRAME: usize = 4; // 2 channels x 16 bit

/// Decoder parameters fixed by the SETUP fmtp vector for realtime streams.
/// `96 352 0 16 40 10 14 2 255 0 0 44100` is what every known source sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmtpParams {
    pub frames_per_packet: u32,
    pub compatible_version: u8,
    pub bit_depth: u8,
    pub rice_history_mult: u8,
    pub rice_initial_history: u8,
    pub rice_k_modifier: u8,
    pub channels: u8,
    pub max_run: u16,
    pub max_frame_bytes: u32,
    pub avg_bit_rate: u32,
    pub sample_rate: u32,
}

impl Default for FmtpParams {
    fn default() -> Self {
        Self {
            frames_per_packet: FRAMES_PER_PACKET as u32,
            compatible_version: 0,
            bit_depth: 16,
            rice_history_mult: 40,
            rice_initial_history: 10,
            rice_k_modifier: 14,
            channels: 2,
            max_run: 255,
            max_frame_bytes: 0,
            avg_bit_rate: 0,
            sample_rate: 44_100,
        }
    }
}

impl FmtpParams {
    pub fn from_vector(fmtp: &[u32]) -> Self {
        let mut params = Self::default();
        if fmtp.len() >= 12 {
            params.frames_per_packet = fmtp[1];
            params.compatible_version = fmtp[2] as u8;
            params.bit_depth = fmtp[3] as u8;
            params.rice_history_mult = fmtp[4] as u8;
            params.rice_initial_history = fmtp[5] as u8;
            params.rice_k_modifier = fmtp[6] as u8;
            params.channels = fmtp[7] as u8;
            params.max_run = fmtp[8] as u16;
            params.max_frame_bytes = fmtp[9];
            params.avg_bit_rate = fmtp[10];
            params.sample_rate = fmtp[11];
        }
        params
    }

    /// The ALACSpecificConfig "magic cookie" the decoder wants, big endian.
    pub fn alac_magic_cookie(&self) -> Vec<u8> {
        let mut cookie = Vec::with_capacity(24);
        cookie.extend_from_slice(&self.frames_per_packet.to_be_bytes());
        cookie.push(self.compatible_version);
        cookie.push(self.bit_depth);
        cookie.push(self.rice_history_mult);
        cookie.push(self.rice_initial_history);
        cookie.push(self.rice_k_modifier);
        cookie.push(self.channels);
        cookie.extend_from_slice(&self.max_run.to_be_bytes());
        cookie.extend_from_slice(&self.max_frame_bytes.to_be_bytes());
        cookie.extend_from_slice(&self.avg_bit_rate.to_be_bytes());
        cookie.extend_from_slice(&self.sample_rate.to_be_bytes());
        cookie
    }
}

/// Interleaved i16 samples to the little-endian byte layout the jitter
/// buffer stores.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Staging buffer between the 1024-frame AAC decoder output and the
/// 352-frame packets the player consumes; holds about 1.5 packets across
/// block boundaries.
pub struct PcmStager {
    buffer: Vec<u8>,
    read_point_rtptime: u32,
}

impl PcmStager {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity((1024 + FRAMES_PER_PACKET) * INPUT_BYTES_PER_FRAME),
            read_point_rtptime: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn read_point_rtptime(&self) -> u32 {
        self.read_point_rtptime
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append a decoded block. When the stager was empty the block's RTP
    /// time becomes the new read point.
    pub fn push_block(&mut self, rtp_time: u32, pcm: &[u8]) {
        if self.buffer.is_empty() {
            self.read_point_rtptime = rtp_time;
        }
        self.buffer.extend_from_slice(pcm);
    }

    /// Drop whole frames from the front up to `rtp_time`, for partial
    /// flushes that land inside the staged audio.
    pub fn discard_until(&mut self, rtp_time: u32) {
        let available = (self.buffer.len() / INPUT_BYTES_PER_FRAME) as u32;
        let distance = rtp_time.wrapping_sub(self.read_point_rtptime) as i32;
        if distance <= 0 {
            return;
        }
        let drop_frames = (distance as u32).min(available);
        self.buffer
            .drain(..drop_frames as usize * INPUT_BYTES_PER_FRAME);
        self.read_point_rtptime = self.read_point_rtptime.wrapping_add(drop_frames);
    }

    /// Take one aligned 352-frame packet if enough audio is staged.
    pub fn take_packet(&mut self) -> Option<(u32, Vec<u8>)> {
        let packet_bytes = FRAMES_PER_PACKET * INPUT_BYTES_PER_FRAME;
        if self.buffer.len() < packet_bytes {
            return None;
        }
        let rtp_time = self.read_point_rtptime;
        let pcm = self.buffer.drain(..packet_bytes).collect();
        self.read_point_rtptime = self.read_point_rtptime.wrapping_add(FRAMES_PER_PACKET as u32);
        Some((rtp_time, pcm))
    }
}

impl Default for PcmStager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fmtp_vector_round_trips_into_cookie() {
        let fmtp = [96, 352, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44_100];
        let params = FmtpParams::from_vector(&fmtp);
        assert_eq!(params, FmtpParams::default());

        let cookie = params.alac_magic_cookie();
        assert_eq!(cookie.len(), 24);
        assert_eq!(&cookie[..4], &352u32.to_be_bytes());
        assert_eq!(cookie[5], 16);
        assert_eq!(cookie[9], 2);
        assert_eq!(&cookie[20..], &44_100u32.to_be_bytes());
    }

    #[test]
    fn stager_emits_aligned_packets() {
        let mut stager = PcmStager::new();
        // 1024-frame block at rtp 10_000
        stager.push_block(10_000, &vec![1u8; 1024 * INPUT_BYTES_PER_FRAME]);

        let (t0, p0) = stager.take_packet().unwrap();
        assert_eq!(t0, 10_000);
        assert_eq!(p0.len(), 352 * INPUT_BYTES_PER_FRAME);
        let (t1, _) = stager.take_packet().unwrap();
        assert_eq!(t1, 10_352);
        // 320 frames left, not enough for a third packet
        assert!(stager.take_packet().is_none());

        stager.push_block(11_024, &vec![2u8; 1024 * INPUT_BYTES_PER_FRAME]);
        let (t2, _) = stager.take_packet().unwrap();
        assert_eq!(t2, 10_704);
    }

    #[test]
    fn stager_discards_for_partial_flush() {
        let mut stager = PcmStager::new();
        stager.push_block(5_000, &vec![0u8; 1024 * INPUT_BYTES_PER_FRAME]);
        stager.discard_until(5_100);
        assert_eq!(stager.read_point_rtptime(), 5_100);
        let (t, _) = stager.take_packet().unwrap();
        assert_eq!(t, 5_100);
    }
}
