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

//! The 7-byte ADTS header framing raw AAC-LC access units: profile LC,
//! 44.1 kHz, stereo, no CRC.

use crate::error::{DecodeError, DecodeResult};

pub const ADTS_HEADER_LEN: usize = 7;

const PROFILE_LC: u32 = 2;
const FREQ_IDX_44100: u32 = 4;
const CHANNEL_CFG_STEREO: u32 = 2;

/// Prepend the ADTS header for a raw AAC payload of `payload_len` bytes.
/// The length field counts the header itself.
pub fn add_adts_header(payload: &[u8]) -> Vec<u8> {
    let frame_len = (payload.len() + ADTS_HEADER_LEN) as u32;
    let mut packet = Vec::with_capacity(frame_len as usize);
    packet.extend_from_slice(&[
        0xFF,
        0xF9,
        (((PROFILE_LC - 1) << 6) + (FREQ_IDX_44100 << 2) + (CHANNEL_CFG_STEREO >> 2)) as u8,
        (((CHANNEL_CFG_STEREO & 3) << 6) as u32 + (frame_len >> 11)) as u8,
        ((frame_len & 0x7FF) >> 3) as u8,
        (((frame_len & 7) << 5) + 0x1F) as u8,
        0xFC,
    ]);
    packet.extend_from_slice(payload);
    packet
}

/// Parsed view of an ADTS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub profile: u32,
    pub frequency_index: u32,
    pub channel_config: u32,
    /// Total frame length including the header.
    pub aac_frame_length: u32,
}

/// Validate the header of `frame` and return it with the raw access unit.
pub fn parse_adts_frame(frame: &[u8]) -> DecodeResult<(AdtsHeader, &[u8])> {
    if frame.len() < ADTS_HEADER_LEN {
        return Err(DecodeError::BadAdtsHeader);
    }
    // 12-bit syncword
    if frame[0] != 0xFF || frame[1] & 0xF0 != 0xF0 {
        return Err(DecodeError::BadAdtsHeader);
    }
    let profile = ((frame[2] >> 6) & 0x3) as u32 + 1;
    let frequency_index = ((frame[2] >> 2) & 0xF) as u32;
    let channel_config = (((frame[2] & 0x1) as u32) << 2) | ((frame[3] >> 6) & 0x3) as u32;
    let aac_frame_length =
        (((frame[3] & 0x3) as u32) << 11) | ((frame[4] as u32) << 3) | ((frame[5] >> 5) as u32);

    if aac_frame_length as usize != frame.len() {
        return Err(DecodeError::BadAdtsHeader);
    }

    Ok((
        AdtsHeader {
            profile,
            frequency_index,
            channel_config,
            aac_frame_length,
        },
        &frame[ADTS_HEADER_LEN..],
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_preserves_length_field() {
        for n in [1usize, 7, 128, 479, 2000] {
            let payload: Vec<u8> = (0..n).map(|i| i as u8).collect();
            let frame = add_adts_header(&payload);
            assert_eq!(frame.len(), n + ADTS_HEADER_LEN);
            let (header, unit) = parse_adts_frame(&frame).unwrap();
            assert_eq!(header.aac_frame_length as usize, n + ADTS_HEADER_LEN);
            assert_eq!(header.profile, PROFILE_LC);
            assert_eq!(header.frequency_index, FREQ_IDX_44100);
            assert_eq!(header.channel_config, CHANNEL_CFG_STEREO);
            assert_eq!(unit, &payload[..]);
        }
    }

    #[test]
    fn bad_syncword_is_rejected() {
        let mut frame = add_adts_header(b"payload");
        frame[0] = 0x00;
        assert!(parse_adts_frame(&frame).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = add_adts_header(b"payload");
        assert!(parse_adts_frame(&frame[..frame.len() - 1]).is_err());
    }
}
