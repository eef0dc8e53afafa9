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

//! ALAC decoding for the realtime stream, configured from the SETUP fmtp
//! vector via the magic cookie.

use super::FmtpParams;
use crate::error::{DecodeError, DecodeResult};
use symphonia::core::{
    audio::{Channels, SampleBuffer},
    codecs::{CODEC_TYPE_ALAC, CodecParameters, Decoder, DecoderOptions},
    formats::Packet,
};

pub struct AlacDecoder {
    decoder: Box<dyn Decoder>,
    frames_per_packet: u32,
    sample_buf: Option<SampleBuffer<i16>>,
}

impl AlacDecoder {
    pub fn new(fmtp: &FmtpParams) -> DecodeResult<Self> {
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_ALAC)
            .with_sample_rate(fmtp.sample_rate)
            .with_bits_per_sample(fmtp.bit_depth as u32)
            .with_channels(Channels::FRONT_LEFT | Channels::FRONT_RIGHT)
            .with_extra_data(fmtp.alac_magic_cookie().into_boxed_slice());

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::CodecError(e.to_string()))?;

        Ok(Self {
            decoder,
            frames_per_packet: fmtp.frames_per_packet,
            sample_buf: None,
        })
    }

    pub fn frames_per_packet(&self) -> u32 {
        self.frames_per_packet
    }

    /// Decode one decrypted ALAC payload into interleaved i16 samples.
    pub fn decode(&mut self, payload: &[u8]) -> DecodeResult<Vec<i16>> {
        let packet = Packet::new_from_slice(0, 0, 0, payload);
        let decoded = self
            .decoder
            .decode(&packet)
            .map_err(|e| DecodeError::CodecError(e.to_string()))?;

        let spec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        let needs_new = match &self.sample_buf {
            Some(buf) => buf.capacity() < decoded.capacity() * spec.channels.count(),
            None => true,
        };
        if needs_new {
            self.sample_buf = Some(SampleBuffer::new(capacity, spec));
        }
        let sample_buf = self.sample_buf.as_mut().expect("sample buffer was just ensured");
        sample_buf.copy_interleaved_ref(decoded);
        Ok(sample_buf.samples().to_vec())
    }
}
