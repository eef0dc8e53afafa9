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

//! AAC-LC decoding for the buffered stream. Each decrypted packet is framed
//! with the 7-byte ADTS header per the wire contract, validated, and the raw
//! access unit decoded to 1024 interleaved stereo frames.

use super::adts;
use crate::error::{DecodeError, DecodeResult};
use symphonia::core::{
    audio::{Channels, SampleBuffer},
    codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions},
    formats::Packet,
};

/// AudioSpecificConfig: AAC-LC, 44.1 kHz, stereo.
const ASC_LC_44100_STEREO: [u8; 2] = [0x12, 0x10];

pub struct AacDecoder {
    decoder: Box<dyn Decoder>,
    sample_buf: Option<SampleBuffer<i16>>,
}

impl AacDecoder {
    pub fn new() -> DecodeResult<Self> {
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_sample_rate(44_100)
            .with_channels(Channels::FRONT_LEFT | Channels::FRONT_RIGHT)
            .with_extra_data(Box::new(ASC_LC_44100_STEREO));

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::CodecError(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_buf: None,
        })
    }

    /// Decode one ADTS-framed AAC packet into interleaved i16 samples.
    pub fn decode(&mut self, adts_frame: &[u8]) -> DecodeResult<Vec<i16>> {
        let (_, access_unit) = adts::parse_adts_frame(adts_frame)?;

        let packet = Packet::new_from_slice(0, 0, 0, access_unit);
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
