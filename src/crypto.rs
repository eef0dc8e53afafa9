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

//! Session ciphers: the ChaCha20-Poly1305 framing that wraps RTSP and event
//! traffic after pairing, the AEAD applied to buffered audio packets, and
//! the AES-CBC layer in front of realtime ALAC payloads.

use crate::error::{CryptoError, CryptoResult};
use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const AEAD_TAG_LEN: usize = 16;

/// Length-framed ChaCha20-Poly1305 channel: 2-byte little-endian plaintext
/// length (also the AAD), ciphertext, 16-byte tag. Each direction has its
/// own key and a 64-bit nonce counter in the trailing bytes of the nonce.
pub struct ChannelCipher {
    read_cipher: ChaCha20Poly1305,
    write_cipher: ChaCha20Poly1305,
    read_nonce: u64,
    write_nonce: u64,
}

impl ChannelCipher {
    pub fn new(read_key: &[u8; 32], write_key: &[u8; 32]) -> Self {
        Self {
            read_cipher: ChaCha20Poly1305::new(Key::from_slice(read_key)),
            write_cipher: ChaCha20Poly1305::new(Key::from_slice(write_key)),
            read_nonce: 0,
            write_nonce: 0,
        }
    }

    fn nonce(counter: u64) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        *Nonce::from_slice(&nonce)
    }

    /// Frame and encrypt one message. The returned buffer includes the
    /// length prefix.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let len = plaintext.len() as u16;
        let aad = len.to_le_bytes();
        let ciphertext = self
            .write_cipher
            .encrypt(
                &Self::nonce(self.write_nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        self.write_nonce += 1;

        let mut framed = Vec::with_capacity(2 + ciphertext.len());
        framed.extend_from_slice(&aad);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Decrypt one frame's payload. `block` is ciphertext plus tag, `len`
    /// the plaintext length from the frame header.
    pub fn decrypt(&mut self, len: u16, block: &[u8]) -> CryptoResult<Vec<u8>> {
        if block.len() < AEAD_TAG_LEN {
            return Err(CryptoError::TruncatedCiphertext(block.len()));
        }
        let aad = len.to_le_bytes();
        let plaintext = self
            .read_cipher
            .decrypt(
                &Self::nonce(self.read_nonce),
                Payload {
                    msg: block,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;
        self.read_nonce += 1;
        Ok(plaintext)
    }
}

/// AEAD for buffered audio packets. Layout on the wire, after the length
/// prefix: 12-byte RTP header (bytes 4..12 are the AAD), ciphertext plus
/// tag, 8-byte nonce suffix. The 8-byte nonce is front-padded with zeros to
/// the 12 bytes ChaCha20-Poly1305 wants.
pub struct BufferedPacketCipher {
    cipher: ChaCha20Poly1305,
}

impl BufferedPacketCipher {
    pub fn new(session_key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(session_key)),
        }
    }

    pub fn decrypt_packet(&self, packet: &[u8]) -> CryptoResult<Vec<u8>> {
        if packet.len() < 12 + AEAD_TAG_LEN + 8 {
            return Err(CryptoError::TruncatedCiphertext(packet.len()));
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&packet[packet.len() - 8..]);

        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &packet[12..packet.len() - 8],
                    aad: &packet[4..12],
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }

    #[cfg(test)]
    pub fn encrypt_packet(&self, header: &[u8; 12], payload: &[u8], nonce8: &[u8; 8]) -> Vec<u8> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(nonce8);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: &header[4..12],
                },
            )
            .expect("encryption cannot fail");
        let mut packet = Vec::with_capacity(12 + ciphertext.len() + 8);
        packet.extend_from_slice(header);
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(nonce8);
        packet
    }
}

/// AES-128-CBC over the multiple-of-16 prefix of a realtime ALAC payload;
/// trailing bytes stay plaintext. The CBC chain restarts at the session IV
/// for every packet.
pub struct RealtimeAudioCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl RealtimeAudioCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    pub fn decrypt_in_place(&self, payload: &mut [u8]) -> CryptoResult<()> {
        let encrypted_len = payload.len() & !0xF;
        if encrypted_len == 0 {
            return Ok(());
        }
        Aes128CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt_padded_mut::<NoPadding>(&mut payload[..encrypted_len])
            .map_err(|_| CryptoError::DecryptFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use aes::cipher::{BlockEncryptMut, generic_array::GenericArray};

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    #[test]
    fn channel_cipher_round_trip() {
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let mut receiver = ChannelCipher::new(&key_a, &key_b);
        let mut sender = ChannelCipher::new(&key_b, &key_a);

        for message in [&b"OPTIONS * RTSP/1.0\r\n\r\n"[..], &b"x"[..]] {
            let framed = sender.encrypt(message).unwrap();
            let len = u16::from_le_bytes([framed[0], framed[1]]);
            assert_eq!(len as usize, message.len());
            let plain = receiver.decrypt(len, &framed[2..]).unwrap();
            assert_eq!(plain, message);
        }
    }

    #[test]
    fn channel_cipher_rejects_tampering() {
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let mut receiver = ChannelCipher::new(&key_a, &key_b);
        let mut sender = ChannelCipher::new(&key_b, &key_a);

        let mut framed = sender.encrypt(b"hello").unwrap();
        let end = framed.len() - 1;
        framed[end] ^= 0xFF;
        let len = u16::from_le_bytes([framed[0], framed[1]]);
        assert!(matches!(
            receiver.decrypt(len, &framed[2..]),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn buffered_packet_round_trip() {
        let key = [7u8; 32];
        let cipher = BufferedPacketCipher::new(&key);
        let mut header = [0u8; 12];
        header[1] = 0x60;
        header[2..4].copy_from_slice(&42u16.to_be_bytes());
        header[4..8].copy_from_slice(&352u32.to_be_bytes());

        let payload = b"not really aac but good enough";
        let packet = cipher.encrypt_packet(&header, payload, &[9u8; 8]);
        assert_eq!(cipher.decrypt_packet(&packet).unwrap(), payload);
    }

    #[test]
    fn buffered_packet_bad_key_fails() {
        let cipher = BufferedPacketCipher::new(&[7u8; 32]);
        let header = [0u8; 12];
        let packet = cipher.encrypt_packet(&header, b"payload", &[9u8; 8]);
        let other = BufferedPacketCipher::new(&[8u8; 32]);
        assert!(other.decrypt_packet(&packet).is_err());
    }

    #[test]
    fn realtime_decrypts_prefix_and_leaves_tail() {
        let key = [3u8; 16];
        let iv = [4u8; 16];

        let plain: Vec<u8> = (0u8..40).collect();
        let mut wire = plain.clone();
        // encrypt only the 32-byte prefix, as the sender does
        let mut enc = Aes128CbcEnc::new_from_slices(&key, &iv).unwrap();
        for block in wire[..32].chunks_mut(16) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        let cipher = RealtimeAudioCipher::new(key, iv);
        cipher.decrypt_in_place(&mut wire).unwrap();
        assert_eq!(wire, plain);
    }

    #[test]
    fn short_realtime_payload_passes_through() {
        let cipher = RealtimeAudioCipher::new([0u8; 16], [0u8; 16]);
        let mut data = vec![1u8, 2, 3];
        cipher.decrypt_in_place(&mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }
}
