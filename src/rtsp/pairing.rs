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

//! Transient pairing: pair-setup exchanges long-term Ed25519 identities,
//! pair-verify runs an X25519 agreement whose signatures prove those
//! identities, and the derived session keys feed the channel cipher that
//! wraps all subsequent RTSP traffic. The full HomeKit SRP ceremony is a
//! collaborator outside this crate.

use crate::{
    crypto::ChannelCipher,
    error::{CryptoError, CryptoResult},
};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha512;
use std::collections::HashMap;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

const PAIR_VERIFY_ENCRYPT_SALT: &[u8] = b"Pair-Verify-Encrypt-Salt";
const PAIR_VERIFY_ENCRYPT_INFO: &[u8] = b"Pair-Verify-Encrypt-Info";
const CONTROL_SALT: &[u8] = b"Control-Salt";
const CONTROL_WRITE_INFO: &[u8] = b"Control-Write-Encryption-Key";
const CONTROL_READ_INFO: &[u8] = b"Control-Read-Encryption-Key";
const MSG02_NONCE: &[u8; 8] = b"PV-Msg02";
const MSG03_NONCE: &[u8; 8] = b"PV-Msg03";

/// In-process map of paired controllers: device id → Ed25519 public key.
#[derive(Default)]
pub struct PairingRegistry {
    entries: HashMap<String, [u8; 32]>,
}

impl PairingRegistry {
    pub fn add(&mut self, device_id: String, public_key: [u8; 32]) {
        self.entries.insert(device_id, public_key);
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        self.entries.remove(device_id).is_some()
    }

    pub fn list(&self) -> impl Iterator<Item = (&String, &[u8; 32])> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn random_32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    bytes
}

fn hkdf_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).expect("32 bytes is a valid HKDF length");
    okm
}

fn padded_nonce(label: &[u8; 8]) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(label);
    *Nonce::from_slice(&nonce)
}

/// Server side of the pair-setup / pair-verify exchange for one RTSP
/// connection.
pub struct PairingSession {
    identity: SigningKey,
    peer_identity: Option<VerifyingKey>,
    verify_state: Option<VerifyState>,
}

struct VerifyState {
    shared_secret: [u8; 32],
    our_public: [u8; 32],
    their_public: [u8; 32],
}

/// What a completed pair-verify hands back to the connection.
pub struct SessionKeys {
    pub read_key: [u8; 32],
    pub write_key: [u8; 32],
}

impl SessionKeys {
    /// Channel cipher from the receiver's point of view: the peer writes
    /// with its write key, which is our read key.
    pub fn channel_cipher(&self) -> ChannelCipher {
        ChannelCipher::new(&self.read_key, &self.write_key)
    }
}

impl PairingSession {
    pub fn new(identity: SigningKey) -> Self {
        Self {
            identity,
            peer_identity: None,
            verify_state: None,
        }
    }

    pub fn generate_identity() -> SigningKey {
        SigningKey::from_bytes(&random_32())
    }

    /// pair-setup: the controller deposits its long-term public key and
    /// receives ours.
    pub fn pair_setup(&mut self, body: &[u8]) -> CryptoResult<Vec<u8>> {
        if body.len() >= 32 {
            let key_bytes: [u8; 32] = body[body.len() - 32..]
                .try_into()
                .expect("32 bytes checked");
            match VerifyingKey::from_bytes(&key_bytes) {
                Ok(key) => self.peer_identity = Some(key),
                Err(_) => {
                    warn!("pair-setup carried an invalid Ed25519 key, continuing transient.")
                }
            }
        }
        debug!("pair-setup complete.");
        Ok(self.identity.verifying_key().to_bytes().to_vec())
    }

    /// pair-verify, both phases. Returns the response body and, after the
    /// second phase, the derived session keys.
    pub fn pair_verify(&mut self, body: &[u8]) -> CryptoResult<(Vec<u8>, Option<SessionKeys>)> {
        if body.len() < 4 {
            return Err(CryptoError::TruncatedCiphertext(body.len()));
        }
        if body[0] == 1 {
            Ok((self.verify_phase_one(&body[4..])?, None))
        } else {
            let keys = self.verify_phase_two(&body[4..])?;
            Ok((Vec::new(), Some(keys)))
        }
    }

    fn verify_phase_one(&mut self, body: &[u8]) -> CryptoResult<Vec<u8>> {
        if body.len() < 32 {
            return Err(CryptoError::TruncatedCiphertext(body.len()));
        }
        let their_public: [u8; 32] = body[..32].try_into().expect("32 bytes checked");
        // the controller's long-term key may ride along after its curve key
        if body.len() >= 64 {
            let key_bytes: [u8; 32] = body[32..64].try_into().expect("32 bytes checked");
            if let Ok(key) = VerifyingKey::from_bytes(&key_bytes) {
                self.peer_identity = Some(key);
            }
        }

        let our_secret = StaticSecret::from(random_32());
        let our_public = PublicKey::from(&our_secret);
        let shared_secret = our_secret
            .diffie_hellman(&PublicKey::from(their_public))
            .to_bytes();

        let mut signed = [0u8; 64];
        signed[..32].copy_from_slice(our_public.as_bytes());
        signed[32..].copy_from_slice(&their_public);
        let signature = self.identity.sign(&signed);

        let session_key = hkdf_32(
            &shared_secret,
            PAIR_VERIFY_ENCRYPT_SALT,
            PAIR_VERIFY_ENCRYPT_INFO,
        );
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&session_key));
        let encrypted_signature = cipher
            .encrypt(&padded_nonce(MSG02_NONCE), signature.to_bytes().as_ref())
            .map_err(|_| CryptoError::EncryptFailed)?;

        self.verify_state = Some(VerifyState {
            shared_secret,
            our_public: our_public.to_bytes(),
            their_public,
        });

        let mut response = Vec::with_capacity(32 + encrypted_signature.len());
        response.extend_from_slice(our_public.as_bytes());
        response.extend_from_slice(&encrypted_signature);
        Ok(response)
    }

    fn verify_phase_two(&mut self, body: &[u8]) -> CryptoResult<SessionKeys> {
        let state = self
            .verify_state
            .take()
            .ok_or_else(|| CryptoError::PairingState("verify phase 2 before phase 1".to_owned()))?;

        let session_key = hkdf_32(
            &state.shared_secret,
            PAIR_VERIFY_ENCRYPT_SALT,
            PAIR_VERIFY_ENCRYPT_INFO,
        );
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&session_key));
        let signature_bytes = cipher
            .decrypt(&padded_nonce(MSG03_NONCE), body)
            .map_err(|_| CryptoError::DecryptFailed)?;

        if let Some(peer) = &self.peer_identity {
            let signature = Signature::from_slice(&signature_bytes)
                .map_err(|_| CryptoError::BadSignature)?;
            let mut signed = [0u8; 64];
            signed[..32].copy_from_slice(&state.their_public);
            signed[32..].copy_from_slice(&state.our_public);
            peer.verify(&signed, &signature)
                .map_err(|_| CryptoError::BadSignature)?;
        } else {
            debug!("No controller identity on file, accepting transient verify.");
        }

        debug!("pair-verify complete, session keys established.");
        Ok(SessionKeys {
            read_key: hkdf_32(&state.shared_secret, CONTROL_SALT, CONTROL_WRITE_INFO),
            write_key: hkdf_32(&state.shared_secret, CONTROL_SALT, CONTROL_READ_INFO),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A minimal controller implementation, used only to drive the server
    /// side through a complete handshake.
    struct Controller {
        identity: SigningKey,
        secret: StaticSecret,
        shared: Option<[u8; 32]>,
        receiver_curve_public: Option<[u8; 32]>,
    }

    impl Controller {
        fn new() -> Self {
            Self {
                identity: SigningKey::from_bytes(&random_32()),
                secret: StaticSecret::from(random_32()),
                shared: None,
                receiver_curve_public: None,
            }
        }

        fn setup_body(&self) -> Vec<u8> {
            self.identity.verifying_key().to_bytes().to_vec()
        }

        fn verify_one_body(&self) -> Vec<u8> {
            let mut body = vec![1, 0, 0, 0];
            body.extend_from_slice(PublicKey::from(&self.secret).as_bytes());
            body.extend_from_slice(&self.identity.verifying_key().to_bytes());
            body
        }

        fn process_verify_one_response(&mut self, response: &[u8]) {
            let receiver_public: [u8; 32] = response[..32].try_into().unwrap();
            self.receiver_curve_public = Some(receiver_public);
            self.shared = Some(
                self.secret
                    .diffie_hellman(&PublicKey::from(receiver_public))
                    .to_bytes(),
            );
        }

        fn verify_two_body(&self) -> Vec<u8> {
            let shared = self.shared.unwrap();
            let mut signed = [0u8; 64];
            signed[..32].copy_from_slice(PublicKey::from(&self.secret).as_bytes());
            signed[32..].copy_from_slice(&self.receiver_curve_public.unwrap());
            let signature = self.identity.sign(&signed);

            let session_key =
                hkdf_32(&shared, PAIR_VERIFY_ENCRYPT_SALT, PAIR_VERIFY_ENCRYPT_INFO);
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&session_key));
            let encrypted = cipher
                .encrypt(&padded_nonce(MSG03_NONCE), signature.to_bytes().as_ref())
                .unwrap();

            let mut body = vec![0, 0, 0, 0];
            body.extend_from_slice(&encrypted);
            body
        }

        fn session_cipher(&self) -> ChannelCipher {
            let shared = self.shared.unwrap();
            // mirror image of the receiver's keys
            let write = hkdf_32(&shared, CONTROL_SALT, CONTROL_WRITE_INFO);
            let read = hkdf_32(&shared, CONTROL_SALT, CONTROL_READ_INFO);
            ChannelCipher::new(&read, &write)
        }
    }

    /// Property: a cipher pair generated by pair-setup then pair-verify
    /// decrypts whatever the peer encrypts with its half of the secret.
    #[test]
    fn full_handshake_yields_working_cipher_pair() {
        let mut server = PairingSession::new(PairingSession::generate_identity());
        let mut controller = Controller::new();

        server.pair_setup(&controller.setup_body()).unwrap();

        let (response_one, keys) = server.pair_verify(&controller.verify_one_body()).unwrap();
        assert!(keys.is_none());
        controller.process_verify_one_response(&response_one);

        let (response_two, keys) = server.pair_verify(&controller.verify_two_body()).unwrap();
        assert!(response_two.is_empty());
        let keys = keys.expect("phase two yields session keys");

        let mut server_cipher = keys.channel_cipher();
        let mut controller_cipher = controller.session_cipher();

        let framed = controller_cipher.encrypt(b"SETUP * RTSP/1.0\r\n\r\n").unwrap();
        let len = u16::from_le_bytes([framed[0], framed[1]]);
        let plain = server_cipher.decrypt(len, &framed[2..]).unwrap();
        assert_eq!(plain, b"SETUP * RTSP/1.0\r\n\r\n");

        let framed = server_cipher.encrypt(b"RTSP/1.0 200 OK\r\n\r\n").unwrap();
        let len = u16::from_le_bytes([framed[0], framed[1]]);
        let plain = controller_cipher.decrypt(len, &framed[2..]).unwrap();
        assert_eq!(plain, b"RTSP/1.0 200 OK\r\n\r\n");
    }

    #[test]
    fn tampered_controller_signature_is_rejected() {
        let mut server = PairingSession::new(PairingSession::generate_identity());
        let mut controller = Controller::new();
        server.pair_setup(&controller.setup_body()).unwrap();
        let (response_one, _) = server.pair_verify(&controller.verify_one_body()).unwrap();
        controller.process_verify_one_response(&response_one);

        let mut body = controller.verify_two_body();
        let end = body.len() - 1;
        body[end] ^= 0x55;
        assert!(server.pair_verify(&body).is_err());
    }

    #[test]
    fn phase_two_without_phase_one_fails() {
        let mut server = PairingSession::new(PairingSession::generate_identity());
        assert!(matches!(
            server.pair_verify(&[0, 0, 0, 0, 1, 2, 3]),
            Err(CryptoError::PairingState(_))
        ));
    }

    #[test]
    fn registry_add_list_remove() {
        let mut registry = PairingRegistry::default();
        registry.add("AA:BB:CC".to_owned(), [1u8; 32]);
        registry.add("DD:EE:FF".to_owned(), [2u8; 32]);
        assert_eq!(registry.len(), 2);
        assert!(registry.remove("AA:BB:CC"));
        assert!(!registry.remove("AA:BB:CC"));
        assert_eq!(registry.list().count(), 1);
    }
}
