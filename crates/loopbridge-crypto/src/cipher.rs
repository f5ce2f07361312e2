//! Symmetric cipher the game applies to every application payload.
//!
//! Blowfish, each 8-byte block on its own (ECB), no padding. A trailing
//! partial block is left as plaintext, so inputs shorter than one block pass
//! through unchanged in both directions.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::Blowfish;

use crate::CryptoError;

pub const BLOCK_SIZE: usize = 8;

#[derive(Clone)]
pub struct GameCipher {
    inner: Blowfish,
}

impl std::fmt::Debug for GameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameCipher").finish_non_exhaustive()
    }
}

impl GameCipher {
    /// Blowfish accepts keys of 4 to 56 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let inner = Blowfish::new_from_slice(key).map_err(|_| {
            CryptoError::InvalidKey(format!("{} bytes, expected 4..=56", key.len()))
        })?;
        Ok(Self { inner })
    }

    /// Build from the base64 key the game is launched with.
    pub fn from_base64(key: &str) -> Result<Self, CryptoError> {
        let raw = BASE64.decode(key.trim())?;
        Self::new(&raw)
    }

    pub fn encrypt_in_place(&self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    pub fn decrypt_in_place(&self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.encrypt_in_place(&mut out);
        out
    }

    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.decrypt_in_place(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &[u8] = b"17BLOhi6KZsTtldTsizvHg==";

    #[test]
    fn test_known_vector() {
        // Schneier's test vector: key 0x0000000000000000, plaintext zeros.
        let cipher = GameCipher::new(&[0u8; 8]).unwrap();
        let out = cipher.encrypt(&[0u8; 8]);
        assert_eq!(out, vec![0x4E, 0xF9, 0x97, 0x45, 0x61, 0x98, 0xDD, 0x78]);
    }

    #[test]
    fn test_short_input_passes_through() {
        let cipher = GameCipher::new(KEY).unwrap();
        let short = [1u8, 2, 3, 4, 5, 6, 7];
        assert_eq!(cipher.encrypt(&short), short.to_vec());
        assert_eq!(cipher.decrypt(&short), short.to_vec());
    }

    #[test]
    fn test_tail_left_in_plaintext() {
        let cipher = GameCipher::new(KEY).unwrap();
        let data: Vec<u8> = (0..11).collect();
        let out = cipher.encrypt(&data);
        assert_ne!(out[..8], data[..8]);
        assert_eq!(out[8..], data[8..]);
    }

    #[test]
    fn test_from_base64() {
        let cipher = GameCipher::from_base64("AAAAAAAAAAA=").unwrap();
        let out = cipher.encrypt(&[0u8; 8]);
        assert_eq!(out[0], 0x4E);
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(GameCipher::new(&[1, 2]), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(GameCipher::from_base64("not base64!"), Err(CryptoError::Base64(_))));
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let cipher = GameCipher::new(KEY).unwrap();
            prop_assert_eq!(cipher.decrypt(&cipher.encrypt(&data)), data);
        }
    }
}
