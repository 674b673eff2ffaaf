//! Transparent page/offset-keyed encryption.
//!
//! When `ENABLE_ENCRYPTION` is set, the device runs every `read`, `write`,
//! and `read_page` through a 128-bit AES counter-mode-style stream cipher,
//! keyed by the environment's 128-bit key with the page/offset address
//! folded into the counter's initial state. Because a stream cipher built
//! this way is its own inverse (`xor_with_keystream` applied twice returns
//! the original bytes), the same function serves both encryption and
//! decryption. Callers above the device never see this; it is entirely a
//! device-layer concern.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use generic_array::GenericArray;

const BLOCK_LEN: usize = 16;

/// Encrypts or decrypts `buf` in place. `address` is the absolute byte
/// offset the buffer starts at; it seeds the keystream so that replaying a
/// ciphertext block at a different address does not reproduce the same
/// plaintext (the same defense-in-depth reason the page CRC folds the
/// address into its seed).
pub fn apply_keystream(key: &[u8; 16], address: u64, buf: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut offset = 0usize;
    let mut counter: u128 = address as u128;
    while offset < buf.len() {
        let mut block = GenericArray::clone_from_slice(&counter.to_be_bytes());
        cipher.encrypt_block(&mut block);
        let take = BLOCK_LEN.min(buf.len() - offset);
        for i in 0..take {
            buf[offset + i] ^= block[i];
        }
        offset += take;
        counter = counter.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = [0x42u8; 16];
        let original = b"the quick brown fox jumps over the lazy dog, 1234567890!!".to_vec();
        let mut buf = original.clone();
        apply_keystream(&key, 4096, &mut buf);
        assert_ne!(buf, original);
        apply_keystream(&key, 4096, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn different_addresses_yield_different_ciphertext() {
        let key = [0x11u8; 16];
        let plain = [0xAAu8; 64];
        let mut a = plain;
        let mut b = plain;
        apply_keystream(&key, 0, &mut a);
        apply_keystream(&key, 16384, &mut b);
        assert_ne!(a, b);
    }
}
