//! Symmetric encryption for sealed blocks.
//!
//! Sealing encrypts a block's plaintext with the tree-wide key and a fresh
//! random nonce, prefixes the ciphertext with the nonce, and hashes the
//! whole prefixed ciphertext with SHA-256 to get the block's `Pointer`
//! (spec.md §4.C). Because the nonce is random, sealing the same plaintext
//! twice yields different ciphertexts and different pointers.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::pointer::Pointer;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A tree-wide symmetric key.
#[derive(Clone)]
pub struct TreeKey([u8; KEY_LEN]);

impl TreeKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> TreeKey {
        TreeKey(bytes)
    }

    pub fn from_hex(s: &str) -> Option<TreeKey> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(TreeKey(arr))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

/// Encrypt `plaintext`, returning the nonce-prefixed ciphertext and the
/// pointer (SHA-256 of the prefixed ciphertext) that addresses it.
pub fn seal(key: &TreeKey, plaintext: &[u8]) -> (Vec<u8>, Pointer) {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers");

    let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);

    let mut hasher = Sha256::new();
    hasher.update(&framed);
    let digest: [u8; 32] = hasher.finalize().into();

    (framed, Pointer::from_hash(digest))
}

/// Decrypt a nonce-prefixed ciphertext produced by `seal`.
pub fn unseal(key: &TreeKey, framed: &[u8]) -> Option<Vec<u8>> {
    if framed.len() < NONCE_LEN {
        return None;
    }
    let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    key.cipher().decrypt(nonce, ciphertext).ok()
}

/// Compute the pointer that `seal` would assign to `framed` bytes without
/// re-encrypting — used to validate that decoded content hashes to its
/// own pointer (testable property 5 in spec.md §8).
pub fn hash_framed(framed: &[u8]) -> Pointer {
    let mut hasher = Sha256::new();
    hasher.update(framed);
    let digest: [u8; 32] = hasher.finalize().into();
    Pointer::from_hash(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TreeKey {
        TreeKey::from_bytes([9u8; KEY_LEN])
    }

    #[test]
    fn seal_unseal_round_trip() {
        let k = key();
        let (framed, ptr) = seal(&k, b"hello world");
        assert_eq!(hash_framed(&framed), ptr);
        let back = unseal(&k, &framed).unwrap();
        assert_eq!(back, b"hello world");
    }

    #[test]
    fn two_seals_of_same_plaintext_differ() {
        let k = key();
        let (f1, p1) = seal(&k, b"same");
        let (f2, p2) = seal(&k, b"same");
        assert_ne!(f1, f2);
        assert_ne!(p1, p2);
    }

    #[test]
    fn wrong_key_fails_to_unseal() {
        let (framed, _) = seal(&key(), b"secret");
        let other = TreeKey::from_bytes([1u8; KEY_LEN]);
        assert!(unseal(&other, &framed).is_none());
    }
}
