// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cryptographic primitives for RTMFP packets and key establishment.
//!
//! - AES-128-CBC packet cipher with an all-zero IV ([`PacketCipher`]).
//! - DH-1024 key agreement over the fixed MODP-1024 group ([`dh`]).
//! - HMAC-SHA-256 asymmetric session-key derivation.
//! - SHA-256 peer-identity hashing.
//!
//! # Key Derivation
//!
//! Both sides derive the same pair after the four-way handshake:
//!
//! ```text
//! dkey = HMAC-SHA256(secret, HMAC-SHA256(resp_nonce, init_nonce))[..16]
//! ekey = HMAC-SHA256(secret, HMAC-SHA256(init_nonce, resp_nonce))[..16]
//! ```
//!
//! The responder decrypts with `dkey` and encrypts with `ekey`; the initiator
//! uses them swapped.

pub mod dh;

mod cipher;

pub use cipher::PacketCipher;
pub use dh::DhKeyPair;

use ring::digest;
use ring::hmac;
use ring::rand::SecureRandom;

use crate::{Error, Result};

/// The fixed symmetric key used for every handshake packet, both directions.
pub const HANDSHAKE_KEY: [u8; 16] = *b"Adobe Systems 02";

/// AES key length in bytes.
pub const AES_KEY_SIZE: usize = 16;

/// Peer identity length (SHA-256 digest).
pub const PEER_ID_SIZE: usize = 32;

/// A 32-byte peer identity.
pub type PeerId = [u8; PEER_ID_SIZE];

/// HMAC-SHA-256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Derive the `(dkey, ekey)` session pair from the DH shared secret and the
/// two handshake nonces. Returned keys are truncated to AES-128 size.
pub fn derive_session_keys(
    secret: &[u8],
    init_nonce: &[u8],
    resp_nonce: &[u8],
) -> ([u8; AES_KEY_SIZE], [u8; AES_KEY_SIZE]) {
    let inner_d = hmac_sha256(resp_nonce, init_nonce);
    let inner_e = hmac_sha256(init_nonce, resp_nonce);
    let full_d = hmac_sha256(secret, &inner_d);
    let full_e = hmac_sha256(secret, &inner_e);
    let mut dkey = [0u8; AES_KEY_SIZE];
    let mut ekey = [0u8; AES_KEY_SIZE];
    dkey.copy_from_slice(&full_d[..AES_KEY_SIZE]);
    ekey.copy_from_slice(&full_e[..AES_KEY_SIZE]);
    (dkey, ekey)
}

/// Peer identity: SHA-256 over the peer's certificate/nonce material.
pub fn peer_id_of(material: &[u8]) -> PeerId {
    let digest = digest::digest(&digest::SHA256, material);
    let mut id = [0u8; PEER_ID_SIZE];
    id.copy_from_slice(digest.as_ref());
    id
}

/// Fill a fixed-size array with cryptographically secure random bytes.
pub fn random_array<const N: usize>(rng: &dyn SecureRandom) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes).map_err(|_| Error::Crypto("rng fill"))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys_are_asymmetric() {
        let secret = [0x42u8; 128];
        let init = [1u8; 64];
        let resp = [2u8; 73];
        let (dkey, ekey) = derive_session_keys(&secret, &init, &resp);
        assert_ne!(dkey, ekey);
        // Swapping the nonces swaps the pair, which is what lets the
        // initiator and responder agree on opposite roles.
        let (dkey2, ekey2) = derive_session_keys(&secret, &resp, &init);
        assert_eq!(dkey, ekey2);
        assert_eq!(ekey, dkey2);
    }

    #[test]
    fn peer_id_is_sha256() {
        let id = peer_id_of(b"abc");
        assert_eq!(
            id[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "SHA-256(\"abc\") prefix mismatch"
        );
    }
}
