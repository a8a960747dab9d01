// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DH-1024 key agreement over the fixed MODP-1024 group, generator 2.
//!
//! RTMFP predates modern curve exchanges; the protocol pins the classic
//! 1024-bit MODP prime and raw `g^x mod p` public values of exactly 128
//! bytes. Public values shorter than the modulus are left-padded with zeros
//! on the wire.

use num_bigint::BigUint;
use ring::rand::SecureRandom;

use crate::{Error, Result};

/// DH public value / shared secret length in bytes.
pub const DH_KEY_SIZE: usize = 128;

/// The MODP-1024 prime (RFC 2409 Second Oakley Group).
const DH1024_PRIME: [u8; DH_KEY_SIZE] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2,
    0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67,
    0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E,
    0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5,
    0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF,
    0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, 0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE,
    0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

fn prime() -> BigUint {
    BigUint::from_bytes_be(&DH1024_PRIME)
}

/// Left-pad a big-endian value to the fixed 128-byte wire width.
fn to_wire(value: &BigUint) -> [u8; DH_KEY_SIZE] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_KEY_SIZE];
    out[DH_KEY_SIZE - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// An ephemeral DH-1024 keypair.
#[derive(Clone)]
pub struct DhKeyPair {
    private: BigUint,
    /// Wire form of `g^x mod p`.
    pub public: [u8; DH_KEY_SIZE],
}

impl DhKeyPair {
    /// Generate a keypair from 128 random bytes of private exponent.
    pub fn generate(rng: &dyn SecureRandom) -> Result<Self> {
        let mut seed = [0u8; DH_KEY_SIZE];
        rng.fill(&mut seed).map_err(|_| Error::Crypto("dh seed"))?;
        let private = BigUint::from_bytes_be(&seed);
        let public = BigUint::from(2u32).modpow(&private, &prime());
        Ok(Self {
            private,
            public: to_wire(&public),
        })
    }

    /// Shared secret `peer_public ^ x mod p`, fixed 128-byte wire form.
    pub fn shared_secret(&self, peer_public: &[u8]) -> [u8; DH_KEY_SIZE] {
        let peer = BigUint::from_bytes_be(peer_public);
        to_wire(&peer.modpow(&self.private, &prime()))
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKeyPair{{public={:02x}{:02x}..}}", self.public[0], self.public[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;

    #[test]
    fn both_sides_agree() {
        let rng = SystemRandom::new();
        let alice = DhKeyPair::generate(&rng).unwrap();
        let bob = DhKeyPair::generate(&rng).unwrap();
        assert_eq!(
            alice.shared_secret(&bob.public),
            bob.shared_secret(&alice.public)
        );
    }

    #[test]
    fn public_value_is_wire_width() {
        let rng = SystemRandom::new();
        let pair = DhKeyPair::generate(&rng).unwrap();
        assert_eq!(pair.public.len(), DH_KEY_SIZE);
    }
}
