// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AES-128-CBC packet cipher.
//!
//! Every RTMFP datagram body is AES-128-CBC with a 16-byte all-zero IV. The
//! IV never varies: determinism is part of the wire format, and freshness
//! comes from the checksum + timestamp inside the plaintext. Padding (0xFF to
//! a 16-byte boundary) is applied by the packet layer, not here.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const ZERO_IV: [u8; 16] = [0u8; 16];

/// One direction of a session's AES-128-CBC context.
///
/// Each call runs a fresh CBC chain from the zero IV, matching the
/// per-packet cipher reset of the protocol.
#[derive(Clone)]
pub struct PacketCipher {
    key: [u8; 16],
}

impl PacketCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Encrypt `buf` in place. `buf.len()` must be a multiple of 16.
    pub fn encrypt(&self, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        Aes128CbcEnc::new(&self.key.into(), &ZERO_IV.into())
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|_| Error::Crypto("cbc encrypt"))?;
        Ok(())
    }

    /// Decrypt `buf` in place. `buf.len()` must be a multiple of 16.
    pub fn decrypt(&self, buf: &mut [u8]) -> Result<()> {
        Aes128CbcDec::new(&self.key.into(), &ZERO_IV.into())
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| Error::Crypto("cbc decrypt"))?;
        Ok(())
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("PacketCipher{..}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HANDSHAKE_KEY;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = PacketCipher::new(HANDSHAKE_KEY);
        let plain: Vec<u8> = (0u8..32).collect();
        let mut buf = plain.clone();
        cipher.encrypt(&mut buf).unwrap();
        assert_ne!(buf, plain);
        cipher.decrypt(&mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn encryption_is_deterministic() {
        let cipher = PacketCipher::new([7u8; 16]);
        let mut a = [0x55u8; 16];
        let mut b = [0x55u8; 16];
        cipher.encrypt(&mut a).unwrap();
        cipher.encrypt(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_block_length_is_rejected() {
        let cipher = PacketCipher::new([7u8; 16]);
        let mut buf = [0u8; 15];
        assert!(cipher.encrypt(&mut buf).is_err());
    }
}
