// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stateless handshake continuation tokens.
//!
//! A cookie proves that an initiator really received our responder hello
//! before we allocate any session state (the anti-SYN-flood device of the
//! handshake). It carries the pending DH context in one of two shapes:
//! a server keypair minted for a URL hello, or a captured target context for
//! the man-in-the-middle rendezvous path.

use std::net::SocketAddr;
use std::time::Duration;

use ring::rand::SecureRandom;

use crate::codec::put_string7;
use crate::crypto::dh::{DhKeyPair, DH_KEY_SIZE};
use crate::crypto::{self, PeerId, AES_KEY_SIZE};
use crate::entity::Target;
use crate::Result;

/// Wire size of the opaque cookie id.
pub const COOKIE_ID_SIZE: usize = 64;

/// Cookies older than this are swept on the next manage tick.
pub const COOKIE_TTL: Duration = Duration::from_secs(120);

const NONCE_URL_PREFIX: [u8; 11] = [
    0x03, 0x1a, 0x00, 0x00, 0x02, 0x1e, 0x00, 0x81, 0x02, 0x0d, 0x02,
];
const NONCE_PEER_PREFIX: [u8; 9] = [0x03, 0x1a, 0x00, 0x00, 0x02, 0x1e, 0x00, 0x41, 0x0e];

/// The responder nonce, kept structured instead of as raw mutable bytes.
///
/// The sub-type byte at offset 9 distinguishes server-originated (0x0d)
/// from target-peer-originated (0x1d) nonces. The synthetic middle peer-id
/// is derived from a 0x1d view of the URL nonce without ever mutating the
/// stored value.
#[derive(Debug, Clone)]
pub enum CookieNonce {
    /// Server keypair nonce: prefix (sub-type 0x0d) plus the DH public.
    Url { public: [u8; DH_KEY_SIZE] },
    /// Target-peer nonce: shorter prefix plus 64 random bytes.
    Peer { random: [u8; 64] },
}

impl CookieNonce {
    /// Serialise to the wire form (73 or 139 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CookieNonce::Url { public } => {
                let mut out = Vec::with_capacity(NONCE_URL_PREFIX.len() + DH_KEY_SIZE);
                out.extend_from_slice(&NONCE_URL_PREFIX);
                out.extend_from_slice(public);
                out
            }
            CookieNonce::Peer { random } => {
                let mut out = Vec::with_capacity(NONCE_PEER_PREFIX.len() + random.len());
                out.extend_from_slice(&NONCE_PEER_PREFIX);
                out.extend_from_slice(random);
                out
            }
        }
    }

    /// The synthetic peer id advertised by a middle session: SHA-256 of the
    /// nonce tail (from offset 7) with the sub-type read as 0x1d.
    ///
    /// Only URL nonces carry a DH public to re-advertise, so only they have a
    /// synthetic id.
    pub fn synthetic_peer_id(&self) -> Option<PeerId> {
        match self {
            CookieNonce::Url { public } => {
                let mut material = Vec::with_capacity(4 + DH_KEY_SIZE);
                material.extend_from_slice(&[0x81, 0x02, 0x1d, 0x02]);
                material.extend_from_slice(public);
                Some(crypto::peer_id_of(&material))
            }
            CookieNonce::Peer { .. } => None,
        }
    }
}

/// Address and scrambling id of a client whose responder keying is deferred
/// until the middle finishes its own handshake with the target.
#[derive(Debug, Clone, Copy)]
pub struct DeferredClient {
    pub address: SocketAddr,
    pub far_id: u32,
}

/// A pending handshake continuation.
pub struct Cookie {
    pub created: Duration,
    pub query_url: String,
    pub nonce: CookieNonce,
    /// Server DH keypair (URL mode) or a copy of the target's (peer mode).
    pub dh: Option<DhKeyPair>,
    /// Captured target context for the rendezvous-middle path.
    pub target: Option<Target>,
    /// Session id minted by a completed 0x38; 0 while still pending. A
    /// retransmitted 0x38 is answered from this instead of re-keying.
    pub session_id: u32,
    pub deferred: Option<DeferredClient>,
}

impl Cookie {
    /// Cookie for a URL hello: mints a fresh server DH keypair.
    pub fn for_url(query_url: &[u8], rng: &dyn SecureRandom, now: Duration) -> Result<Self> {
        let dh = DhKeyPair::generate(rng)?;
        let nonce = CookieNonce::Url { public: dh.public };
        Ok(Self {
            created: now,
            query_url: String::from_utf8_lossy(query_url).into_owned(),
            nonce,
            dh: Some(dh),
            target: None,
            session_id: 0,
            deferred: None,
        })
    }

    /// Cookie bound to an existing middle target (rendezvous toward a proxied
    /// peer). Shares the target's DH context.
    pub fn for_target(target: Target, rng: &dyn SecureRandom, now: Duration) -> Result<Self> {
        let random = crypto::random_array::<64>(rng)?;
        Ok(Self {
            created: now,
            query_url: String::new(),
            nonce: CookieNonce::Peer { random },
            dh: target.dh.clone(),
            target: Some(target),
            session_id: 0,
            deferred: None,
        })
    }

    pub fn is_obsolete(&self, now: Duration) -> bool {
        now.saturating_sub(self.created) >= COOKIE_TTL
    }

    /// Finish DH with the initiator's public value and derive the session
    /// key pair `(dkey, ekey)`.
    pub fn compute_keys(
        &self,
        init_public: &[u8],
        init_nonce: &[u8],
    ) -> Option<([u8; AES_KEY_SIZE], [u8; AES_KEY_SIZE])> {
        let dh = self.dh.as_ref()?;
        let secret = dh.shared_secret(init_public);
        Some(crypto::derive_session_keys(
            &secret,
            init_nonce,
            &self.nonce.to_bytes(),
        ))
    }

    /// The responder-keying payload: `session_id(u32) || nonce || 0x58`.
    pub fn keying_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.session_id.to_be_bytes());
        put_string7(&mut out, &self.nonce.to_bytes());
        out.push(0x58);
        out
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookie")
            .field("query_url", &self.query_url)
            .field("session_id", &self.session_id)
            .field("target", &self.target.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;

    #[test]
    fn nonce_wire_sizes() {
        let url = CookieNonce::Url {
            public: [1u8; DH_KEY_SIZE],
        };
        assert_eq!(url.to_bytes().len(), 139);
        let peer = CookieNonce::Peer { random: [2u8; 64] };
        assert_eq!(peer.to_bytes().len(), 73);
    }

    #[test]
    fn url_nonce_sub_type_marker() {
        let nonce = CookieNonce::Url {
            public: [0u8; DH_KEY_SIZE],
        };
        assert_eq!(nonce.to_bytes()[9], 0x0d);
    }

    #[test]
    fn synthetic_id_uses_0x1d_view() {
        let public = [7u8; DH_KEY_SIZE];
        let nonce = CookieNonce::Url { public };
        let mut material = vec![0x81, 0x02, 0x1d, 0x02];
        material.extend_from_slice(&public);
        assert_eq!(
            nonce.synthetic_peer_id().unwrap(),
            crypto::peer_id_of(&material)
        );
        // The stored nonce itself is untouched.
        assert_eq!(nonce.to_bytes()[9], 0x0d);
    }

    #[test]
    fn ttl_expiry() {
        let rng = SystemRandom::new();
        let cookie = Cookie::for_url(b"rtmfp://host/app", &rng, Duration::from_secs(10)).unwrap();
        assert!(!cookie.is_obsolete(Duration::from_secs(129)));
        assert!(cookie.is_obsolete(Duration::from_secs(130)));
    }

    #[test]
    fn keying_payload_shape() {
        let rng = SystemRandom::new();
        let mut cookie = Cookie::for_url(b"rtmfp://h/a", &rng, Duration::ZERO).unwrap();
        cookie.session_id = 0x0102_0304;
        let payload = cookie.keying_payload();
        assert_eq!(&payload[..4], &[1, 2, 3, 4]);
        // 139-byte nonce needs a 2-byte VarInt-7 length.
        assert_eq!(payload[4], 0x81);
        assert_eq!(payload[5], 0x0b);
        assert_eq!(*payload.last().unwrap(), 0x58);
    }
}
