// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The remote endpoint a middle session proxies to.

use std::net::SocketAddr;

use crate::crypto::dh::{DhKeyPair, DH_KEY_SIZE};
use crate::crypto::PeerId;
use crate::entity::cookie::{Cookie, CookieNonce};

const DEFAULT_PORT: u16 = 1935;

/// Target of a man-in-the-middle session.
///
/// In peer mode the target is a real client whose DH context was captured
/// from its connect cookie; the synthetic `id` replaces the real `peer_id`
/// on everything the server advertises, so initiators reach the target
/// through the middle without noticing.
#[derive(Clone)]
pub struct Target {
    pub address: SocketAddr,
    pub is_peer: bool,
    /// Synthetic identity advertised in place of the real one.
    pub id: PeerId,
    /// The target's true peer id.
    pub peer_id: PeerId,
    /// The target's DH public value (Kp).
    pub kp: [u8; DH_KEY_SIZE],
    /// DH context inherited from the captured cookie.
    pub dh: Option<DhKeyPair>,
}

impl Target {
    /// Capture a peer target from its connect cookie: takes over the
    /// cookie's DH keypair and derives the synthetic id from the nonce.
    pub fn from_cookie(address: SocketAddr, cookie: &mut Cookie) -> Self {
        let mut address = address;
        if address.port() == 0 {
            address.set_port(DEFAULT_PORT);
        }
        let kp = match &cookie.nonce {
            CookieNonce::Url { public } => *public,
            CookieNonce::Peer { .. } => [0u8; DH_KEY_SIZE],
        };
        let id = cookie.nonce.synthetic_peer_id().unwrap_or([0u8; 32]);
        Self {
            address,
            is_peer: true,
            id,
            peer_id: [0u8; 32],
            kp,
            dh: cookie.dh.take(),
        }
    }

    /// Plain upstream target (cirrus passthrough); no captured crypto.
    pub fn for_url(address: SocketAddr) -> Self {
        let mut address = address;
        if address.port() == 0 {
            address.set_port(DEFAULT_PORT);
        }
        Self {
            address,
            is_peer: false,
            id: [0u8; 32],
            peer_id: [0u8; 32],
            kp: [0u8; DH_KEY_SIZE],
            dh: None,
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("address", &self.address)
            .field("is_peer", &self.is_peer)
            .finish()
    }
}
