// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The handshake pseudo-session.
//!
//! All handshake traffic is encrypted with the fixed key
//! `"Adobe Systems 02"` and routed to session id 0. The handshake keeps no
//! per-initiator state until a valid cookie echo arrives: an initiator hello
//! only costs a cookie in the jar, swept after its TTL.
//!
//! ```text
//! initiator                                   responder
//!    | 0x30 initiator hello ----------------------> |
//!    | <---------------------- 0x70 responder hello |   (cookie + cert)
//!    | 0x38 initiator initial keying -------------> |   (cookie echo + DH)
//!    | <--------- 0x78 responder initial keying     |   (session minted)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ring::rand::SystemRandom;

use crate::crypto::{self, PacketCipher, HANDSHAKE_KEY};
use crate::entity::{Cookie, COOKIE_ID_SIZE};
use crate::packet::{scramble_id, seal, time_4ms, DATA_OFFSET, MARKER_SYMMETRIC};
use crate::session::send_datagram;
use crate::{Error, Result};

/// Responder certificate prefix.
const CERT_PREFIX: [u8; 4] = [0x01, 0x0a, 0x41, 0x0e];
/// Responder certificate suffix.
const CERT_SUFFIX: [u8; 9] = [0x02, 0x15, 0x02, 0x02, 0x15, 0x05, 0x02, 0x15, 0x0e];

/// Cookie jar, responder certificate and the fixed handshake cipher.
pub struct Handshake {
    cipher: PacketCipher,
    certificate: [u8; 77],
    cookies: HashMap<Vec<u8>, Cookie>,
    rng: SystemRandom,
}

impl Handshake {
    pub fn new() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut certificate = [0u8; 77];
        certificate[..4].copy_from_slice(&CERT_PREFIX);
        certificate[4..68].copy_from_slice(&crypto::random_array::<64>(&rng)?);
        certificate[68..].copy_from_slice(&CERT_SUFFIX);
        log::debug!(
            "[HANDSHAKE] responder identity {:02x?}..",
            &crypto::peer_id_of(&certificate)[..4]
        );
        Ok(Self {
            cipher: PacketCipher::new(HANDSHAKE_KEY),
            certificate,
            cookies: HashMap::new(),
            rng,
        })
    }

    pub fn cipher(&self) -> &PacketCipher {
        &self.cipher
    }

    pub fn certificate(&self) -> &[u8; 77] {
        &self.certificate
    }

    pub fn rng(&self) -> &SystemRandom {
        &self.rng
    }

    /// Stash a cookie under a fresh 64-byte id; returns the id.
    pub fn store_cookie(&mut self, cookie: Cookie) -> Result<Vec<u8>> {
        let id = crypto::random_array::<COOKIE_ID_SIZE>(&self.rng)?.to_vec();
        self.cookies.insert(id.clone(), cookie);
        Ok(id)
    }

    pub fn cookie(&self, id: &[u8]) -> Option<&Cookie> {
        self.cookies.get(id)
    }

    pub fn cookie_mut(&mut self, id: &[u8]) -> Option<&mut Cookie> {
        self.cookies.get_mut(id)
    }

    /// Fetch the cookie echoed by a 0x38, or refuse the keying.
    pub fn take_pending(&mut self, id: &[u8]) -> Result<&mut Cookie> {
        self.cookies.get_mut(id).ok_or(Error::UnknownCookie)
    }

    /// A session's first real packet retires its cookie.
    pub fn commit_cookie(&mut self, session_id: u32) {
        let before = self.cookies.len();
        self.cookies.retain(|_, c| c.session_id != session_id);
        if self.cookies.len() == before {
            log::debug!("[HANDSHAKE] no cookie found for session {session_id}");
        }
    }

    /// Drop cookies past their TTL. Runs on every manage tick.
    pub fn sweep(&mut self, now: Duration) {
        self.cookies.retain(|_, c| !c.is_obsolete(now));
    }

    /// Seal and send a handshake response (symmetric encoding, marker 0x0b).
    ///
    /// `far_id` is 0 except for the responder keying, which scrambles with
    /// the initiator's chosen id because the initiator has not installed the
    /// session keys yet.
    pub fn send_response(
        &self,
        socket: &mio::net::UdpSocket,
        addr: std::net::SocketAddr,
        now: Duration,
        ty: u8,
        payload: &[u8],
        far_id: u32,
    ) -> Result<()> {
        let mut data = vec![0u8; DATA_OFFSET];
        data.push(MARKER_SYMMETRIC);
        data.extend_from_slice(&time_4ms(now).to_be_bytes());
        data.push(ty);
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
        seal(&self.cipher, &mut data)?;
        scramble_id(&mut data, far_id);
        send_datagram(socket, &data, addr);
        Ok(())
    }
}
