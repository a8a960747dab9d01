// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A single remote peer as observed by the server.

use std::net::SocketAddr;

use crate::crypto::PeerId;

/// Connection state of a peer across the `connect` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No application-level connection attempted yet.
    None,
    /// `connect` accepted.
    Accepted,
    /// `connect` rejected (also the state while a connect is being judged).
    Rejected,
}

/// A remote endpoint: identity, transport addresses and liveness.
#[derive(Debug, Clone)]
pub struct Peer {
    /// SHA-256 of the peer's certificate material; all zero until keying.
    pub id: PeerId,
    /// Public transport address observed over UDP.
    pub address: SocketAddr,
    /// Self-reported private addresses, in the order the peer sent them.
    pub private_addresses: Vec<SocketAddr>,
    /// Measured round-trip time in milliseconds.
    pub ping: u32,
    pub state: PeerState,
    /// Ids of the groups this peer is a member of.
    ///
    /// Invariant: `id` appears in exactly the groups listed here.
    pub groups: Vec<Vec<u8>>,
    pub swf_url: Option<String>,
    pub page_url: Option<String>,
    /// Path component of the connect URL.
    pub path: String,
    /// The full rtmfp:// URL the peer connected with.
    pub query_url: String,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            id: [0u8; 32],
            address,
            private_addresses: Vec::new(),
            ping: 0,
            state: PeerState::None,
            groups: Vec::new(),
            swf_url: None,
            page_url: None,
            path: String::new(),
            query_url: String::new(),
        }
    }

    /// Install the self-reported private addresses. A zero port inherits the
    /// public port, since some clients omit it.
    pub fn set_private_addresses(&mut self, addresses: Vec<SocketAddr>) {
        let public_port = self.address.port();
        self.private_addresses = addresses
            .into_iter()
            .map(|mut a| {
                if a.port() == 0 {
                    a.set_port(public_port);
                }
                a
            })
            .collect();
    }
}
