// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Smallest keepalive interval a client may be told to use.
pub const MIN_KEEPALIVE_SECS: u32 = 5;

/// Server options, mapped 1:1 from the daemon's command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP bind address.
    pub host: IpAddr,
    /// UDP bind port.
    pub port: u16,
    /// Enable man-in-the-middle mode between two peers.
    pub middle: bool,
    /// Upstream server for middle passthrough; implies proxying connects.
    pub cirrus: Option<SocketAddr>,
    /// Period of the management sweep (timeouts, cookie expiry, retries).
    pub freq_manage: Duration,
    /// Peer-to-server keepalive advertised in the 0x29 record, seconds.
    pub keep_alive_server: u32,
    /// Peer-to-peer keepalive advertised in the 0x29 record, seconds.
    pub keep_alive_peer: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1935,
            middle: false,
            cirrus: None,
            freq_manage: Duration::from_secs(2),
            keep_alive_server: 15,
            keep_alive_peer: 10,
        }
    }
}

impl ServerConfig {
    /// Apply the lower bounds on keepalive intervals.
    pub fn clamp(mut self) -> Self {
        self.keep_alive_server = self.keep_alive_server.max(MIN_KEEPALIVE_SECS);
        self.keep_alive_peer = self.keep_alive_peer.max(MIN_KEEPALIVE_SECS);
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalives_are_clamped() {
        let config = ServerConfig {
            keep_alive_server: 1,
            keep_alive_peer: 0,
            ..ServerConfig::default()
        }
        .clamp();
        assert_eq!(config.keep_alive_server, MIN_KEEPALIVE_SECS);
        assert_eq!(config.keep_alive_peer, MIN_KEEPALIVE_SECS);
    }
}
