// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rtmfp - RTMFP rendezvous server
//!
//! A pure Rust implementation of an RTMFP (Real-Time Media Flow Protocol)
//! rendezvous and man-in-the-middle server. RTMFP is the UDP-based,
//! AES-encrypted, session-oriented transport used by Flash endpoints for
//! real-time audio, video and RPC exchange, both client-to-server and
//! peer-to-peer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtmfp::{Server, ServerConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let config = ServerConfig::default();
//!     let mut server = Server::bind(config)?;
//!     server.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            Server                                  |
//! |   UDP socket | session routing by unscrambled id | manage tick     |
//! +--------------------------------------------------------------------+
//! |          Handshake             |            Session                |
//! |   stateless cookies, DH-1024   |   chunk dispatch, keepalive,      |
//! |   responder certificate        |   flow tables, outbound flush     |
//! +--------------------------------------------------------------------+
//! |                         Flow / FlowWriter                          |
//! |   stage-ordered reassembly | fragmentation | ack | retransmission  |
//! +--------------------------------------------------------------------+
//! |                        Packet / Codec / Crypto                     |
//! |   AES-128-CBC, id scrambling, checksum | VarInt-7, addresses       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Server`] | Owns the UDP socket and the session table, runs the event loop |
//! | [`ServerConfig`] | Bind address, middle mode, keepalive and manage cadence |
//! | [`session::Session`] | One established endpoint with its crypto context |
//! | [`flow::Flow`] | Inbound stage-ordered fragment reassembly |
//! | [`flow::FlowWriter`] | Outbound fragmentation with retransmission |
//!
//! ## See Also
//!
//! - [RFC 7016](https://datatracker.ietf.org/doc/html/rfc7016) -- RTMFP protocol
//! - [RFC 7425](https://datatracker.ietf.org/doc/html/rfc7425) -- RTMFP for Flash

/// AMF0 value reader/writer (opaque command-message codec).
pub mod amf;
/// Wire primitives: VarInt-7, length-prefixed strings, addresses, checksum.
pub mod codec;
/// Runtime configuration.
pub mod config;
/// Packet cipher, DH-1024 key agreement, HMAC key derivation, peer ids.
pub mod crypto;
/// Entity model: Peer, Group, Target, Cookie.
pub mod entity;
/// Per-session flow transport: reassembly, fragmentation, retransmission.
pub mod flow;
/// Handshake pseudo-session (stateless cookies, session minting).
pub mod handshake;
/// Man-in-the-middle session variant.
pub mod middle;
/// Datagram seal/open and the outbound packet builder.
pub mod packet;
/// Established session state machine.
pub mod session;
/// UDP server: routing, rendezvous, manage tick.
pub mod server;
/// Publication/subscription bookkeeping for stream flows.
pub mod streams;

pub use config::ServerConfig;
pub use server::Server;

use std::fmt;

/// Error type for every fallible operation in the crate.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Wire errors
    // ========================================================================
    /// Input ended before the named field could be read.
    Truncated(&'static str),
    /// Packet checksum did not match the decrypted body.
    InvalidChecksum,
    /// Handshake packet carried a marker other than 0x0b.
    BadMarker(u8),
    /// Value does not fit the 28-bit VarInt-7 range.
    VarIntRange(u32),
    /// Malformed AMF0 payload.
    Amf(&'static str),

    // ========================================================================
    // Handshake errors
    // ========================================================================
    /// 0x30 endpoint discriminator type is neither URL (0x0a) nor peer (0x0f).
    UnknownEpdType(u8),
    /// Handshake chunk id is neither 0x30 nor 0x38.
    UnknownHandshakeType(u8),
    /// 0x38 echoed a cookie that is not pending (expired or never issued).
    UnknownCookie,

    // ========================================================================
    // Session errors
    // ========================================================================
    /// A flow handler rejected the message; the flow reports an exception.
    Flow(String),
    /// The session failed (timeout, keepalive exhaustion, peer close).
    SessionFailed(String),
    /// Outbound chunk would exceed the packet capacity even when alone.
    PacketOverflow(usize),

    // ========================================================================
    // Environment errors
    // ========================================================================
    /// I/O error from the socket layer.
    Io(std::io::Error),
    /// Randomness or cipher failure from the crypto provider.
    Crypto(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated(what) => write!(f, "truncated input while reading {what}"),
            Error::InvalidChecksum => write!(f, "invalid packet checksum"),
            Error::BadMarker(m) => write!(f, "invalid handshake marker 0x{m:02x}"),
            Error::VarIntRange(v) => write!(f, "value {v} exceeds VarInt-7 range"),
            Error::Amf(what) => write!(f, "malformed AMF0 data: {what}"),
            Error::UnknownEpdType(t) => write!(f, "unknown endpoint discriminator type 0x{t:02x}"),
            Error::UnknownHandshakeType(t) => write!(f, "unknown handshake type 0x{t:02x}"),
            Error::UnknownCookie => write!(f, "unknown handshake cookie"),
            Error::Flow(msg) => write!(f, "flow error: {msg}"),
            Error::SessionFailed(msg) => write!(f, "session failed: {msg}"),
            Error::PacketOverflow(size) => write!(f, "chunk of {size} bytes exceeds packet capacity"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::Crypto(what) => write!(f, "crypto failure: {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// Convenient alias for results using the crate-wide [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
