// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side test harness: builds and opens RTMFP datagrams against a
//! server instance without running its event loop.

// Each integration test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use ring::rand::SystemRandom;

use rtmfp::codec::{put_string7, Cursor};
use rtmfp::crypto::dh::DhKeyPair;
use rtmfp::crypto::{self, PacketCipher, HANDSHAKE_KEY};
use rtmfp::packet::{self, scramble_id, seal, unscramble_id};
use rtmfp::{Server, ServerConfig};

pub fn start_server(middle: bool, cirrus: Option<SocketAddr>) -> Server {
    let config = ServerConfig {
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        middle,
        cirrus,
        ..ServerConfig::default()
    };
    Server::bind(config).expect("bind server")
}

pub fn client_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind client");
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

pub fn handshake_cipher() -> PacketCipher {
    PacketCipher::new(HANDSHAKE_KEY)
}

/// Symmetric-encoded handshake datagram (marker 0x0b, id 0).
pub fn build_handshake(ty: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 6];
    data.push(0x0b);
    data.extend_from_slice(&0u16.to_be_bytes());
    data.push(ty);
    data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    data.extend_from_slice(payload);
    seal(&handshake_cipher(), &mut data).unwrap();
    scramble_id(&mut data, 0);
    data
}

pub fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).expect("expected a datagram");
    buf[..len].to_vec()
}

pub fn try_recv_datagram(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = [0u8; 2048];
    match socket.recv_from(&mut buf) {
        Ok((len, _)) => Some(buf[..len].to_vec()),
        Err(_) => None,
    }
}

/// Open a handshake datagram scrambled to `expected_id`; returns
/// `(type, payload)`.
pub fn open_handshake(data: &[u8], expected_id: u32) -> (u8, Vec<u8>) {
    assert_eq!(unscramble_id(data), Some(expected_id), "scrambled id");
    let raw = packet::open(&handshake_cipher(), data).expect("handshake decrypt");
    let body = &raw[6..];
    assert_eq!(body[0], 0x0b, "handshake marker");
    let ty = body[3];
    let size = u16::from_be_bytes([body[4], body[5]]) as usize;
    (ty, body[6..6 + size].to_vec())
}

/// An established client-side session.
pub struct ClientSession {
    pub socket: UdpSocket,
    /// Server-chosen id we scramble our packets to.
    pub near_id: u32,
    /// Our chosen id the server scrambles its packets to.
    pub far_id: u32,
    pub encrypt: PacketCipher,
    pub decrypt: PacketCipher,
    pub peer_id: [u8; 32],
}

/// The initiator hello for `url` with a fixed tag.
pub fn hello_payload(url: &[u8], tag: &[u8; 16]) -> Vec<u8> {
    let mut payload = vec![0x00, url.len() as u8 + 1, 0x0a];
    payload.extend_from_slice(url);
    payload.extend_from_slice(tag);
    payload
}

/// The peer-id hello used for rendezvous.
pub fn peer_hello_payload(peer_id: &[u8; 32], tag: &[u8; 16]) -> Vec<u8> {
    let mut payload = vec![0x00, 33, 0x0f];
    payload.extend_from_slice(peer_id);
    payload.extend_from_slice(tag);
    payload
}

/// Run the four-way handshake against `server`, returning the client side
/// of the established session. With a middle server the responder keying is
/// deferred, so this helper is only used in direct mode.
pub fn connect_session(server: &mut Server, far_id: u32) -> ClientSession {
    let socket = client_socket();
    let addr = socket.local_addr().unwrap();
    let now = server.now();
    server.process_datagram(
        &build_handshake(0x30, &hello_payload(b"rtmfp://localhost/app", &[0u8; 16])),
        addr,
        now,
    );
    let (ty, payload) = open_handshake(&recv_datagram(&socket), 0);
    assert_eq!(ty, 0x70, "responder hello expected");
    let mut c = Cursor::new(&payload);
    let tag = c.read_string8("tag").unwrap();
    assert_eq!(tag, &[0u8; 16]);
    let cookie = c.read_string8("cookie").unwrap().to_vec();
    assert_eq!(cookie.len(), 64, "cookie size");
    assert_eq!(c.remaining(), 77, "certificate size");

    let rng = SystemRandom::new();
    let dh = DhKeyPair::generate(&rng).unwrap();
    let client_cert = dh.public.to_vec();
    let client_nonce = [0x42u8; 64];
    let mut keying = Vec::new();
    keying.extend_from_slice(&far_id.to_be_bytes());
    put_string7(&mut keying, &cookie);
    put_string7(&mut keying, &client_cert);
    put_string7(&mut keying, &client_nonce);
    keying.push(0x58);
    server.process_datagram(&build_handshake(0x38, &keying), addr, server.now());

    let (ty, payload) = open_handshake(&recv_datagram(&socket), far_id);
    assert_eq!(ty, 0x78, "responder keying expected");
    let mut c = Cursor::new(&payload);
    let near_id = c.read_u32("near id").unwrap();
    assert_ne!(near_id, 0);
    let server_nonce = c.read_string7("server nonce").unwrap().to_vec();
    assert_eq!(c.read_u8("terminator").unwrap(), 0x58);
    assert_eq!(
        &server_nonce[..11],
        &[0x03, 0x1a, 0x00, 0x00, 0x02, 0x1e, 0x00, 0x81, 0x02, 0x0d, 0x02],
        "server nonce prefix"
    );

    let server_public = &server_nonce[server_nonce.len() - 128..];
    let secret = dh.shared_secret(server_public);
    // The server decrypts with dkey and encrypts with ekey; the client uses
    // the same pair swapped.
    let (dkey, ekey) = crypto::derive_session_keys(&secret, &client_nonce, &server_nonce);
    ClientSession {
        socket,
        near_id,
        far_id,
        encrypt: PacketCipher::new(dkey),
        decrypt: PacketCipher::new(ekey),
        peer_id: crypto::peer_id_of(&client_cert),
    }
}

/// Session datagram from the client: marker 0x89 (from peer, no echo).
pub fn build_session_packet(session: &ClientSession, chunks: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut data = vec![0u8; 6];
    data.push(0x89);
    data.extend_from_slice(&0u16.to_be_bytes());
    for (ty, payload) in chunks {
        data.push(*ty);
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
    }
    seal(&session.encrypt, &mut data).unwrap();
    scramble_id(&mut data, session.near_id);
    data
}

/// Open a server-to-client session datagram into its chunks.
pub fn open_session_packet(session: &ClientSession, data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    assert_eq!(unscramble_id(data), Some(session.far_id), "scrambled id");
    let raw = packet::open(&session.decrypt, data).expect("session decrypt");
    let body = &raw[6..];
    let marker = body[0];
    let mut at = 3;
    if marker & 0x04 != 0 {
        at += 2; // timestamp echo
    }
    let mut chunks = Vec::new();
    while at < body.len() && body[at] != 0xff {
        let ty = body[at];
        let size = u16::from_be_bytes([body[at + 1], body[at + 2]]) as usize;
        chunks.push((ty, body[at + 3..at + 3 + size].to_vec()));
        at += 3 + size;
    }
    chunks
}

/// First-fragment user-data chunk for a new flow carrying one message.
pub fn user_data_chunk(flow_id: u8, stage: u8, signature: &[u8], message: &[u8]) -> Vec<u8> {
    let mut chunk = vec![0x80, flow_id, stage, stage];
    chunk.push(signature.len() as u8);
    chunk.extend_from_slice(signature);
    chunk.push(0x00);
    chunk.extend_from_slice(message);
    chunk
}

/// AMF command message in the 0x14 envelope.
pub fn amf_command(name: &str, handle: f64, args: &[rtmfp::amf::Value]) -> Vec<u8> {
    let mut message = vec![0x14];
    message.extend_from_slice(&0u32.to_be_bytes());
    let mut writer = rtmfp::amf::Writer::new();
    writer.write(&rtmfp::amf::Value::String(name.to_string()));
    writer.write(&rtmfp::amf::Value::Number(handle));
    for arg in args {
        writer.write(arg);
    }
    message.extend_from_slice(&writer.into_bytes());
    message
}
