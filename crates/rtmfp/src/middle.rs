// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Man-in-the-middle session variant.
//!
//! A middle session keeps two coupled crypto contexts: the one inherited
//! from [`Session`] toward the initiator, and an auxiliary one toward the
//! real target reached through a child UDP socket on an ephemeral port. The
//! middle runs its own four-way handshake with the target, then relays
//! packets in both directions, rewriting the few records that would
//! otherwise reveal or break the interception:
//!
//! - `connect` tcUrl is pointed at the target,
//! - `setPeerInfo` private addresses get the middle socket's port,
//! - NetGroup identity material is recomputed for the target-side secret,
//! - peer ids in forwarded P2P handshakes are swapped between the real and
//!   the advertised (synthetic) identity.

use std::net::SocketAddr;
use std::time::Duration;

use mio::Token;
use ring::rand::SystemRandom;

use crate::amf::{self, Value};
use crate::codec::{put_string7, put_string8, put_varint7, Cursor};
use crate::crypto::dh::{DhKeyPair, DH_KEY_SIZE};
use crate::crypto::{self, PacketCipher, PeerId, HANDSHAKE_KEY};
use crate::entity::{Peer, Target};
use crate::flow::flags;
use crate::packet::{self, scramble_id, seal, time_4ms, DATA_OFFSET, MIN_DATAGRAM};
use crate::server::Server;
use crate::session::{send_datagram, Session, SessionKind};
use crate::{Error, Result};

const MIDDLE_CERT_PREFIX: [u8; 5] = [0x02, 0x1d, 0x02, 0x41, 0x0e];
const MIDDLE_CERT_SUFFIX: [u8; 7] = [0x03, 0x1a, 0x02, 0x0a, 0x02, 0x1e, 0x02];
const MIDDLE_NONCE_PREFIX: [u8; 4] = [0x81, 0x02, 0x1d, 0x02];

/// Target-side state of a middle session.
pub struct MiddleState {
    /// Child socket bound to an ephemeral port, facing the target.
    pub socket: mio::net::UdpSocket,
    pub token: Token,
    pub is_peer: bool,
    /// Far id on the target side (from the target's responder keying).
    middle_id: u32,
    query_url: String,
    middle_cert: Vec<u8>,
    middle_dh: Option<DhKeyPair>,
    target_nonce: Vec<u8>,
    shared_secret: Vec<u8>,
    /// Identity the middle advertises toward other clients.
    pub middle_peer_id: PeerId,
    encrypt: Option<PacketCipher>,
    decrypt: Option<PacketCipher>,
    first_response: bool,
    /// Cookie id of the paused client handshake, resumed on keying.
    pub deferred_cookie: Option<Vec<u8>>,
}

/// Build a middle session and open its handshake toward the target.
#[allow(clippy::too_many_arguments)]
pub fn create(
    server: &mut Server,
    id: u32,
    far_id: u32,
    mut peer: Peer,
    dkey: [u8; 16],
    ekey: [u8; 16],
    target: Target,
    now: Duration,
) -> Result<Session> {
    let rng = SystemRandom::new();
    let query_url = format!("rtmfp://{}{}", address_label(target.address), peer.path);

    let mut socket = mio::net::UdpSocket::bind("0.0.0.0:0".parse().expect("wildcard addr"))?;
    let token = server.register_middle_socket(&mut socket)?;

    let mut middle_cert = Vec::with_capacity(76);
    middle_cert.extend_from_slice(&MIDDLE_CERT_PREFIX);
    middle_cert.extend_from_slice(&crypto::random_array::<64>(&rng)?);
    middle_cert.extend_from_slice(&MIDDLE_CERT_SUFFIX);

    let mut hello = Vec::new();
    let middle_dh;
    let middle_peer_id;
    if target.is_peer {
        middle_dh = target.dh.clone();
        middle_peer_id = target.id;
        peer.id = target.id;
        hello.extend_from_slice(&[0x22, 0x21, 0x0f]);
        hello.extend_from_slice(&target.peer_id);
        log::debug!("[MIDDLE] target handshake toward peer {:02x?}", &target.peer_id[..4]);
    } else {
        middle_dh = None;
        middle_peer_id = [0u8; 32];
        hello.push(query_url.len() as u8 + 2);
        hello.push(query_url.len() as u8 + 1);
        hello.push(0x0a);
        hello.extend_from_slice(query_url.as_bytes());
        log::debug!("[MIDDLE] target handshake toward url {query_url:?}");
    }
    hello.extend_from_slice(&crypto::random_array::<16>(&rng)?);

    let state = MiddleState {
        socket,
        token,
        is_peer: target.is_peer,
        middle_id: 0,
        query_url,
        middle_cert,
        middle_dh,
        target_nonce: Vec::new(),
        shared_secret: Vec::new(),
        middle_peer_id,
        encrypt: None,
        decrypt: None,
        first_response: false,
        deferred_cookie: None,
    };
    send_handshake_to_target(&state, target.address, 0x30, &hello, now)?;

    let mut session = Session::new(id, far_id, peer, dkey, ekey, now);
    session.target = Some(target);
    session.kind = SessionKind::Middle(Box::new(state));
    Ok(session)
}

/// `ip` or `ip:port` when the port is not the default.
fn address_label(addr: SocketAddr) -> String {
    if addr.port() == 0 || addr.port() == 1935 {
        addr.ip().to_string()
    } else {
        addr.to_string()
    }
}

/// Handshake packets to the target are symmetric-encoded with id 0.
fn send_handshake_to_target(
    state: &MiddleState,
    addr: SocketAddr,
    ty: u8,
    payload: &[u8],
    now: Duration,
) -> Result<()> {
    let mut data = vec![0u8; DATA_OFFSET];
    data.push(0x0b);
    data.extend_from_slice(&time_4ms(now).to_be_bytes());
    data.push(ty);
    data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    data.extend_from_slice(payload);
    let cipher = PacketCipher::new(HANDSHAKE_KEY);
    seal(&cipher, &mut data)?;
    scramble_id(&mut data, 0);
    send_datagram(&state.socket, &data, addr);
    Ok(())
}

/// Session-encoded packet toward the target.
fn send_to_target(state: &mut MiddleState, addr: SocketAddr, payload: &[u8]) -> Result<()> {
    let Some(encrypt) = &state.encrypt else {
        log::debug!("[MIDDLE] cannot reach target: middle handshake not finished");
        return Ok(());
    };
    state.first_response = true;
    let mut data = vec![0u8; DATA_OFFSET];
    data.extend_from_slice(payload);
    seal(encrypt, &mut data)?;
    scramble_id(&mut data, state.middle_id);
    send_datagram(&state.socket, &data, addr);
    Ok(())
}

/// Drain the middle child socket; called by the server on readiness.
pub fn on_child_readable(server: &mut Server, session: &mut Session, now: Duration) {
    let mut buf = [0u8; 4096];
    loop {
        let SessionKind::Middle(state) = &mut session.kind else {
            return;
        };
        let (len, from) = match state.socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                log::error!("[MIDDLE] child socket receive error: {err}");
                return;
            }
        };
        let target_addr = session.target.as_ref().map(|t| t.address);
        if target_addr != Some(from) {
            log::debug!("[MIDDLE] datagram from {from} is not the target");
            continue;
        }
        if len < MIN_DATAGRAM {
            log::debug!("[MIDDLE] runt datagram of {len} bytes from target");
            continue;
        }
        let data = &buf[..len];
        let id = packet::unscramble_id(data).unwrap_or(0);
        if id == 0 || state.decrypt.is_none() {
            let cipher = PacketCipher::new(HANDSHAKE_KEY);
            match packet::open(&cipher, data) {
                Ok(raw) => {
                    if raw[DATA_OFFSET] != 0x0b {
                        log::debug!(
                            "[MIDDLE] target handshake with marker 0x{:02x}",
                            raw[DATA_OFFSET]
                        );
                        continue;
                    }
                    let ty = raw[DATA_OFFSET + 3];
                    let size = u16::from_be_bytes([raw[DATA_OFFSET + 4], raw[DATA_OFFSET + 5]])
                        as usize;
                    let start = DATA_OFFSET + 6;
                    if raw.len() < start + size {
                        log::debug!("[MIDDLE] truncated target handshake");
                        continue;
                    }
                    let content = raw[start..start + size].to_vec();
                    if let Err(err) = on_target_handshake(server, session, ty, &content, now) {
                        log::error!("[MIDDLE] target handshake failed: {err}");
                    }
                }
                Err(err) => log::debug!("[MIDDLE] undecodable target handshake: {err}"),
            }
        } else {
            let Some(cipher) = state.decrypt.clone() else {
                continue;
            };
            match packet::open(&cipher, data) {
                Ok(raw) => {
                    let payload = raw[DATA_OFFSET..].to_vec();
                    if let Err(err) = relay_from_target(session, server, &payload, now) {
                        log::debug!("[MIDDLE] relay from target failed: {err}");
                    }
                }
                Err(err) => log::debug!("[MIDDLE] undecodable target packet: {err}"),
            }
        }
    }
}

fn on_target_handshake(
    server: &mut Server,
    session: &mut Session,
    ty: u8,
    content: &[u8],
    now: Duration,
) -> Result<()> {
    log::debug!("[MIDDLE] target handshake type=0x{ty:02x}");
    let target_addr = session
        .target
        .as_ref()
        .map(|t| t.address)
        .ok_or(Error::SessionFailed("middle without target".into()))?;
    match ty {
        0x70 => {
            let SessionKind::Middle(state) = &mut session.kind else {
                return Ok(());
            };
            let mut c = Cursor::new(content);
            let _tag = c.read_string8("handshake tag")?;
            let cookie = c.read_string8("handshake cookie")?.to_vec();
            let mut nonce = MIDDLE_NONCE_PREFIX.to_vec();
            if state.is_peer {
                c.skip(4, "certificate prefix")?;
                let target_public = c.read_bytes(DH_KEY_SIZE, "target public")?;
                let kp = session
                    .target
                    .as_ref()
                    .map(|t| t.kp)
                    .unwrap_or([0u8; DH_KEY_SIZE]);
                nonce.extend_from_slice(&kp);
                let dh = state
                    .middle_dh
                    .as_ref()
                    .ok_or(Error::Crypto("middle dh context missing"))?;
                state.shared_secret = dh.shared_secret(target_public).to_vec();
            } else {
                let rng = SystemRandom::new();
                let dh = DhKeyPair::generate(&rng)?;
                nonce.extend_from_slice(&dh.public);
                state.middle_dh = Some(dh);
                state.middle_peer_id = crypto::peer_id_of(&nonce);
                session.peer.id = state.middle_peer_id;
            }
            let mut keying = Vec::new();
            keying.extend_from_slice(&session.id.to_be_bytes());
            put_string8(&mut keying, &cookie);
            put_string7(&mut keying, &nonce);
            put_string7(&mut keying, &state.middle_cert);
            keying.push(0x58);
            send_handshake_to_target(state, target_addr, 0x38, &keying, now)
        }
        0x71 => {
            let mut c = Cursor::new(content);
            let _tag = c.read_string8("redirect tag")?;
            let SessionKind::Middle(state) = &session.kind else {
                return Ok(());
            };
            if state.decrypt.is_some() {
                log::debug!("[MIDDLE] redirect after keying ignored");
                return Ok(());
            }
            log::warn!("[MIDDLE] target redirected; listed addresses follow");
            let rest = c.rest();
            let mut i = 0;
            while i < rest.len() {
                if rest[i] == 0x01 && i + 7 <= rest.len() {
                    log::warn!(
                        "[MIDDLE]   {}.{}.{}.{}:{}",
                        rest[i + 1],
                        rest[i + 2],
                        rest[i + 3],
                        rest[i + 4],
                        u16::from_be_bytes([rest[i + 5], rest[i + 6]])
                    );
                    i += 7;
                } else {
                    i += 1;
                }
            }
            session.fail(server, now, "redirection middle request");
            session.kill(server);
            Ok(())
        }
        0x78 => {
            let SessionKind::Middle(state) = &mut session.kind else {
                return Ok(());
            };
            let mut c = Cursor::new(content);
            state.middle_id = c.read_u32("middle session id")?;
            state.target_nonce = c.read_string7("target nonce")?.to_vec();
            if !state.is_peer {
                if state.target_nonce.len() < DH_KEY_SIZE {
                    return Err(Error::Truncated("target nonce public"));
                }
                let key = &state.target_nonce[state.target_nonce.len() - DH_KEY_SIZE..];
                let dh = state
                    .middle_dh
                    .as_ref()
                    .ok_or(Error::Crypto("middle dh context missing"))?;
                state.shared_secret = dh.shared_secret(key).to_vec();
            }
            // The middle is the initiator on this leg, so the pair swaps.
            let (dkey, ekey) = crypto::derive_session_keys(
                &state.shared_secret,
                &state.middle_cert,
                &state.target_nonce,
            );
            state.encrypt = Some(PacketCipher::new(dkey));
            state.decrypt = Some(PacketCipher::new(ekey));
            log::debug!("[MIDDLE] target keying complete, middle id {}", state.middle_id);
            if let Some(cookie_id) = state.deferred_cookie.take() {
                server.resume_deferred_handshake(&cookie_id, now);
            }
            Ok(())
        }
        other => {
            log::debug!("[MIDDLE] unknown target handshake type 0x{other:02x}");
            Ok(())
        }
    }
}

/// Initiator -> target: parse, rewrite, re-encrypt under the target leg.
pub(crate) fn relay_from_initiator(
    session: &mut Session,
    server: &mut Server,
    payload: &[u8],
    now: Duration,
) -> Result<()> {
    let target_addr = session
        .target
        .as_ref()
        .map(|t| t.address)
        .ok_or(Error::SessionFailed("middle without target".into()))?;
    let mut cur = Cursor::new(payload);
    let marker = cur.read_u8("marker")?;
    let _ts = cur.read_u16("timestamp")?;
    let mut request = payload[..3].to_vec();
    if marker | 0xf0 == 0xfd {
        let echo = cur.read_bytes(2, "timestamp echo")?;
        request.extend_from_slice(echo);
    }
    let header_len = request.len();

    let mut kill_after = false;
    while let Some(ty) = cur.peek_u8() {
        if ty == 0xff {
            break;
        }
        cur.skip(1, "chunk type")?;
        let size = cur.read_u16("chunk size")? as usize;
        let chunk = cur.read_bytes(size, "chunk payload")?;
        let newdata = match ty {
            0x10 => rewrite_initiator_user_data(session, server, chunk)?,
            0x4c => {
                kill_after = true;
                chunk.to_vec()
            }
            _ => chunk.to_vec(),
        };
        request.push(ty);
        request.extend_from_slice(&(newdata.len() as u16).to_be_bytes());
        request.extend_from_slice(&newdata);
    }

    if request.len() > header_len {
        if let SessionKind::Middle(state) = &mut session.kind {
            send_to_target(state, target_addr, &request)?;
        }
    }
    if kill_after {
        session.kill(server);
    }
    Ok(())
}

/// Rewrites applied to initiator-side 0x10 chunks.
fn rewrite_initiator_user_data(
    session: &mut Session,
    server: &Server,
    chunk: &[u8],
) -> Result<Vec<u8>> {
    let mut c = Cursor::new(chunk);
    let frag_flags = c.read_u8("fragment flags")?;
    let flow_id = c.read_varint7("flow id")?;
    let stage = c.read_varint7("stage")?;
    let mut out = vec![frag_flags];
    put_varint7(&mut out, flow_id);
    put_varint7(&mut out, stage);
    let content = c.rest();

    let SessionKind::Middle(state) = &mut session.kind else {
        out.extend_from_slice(content);
        return Ok(out);
    };

    if !state.is_peer {
        if flow_id == 0x02 && stage == 0x01 && content.len() > 14 {
            // connect: swap tcUrl for the middle's target URL.
            out.extend_from_slice(&content[..14]);
            let mut c = Cursor::new(&content[14..]);
            let name = c.read_string16("command name")?;
            crate::codec::put_string16(&mut out, name);
            let mut reader = amf::Reader::new(c.rest());
            let mut writer = amf::Writer::new();
            writer.write(&reader.read()?);
            let mut object = reader.read()?;
            if object.get("tcUrl").is_some() {
                object.set("tcUrl", Value::String(state.query_url.clone()));
            }
            writer.write(&object);
            out.extend_from_slice(&writer.into_bytes());
            return Ok(out);
        }
        if flow_id == 0x02 && stage == 0x02 && content.len() > 7 {
            // setPeerInfo: every private address gets the middle port.
            out.extend_from_slice(&content[..7]);
            let mut reader = amf::Reader::new(&content[7..]);
            let mut writer = amf::Writer::new();
            let name = reader.read()?;
            let is_set_peer_info = name.as_str() == Some("setPeerInfo");
            writer.write(&name);
            if is_set_peer_info {
                writer.write(&reader.read()?);
                let _ = reader.read();
                writer.write(&Value::Null);
                let port = state.socket.local_addr()?.port();
                while !reader.is_empty() {
                    match reader.read() {
                        Ok(Value::String(address)) => {
                            let host = address
                                .rsplit_once(':')
                                .map_or(address.as_str(), |(h, _)| h);
                            writer.write(&Value::String(format!("{host}:{port}")));
                        }
                        Ok(other) => writer.write(&other),
                        Err(_) => break,
                    }
                }
            }
            out.extend_from_slice(&writer.into_bytes());
            return Ok(out);
        }
    } else if flow_id == 0x02 && stage == 0x01 && content.len() > 7 {
        // NetGroup join toward the proxied peer: recompute the group
        // signature under the target-side secret and restore the real id.
        out.extend_from_slice(&content[..5]);
        let mut c = Cursor::new(&content[5..]);
        let net_group_header = c.read_u16("netgroup header")?;
        if let (0x4752, Some(target)) = (net_group_header, session.target.as_ref()) {
            out.extend_from_slice(c.read_bytes(71, "netgroup prefix")?);
            if let Some(group) = server.groups.find_with_peer(&target.id) {
                let inner = crypto::hmac_sha256(&state.shared_secret, &state.target_nonce);
                let signature = crypto::hmac_sha256(&group.id, &inner);
                c.skip(32, "group signature")?;
                out.extend_from_slice(&signature);
                out.extend_from_slice(c.read_bytes(4, "netgroup separator")?);
                c.skip(32, "advertised peer id")?;
                out.extend_from_slice(&target.peer_id);
            } else {
                log::debug!("[MIDDLE] netgroup handshake without a shared group");
            }
        }
        out.extend_from_slice(c.rest());
        return Ok(out);
    }

    out.extend_from_slice(content);
    Ok(out)
}

/// Target -> initiator: parse, rewrite, re-encrypt under the client leg.
fn relay_from_target(
    session: &mut Session,
    server: &mut Server,
    payload: &[u8],
    now: Duration,
) -> Result<()> {
    {
        let SessionKind::Middle(state) = &mut session.kind else {
            return Ok(());
        };
        if state.first_response {
            session.recv_ts = now;
        }
        state.first_response = false;
    }
    let mut cur = Cursor::new(payload);
    let marker = cur.read_u8("marker")?;
    let _ts = cur.read_u16("timestamp")?;
    let mut echo_to_client = None;
    if marker | 0xf0 == 0xfe {
        echo_to_client = Some(cur.read_u16("timestamp echo")?);
    }

    let mut request = Vec::new();
    let mut stage: u32 = 0;
    while let Some(ty) = cur.peek_u8() {
        if ty == 0xff {
            break;
        }
        cur.skip(1, "chunk type")?;
        let size = cur.read_u16("chunk size")? as usize;
        let chunk = cur.read_bytes(size, "chunk payload")?;
        request.push(ty);
        request.extend_from_slice(&(size as u16).to_be_bytes());
        match ty {
            0x10 | 0x11 => {
                rewrite_target_user_data(session, server, marker, ty, chunk, &mut stage, &mut request)?;
            }
            0x0f => {
                let mut c = Cursor::new(chunk);
                request.extend_from_slice(c.read_bytes(3, "forward header")?);
                let peer_id = c.read_bytes(32, "forwarded peer id")?;
                let advertised = match &session.kind {
                    SessionKind::Middle(state) => state.middle_peer_id,
                    SessionKind::Direct => [0u8; 32],
                };
                if peer_id != session.peer.id && peer_id != advertised {
                    log::debug!("[MIDDLE] forwarded handshake does not match either peer id");
                }
                request.extend_from_slice(&session.peer.id);
                request.extend_from_slice(c.rest());
            }
            _ => request.extend_from_slice(chunk),
        }
    }

    if let Some(echo) = echo_to_client {
        session.set_time_sent(echo);
    }
    if request.is_empty() {
        return Ok(());
    }
    forward_to_client(session, server, &request, now)
}

/// Rewrites applied to target-side 0x10/0x11 chunks before they reach the
/// initiator.
fn rewrite_target_user_data(
    session: &mut Session,
    server: &Server,
    marker: u8,
    ty: u8,
    chunk: &[u8],
    stage: &mut u32,
    request: &mut Vec<u8>,
) -> Result<()> {
    let mut c = Cursor::new(chunk);
    let frag_flags = c.read_u8("fragment flags")?;
    request.push(frag_flags);
    let mut flow_id = 0u32;
    if ty == 0x10 {
        flow_id = c.read_varint7("flow id")?;
        *stage = c.read_varint7("stage")?;
        put_varint7(request, flow_id);
        put_varint7(request, *stage);
    } else {
        *stage += 1;
    }
    if c.is_empty() {
        return Ok(());
    }
    let delta = c.read_varint7("deltaNack")?;
    put_varint7(request, delta);

    if frag_flags & flags::WITH_BEFOREPART == 0 {
        if frag_flags & flags::HEADER != 0 {
            // Copy the signature and association blocks untouched.
            loop {
                let len = c.read_u8("header block length")?;
                request.push(len);
                if len == 0 {
                    break;
                }
                request.extend_from_slice(c.read_bytes(len as usize, "header block")?);
            }
        }
        if !c.is_empty() {
            let inner = c.read_u8("inner type")?;
            request.push(inner);
            match inner {
                0x08 | 0x09 => {
                    request.extend_from_slice(c.read_bytes(4, "media timestamp")?);
                }
                0x04 => {
                    request.extend_from_slice(c.read_bytes(14, "raw header")?);
                }
                _ => {}
            }
            let p2p_handshake = inner == 0x0b
                && *stage == 0x01
                && ((marker == 0x4e && flow_id == 0x03) || (marker == 0x8e && flow_id == 0x05));
            if p2p_handshake {
                let wanted = c.read_bytes(32, "middle peer id")?;
                let mut replaced: PeerId = [0u8; 32];
                replaced.copy_from_slice(wanted);
                if let Some(real) = server.find_peer_behind_middle(&replaced) {
                    log::debug!("[MIDDLE] replaced middle id by real peer id");
                    replaced = real;
                }
                request.extend_from_slice(&replaced);
            } else if inner == 0x01 {
                let (SessionKind::Middle(state), Some(target)) =
                    (&session.kind, session.target.as_ref())
                else {
                    request.extend_from_slice(c.rest());
                    return Ok(());
                };
                request.extend_from_slice(c.read_bytes(68, "netgroup prefix")?);
                if let Some(group) = server.groups.find_with_peer(&target.id) {
                    let inner_mac = crypto::hmac_sha256(&state.shared_secret, &state.target_nonce);
                    let signature = crypto::hmac_sha256(&group.id, &inner_mac);
                    c.skip(32, "group signature")?;
                    request.extend_from_slice(&signature);
                    request.extend_from_slice(c.read_bytes(4, "netgroup separator")?);
                    c.skip(32, "peer id")?;
                    request.extend_from_slice(&target.peer_id);
                } else {
                    log::debug!("[MIDDLE] netgroup packet without a shared group");
                }
            }
        }
    }
    request.extend_from_slice(c.rest());
    Ok(())
}

/// Ship a rewritten target packet to the initiator under the client-leg
/// crypto.
fn forward_to_client(
    session: &mut Session,
    server: &Server,
    request: &[u8],
    now: Duration,
) -> Result<()> {
    let marker = if now.saturating_sub(session.recv_ts) < Duration::from_secs(30) {
        0x4e
    } else {
        0x4a
    };
    let mut data = vec![0u8; DATA_OFFSET];
    data.push(marker);
    data.extend_from_slice(&time_4ms(now).to_be_bytes());
    if marker == 0x4e {
        let echo = session.client_echo(now);
        data.extend_from_slice(&echo.to_be_bytes());
    }
    data.extend_from_slice(request);
    session.seal_and_send(server, &mut data)
}

/// On middle death, tell the target its session is over.
pub(crate) fn signal_close_to_target(session: &mut Session, now: Duration) {
    let target_addr = session.target.as_ref().map(|t| t.address);
    let SessionKind::Middle(state) = &mut session.kind else {
        return;
    };
    let Some(addr) = target_addr else { return };
    if state.encrypt.is_none() {
        return;
    }
    let mut payload = Vec::with_capacity(8);
    payload.push(0x4a);
    payload.extend_from_slice(&time_4ms(now).to_be_bytes());
    payload.push(0x4c);
    payload.extend_from_slice(&0u16.to_be_bytes());
    if let Err(err) = send_to_target(state, addr, &payload) {
        log::debug!("[MIDDLE] close signal to target failed: {err}");
    }
}
