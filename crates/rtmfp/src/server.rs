// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The UDP server: socket ownership, session routing and rendezvous.
//!
//! One readiness loop owns every socket: the public socket (token 0) and
//! one child socket per middle session. Datagrams are routed by their
//! unscrambled session id; id 0 goes to the handshake. All session state is
//! touched only from this loop, so there is no locking anywhere in the
//! engine.
//!
//! The manage tick (default 2 s) sweeps expired cookies, drives session
//! timeouts/keepalives and retransmission triggers, and reaps dead sessions.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::{put_address, put_string8, Cursor};
use crate::config::ServerConfig;
use crate::crypto::dh::DH_KEY_SIZE;
use crate::crypto::{self, PeerId};
use crate::entity::{Cookie, DeferredClient, GroupRegistry, Peer, Target};
use crate::flow::MediaLink;
use crate::handshake::Handshake;
use crate::middle;
use crate::packet::{self, MIN_DATAGRAM};
use crate::session::{Session, SessionKind};
use crate::streams::Streams;
use crate::{Error, Result};

const MAIN_TOKEN: Token = Token(0);
const RECV_BUFFER: usize = 2048;

/// How a 0x38 keying was answered.
enum Minted {
    /// Session created; reply with the responder keying now.
    Created(u32),
    /// Middle session created; the keying goes out when the middle finishes
    /// its own handshake with the target.
    Deferred(u32),
}

/// The RTMFP server.
pub struct Server {
    pub config: ServerConfig,
    socket: Rc<mio::net::UdpSocket>,
    poll: Poll,
    epoch: Instant,
    pub(crate) handshake: Handshake,
    sessions: HashMap<u32, Session>,
    /// Child-socket token -> owning middle session id.
    tokens: HashMap<Token, u32>,
    next_token: usize,
    next_session_id: u32,
    pub(crate) groups: GroupRegistry,
    pub(crate) streams: Streams,
    last_manage: Option<Duration>,
}

impl Server {
    /// Bind the public UDP socket and set up the readiness loop.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let config = config.clamp();
        let domain = if config.host.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_nonblocking(true)?;
        raw.bind(&config.bind_addr().into())?;
        let std_socket: std::net::UdpSocket = raw.into();
        let mut socket = mio::net::UdpSocket::from_std(std_socket);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, MAIN_TOKEN, Interest::READABLE)?;
        log::info!(
            "[SERVER] listening udp on {} (middle={})",
            socket.local_addr()?,
            config.middle
        );
        Ok(Self {
            config,
            socket: Rc::new(socket),
            poll,
            epoch: Instant::now(),
            handshake: Handshake::new()?,
            sessions: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            next_session_id: 0,
            groups: GroupRegistry::new(),
            streams: Streams::new(),
            last_manage: None,
        })
    }

    /// Monotonic time since the server started.
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Address of the public socket (useful when bound to port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, id: u32) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Peer identity of a live session, for introspection and tests.
    pub fn session_peer_id(&self, id: u32) -> Option<PeerId> {
        self.sessions.get(&id).map(|s| s.peer.id)
    }

    pub(crate) fn socket_ref(&self) -> Rc<mio::net::UdpSocket> {
        Rc::clone(&self.socket)
    }

    /// Run the event loop forever.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.poll_once(Some(self.config.freq_manage))?;
            self.manage(self.now());
        }
    }

    /// One iteration of the event loop: wait for readiness (up to
    /// `timeout`) and drain whatever sockets woke up.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut events = Events::with_capacity(128);
        if let Err(err) = self.poll.poll(&mut events, timeout) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        let now = self.now();
        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token == MAIN_TOKEN {
                self.drain_main_socket(now);
            } else if let Some(&session_id) = self.tokens.get(&token) {
                self.drain_middle_socket(session_id, now);
            }
        }
        Ok(())
    }

    fn drain_main_socket(&mut self, now: Duration) {
        let socket = self.socket_ref();
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    log::debug!("[SERVER] <= {from} [{len}]");
                    self.process_datagram(&buf[..len], from, now);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::error!("[SERVER] receive error: {err}");
                    break;
                }
            }
        }
    }

    fn drain_middle_socket(&mut self, session_id: u32, now: Duration) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        middle::on_child_readable(self, &mut session, now);
        if session.died {
            self.reap(session);
        } else {
            self.sessions.insert(session_id, session);
        }
    }

    /// Route one datagram: id 0 to the handshake, anything else to its
    /// session. Unknown ids and undecodable packets are dropped silently so
    /// spoofed traffic cannot probe session state.
    pub fn process_datagram(&mut self, data: &[u8], from: std::net::SocketAddr, now: Duration) {
        if data.len() < MIN_DATAGRAM {
            log::debug!("[SERVER] invalid packet of length {}", data.len());
            return;
        }
        let Some(id) = packet::unscramble_id(data) else {
            return;
        };
        if id == 0 {
            if let Err(err) = self.on_handshake_datagram(data, from, now) {
                log::debug!("[HANDSHAKE] dropped packet from {from}: {err}");
            }
            return;
        }
        let Some(mut session) = self.sessions.remove(&id) else {
            log::debug!("[SERVER] session {id} not found");
            return;
        };
        if !session.checked {
            self.handshake.commit_cookie(session.id);
            session.checked = true;
        }
        if let Err(err) = session.handle(self, data, from, now) {
            log::debug!("[SESSION] error on session {id}: {err}");
        }
        if session.died {
            self.reap(session);
        } else {
            self.sessions.insert(id, session);
        }
    }

    /// Tear down a dead session's external resources.
    fn reap(&mut self, mut session: Session) {
        log::debug!("[SERVER] session {} reaped", session.id);
        self.groups.remove_member(&session.peer.groups, session.id);
        self.streams.forget_session(session.id);
        if let SessionKind::Middle(state) = &mut session.kind {
            self.tokens.remove(&state.token);
            if let Err(err) = self.poll.registry().deregister(&mut state.socket) {
                log::debug!("[SERVER] middle socket deregister failed: {err}");
            }
        }
    }

    /// Periodic sweep; rate-limited to the configured manage frequency.
    pub fn manage(&mut self, now: Duration) {
        if let Some(last) = self.last_manage {
            if now < last + self.config.freq_manage {
                return;
            }
        }
        self.last_manage = Some(now);
        self.handshake.sweep(now);
        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for id in ids {
            let Some(mut session) = self.sessions.remove(&id) else {
                continue;
            };
            session.manage(self, now);
            if session.died {
                self.reap(session);
            } else {
                self.sessions.insert(id, session);
            }
        }
    }

    // ========================================================================
    // Handshake processing
    // ========================================================================

    fn on_handshake_datagram(
        &mut self,
        data: &[u8],
        from: std::net::SocketAddr,
        now: Duration,
    ) -> Result<()> {
        let raw = packet::open(self.handshake.cipher(), data)?;
        let mut c = Cursor::new(&raw[packet::DATA_OFFSET..]);
        let marker = c.read_u8("handshake marker")?;
        if marker != 0x0b {
            return Err(Error::BadMarker(marker));
        }
        let _timestamp = c.read_u16("handshake timestamp")?;
        let ty = c.read_u8("handshake type")?;
        let size = c.read_u16("handshake size")? as usize;
        let payload = c.read_bytes(size, "handshake payload")?.to_vec();
        match ty {
            0x30 => self.on_initiator_hello(&payload, from, now),
            0x38 => self.on_initiator_keying(&payload, from, now),
            other => Err(Error::UnknownHandshakeType(other)),
        }
    }

    fn on_initiator_hello(
        &mut self,
        payload: &[u8],
        from: std::net::SocketAddr,
        now: Duration,
    ) -> Result<()> {
        let mut c = Cursor::new(payload);
        let _first = c.read_u8("hello prefix")?;
        let epd_len = c.read_u8("epd length")? as usize;
        let epd_type = c.read_u8("epd type")?;
        if epd_len == 0 {
            return Err(Error::Truncated("endpoint discriminator"));
        }
        let epd = c.read_bytes(epd_len - 1, "endpoint discriminator")?;
        let tag = c.read_bytes(16, "hello tag")?;
        let mut response = Vec::new();
        put_string8(&mut response, tag);
        let socket = self.socket_ref();
        match epd_type {
            0x0a => {
                log::debug!(
                    "[HANDSHAKE] url hello from {from}: {:?}",
                    String::from_utf8_lossy(epd)
                );
                let cookie = Cookie::for_url(epd, self.handshake.rng(), now)?;
                let cookie_id = self.handshake.store_cookie(cookie)?;
                put_string8(&mut response, &cookie_id);
                response.extend_from_slice(self.handshake.certificate());
                self.handshake
                    .send_response(&socket, from, now, 0x70, &response, 0)
            }
            0x0f => {
                let (ty, extra) = self.handshake_p2p(tag, from, epd, now)?;
                if ty == 0 {
                    return Ok(());
                }
                response.extend_from_slice(&extra);
                self.handshake
                    .send_response(&socket, from, now, ty, &response, 0)
            }
            other => Err(Error::UnknownEpdType(other)),
        }
    }

    fn on_initiator_keying(
        &mut self,
        payload: &[u8],
        from: std::net::SocketAddr,
        now: Duration,
    ) -> Result<()> {
        let mut c = Cursor::new(payload);
        let far_id = c.read_u32("initiator session id")?;
        let cookie_id = c.read_string7("cookie echo")?.to_vec();
        let socket = self.socket_ref();

        // A retransmitted keying for an already-minted session is answered
        // from the recorded state instead of re-keying.
        let repeat = {
            let cookie = self.handshake.take_pending(&cookie_id)?;
            (cookie.session_id != 0).then(|| cookie.keying_payload())
        };
        if let Some(keying) = repeat {
            return self
                .handshake
                .send_response(&socket, from, now, 0x78, &keying, far_id);
        }

        let cert = c.read_string7("initiator certificate")?;
        if cert.len() < DH_KEY_SIZE {
            return Err(Error::Truncated("initiator public key"));
        }
        let init_nonce = c.read_string7("initiator nonce")?.to_vec();
        let init_public = cert[cert.len() - DH_KEY_SIZE..].to_vec();
        let peer_id = crypto::peer_id_of(cert);

        let (dkey, ekey, query_url) = {
            let cookie = self
                .handshake
                .cookie_mut(&cookie_id)
                .ok_or(Error::UnknownCookie)?;
            let (dkey, ekey) = cookie
                .compute_keys(&init_public, &init_nonce)
                .ok_or(Error::Crypto("cookie without dh context"))?;
            (dkey, ekey, cookie.query_url.clone())
        };

        let mut peer = Peer::new(from);
        peer.id = peer_id;
        peer.path = url_path(&query_url);
        peer.query_url = query_url;
        log::debug!("[HANDSHAKE] keying from {from}, peer {:02x?}..", &peer.id[..4]);

        match self.create_session(far_id, peer, dkey, ekey, &cookie_id, now)? {
            Minted::Created(id) => {
                let cookie = self
                    .handshake
                    .cookie_mut(&cookie_id)
                    .ok_or(Error::UnknownCookie)?;
                cookie.session_id = id;
                let keying = cookie.keying_payload();
                self.handshake
                    .send_response(&socket, from, now, 0x78, &keying, far_id)
            }
            Minted::Deferred(id) => {
                let cookie = self
                    .handshake
                    .cookie_mut(&cookie_id)
                    .ok_or(Error::UnknownCookie)?;
                cookie.session_id = id;
                cookie.deferred = Some(DeferredClient {
                    address: from,
                    far_id,
                });
                log::debug!("[HANDSHAKE] keying deferred until middle completes");
                Ok(())
            }
        }
    }

    /// Monotonic id allocation skipping 0 and live sessions.
    fn alloc_session_id(&mut self) -> u32 {
        loop {
            self.next_session_id = self.next_session_id.wrapping_add(1);
            if self.next_session_id != 0 && !self.sessions.contains_key(&self.next_session_id) {
                return self.next_session_id;
            }
        }
    }

    /// Mint the session for a completed keying, branching into middle mode
    /// when configured.
    fn create_session(
        &mut self,
        far_id: u32,
        mut peer: Peer,
        dkey: [u8; 16],
        ekey: [u8; 16],
        cookie_id: &[u8],
        now: Duration,
    ) -> Result<Minted> {
        let id = self.alloc_session_id();

        let mut middle_target: Option<Target> = None;
        let mut own_target: Option<Target> = None;
        if self.config.middle {
            let existing = self
                .handshake
                .cookie(cookie_id)
                .and_then(|c| c.target.clone());
            if let Some(target) = existing {
                // Rendezvous toward a proxied peer: this session relays.
                middle_target = Some(target);
            } else if let Some(cirrus) = self.config.cirrus {
                middle_target = Some(Target::for_url(cirrus));
            } else if let Some(cookie) = self.handshake.cookie_mut(cookie_id) {
                // First client in middle mode: capture its DH context so
                // future initiators can be proxied to it.
                let mut target = Target::from_cookie(peer.address, cookie);
                target.peer_id = peer.id;
                log::info!(
                    "[MIDDLE] to connect peer {} use {}",
                    hex(&target.peer_id),
                    hex(&target.id)
                );
                peer.id = target.id;
                cookie.target = Some(target.clone());
                own_target = Some(target);
            }
        }

        if let Some(target) = middle_target {
            let mut session = middle::create(self, id, far_id, peer, dkey, ekey, target, now)?;
            if let SessionKind::Middle(state) = &mut session.kind {
                state.deferred_cookie = Some(cookie_id.to_vec());
                self.tokens.insert(state.token, id);
            }
            log::debug!("[SERVER] created middle session {id} (far {far_id})");
            self.sessions.insert(id, session);
            return Ok(Minted::Deferred(id));
        }

        let mut session = Session::new(id, far_id, peer, dkey, ekey, now);
        session.target = own_target;
        log::debug!("[SERVER] created session {id} (far {far_id})");
        self.sessions.insert(id, session);
        Ok(Minted::Created(id))
    }

    /// Resume a client keying that waited for the middle's own handshake.
    pub(crate) fn resume_deferred_handshake(&mut self, cookie_id: &[u8], now: Duration) {
        let Some(cookie) = self.handshake.cookie(cookie_id) else {
            log::debug!("[HANDSHAKE] deferred cookie vanished");
            return;
        };
        let Some(deferred) = cookie.deferred else {
            return;
        };
        let keying = cookie.keying_payload();
        let socket = self.socket_ref();
        if let Err(err) = self.handshake.send_response(
            &socket,
            deferred.address,
            now,
            0x78,
            &keying,
            deferred.far_id,
        ) {
            log::debug!("[HANDSHAKE] deferred keying send failed: {err}");
        }
    }

    // ========================================================================
    // Rendezvous
    // ========================================================================

    /// Introduce the initiator at `addr` to the holder of `epd` (a peer id).
    ///
    /// Returns the handshake reply `(type, payload)`; type 0 means drop
    /// silently so probes for unknown peers learn nothing.
    fn handshake_p2p(
        &mut self,
        tag: &[u8],
        addr: std::net::SocketAddr,
        epd: &[u8],
        now: Duration,
    ) -> Result<(u8, Vec<u8>)> {
        if epd.len() != 32 {
            log::debug!("[RENDEZVOUS] peer-id epd of {} bytes", epd.len());
            return Ok((0, Vec::new()));
        }
        let mut wanted: PeerId = [0u8; 32];
        wanted.copy_from_slice(epd);

        let wanted_sid = self
            .sessions
            .iter()
            .find(|(_, s)| s.peer.id == wanted)
            .map(|(&id, _)| id);
        let Some(wanted_sid) = wanted_sid else {
            log::debug!("[RENDEZVOUS] no session for wanted peer {}", hex(&wanted));
            return Ok((0, Vec::new()));
        };
        if self.sessions[&wanted_sid].failed {
            log::debug!("[RENDEZVOUS] wanted session {wanted_sid} is going away");
            return Ok((0, Vec::new()));
        }

        if self.config.middle {
            if let Some(target) = self.sessions[&wanted_sid].target.clone() {
                // Pretend the proxied peer answered: hand out a cookie bound
                // to its captured context and its public value.
                let kp = target.kp;
                let cookie = Cookie::for_target(target, self.handshake.rng(), now)?;
                let cookie_id = self.handshake.store_cookie(cookie)?;
                let mut resp = Vec::new();
                put_string8(&mut resp, &cookie_id);
                resp.extend_from_slice(&[0x81, 0x02, 0x1d, 0x02]);
                resp.extend_from_slice(&kp);
                return Ok((0x70, resp));
            }
            log::error!("[RENDEZVOUS] middle mode without a captured target for the wanted peer");
        }

        let initiator = self
            .sessions
            .values()
            .find(|s| s.peer.address == addr)
            .map(|s| (s.peer.id, s.peer.private_addresses.clone()));
        let (initiator_id, initiator_private) = initiator.unwrap_or((wanted, Vec::new()));

        let socket = self.socket_ref();
        let wanted_session = self.sessions.get_mut(&wanted_sid).expect("looked up above");
        wanted_session.emit_p2p_handshake(
            &socket,
            now,
            &initiator_id,
            addr,
            &initiator_private,
            tag,
        )?;

        let mut resp = Vec::new();
        put_address(&mut resp, &wanted_session.peer.address, true);
        for private in &wanted_session.peer.private_addresses {
            if *private == addr {
                continue;
            }
            put_address(&mut resp, private, false);
        }
        Ok((0x71, resp))
    }

    // ========================================================================
    // Middle helpers
    // ========================================================================

    pub(crate) fn register_middle_socket(
        &mut self,
        socket: &mut mio::net::UdpSocket,
    ) -> Result<Token> {
        self.next_token += 1;
        let token = Token(self.next_token);
        self.poll
            .registry()
            .register(socket, token, Interest::READABLE)?;
        Ok(token)
    }

    /// Map an advertised (synthetic) middle identity back to the real one.
    pub(crate) fn find_peer_behind_middle(&self, advertised: &PeerId) -> Option<PeerId> {
        self.sessions
            .values()
            .filter_map(|s| s.target.as_ref())
            .find(|t| &t.id == advertised)
            .map(|t| t.peer_id)
    }

    // ========================================================================
    // Media fan-out
    // ========================================================================

    /// Push a publisher's media packet to every listener. Returns false when
    /// no publication is bound to the stream index.
    pub(crate) fn push_media(
        &mut self,
        index: u32,
        kind: u8,
        tm: u32,
        data: &[u8],
        lost: u32,
        now: Duration,
    ) -> bool {
        let Some(name) = self.streams.publication_by_publisher(index) else {
            return false;
        };
        let Server {
            streams,
            sessions,
            socket,
            ..
        } = self;
        let Some(publication) = streams.publication_mut(&name) else {
            return false;
        };
        match kind {
            0x08 => publication.audio_qos.add(now, tm, 1, lost),
            _ => publication.video_qos.add(now, tm, 1, lost),
        }
        for listener in publication.listeners.values_mut() {
            let Some(session) = sessions.get_mut(&listener.session_id) else {
                continue;
            };
            if kind == 0x09 {
                if data.first().is_some_and(|b| b & 0xf0 == 0x10) {
                    listener.first_key_frame = true;
                }
                if !listener.first_key_frame {
                    log::debug!(
                        "[STREAM] video frame dropped for listener {} until key frame",
                        listener.index
                    );
                    listener.video_qos.dropped_frames += 1;
                    continue;
                }
            }
            let writer_id = if kind == 0x08 {
                listener.audio_writer
            } else {
                listener.video_writer
            };
            if session.writer_mut(writer_id).is_some_and(|w| w.reseted) {
                if let Some(writer) = session.writer_mut(writer_id) {
                    writer.reseted = false;
                }
                session.write_bounds(listener);
            }
            let time = listener.compute_time(tm);
            let mut record = Vec::with_capacity(5 + data.len());
            record.push(kind);
            record.extend_from_slice(&time.to_be_bytes());
            record.extend_from_slice(data);
            if let Some(writer) = session.writer_mut(writer_id) {
                if listener.unbuffered {
                    writer.write_unbuffered(record);
                } else {
                    writer.write_raw(&record, true);
                }
            }
            if let Err(err) = session.flush(socket, now, false) {
                log::debug!("[STREAM] listener flush failed: {err}");
            }
        }
        true
    }

    /// Flush listeners of the publication fed by `index` (commit hook).
    pub(crate) fn flush_publication_of(&mut self, index: u32, now: Duration) {
        let Some(name) = self.streams.publication_by_publisher(index) else {
            return;
        };
        let Server {
            streams,
            sessions,
            socket,
            ..
        } = self;
        let Some(publication) = streams.publication_mut(&name) else {
            return;
        };
        for listener in publication.listeners.values() {
            if let Some(session) = sessions.get_mut(&listener.session_id) {
                if let Err(err) = session.flush(socket, now, false) {
                    log::debug!("[STREAM] listener flush failed: {err}");
                }
            }
        }
    }

    /// Tell every listener a publisher appeared.
    pub(crate) fn notify_publish(&mut self, name: &str, now: Duration) {
        let Server {
            streams,
            sessions,
            socket,
            ..
        } = self;
        let Some(publication) = streams.publication_mut(name) else {
            return;
        };
        for listener in publication.listeners.values_mut() {
            listener.first_key_frame = false;
            let Some(session) = sessions.get_mut(&listener.session_id) else {
                continue;
            };
            if let Some(writer) = session.writer_mut(listener.main_writer) {
                writer.write_amf(
                    "onStatus",
                    &[crate::amf::status(
                        "status",
                        "NetStream.Play.PublishNotify",
                        &format!("\"{name}\" is now published"),
                    )],
                );
            }
            let _ = session.flush(socket, now, false);
        }
    }

    /// Tell every listener the publisher went away.
    pub(crate) fn notify_unpublish(&mut self, name: &str, now: Duration) {
        let Server {
            streams,
            sessions,
            socket,
            ..
        } = self;
        let Some(publication) = streams.publication_mut(name) else {
            return;
        };
        for listener in publication.listeners.values_mut() {
            listener.on_unpublish();
            let Some(session) = sessions.get_mut(&listener.session_id) else {
                continue;
            };
            if let Some(writer) = session.writer_mut(listener.main_writer) {
                writer.write_amf(
                    "onStatus",
                    &[crate::amf::status(
                        "status",
                        "NetStream.Play.UnpublishNotify",
                        &format!("\"{name}\" is now unpublished"),
                    )],
                );
            }
            let _ = session.flush(socket, now, false);
        }
    }

    /// Feed a listener's QoS from an acknowledged media message.
    pub(crate) fn record_media_ack(
        &mut self,
        link: &MediaLink,
        tm: u32,
        lost: u32,
        now: Duration,
    ) {
        let Some(publication) = self.streams.publication_mut(&link.publication) else {
            return;
        };
        let Some(listener) = publication.listeners.get_mut(&link.listener) else {
            return;
        };
        match link.kind {
            0x08 => listener.audio_qos.add(now, tm, 1, lost),
            _ => listener.video_qos.add(now, tm, 1, lost),
        }
    }
}

/// Path component of an rtmfp URL (`rtmfp://host:port/app?x -> /app`).
fn url_path(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    match rest.find('/') {
        Some(at) => {
            let path = &rest[at..];
            path.split_once('?').map_or(path, |(p, _)| p).to_string()
        }
        None => String::new(),
    }
}

/// Lowercase hex of an identity.
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
