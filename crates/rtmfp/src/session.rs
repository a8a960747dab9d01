// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Established session state machine.
//!
//! A session is one peer endpoint with its AES context pair, its flow
//! tables and its liveness timers. Inbound datagrams are decrypted,
//! checksum-verified and split into chunks; user-data chunks feed the flow
//! reassembly and the per-purpose dispatch below. Outbound traffic is staged
//! in a [`PacketBuilder`] and sealed on flush.
//!
//! ## Chunk types handled
//!
//! | type | meaning |
//! |------|---------|
//! | 0x0c | peer-initiated close -> mark failed |
//! | 0x4c | peer died ack -> kill session |
//! | 0x01 | keepalive probe -> reply 0x41 |
//! | 0x41 | keepalive reply -> reset counter |
//! | 0x10 | user-data fragment (flow id, stage, deltaNack, flags) |
//! | 0x11 | continuation fragment (implicit stage + 1) |
//! | 0x51 | acknowledgement for a flow |
//! | 0x5e | flow exception report |
//! | 0x18 | buffer probe -> zero acknowledgement |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::amf::{self, Value};
use crate::codec::{put_varint7, Cursor};
use crate::crypto::{PacketCipher, PeerId};
use crate::entity::{GroupMember, Peer, PeerState, Target};
use crate::flow::{
    self, classify_signature, flags, ChunkSink, Fire, Flow, FlowEvent, FlowKind, FlowWriter,
    InnerKind, MediaLink, StreamState,
};
use crate::middle::MiddleState;
use crate::packet::{
    self, scramble_id, seal, time_4ms, PacketBuilder, DATA_OFFSET, MARKER_ECHO_BIT, MARKER_SERVER,
    MARKER_SYMMETRIC,
};
use crate::server::Server;
use crate::streams::Listener;
use crate::{Error, Result};

/// Receive-idle limit; a session quieter than this is failed.
pub const TIMEOUT_RECV: Duration = Duration::from_secs(360);
/// Idle time after which the server starts probing with keepalives.
pub const TIMEOUT_KEEPALIVE: Duration = Duration::from_secs(120);
/// Keepalive probes without a reply before the session is failed.
pub const MAX_KEEPALIVE_ATTEMPTS: u8 = 10;
/// Close chunks emitted after failure before the session is reaped.
pub const MAX_FAIL_SIGNALS: u8 = 10;
/// Echo the peer's timestamp only if it was heard within this window.
const ECHO_WINDOW: Duration = Duration::from_secs(30);

/// Send retries on a short or blocked UDP write.
const SEND_ATTEMPTS: usize = 3;

/// Fire a datagram with bounded retries; transport errors are logged, not
/// fatal (UDP loss is normal operation).
pub(crate) fn send_datagram(socket: &mio::net::UdpSocket, data: &[u8], addr: SocketAddr) {
    for _ in 0..SEND_ATTEMPTS {
        match socket.send_to(data, addr) {
            Ok(n) if n == data.len() => return,
            Ok(n) => log::debug!("[UDP] short write {n}/{} to {addr}", data.len()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                log::debug!("[UDP] send to {addr} failed: {err}");
                return;
            }
        }
    }
    log::debug!("[UDP] datagram to {addr} dropped after {SEND_ATTEMPTS} attempts");
}

/// Outbound packet path of a session: stages chunks and seals packets.
///
/// Borrows the builder and crypto context from the session so flow writers
/// can force mid-flush sends without reaching back into the session.
pub(crate) struct Outbound<'a> {
    pub builder: &'a mut PacketBuilder,
    pub cipher: &'a PacketCipher,
    pub far_id: u32,
    pub addr: SocketAddr,
    pub socket: &'a mio::net::UdpSocket,
    pub now: Duration,
    pub symmetric: bool,
    /// Timestamp echo for the final flush; forced flushes never echo.
    pub echo: Option<u16>,
}

impl Outbound<'_> {
    pub fn flush_with(&mut self, echo: Option<u16>) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let base = if self.symmetric {
            MARKER_SYMMETRIC
        } else {
            MARKER_SERVER
        };
        let marker = base + if echo.is_some() { MARKER_ECHO_BIT } else { 0 };
        let mut data = vec![0u8; DATA_OFFSET];
        data.push(marker);
        data.extend_from_slice(&time_4ms(self.now).to_be_bytes());
        if let Some(e) = echo {
            data.extend_from_slice(&e.to_be_bytes());
        }
        data.extend_from_slice(&self.builder.take());
        seal(self.cipher, &mut data)?;
        scramble_id(&mut data, self.far_id);
        send_datagram(self.socket, &data, self.addr);
        Ok(())
    }

    /// Final flush carrying the session's echo, if allowed.
    pub fn finish(mut self) -> Result<()> {
        let echo = self.echo.take();
        self.flush_with(echo)
    }
}

impl ChunkSink for Outbound<'_> {
    fn available(&self) -> usize {
        self.builder.available()
    }

    fn last_writer(&self) -> Option<u32> {
        self.builder.last_writer()
    }

    fn write_chunk(&mut self, ty: u8, payload: &[u8], writer: Option<u32>) -> Result<()> {
        if 3 + payload.len() > self.builder.available() {
            self.flush_with(None)?;
        }
        self.builder.write_chunk(ty, payload, writer)
    }

    fn flush_packet(&mut self) -> Result<()> {
        self.flush_with(None)
    }
}

/// Direct session or man-in-the-middle variant.
pub enum SessionKind {
    Direct,
    Middle(Box<MiddleState>),
}

/// One established RTMFP endpoint.
pub struct Session {
    /// Near id: what the peer scrambles its packets to.
    pub id: u32,
    /// Far id: what we scramble our packets to.
    pub far_id: u32,
    pub peer: Peer,
    /// P2P middle context owned by this session (middle mode only).
    pub target: Option<Target>,
    decrypt: PacketCipher,
    encrypt: PacketCipher,
    pub recv_ts: Duration,
    time_sent: u16,
    /// Cookie committed: the handshake no longer owns this session's cookie.
    pub checked: bool,
    pub failed: bool,
    pub died: bool,
    times_failed: u8,
    times_keepalive: u8,
    flows: HashMap<u32, Flow>,
    writers: HashMap<u32, FlowWriter>,
    next_writer_id: u32,
    builder: PacketBuilder,
    /// Rendezvous attempts per tag, cycling through private addresses.
    handshake_attempts: HashMap<Vec<u8>, usize>,
    pub kind: SessionKind,
}

impl Session {
    pub fn new(
        id: u32,
        far_id: u32,
        peer: Peer,
        dkey: [u8; 16],
        ekey: [u8; 16],
        now: Duration,
    ) -> Self {
        Self {
            id,
            far_id,
            peer,
            target: None,
            decrypt: PacketCipher::new(dkey),
            encrypt: PacketCipher::new(ekey),
            recv_ts: now,
            time_sent: 0,
            checked: false,
            failed: false,
            died: false,
            times_failed: 0,
            times_keepalive: 0,
            flows: HashMap::new(),
            writers: HashMap::new(),
            next_writer_id: 0,
            builder: PacketBuilder::new(),
            handshake_attempts: HashMap::new(),
            kind: SessionKind::Direct,
        }
    }

    /// Install the peer timestamp to echo (middle relay path).
    pub(crate) fn set_time_sent(&mut self, value: u16) {
        self.time_sent = value;
    }

    /// Echo value for a packet built outside the normal builder path.
    pub(crate) fn client_echo(&self, now: Duration) -> u16 {
        self.time_sent
            .wrapping_add(time_4ms(now.saturating_sub(self.recv_ts)))
    }

    /// Seal a hand-built datagram under this session's keys and send it to
    /// the peer.
    pub(crate) fn seal_and_send(&mut self, server: &Server, data: &mut Vec<u8>) -> Result<()> {
        seal(&self.encrypt, data)?;
        scramble_id(data, self.far_id);
        send_datagram(&server.socket_ref(), data, self.peer.address);
        Ok(())
    }

    fn echo_value(&self, now: Duration) -> Option<u16> {
        if now.saturating_sub(self.recv_ts) < ECHO_WINDOW {
            Some(
                self.time_sent
                    .wrapping_add(time_4ms(now.saturating_sub(self.recv_ts))),
            )
        } else {
            None
        }
    }

    /// Borrow the outbound path toward the peer.
    fn outbound<'a>(&'a mut self, socket: &'a mio::net::UdpSocket, now: Duration) -> Outbound<'a> {
        let echo = self.echo_value(now);
        Outbound {
            builder: &mut self.builder,
            cipher: &self.encrypt,
            far_id: self.far_id,
            addr: self.peer.address,
            socket,
            now,
            symmetric: false,
            echo,
        }
    }

    /// Append a control chunk, flushing first when it would not fit.
    pub(crate) fn write_message(
        &mut self,
        socket: &mio::net::UdpSocket,
        now: Duration,
        ty: u8,
        payload: &[u8],
    ) -> Result<()> {
        if self.failed {
            return Ok(());
        }
        let mut out = self.outbound(socket, now);
        out.write_chunk(ty, payload, None)
    }

    /// Flush queued writer messages and send the packet under construction.
    pub(crate) fn flush(
        &mut self,
        socket: &mio::net::UdpSocket,
        now: Duration,
        with_echo: bool,
    ) -> Result<()> {
        let echo = if with_echo { self.echo_value(now) } else { None };
        let Session {
            writers,
            builder,
            encrypt,
            far_id,
            peer,
            ..
        } = self;
        let mut out = Outbound {
            builder,
            cipher: encrypt,
            far_id: *far_id,
            addr: peer.address,
            socket,
            now,
            symmetric: false,
            echo,
        };
        for writer in writers.values_mut() {
            writer.flush(&mut out)?;
        }
        out.finish()
    }

    // ========================================================================
    // Flow writer registry
    // ========================================================================

    /// Register a writer under a fresh id (never 0, never a live one).
    pub(crate) fn init_flow_writer(&mut self, mut writer: FlowWriter) -> u32 {
        loop {
            self.next_writer_id = self.next_writer_id.wrapping_add(1);
            if self.next_writer_id != 0 && !self.writers.contains_key(&self.next_writer_id) {
                break;
            }
        }
        writer.id = self.next_writer_id;
        self.writers.insert(writer.id, writer);
        self.next_writer_id
    }

    pub(crate) fn writer_mut(&mut self, id: u32) -> Option<&mut FlowWriter> {
        self.writers.get_mut(&id)
    }

    /// Reset a writer whose retry budget ran out: it restarts its stage
    /// space under a fresh id, and the peer sees a new generation.
    fn fail_writer(&mut self, id: u32) {
        let Some(mut writer) = self.writers.remove(&id) else {
            return;
        };
        log::debug!("[SESSION] flow writer {id} failed on session {}", self.id);
        writer.reset_for_fail();
        self.init_flow_writer(writer);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process one datagram addressed to this session.
    pub fn handle(
        &mut self,
        server: &mut Server,
        data: &[u8],
        sender: SocketAddr,
        now: Duration,
    ) -> Result<()> {
        self.peer.address = sender;
        if let Some(target) = &mut self.target {
            target.address = sender;
        }
        let raw = packet::open(&self.decrypt, data)?;
        self.recv_ts = now;

        if matches!(self.kind, SessionKind::Middle(_)) {
            return crate::middle::relay_from_initiator(self, server, &raw[DATA_OFFSET..], now);
        }
        self.handle_payload(server, &raw[DATA_OFFSET..], now)
    }

    fn handle_payload(&mut self, server: &mut Server, payload: &[u8], now: Duration) -> Result<()> {
        let mut cur = Cursor::new(payload);
        let marker = cur.read_u8("marker")?;
        self.time_sent = cur.read_u16("timestamp")?;
        match marker | 0xf0 {
            0xfd => {
                let echo = cur.read_u16("timestamp echo")?;
                let ticks = time_4ms(now).wrapping_sub(echo);
                self.peer.ping = u32::from(ticks) * 4;
                server
                    .groups
                    .update_ping(&self.peer.groups, self.id, self.peer.ping);
            }
            0xf9 => {}
            other => log::debug!("[SESSION] unknown packet marker 0x{other:02x}"),
        }

        let mut current_flow: Option<u32> = None;
        let mut stage: u64 = 0;
        let mut delta_nack: u64 = 0;
        while let Some(ty) = cur.peek_u8() {
            if ty == 0xff {
                break;
            }
            cur.skip(1, "chunk type")?;
            let size = cur.read_u16("chunk size")? as usize;
            let chunk = cur.read_bytes(size, "chunk payload")?;
            log::debug!("[SESSION] chunk type=0x{ty:02x} size={size}");

            match ty {
                0x0c => self.fail(server, now, "session failed on the client side"),
                0x4c => self.kill(server),
                0x01 => {
                    self.times_keepalive = 0;
                    self.write_message(&server.socket_ref(), now, 0x41, &[])?;
                }
                0x41 => self.times_keepalive = 0,
                0x5e => {
                    let mut c = Cursor::new(chunk);
                    let id = c.read_varint7("exception flow id")?;
                    log::debug!("[SESSION] peer reports exception on flow {id}");
                    if let Some(writer) = self.writers.get_mut(&id) {
                        writer.close();
                    }
                }
                0x18 => {
                    // Buffer probe: answer with a zero acknowledgement for
                    // the probed flow instead of treating it as fatal.
                    let mut c = Cursor::new(chunk);
                    let id = u32::from(c.read_u8("probed flow id")?);
                    let probe_stage = self.flows.get(&id).map_or(0, |f| f.stage);
                    let mut ack = Vec::new();
                    put_varint7(&mut ack, id);
                    ack.push(0x00);
                    put_varint7(&mut ack, probe_stage as u32);
                    self.write_message(&server.socket_ref(), now, 0x51, &ack)?;
                }
                0x51 => {
                    let mut c = Cursor::new(chunk);
                    let id = c.read_varint7("ack flow id")?;
                    let _buffer = c.read_u8("ack buffer")?;
                    let ack_stage = u64::from(c.read_varint7("ack stage")?);
                    self.on_acknowledgment(server, id, ack_stage, now);
                }
                0x10 => {
                    let mut c = Cursor::new(chunk);
                    let frag_flags = c.read_u8("fragment flags")?;
                    let flow_id = c.read_varint7("flow id")?;
                    stage = u64::from(c.read_varint7("stage")?);
                    delta_nack = u64::from(c.read_varint7("deltaNack")?);
                    if frag_flags & flags::HEADER != 0 {
                        let signature = c.read_string8("flow signature")?.to_vec();
                        if !self.flows.contains_key(&flow_id) {
                            self.create_flow(flow_id, &signature);
                        }
                        skip_header_extensions(&mut c, flow_id)?;
                    } else if frag_flags & flags::OPTIONS != 0 {
                        skip_option_blocks(&mut c)?;
                    }
                    if self.flows.contains_key(&flow_id) {
                        current_flow = Some(flow_id);
                        self.on_fragment(server, flow_id, stage, delta_nack, c.rest(), frag_flags, now)?;
                    } else {
                        log::debug!("[SESSION] flow {flow_id} not found");
                        self.refuse_flow(&server.socket_ref(), now, flow_id)?;
                        current_flow = None;
                    }
                }
                0x11 => {
                    let mut c = Cursor::new(chunk);
                    let frag_flags = c.read_u8("fragment flags")?;
                    if frag_flags & flags::OPTIONS != 0 {
                        skip_option_blocks(&mut c)?;
                    }
                    stage += 1;
                    delta_nack += 1;
                    if let Some(flow_id) = current_flow {
                        self.on_fragment(server, flow_id, stage, delta_nack, c.rest(), frag_flags, now)?;
                    } else {
                        log::debug!("[SESSION] continuation chunk without a flow");
                    }
                }
                other => log::debug!("[SESSION] unknown message type 0x{other:02x}"),
            }

            if self.died {
                return Ok(());
            }
            let next_ty = cur.peek_u8().unwrap_or(0xff);
            if let Some(flow_id) = current_flow {
                if stage > 0 && next_ty != 0x11 {
                    self.commit_flow(server, flow_id, now)?;
                    current_flow = None;
                }
            }
        }
        self.flush(&server.socket_ref(), now, true)
    }

    /// Deliver one wire fragment into its flow and dispatch what comes out.
    #[allow(clippy::too_many_arguments)]
    fn on_fragment(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        stage: u64,
        delta_nack: u64,
        data: &[u8],
        frag_flags: u8,
        now: Duration,
    ) -> Result<()> {
        if matches!(
            self.flows.get(&flow_id).map(|f| &f.kind),
            Some(FlowKind::Null)
        ) {
            if let Some(flow) = self.flows.get_mut(&flow_id) {
                flow.stage = stage;
            }
            self.refuse_flow(&server.socket_ref(), now, flow_id)?;
            return Ok(());
        }
        let mut events = Vec::new();
        if let Some(flow) = self.flows.get_mut(&flow_id) {
            flow.on_fragment(stage, delta_nack, data, frag_flags, &mut events);
        }
        for event in events {
            match event {
                FlowEvent::Message(message) => {
                    if let Err(err) = self.on_flow_message(server, flow_id, &message, now) {
                        log::error!("[SESSION] flow {flow_id} handler error: {err}");
                        self.refuse_flow(&server.socket_ref(), now, flow_id)?;
                        let critical = self
                            .flows
                            .get(&flow_id)
                            .and_then(|f| self.writers.get(&f.writer_id))
                            .is_some_and(|w| w.critical);
                        if critical {
                            self.fail(server, now, &err.to_string());
                            return Ok(());
                        }
                    }
                }
                FlowEvent::Lost(count) => {
                    log::debug!("[FLOW] {count} fragments lost on flow {flow_id}");
                }
                FlowEvent::Completed => {}
            }
        }
        Ok(())
    }

    /// Signature-dispatch creation of an inbound flow and its paired writer.
    fn create_flow(&mut self, flow_id: u32, signature: &[u8]) {
        log::debug!(
            "[SESSION] new flow {flow_id} on session {} signature={signature:02x?}",
            self.id
        );
        let kind = classify_signature(signature);
        if matches!(kind, FlowKind::Null) {
            log::debug!("[SESSION] unknown flow signature {signature:02x?}");
        }
        let mut writer = FlowWriter::new(0, signature);
        writer.critical = matches!(kind, FlowKind::Connection { .. });
        writer.flow_id = flow_id;
        let writer_id = self.init_flow_writer(writer);
        self.flows
            .insert(flow_id, Flow::new(flow_id, signature, writer_id));
    }

    /// Report an exception for a flow we cannot accept.
    fn refuse_flow(
        &mut self,
        socket: &mio::net::UdpSocket,
        now: Duration,
        flow_id: u32,
    ) -> Result<()> {
        let mut payload = Vec::new();
        put_varint7(&mut payload, flow_id);
        payload.push(0x00);
        self.write_message(socket, now, 0x5e, &payload)
    }

    /// Acknowledge a flow's progress and flush its response writer.
    fn commit_flow(&mut self, server: &mut Server, flow_id: u32, now: Duration) -> Result<()> {
        let Some(flow) = self.flows.get(&flow_id) else {
            return Ok(());
        };
        let writer_id = flow.writer_id;
        let flow_stage = flow.stage;
        let completed = flow.completed;
        let buffer_byte = if self
            .writers
            .get(&writer_id)
            .is_some_and(|w| !w.signature.is_empty())
        {
            0x7f
        } else {
            0x00
        };
        let mut ack = Vec::new();
        put_varint7(&mut ack, flow_id);
        ack.push(buffer_byte);
        put_varint7(&mut ack, flow_stage as u32);
        let socket = server.socket_ref();
        self.write_message(&socket, now, 0x51, &ack)?;

        // Commit hook: a publishing stream flow pushes buffered media out to
        // its listeners' sessions.
        if let Some(FlowKind::Stream { index, .. }) = self.flows.get(&flow_id).map(|f| &f.kind) {
            let index = *index;
            server.flush_publication_of(index, now);
        }

        {
            let Session {
                writers,
                builder,
                encrypt,
                far_id,
                peer,
                ..
            } = &mut *self;
            if let Some(writer) = writers.get_mut(&writer_id) {
                let mut out = Outbound {
                    builder,
                    cipher: encrypt,
                    far_id: *far_id,
                    addr: peer.address,
                    socket: socket.as_ref(),
                    now,
                    symmetric: false,
                    echo: None,
                };
                writer.flush(&mut out)?;
            }
        }

        if completed {
            self.close_flow(server, flow_id, now);
        }
        Ok(())
    }

    /// Remove a finished flow, releasing whatever its purpose held.
    fn close_flow(&mut self, server: &mut Server, flow_id: u32, now: Duration) {
        let Some(flow) = self.flows.remove(&flow_id) else {
            return;
        };
        match flow.kind {
            FlowKind::Connection { streams } => {
                for index in streams {
                    server.streams.destroy(index);
                }
            }
            FlowKind::Group { joined: Some(gid) } => {
                server.groups.remove_member(std::slice::from_ref(&gid), self.id);
                self.peer.groups.retain(|g| g != &gid);
            }
            FlowKind::Group { joined: None } => {}
            FlowKind::Stream { index, state, name } => {
                self.disengage_stream(server, flow.writer_id, index, state, &name, now);
            }
            FlowKind::Null => {}
        }
        if let Some(writer) = self.writers.get_mut(&flow.writer_id) {
            writer.close();
        }
    }

    fn on_acknowledgment(&mut self, server: &mut Server, id: u32, ack_stage: u64, now: Duration) {
        let Some(writer) = self.writers.get_mut(&id) else {
            log::debug!("[SESSION] ack for unknown flow writer {id}");
            return;
        };
        let media = writer.media.clone();
        for acked in writer.acknowledgment(ack_stage) {
            let Some(link) = &media else { continue };
            // Media records are `kind(u8) || timestamp(u32) || data`.
            if acked.payload.first() != Some(&link.kind) || acked.payload.len() < 5 {
                continue;
            }
            let tm = u32::from_be_bytes([
                acked.payload[1],
                acked.payload[2],
                acked.payload[3],
                acked.payload[4],
            ]);
            server.record_media_ack(link, tm, acked.lost_messages, now);
        }
    }

    // ========================================================================
    // Flow message dispatch
    // ========================================================================

    fn on_flow_message(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        message: &[u8],
        now: Duration,
    ) -> Result<()> {
        let Some((inner, rest)) = flow::unpack_inner(message) else {
            log::debug!("[SESSION] truncated inner message on flow {flow_id}");
            return Ok(());
        };
        let Some((kind_probe, writer_id)) = self
            .flows
            .get(&flow_id)
            .map(|flow| (flow.kind.clone(), flow.writer_id))
        else {
            return Ok(());
        };
        match inner {
            InnerKind::AmfWithHandler | InnerKind::Amf => {
                let mut reader = amf::Reader::new(rest);
                let name = reader
                    .read()?
                    .as_str()
                    .ok_or(Error::Amf("command name"))?
                    .to_string();
                log::debug!("[SESSION] command {name:?} on flow {flow_id}");
                let handle = if inner == InnerKind::AmfWithHandler {
                    reader.read()?.as_number().unwrap_or(0.0)
                } else {
                    0.0
                };
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.callback_handle = handle;
                }
                let result = match kind_probe {
                    FlowKind::Connection { .. } => {
                        self.on_connection_command(server, flow_id, writer_id, &name, &mut reader)
                    }
                    FlowKind::Stream { .. } => {
                        self.on_stream_command(server, flow_id, writer_id, &name, &mut reader, now)
                    }
                    _ => {
                        log::debug!("[SESSION] unexpected command {name:?} on flow {flow_id}");
                        Ok(())
                    }
                };
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.callback_handle = 0.0;
                }
                result
            }
            InnerKind::Audio => self.on_media(server, flow_id, 0x08, rest, now),
            InnerKind::Video => self.on_media(server, flow_id, 0x09, rest, now),
            InnerKind::RawControl | InnerKind::Raw(_) => {
                let raw_type = match inner {
                    InnerKind::Raw(t) => t,
                    _ => 0x04,
                };
                self.on_raw(server, flow_id, writer_id, raw_type, rest)
            }
        }
    }

    fn on_connection_command(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        writer_id: u32,
        name: &str,
        reader: &mut amf::Reader<'_>,
    ) -> Result<()> {
        match name {
            "connect" => {
                let data = reader.read()?;
                self.peer.swf_url = data
                    .get("swfUrl")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.peer.page_url = data
                    .get("pageUrl")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let encoding = data
                    .get("objectEncoding")
                    .and_then(Value::as_number)
                    .unwrap_or(0.0);
                if encoding != 3.0 {
                    return Err(Error::Flow(format!(
                        "objectEncoding must be AMF3, not {encoding}"
                    )));
                }
                self.peer.state = PeerState::Accepted;
                log::debug!("[SESSION] connect accepted for session {}", self.id);
                let result = Value::Object(vec![
                    ("level".to_string(), Value::String("status".into())),
                    (
                        "code".to_string(),
                        Value::String("NetConnection.Connect.Success".into()),
                    ),
                    (
                        "description".to_string(),
                        Value::String("Connection succeeded".into()),
                    ),
                    ("objectEncoding".to_string(), Value::Number(3.0)),
                ]);
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.write_amf("_result", &[result]);
                }
                Ok(())
            }
            "setPeerInfo" => {
                // Leader null, then the address strings.
                let _ = reader.read();
                let mut addresses = Vec::new();
                while !reader.is_empty() {
                    match reader.read() {
                        Ok(Value::String(s)) => {
                            if let Some(addr) = parse_host_port(&s) {
                                addresses.push(addr);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                self.peer.set_private_addresses(addresses);
                let mut record = Vec::with_capacity(10);
                record.extend_from_slice(&0x29u16.to_be_bytes());
                record.extend_from_slice(&server.config.keep_alive_server.to_be_bytes());
                record.extend_from_slice(&server.config.keep_alive_peer.to_be_bytes());
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.write_raw(&record, false);
                }
                Ok(())
            }
            "createStream" => {
                let index = server.streams.create();
                if let Some(Flow {
                    kind: FlowKind::Connection { streams },
                    ..
                }) = self.flows.get_mut(&flow_id)
                {
                    streams.push(index);
                }
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.write_amf("_result", &[Value::Number(f64::from(index))]);
                }
                Ok(())
            }
            "deleteStream" => {
                let index = reader.read()?.as_number().unwrap_or(0.0) as u32;
                if let Some(Flow {
                    kind: FlowKind::Connection { streams },
                    ..
                }) = self.flows.get_mut(&flow_id)
                {
                    streams.retain(|&s| s != index);
                }
                server.streams.destroy(index);
                Ok(())
            }
            "initStream" => Ok(()),
            other => {
                log::debug!("[SESSION] unhandled command {other:?}");
                let error = amf::status(
                    "error",
                    "NetConnection.Call.Failed",
                    &format!("Method '{other}' not found"),
                );
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.write_amf("_error", &[error]);
                }
                Ok(())
            }
        }
    }

    fn on_stream_command(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        writer_id: u32,
        name: &str,
        reader: &mut amf::Reader<'_>,
        now: Duration,
    ) -> Result<()> {
        let (index, state, stream_name) = match self.flows.get(&flow_id).map(|f| &f.kind) {
            Some(FlowKind::Stream { index, state, name }) => (*index, *state, name.clone()),
            _ => return Ok(()),
        };
        match name {
            "|RtmpSampleAccess" => {
                let _ = reader.read();
                let _ = reader.read();
                Ok(())
            }
            "play" => {
                self.disengage_stream(server, writer_id, index, state, &stream_name, now);
                let played = reader
                    .read()?
                    .as_str()
                    .ok_or(Error::Amf("play target"))?
                    .to_string();
                let start = reader.read().ok().and_then(|v| v.as_number()).unwrap_or(-2.0);
                self.start_playing(server, flow_id, writer_id, index, &played, start)?;
                Ok(())
            }
            "publish" => {
                self.disengage_stream(server, writer_id, index, state, &stream_name, now);
                let published = reader
                    .read()?
                    .as_str()
                    .ok_or(Error::Amf("publish target"))?
                    .to_string();
                // Optional type argument ("live" etc) is accepted and ignored.
                let _ = reader.read();
                if server.streams.publish(&published, index) {
                    self.set_stream_state(flow_id, StreamState::Publishing, &published);
                    let status = amf::status(
                        "status",
                        "NetStream.Publish.Start",
                        &format!("\"{published}\" is now published"),
                    );
                    if let Some(writer) = self.writers.get_mut(&writer_id) {
                        writer.write_amf("onStatus", &[status]);
                    }
                    server.notify_publish(&published, now);
                } else {
                    let status = amf::status(
                        "status",
                        "NetStream.Publish.BadName",
                        &format!("\"{published}\" is already publishing"),
                    );
                    if let Some(writer) = self.writers.get_mut(&writer_id) {
                        writer.write_amf("onStatus", &[status]);
                    }
                }
                Ok(())
            }
            "closeStream" => {
                self.disengage_stream(server, writer_id, index, state, &stream_name, now);
                self.set_stream_state(flow_id, StreamState::Idle, "");
                Ok(())
            }
            other => {
                log::debug!("[SESSION] unknown stream command {other:?}");
                Ok(())
            }
        }
    }

    fn set_stream_state(&mut self, flow_id: u32, new_state: StreamState, new_name: &str) {
        if let Some(Flow {
            kind: FlowKind::Stream { state, name, .. },
            ..
        }) = self.flows.get_mut(&flow_id)
        {
            *state = new_state;
            if !new_name.is_empty() || new_state == StreamState::Idle {
                *name = new_name.to_string();
            }
        }
    }

    /// Begin playing: dedicated audio/video writers, the sample-access
    /// preamble, the play statuses and the subscription itself.
    fn start_playing(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        writer_id: u32,
        index: u32,
        name: &str,
        start: f64,
    ) -> Result<()> {
        let signature = self
            .flows
            .get(&flow_id)
            .map(|f| f.signature.clone())
            .unwrap_or_default();
        let mut audio = FlowWriter::new(0, &signature);
        audio.flow_id = flow_id;
        audio.media = Some(MediaLink {
            kind: 0x08,
            publication: name.to_string(),
            listener: index,
        });
        let audio_id = self.init_flow_writer(audio);
        let mut video = FlowWriter::new(0, &signature);
        video.flow_id = flow_id;
        video.media = Some(MediaLink {
            kind: 0x09,
            publication: name.to_string(),
            listener: index,
        });
        let video_id = self.init_flow_writer(video);

        // `|RtmpSampleAccess false false` preamble on the stream writer.
        let mut preamble = vec![0x0f];
        preamble.extend_from_slice(&0u32.to_be_bytes());
        preamble.push(0x00);
        let mut amf_writer = amf::Writer::new();
        amf_writer.write(&Value::String("|RtmpSampleAccess".into()));
        amf_writer.write(&Value::Boolean(false));
        amf_writer.write(&Value::Boolean(false));
        preamble.extend_from_slice(&amf_writer.into_bytes());
        if let Some(writer) = self.writers.get_mut(&writer_id) {
            writer.write_raw(&preamble, true);
            writer.write_amf(
                "onStatus",
                &[amf::status(
                    "status",
                    "NetStream.Play.Reset",
                    &format!("Playing and resetting \"{name}\""),
                )],
            );
            writer.write_amf(
                "onStatus",
                &[amf::status(
                    "status",
                    "NetStream.Play.Start",
                    &format!("Started playing \"{name}\""),
                )],
            );
        }

        let unbuffered = start == -3000.0;
        let mut listener = Listener::new(index, self.id, writer_id, audio_id, video_id, unbuffered);
        self.write_bounds(&mut listener);
        server.streams.subscribe(name, listener);
        self.set_stream_state(flow_id, StreamState::Playing, name);
        Ok(())
    }

    /// Emit the 0x22 track-bound markers on the listener's three writers.
    pub(crate) fn write_bounds(&mut self, listener: &mut Listener) {
        let bound = listener.next_bound();
        for id in [
            listener.video_writer,
            listener.audio_writer,
            listener.main_writer,
        ] {
            let mut record = Vec::with_capacity(10);
            record.extend_from_slice(&0x22u16.to_be_bytes());
            record.extend_from_slice(&bound.to_be_bytes());
            record.extend_from_slice(&3u32.to_be_bytes());
            if let Some(writer) = self.writers.get_mut(&id) {
                writer.write_raw(&record, false);
            }
        }
    }

    /// Tear down whatever the stream flow was doing.
    fn disengage_stream(
        &mut self,
        server: &mut Server,
        writer_id: u32,
        index: u32,
        state: StreamState,
        name: &str,
        now: Duration,
    ) {
        match state {
            StreamState::Publishing => {
                server.streams.unpublish(name, index);
                server.notify_unpublish(name, now);
                let status = amf::status(
                    "status",
                    "NetStream.Unpublish.Success",
                    &format!("'{name}' is now unpublished"),
                );
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.write_amf("onStatus", &[status]);
                }
            }
            StreamState::Playing => {
                if let Some(listener) = server.streams.unsubscribe(name, index) {
                    for id in [listener.audio_writer, listener.video_writer] {
                        if let Some(writer) = self.writers.get_mut(&id) {
                            writer.close();
                        }
                    }
                }
                let status = amf::status(
                    "status",
                    "NetStream.Play.Stop",
                    &format!("Stopped playing '{name}'"),
                );
                if let Some(writer) = self.writers.get_mut(&writer_id) {
                    writer.write_amf("onStatus", &[status]);
                }
            }
            StreamState::Idle => {}
        }
    }

    fn on_media(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        media_kind: u8,
        rest: &[u8],
        now: Duration,
    ) -> Result<()> {
        let index = match self.flows.get(&flow_id).map(|f| &f.kind) {
            Some(FlowKind::Stream { index, .. }) => *index,
            _ => {
                log::debug!("[SESSION] media packet on non-stream flow {flow_id}");
                return Ok(());
            }
        };
        if rest.len() < 4 {
            return Err(Error::Truncated("media timestamp"));
        }
        let tm = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let lost = self
            .flows
            .get_mut(&flow_id)
            .map_or(0, Flow::take_lost_fragments);
        if !server.push_media(index, media_kind, tm, &rest[4..], lost, now) {
            return Err(Error::Flow(format!(
                "a media packet is received with no publisher stream {index}"
            )));
        }
        Ok(())
    }

    fn on_raw(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        writer_id: u32,
        raw_type: u8,
        rest: &[u8],
    ) -> Result<()> {
        let kind = self.flows.get(&flow_id).map(|f| f.kind.clone());
        match kind {
            Some(FlowKind::Group { .. }) if raw_type == 0x01 => {
                if rest.is_empty() {
                    return Ok(());
                }
                let mut c = Cursor::new(rest);
                let group_id = c.read_string7("group id")?.to_vec();
                self.join_group(server, flow_id, writer_id, &group_id);
                Ok(())
            }
            Some(FlowKind::Stream { .. }) => {
                if rest.len() >= 2 {
                    let flag = u16::from_be_bytes([rest[0], rest[1]]);
                    if flag == 0x22 {
                        // Track bound marker from the peer; nothing to do.
                        return Ok(());
                    }
                    log::debug!("[SESSION] unknown raw flag 0x{flag:04x} on flow {flow_id}");
                }
                Ok(())
            }
            _ => {
                log::debug!(
                    "[SESSION] raw message type 0x{raw_type:02x} untreated on flow {flow_id}"
                );
                Ok(())
            }
        }
    }

    /// NetGroup join: answer with the best peers, then add the newcomer.
    fn join_group(
        &mut self,
        server: &mut Server,
        flow_id: u32,
        writer_id: u32,
        group_id: &[u8],
    ) {
        let group = server.groups.get_or_create(group_id);
        let best: Vec<PeerId> = group
            .best(self.id)
            .into_iter()
            .map(|m| m.peer_id)
            .collect();
        group.insert(GroupMember {
            session_id: self.id,
            peer_id: self.peer.id,
            address: self.peer.address,
            ping: self.peer.ping,
        });
        if !self.peer.groups.iter().any(|g| g == group_id) {
            self.peer.groups.push(group_id.to_vec());
        }
        if let Some(Flow {
            kind: FlowKind::Group { joined },
            ..
        }) = self.flows.get_mut(&flow_id)
        {
            *joined = Some(group_id.to_vec());
        }
        if let Some(writer) = self.writers.get_mut(&writer_id) {
            for peer_id in best {
                let mut record = Vec::with_capacity(33);
                record.push(0x0b);
                record.extend_from_slice(&peer_id);
                writer.write_raw(&record, true);
            }
        }
    }

    // ========================================================================
    // Rendezvous
    // ========================================================================

    /// Tell this session's peer that a newcomer wants a P2P session, cycling
    /// through the newcomer's private addresses across retries of one tag.
    pub(crate) fn emit_p2p_handshake(
        &mut self,
        socket: &mio::net::UdpSocket,
        now: Duration,
        initiator_id: &PeerId,
        initiator_address: SocketAddr,
        initiator_private: &[SocketAddr],
        tag: &[u8],
    ) -> Result<()> {
        // Same public address means both sit behind one NAT; start with the
        // private addresses straight away.
        let first_attempt =
            usize::from(initiator_address == self.peer.address && !initiator_private.is_empty());
        let attempts = self
            .handshake_attempts
            .entry(tag.to_vec())
            .or_insert(first_attempt);
        let chosen = if *attempts > 0 {
            initiator_private.get(*attempts - 1).copied()
        } else {
            None
        };
        *attempts += 1;
        if *attempts > initiator_private.len() {
            *attempts = 0;
        }

        let mut payload = Vec::with_capacity(3 + 32 + 19 + tag.len());
        payload.extend_from_slice(&[0x22, 0x21, 0x0f]);
        payload.extend_from_slice(initiator_id);
        match chosen {
            Some(private) => crate::codec::put_address(&mut payload, &private, false),
            None => crate::codec::put_address(&mut payload, &initiator_address, true),
        }
        payload.extend_from_slice(tag);
        self.write_message(socket, now, 0x0f, &payload)?;
        self.flush(socket, now, true)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Periodic management: idle timeout, keepalive probing, retransmission.
    pub fn manage(&mut self, server: &mut Server, now: Duration) {
        if self.died {
            return;
        }
        if self.failed {
            self.fail_signal(server, now);
            return;
        }
        if now.saturating_sub(self.recv_ts) >= TIMEOUT_RECV {
            log::debug!("[SESSION] session {} timed out", self.id);
            self.fail(server, now, "timeout no client message");
            return;
        }
        if now.saturating_sub(self.recv_ts) >= TIMEOUT_KEEPALIVE && !self.keep_alive(server, now) {
            return;
        }

        let ids: Vec<u32> = self.writers.keys().copied().collect();
        for id in ids {
            let (consumed, fire, critical) = match self.writers.get_mut(&id) {
                None => continue,
                Some(writer) => {
                    if writer.consumed() {
                        (true, Fire::Idle, false)
                    } else {
                        (false, writer.tick(), writer.critical)
                    }
                }
            };
            if consumed {
                self.writers.remove(&id);
                continue;
            }
            match fire {
                Fire::Idle => {}
                Fire::Raise => {
                    if let Err(err) = self.raise_writer(server, id, now) {
                        log::debug!("[SESSION] retransmission on writer {id} failed: {err}");
                    }
                }
                Fire::Exhausted => {
                    if critical {
                        self.fail(server, now, "repeat trigger failed on critical flow");
                        return;
                    }
                    self.fail_writer(id);
                }
            }
        }
        if let Err(err) = self.flush(&server.socket_ref(), now, true) {
            log::debug!("[SESSION] flush failed on session {}: {err}", self.id);
        }
    }

    fn raise_writer(&mut self, server: &Server, id: u32, now: Duration) -> Result<()> {
        let socket = server.socket_ref();
        let Session {
            writers,
            builder,
            encrypt,
            far_id,
            peer,
            ..
        } = self;
        let mut out = Outbound {
            builder,
            cipher: encrypt,
            far_id: *far_id,
            addr: peer.address,
            socket: socket.as_ref(),
            now,
            symmetric: false,
            echo: None,
        };
        // Repeat before anything queued this tick goes out.
        out.flush_with(None)?;
        if let Some(writer) = writers.get_mut(&id) {
            writer.raise(&mut out)?;
        }
        out.finish()
    }

    /// Probe the peer; gives up (fails the session) after ten unanswered
    /// probes.
    fn keep_alive(&mut self, server: &mut Server, now: Duration) -> bool {
        log::debug!("[SESSION] keepalive probe on session {}", self.id);
        if self.times_keepalive == MAX_KEEPALIVE_ATTEMPTS {
            self.fail(server, now, "timeout keepalive attempts");
            return false;
        }
        self.times_keepalive += 1;
        let _ = self.write_message(&server.socket_ref(), now, 0x01, &[]);
        true
    }

    /// Enter the failed state: stop application work, release memberships
    /// and start emitting close chunks.
    pub fn fail(&mut self, server: &mut Server, now: Duration, error: &str) {
        if self.failed {
            return;
        }
        self.failed = true;
        if self.peer.state != PeerState::None {
            log::info!("[SESSION] session {} failed: {error}", self.id);
        } else {
            log::debug!("[SESSION] session {} failed: {error}", self.id);
        }
        for writer in self.writers.values_mut() {
            writer.close();
        }
        self.builder.clear();
        server.groups.remove_member(&self.peer.groups, self.id);
        self.peer.groups.clear();
        server.streams.forget_session(self.id);
        self.fail_signal(server, now);
    }

    /// One close chunk toward the peer; the tenth (or deep idleness) kills.
    fn fail_signal(&mut self, server: &mut Server, now: Duration) {
        if self.died {
            log::debug!("[SESSION] fail signal on dead session {}", self.id);
            return;
        }
        self.failed = true;
        self.times_failed += 1;
        let socket = server.socket_ref();
        {
            let Session {
                builder,
                encrypt,
                far_id,
                peer,
                ..
            } = &mut *self;
            let mut out = Outbound {
                builder,
                cipher: encrypt,
                far_id: *far_id,
                addr: peer.address,
                socket: socket.as_ref(),
                now,
                symmetric: false,
                echo: None,
            };
            let _ = out.write_chunk(0x0c, &[], None);
            let _ = out.flush_with(None);
        }
        if self.times_failed >= MAX_FAIL_SIGNALS
            || now.saturating_sub(self.recv_ts) >= TIMEOUT_RECV
        {
            self.kill(server);
        }
        if self.died {
            if let SessionKind::Middle(_) = self.kind {
                crate::middle::signal_close_to_target(self, now);
            }
        }
    }

    /// Final state: the server reaps the session on its next manage tick.
    pub fn kill(&mut self, server: &mut Server) {
        if self.died {
            return;
        }
        if self.peer.state != PeerState::None {
            self.peer.state = PeerState::None;
            log::info!("[SESSION] session {} disconnected", self.id);
        }
        server.groups.remove_member(&self.peer.groups, self.id);
        self.peer.groups.clear();
        server.streams.forget_session(self.id);
        self.died = true;
        self.failed = true;
    }
}

/// Skip the full-duplex association and trailing option blocks of a flow
/// header.
fn skip_header_extensions(c: &mut Cursor<'_>, flow_id: u32) -> Result<()> {
    let next = c.read_u8("fullduplex length")?;
    if next > 0 {
        let marker = c.read_u8("fullduplex marker")?;
        if marker == 0x0a {
            let _associated = c.read_varint7("associated flow id")?;
        } else {
            log::debug!("[SESSION] unknown full duplex header 0x{marker:02x} for flow {flow_id}");
        }
        loop {
            let len = c.read_u8("header part length")?;
            if len == 0 {
                break;
            }
            log::debug!("[SESSION] unknown header part on flow {flow_id}");
            c.skip(len as usize, "header part")?;
        }
    }
    Ok(())
}

/// Skip option blocks: 7-bit length then payload, zero length terminates.
fn skip_option_blocks(c: &mut Cursor<'_>) -> Result<()> {
    loop {
        let len = c.read_varint7("option length")?;
        if len == 0 {
            return Ok(());
        }
        c.skip(len as usize, "option block")?;
    }
}

/// Parse `"host:port"`; a missing port parses as 0 so the peer's public port
/// can be substituted.
fn parse_host_port(value: &str) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    let (host, port) = value.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let ip: std::net::IpAddr = host.trim_matches(['[', ']']).parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_variants() {
        assert_eq!(
            parse_host_port("192.168.1.4:5000"),
            Some("192.168.1.4:5000".parse().unwrap())
        );
        assert_eq!(
            parse_host_port("[2001:db8::1]:80"),
            Some("[2001:db8::1]:80".parse().unwrap())
        );
        assert_eq!(parse_host_port("no-port"), None);
    }

    #[test]
    fn skip_options_terminates_on_zero() {
        let data = [0x02, 0xaa, 0xbb, 0x01, 0xcc, 0x00, 0x42];
        let mut c = Cursor::new(&data);
        skip_option_blocks(&mut c).unwrap();
        assert_eq!(c.read_u8("rest").unwrap(), 0x42);
    }

    #[test]
    fn header_extension_skip_matches_writer_output() {
        // What the writer emits after the signature for flow_id 2:
        // len=2, 0x0a, varint(2), then the 0x00 terminator.
        let data = [0x02, 0x0a, 0x02, 0x00, 0x99];
        let mut c = Cursor::new(&data);
        skip_header_extensions(&mut c, 7).unwrap();
        assert_eq!(c.read_u8("rest").unwrap(), 0x99);
    }
}
