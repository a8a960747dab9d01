// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound half of a flow: message queue, fragmentation, acknowledgement
//! bookkeeping and retransmission.
//!
//! A queued [`Message`] keeps its full payload plus the list of fragment
//! start offsets it was emitted as; acknowledgements pop fragments from the
//! front, retransmission re-emits whatever is left. Messages never straddle
//! flows inside a packet: a writer either continues its own chunk run (0x11)
//! or re-declares the flow header (0x10).

use std::collections::VecDeque;

use crate::amf::{self, Value};
use crate::codec::{put_string8, put_varint7, varint7_len};
use crate::flow::{flags, Fire, Trigger};
use crate::packet::PacketBuilder;
use crate::Result;

/// Fragment payload cap, leaving room for a worst-case re-declared flow
/// header when the fragment is retransmitted at a packet boundary.
const MAX_FRAGMENT: usize = PacketBuilder::CAPACITY - 40;

/// Where a writer emits its chunks.
///
/// Implemented by the session's outbound path; tests substitute a capturing
/// sink.
pub trait ChunkSink {
    /// Chunk-area bytes left in the packet under construction.
    fn available(&self) -> usize;
    /// Writer that appended the previous chunk of this packet, if any.
    fn last_writer(&self) -> Option<u32>;
    /// Append a `type || size || payload` chunk.
    fn write_chunk(&mut self, ty: u8, payload: &[u8], writer: Option<u32>) -> Result<()>;
    /// Seal and send the packet under construction.
    fn flush_packet(&mut self) -> Result<()>;
}

/// Media association of a writer feeding per-stream QoS on acknowledgement.
#[derive(Debug, Clone)]
pub struct MediaLink {
    /// 0x08 audio or 0x09 video.
    pub kind: u8,
    pub publication: String,
    pub listener: u32,
}

/// A fully acknowledged message handed back for QoS accounting.
pub struct AckedMessage {
    pub payload: Vec<u8>,
    /// Messages dropped (non-repeatable loss) since the previous ack.
    pub lost_messages: u32,
}

struct Message {
    repeatable: bool,
    payload: Vec<u8>,
    /// Start offsets of emitted fragments; empty until flushed, drained from
    /// the front by acknowledgements.
    fragments: VecDeque<usize>,
    /// Stage just before this message's first un-acked fragment.
    start_stage: u64,
}

/// Outbound flow state.
pub struct FlowWriter {
    pub id: u32,
    /// Inbound flow this writer answers (0 when unassociated).
    pub flow_id: u32,
    pub signature: Vec<u8>,
    /// Last stage assigned to an emitted fragment.
    pub stage: u64,
    /// A critical writer (the connection flow) fails the whole session when
    /// its retry budget runs out.
    pub critical: bool,
    pub closed: bool,
    /// Callback handle of the AMF request currently being answered.
    pub callback_handle: f64,
    /// Set when the writer was reset after retry exhaustion; media paths
    /// re-announce their bounds when they see it.
    pub reseted: bool,
    pub media: Option<MediaLink>,
    messages: VecDeque<Message>,
    trigger: Trigger,
    lost_messages: u32,
    reset_count: u32,
}

impl FlowWriter {
    pub fn new(id: u32, signature: &[u8]) -> Self {
        Self {
            id,
            flow_id: 0,
            signature: signature.to_vec(),
            stage: 0,
            critical: false,
            closed: false,
            callback_handle: 0.0,
            reseted: false,
            media: None,
            messages: VecDeque::new(),
            trigger: Trigger::new(),
            lost_messages: 0,
            reset_count: 0,
        }
    }

    pub fn queued(&self) -> usize {
        self.messages.len()
    }

    /// A closed writer with nothing left in flight can be dropped.
    pub fn consumed(&self) -> bool {
        self.closed && self.messages.is_empty()
    }

    /// True while some emitted fragment awaits acknowledgement.
    pub fn in_flight(&self) -> bool {
        self.messages.front().is_some_and(|m| !m.fragments.is_empty())
    }

    // ========================================================================
    // Message creation
    // ========================================================================

    fn create_message(&mut self, repeatable: bool, payload: Vec<u8>) {
        if self.closed || self.signature.is_empty() {
            return;
        }
        self.messages.push_back(Message {
            repeatable,
            payload,
            fragments: VecDeque::new(),
            start_stage: 0,
        });
        if self.messages.len() > 100 {
            log::debug!(
                "[FLOW] writer {} holds {} queued messages",
                self.id,
                self.messages.len()
            );
        }
    }

    /// Queue a raw record; unless `without_header`, it is wrapped in the
    /// standard `0x04 || u32 0` raw-control envelope.
    pub fn write_raw(&mut self, data: &[u8], without_header: bool) {
        let mut payload = Vec::with_capacity(5 + data.len());
        if !without_header {
            payload.push(0x04);
            payload.extend_from_slice(&0u32.to_be_bytes());
        }
        payload.extend_from_slice(data);
        self.create_message(true, payload);
    }

    /// Queue an unbuffered (non-repeatable) media record.
    pub fn write_unbuffered(&mut self, data: Vec<u8>) {
        self.create_message(false, data);
    }

    /// Queue an AMF command: `name`, the pending callback handle, a null
    /// leader, then the arguments.
    pub fn write_amf(&mut self, name: &str, args: &[Value]) {
        let mut payload = vec![0x14];
        payload.extend_from_slice(&0u32.to_be_bytes());
        let mut writer = amf::Writer::new();
        writer.write(&Value::String(name.to_string()));
        writer.write(&Value::Number(self.callback_handle));
        writer.write(&Value::Null);
        for arg in args {
            writer.write(arg);
        }
        payload.extend_from_slice(&writer.into_bytes());
        self.create_message(true, payload);
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Fragment and emit every not-yet-sent queued message.
    pub fn flush(&mut self, sink: &mut dyn ChunkSink) -> Result<()> {
        let id = self.id;
        let flow_id = self.flow_id;
        let closed = self.closed;
        let mut stage = self.stage;
        let mut header = sink.last_writer() != Some(id);
        let mut delta_nack: u64 = 0;
        let FlowWriter {
            messages,
            trigger,
            signature,
            ..
        } = self;
        for msg in messages.iter_mut() {
            if !msg.fragments.is_empty() {
                delta_nack += msg.fragments.len() as u64;
                continue;
            }
            trigger.start();
            msg.start_stage = stage;
            let total = msg.payload.len();
            let mut offset = 0usize;
            loop {
                let head = header;
                let hbytes = if head {
                    header_bytes_for(id, signature, flow_id, stage + 1, delta_nack + 1)
                } else {
                    Vec::new()
                };
                if sink.available() < hbytes.len() + 5 {
                    sink.flush_packet()?;
                    header = true;
                    continue;
                }
                let remaining = total - offset;
                let room = sink.available() - 4 - hbytes.len();
                let content_len = remaining.min(room).min(MAX_FRAGMENT);
                let more = offset + content_len < total;

                let mut frag_flags = 0u8;
                if stage == 0 {
                    frag_flags |= flags::HEADER;
                }
                if closed {
                    frag_flags |= flags::END | flags::ABANDONMENT;
                }
                if offset > 0 {
                    frag_flags |= flags::WITH_BEFOREPART;
                }
                if more {
                    frag_flags |= flags::WITH_AFTERPART;
                }
                stage += 1;

                let mut chunk = Vec::with_capacity(1 + hbytes.len() + content_len);
                chunk.push(frag_flags);
                chunk.extend_from_slice(&hbytes);
                chunk.extend_from_slice(&msg.payload[offset..offset + content_len]);
                sink.write_chunk(if head { 0x10 } else { 0x11 }, &chunk, Some(id))?;
                header = false;

                msg.fragments.push_back(offset);
                offset += content_len;
                if offset >= total {
                    break;
                }
            }
        }
        self.stage = stage;
        Ok(())
    }

    /// Re-emit every still-unacknowledged fragment (retransmission).
    pub fn raise(&mut self, sink: &mut dyn ChunkSink) -> Result<()> {
        // Non-repeatable messages at the head are abandoned on first loss.
        while let Some(front) = self.messages.front() {
            if !front.repeatable && !front.fragments.is_empty() {
                self.messages.pop_front();
                self.lost_messages += 1;
            } else {
                break;
            }
        }
        if !self.in_flight() {
            self.trigger.stop();
            return Ok(());
        }

        let id = self.id;
        let mut header = true;
        let mut delta_nack: u64 = 0;
        for msg in &self.messages {
            if msg.fragments.is_empty() {
                // Queued but never emitted; the normal flush will send it.
                continue;
            }
            if !msg.repeatable {
                // Kept only to preserve stage numbering of what follows.
                delta_nack += msg.fragments.len() as u64;
                header = true;
                continue;
            }
            let mut stage = msg.start_stage;
            for (k, &frag_off) in msg.fragments.iter().enumerate() {
                let end = k + 1 == msg.fragments.len();
                let next_off = if end {
                    msg.payload.len()
                } else {
                    msg.fragments[k + 1]
                };
                let content = &msg.payload[frag_off..next_off];
                stage += 1;

                let head = header;
                let hbytes = if head {
                    header_bytes_for(id, &self.signature, self.flow_id, stage, delta_nack + 1)
                } else {
                    Vec::new()
                };
                if sink.available() < hbytes.len() + 4 + content.len() {
                    sink.flush_packet()?;
                    // Re-declare the header in the fresh packet.
                    let hbytes =
                        header_bytes_for(id, &self.signature, self.flow_id, stage, delta_nack + 1);
                    self.emit_fragment(sink, true, &hbytes, stage, k, content, end)?;
                } else {
                    self.emit_fragment(sink, head, &hbytes, stage, k, content, end)?;
                }
                header = false;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_fragment(
        &self,
        sink: &mut dyn ChunkSink,
        head: bool,
        hbytes: &[u8],
        stage: u64,
        index: usize,
        content: &[u8],
        end: bool,
    ) -> Result<()> {
        let mut frag_flags = 0u8;
        if stage == 1 {
            frag_flags |= flags::HEADER;
        }
        if self.closed {
            frag_flags |= flags::END;
        }
        if index > 0 {
            frag_flags |= flags::WITH_BEFOREPART;
        }
        if !end {
            frag_flags |= flags::WITH_AFTERPART;
        }
        let mut chunk = Vec::with_capacity(1 + hbytes.len() + content.len());
        chunk.push(frag_flags);
        chunk.extend_from_slice(hbytes);
        chunk.extend_from_slice(content);
        sink.write_chunk(if head { 0x10 } else { 0x11 }, &chunk, Some(self.id))
    }

    // ========================================================================
    // Acknowledgement and lifecycle
    // ========================================================================

    /// Process an ack up to `stage`; fully acknowledged messages come back
    /// for per-stream QoS accounting.
    pub fn acknowledgment(&mut self, stage: u64) -> Vec<AckedMessage> {
        let mut acked = Vec::new();
        if stage > self.stage {
            log::debug!(
                "[FLOW] ack for stage {stage} above sending stage {} on writer {}",
                self.stage,
                self.id
            );
            return acked;
        }
        let Some(front) = self.messages.front() else {
            self.trigger.stop();
            return acked;
        };
        if front.fragments.is_empty() {
            return acked;
        }
        let start = front.start_stage;
        if stage < start {
            log::debug!(
                "[FLOW] ack for stage {stage} below every nack of writer {}",
                self.id
            );
            return acked;
        }
        if stage == start {
            // Repeated ack just below the last nack; nothing new.
            return acked;
        }
        let mut count = stage - start;
        while count > 0 {
            let Some(front) = self.messages.front_mut() else {
                break;
            };
            if front.fragments.is_empty() {
                break;
            }
            while count > 0 && !front.fragments.is_empty() {
                front.fragments.pop_front();
                front.start_stage += 1;
                count -= 1;
            }
            if front.fragments.is_empty() {
                let msg = self.messages.pop_front().expect("front just inspected");
                acked.push(AckedMessage {
                    payload: msg.payload,
                    lost_messages: std::mem::take(&mut self.lost_messages),
                });
            }
        }
        if self.in_flight() {
            self.trigger.reset();
        } else {
            self.trigger.stop();
        }
        acked
    }

    /// Advance the retransmission pacing by one manage tick.
    pub fn tick(&mut self) -> Fire {
        self.trigger.dispatch()
    }

    /// Drop queued messages. With `except_last`, the newest survives (used on
    /// close so the final status still goes out).
    pub fn clear_messages(&mut self, except_last: bool) {
        let keep = usize::from(except_last);
        while self.messages.len() > keep {
            self.messages.pop_front();
            self.lost_messages += 1;
        }
        if self.messages.is_empty() {
            self.trigger.stop();
        }
    }

    /// Close the writer; the next flush carries END | ABANDONMENT.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.clear_messages(true);
        if self.stage > 0 && self.messages.is_empty() {
            // The receiver saw this flow exist; tell it the flow is over.
            self.create_message(true, Vec::new());
        }
        self.closed = true;
    }

    /// Reset after retry exhaustion: drop state, restart the stage space and
    /// bump the generation counter. The session re-registers the writer
    /// under a fresh id.
    pub fn reset_for_fail(&mut self) {
        self.clear_messages(false);
        self.stage = 0;
        self.reset_count += 1;
        self.reseted = true;
        self.trigger.stop();
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }
}

/// Free-standing header builder so `flush` can borrow messages mutably while
/// building headers from the writer's identity fields.
fn header_bytes_for(
    id: u32,
    signature: &[u8],
    flow_id: u32,
    wire_stage: u64,
    wire_delta: u64,
) -> Vec<u8> {
    let mut h = Vec::new();
    put_varint7(&mut h, id);
    put_varint7(&mut h, wire_stage as u32);
    put_varint7(&mut h, wire_delta as u32);
    if wire_stage == wire_delta {
        put_string8(&mut h, signature);
        if flow_id > 0 {
            h.push(1 + varint7_len(flow_id) as u8);
            h.push(0x0a);
            put_varint7(&mut h, flow_id);
        }
        h.push(0x00);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::SIGNATURE_CONNECTION;

    /// Sink that records chunks and packet boundaries.
    struct RecordingSink {
        chunks: Vec<(u8, Vec<u8>)>,
        packets: usize,
        used: usize,
        last: Option<u32>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                chunks: Vec::new(),
                packets: 0,
                used: 0,
                last: None,
            }
        }
    }

    impl ChunkSink for RecordingSink {
        fn available(&self) -> usize {
            PacketBuilder::CAPACITY - self.used
        }
        fn last_writer(&self) -> Option<u32> {
            self.last
        }
        fn write_chunk(&mut self, ty: u8, payload: &[u8], writer: Option<u32>) -> Result<()> {
            self.used += 3 + payload.len();
            self.chunks.push((ty, payload.to_vec()));
            self.last = writer;
            Ok(())
        }
        fn flush_packet(&mut self) -> Result<()> {
            self.packets += 1;
            self.used = 0;
            self.last = None;
            Ok(())
        }
    }

    #[test]
    fn small_message_is_one_header_chunk() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.write_raw(b"\x29abc", false);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        assert_eq!(sink.chunks.len(), 1);
        let (ty, chunk) = &sink.chunks[0];
        assert_eq!(*ty, 0x10);
        assert_eq!(chunk[0], flags::HEADER);
        // id=2, stage=1, deltaNack=1, then the signature block.
        assert_eq!(&chunk[1..4], &[2, 1, 1]);
        assert_eq!(chunk[4] as usize, SIGNATURE_CONNECTION.len());
        assert_eq!(&chunk[5..10], SIGNATURE_CONNECTION);
        assert_eq!(w.stage, 1);
    }

    #[test]
    fn large_message_fragments_with_before_after_flags() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        let body = vec![0x42u8; 2600];
        w.write_raw(&body, true);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        assert!(sink.chunks.len() >= 3, "expected fragmentation");
        let first = &sink.chunks[0];
        assert_eq!(first.0, 0x10);
        assert_eq!(
            first.1[0] & (flags::WITH_AFTERPART | flags::WITH_BEFOREPART),
            flags::WITH_AFTERPART
        );
        let middle = &sink.chunks[1];
        assert_eq!(middle.0, 0x11);
        assert_eq!(
            middle.1[0] & (flags::WITH_AFTERPART | flags::WITH_BEFOREPART),
            flags::WITH_AFTERPART | flags::WITH_BEFOREPART
        );
        let last = sink.chunks.last().unwrap();
        assert_eq!(
            last.1[0] & (flags::WITH_AFTERPART | flags::WITH_BEFOREPART),
            flags::WITH_BEFOREPART
        );
        // All fragments together carry the payload exactly once. The first
        // chunk carries the full flow header with signature; later 0x10
        // chunks (after a packet boundary) re-declare only id/stage/delta.
        let total: usize = sink
            .chunks
            .iter()
            .enumerate()
            .map(|(i, (ty, c))| {
                let overhead = match (*ty, i) {
                    (0x10, 0) => 1 + 3 + 1 + SIGNATURE_CONNECTION.len() + 1,
                    (0x10, _) => 1 + 3,
                    _ => 1,
                };
                c.len() - overhead
            })
            .sum();
        assert_eq!(total, 2600);
        assert_eq!(w.stage, sink.chunks.len() as u64);
    }

    #[test]
    fn ack_drains_messages_and_reports_loss_counter() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.write_raw(b"first", true);
        w.write_raw(b"second", true);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        assert_eq!(w.stage, 2);
        assert!(w.in_flight());

        let acked = w.acknowledgment(1);
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].payload, b"first");
        assert!(w.in_flight());

        let acked = w.acknowledgment(2);
        assert_eq!(acked.len(), 1);
        assert!(!w.in_flight());
        assert!(!w.trigger.is_running());
    }

    #[test]
    fn repeated_ack_is_ignored() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.write_raw(b"msg", true);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        assert_eq!(w.acknowledgment(1).len(), 1);
        assert_eq!(w.acknowledgment(1).len(), 0);
    }

    #[test]
    fn raise_reemits_unacked_fragments() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.write_raw(b"retransmit me", true);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        let emitted = sink.chunks.clone();
        let mut sink2 = RecordingSink::new();
        w.raise(&mut sink2).unwrap();
        assert_eq!(sink2.chunks, emitted);
        // Stage numbering did not advance.
        assert_eq!(w.stage, 1);
    }

    #[test]
    fn non_repeatable_front_is_dropped_on_raise() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.write_unbuffered(b"\x08\x00\x00\x00\x01frame".to_vec());
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        let mut sink2 = RecordingSink::new();
        w.raise(&mut sink2).unwrap();
        assert!(sink2.chunks.is_empty());
        assert_eq!(w.queued(), 0);
        // The loss surfaces with the next acknowledged message.
        w.write_raw(b"status", true);
        let mut sink3 = RecordingSink::new();
        w.flush(&mut sink3).unwrap();
        let acked = w.acknowledgment(w.stage);
        assert_eq!(acked[0].lost_messages, 1);
    }

    #[test]
    fn close_emits_end_abandonment_message() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.write_raw(b"hello", true);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        w.acknowledgment(1);
        w.close();
        assert!(!w.consumed(), "the end marker is still queued");
        w.flush(&mut sink).unwrap();
        let last = sink.chunks.last().unwrap();
        assert_eq!(last.1[0] & (flags::END | flags::ABANDONMENT), flags::END | flags::ABANDONMENT);
        w.acknowledgment(w.stage);
        assert!(w.consumed());
    }

    #[test]
    fn amf_message_layout() {
        let mut w = FlowWriter::new(2, SIGNATURE_CONNECTION);
        w.callback_handle = 1.0;
        w.write_amf("_result", &[Value::Number(3.0)]);
        let mut sink = RecordingSink::new();
        w.flush(&mut sink).unwrap();
        let (_, chunk) = &sink.chunks[0];
        // Skip flags + flow header, find the 0x14 envelope.
        let pos = chunk.iter().position(|&b| b == 0x14).unwrap();
        let body = &chunk[pos..];
        assert_eq!(body[0], 0x14);
        assert_eq!(&body[1..5], &[0, 0, 0, 0]);
        let mut reader = amf::Reader::new(&body[5..]);
        assert_eq!(reader.read().unwrap().as_str(), Some("_result"));
        assert_eq!(reader.read().unwrap().as_number(), Some(1.0));
        assert_eq!(reader.read().unwrap(), Value::Null);
        assert_eq!(reader.read().unwrap().as_number(), Some(3.0));
    }
}
