// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session flow transport.
//!
//! A flow is one direction of an ordered message stream inside a session.
//! Inbound, [`Flow`] reassembles wire fragments into messages: fragments
//! carry a per-flow stage number, arrive in any order, and may be abandoned
//! by the sender. Outbound, [`FlowWriter`] fragments queued messages into
//! user-data chunks and retransmits unacknowledged ones under [`Trigger`]
//! pacing.
//!
//! ## Fragment flags
//!
//! | bit | meaning |
//! |-----|---------|
//! | 0x80 | HEADER: flow signature accompanies this fragment |
//! | 0x20 | WITH_BEFOREPART: continues a message begun earlier |
//! | 0x10 | WITH_AFTERPART: message continues in the next fragment |
//! | 0x04 | option blocks present |
//! | 0x02 | ABANDONMENT: sender gave up on earlier stages |
//! | 0x01 | END: flow complete after this fragment |

mod trigger;
mod writer;

pub use trigger::{Fire, Trigger, MAX_CYCLES};
pub use writer::{AckedMessage, ChunkSink, FlowWriter, MediaLink};

use std::collections::BTreeMap;

use crate::codec::Cursor;

/// Fragment flag bits.
pub mod flags {
    pub const HEADER: u8 = 0x80;
    pub const WITH_BEFOREPART: u8 = 0x20;
    pub const WITH_AFTERPART: u8 = 0x10;
    pub const OPTIONS: u8 = 0x04;
    pub const ABANDONMENT: u8 = 0x02;
    pub const END: u8 = 0x01;
}

/// Signature of the NetConnection control flow.
pub const SIGNATURE_CONNECTION: &[u8] = b"\x00\x54\x43\x04\x00";
/// Signature prefix of NetGroup flows.
pub const SIGNATURE_GROUP: &[u8] = b"\x00\x47\x43";
/// Signature prefix of NetStream flows; trailing bytes are the stream index.
pub const SIGNATURE_STREAM: &[u8] = b"\x00\x54\x43\x04";

/// Flow purpose, decided once from the signature of its first fragment.
///
/// Variants carry the per-purpose dispatch state the session mutates as
/// messages arrive.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowKind {
    /// NetConnection command flow; tracks stream ids it created.
    Connection { streams: Vec<u32> },
    /// NetGroup flow; remembers the joined group id for cleanup.
    Group { joined: Option<Vec<u8>> },
    /// NetStream flow bound to a stream index.
    Stream {
        index: u32,
        state: StreamState,
        name: String,
    },
    /// Unrecognised signature; fragments are consumed and refused.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Publishing,
    Playing,
}

/// Classify a flow signature.
pub fn classify_signature(signature: &[u8]) -> FlowKind {
    if signature == SIGNATURE_CONNECTION {
        return FlowKind::Connection {
            streams: Vec::new(),
        };
    }
    if signature.starts_with(SIGNATURE_GROUP) {
        return FlowKind::Group { joined: None };
    }
    if signature.starts_with(SIGNATURE_STREAM) {
        let mut cur = Cursor::new(&signature[SIGNATURE_STREAM.len()..]);
        let index = cur.read_varint7("stream index").unwrap_or(0);
        return FlowKind::Stream {
            index,
            state: StreamState::Idle,
            name: String::new(),
        };
    }
    FlowKind::Null
}

/// Inner record tag of a reassembled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerKind {
    /// AMF command carrying a callback handle.
    AmfWithHandler,
    /// AMF command without a handle.
    Amf,
    Audio,
    Video,
    /// Raw control record (0x04).
    RawControl,
    /// Any other raw record, tag preserved.
    Raw(u8),
}

/// Split a reassembled message into its inner tag and payload.
///
/// Returns `None` when the message is shorter than its fixed header.
pub fn unpack_inner(message: &[u8]) -> Option<(InnerKind, &[u8])> {
    let ty = *message.first()?;
    let (kind, skip) = match ty {
        0x11 => (InnerKind::AmfWithHandler, 6),
        0x14 => (InnerKind::AmfWithHandler, 5),
        0x0f => (InnerKind::Amf, 6),
        0x08 => (InnerKind::Audio, 1),
        0x09 => (InnerKind::Video, 1),
        0x04 => (InnerKind::RawControl, 5),
        0x01 => (InnerKind::Raw(0x01), 1),
        other => {
            log::debug!("[FLOW] unknown inner message type 0x{other:02x}");
            (InnerKind::Raw(other), 1)
        }
    };
    if message.len() < skip {
        return None;
    }
    Some((kind, &message[skip..]))
}

/// What a batch of fragments produced.
#[derive(Debug, PartialEq)]
pub enum FlowEvent {
    /// A complete, in-order message.
    Message(Vec<u8>),
    /// Fragments were skipped (gap or abandonment).
    Lost(u64),
    /// The flow carried its END flag; no more messages will follow.
    Completed,
}

struct BufferedFragment {
    data: Vec<u8>,
    flags: u8,
}

/// Inbound reassembly state of one flow.
pub struct Flow {
    pub id: u32,
    pub signature: Vec<u8>,
    pub kind: FlowKind,
    /// Id of the response writer paired with this flow.
    pub writer_id: u32,
    /// Last stage delivered in order.
    pub stage: u64,
    pub completed: bool,
    /// Fragments lost since the dispatcher last consumed the counter.
    pub lost_fragments: u32,
    fragments: BTreeMap<u64, BufferedFragment>,
    reassembly: Option<Vec<u8>>,
}

impl Flow {
    pub fn new(id: u32, signature: &[u8], writer_id: u32) -> Self {
        Self {
            id,
            signature: signature.to_vec(),
            kind: classify_signature(signature),
            writer_id,
            stage: 0,
            completed: false,
            lost_fragments: 0,
            fragments: BTreeMap::new(),
            reassembly: None,
        }
    }

    /// Feed one wire fragment; completed messages and loss reports come back
    /// through `events` in delivery order.
    pub fn on_fragment(
        &mut self,
        stage: u64,
        delta_nack: u64,
        data: &[u8],
        frag_flags: u8,
        events: &mut Vec<FlowEvent>,
    ) {
        if self.completed {
            return;
        }
        let mut next = self.stage + 1;
        if stage < next {
            log::debug!("[FLOW] stage {stage} on flow {} already received", self.id);
            return;
        }
        let delta = if delta_nack > stage || delta_nack == 0 {
            stage
        } else {
            delta_nack
        };

        if frag_flags & flags::ABANDONMENT != 0 || self.stage < stage - delta {
            log::debug!("[FLOW] abandonment on flow {} flags=0x{frag_flags:02x}", self.id);
            let buffered: Vec<u64> = self.fragments.range(..=stage).map(|(&k, _)| k).collect();
            for index in buffered {
                let frag = self.fragments.remove(&index).expect("key just listed");
                // Stages up to stage-1 still deliver; (stage-1, stage] is
                // dropped with the abandoned window.
                if index <= stage - 1 {
                    self.deliver(index, &frag.data, frag.flags, events);
                }
            }
            next = stage;
        }

        if stage > next {
            if self.fragments.contains_key(&stage) {
                log::debug!("[FLOW] duplicate buffered stage {stage} on flow {}", self.id);
            } else {
                self.fragments.insert(
                    stage,
                    BufferedFragment {
                        data: data.to_vec(),
                        flags: frag_flags,
                    },
                );
                if self.fragments.len() > 100 {
                    log::debug!(
                        "[FLOW] {} fragments buffered on flow {}",
                        self.fragments.len(),
                        self.id
                    );
                }
            }
        } else {
            self.deliver(next, data, frag_flags, events);
            next += 1;
            while let Some(frag) = self.fragments.remove(&next) {
                self.deliver(next, &frag.data, frag.flags, events);
                next += 1;
            }
        }
    }

    /// Deliver a fragment whose stage is now in order, composing
    /// BEFORE/AFTER parts into whole messages.
    fn deliver(&mut self, stage: u64, data: &[u8], frag_flags: u8, events: &mut Vec<FlowEvent>) {
        if stage <= self.stage {
            log::debug!("[FLOW] stage {stage} not sorted on flow {}", self.id);
            return;
        }
        if stage > self.stage + 1 {
            let lost = stage - self.stage - 1;
            self.lost_fragments += lost as u32;
            events.push(FlowEvent::Lost(lost));
            self.stage = stage;
            self.reassembly = None;
            if frag_flags & flags::WITH_BEFOREPART != 0 {
                // Continuation of a message whose head was lost.
                return;
            }
        } else {
            self.stage = stage;
        }

        let message: Vec<u8>;
        if frag_flags & flags::WITH_BEFOREPART != 0 {
            let Some(mut buffer) = self.reassembly.take() else {
                log::debug!(
                    "[FLOW] beforepart fragment with no reassembly in progress on flow {}",
                    self.id
                );
                return;
            };
            buffer.extend_from_slice(data);
            if frag_flags & flags::WITH_AFTERPART != 0 {
                self.reassembly = Some(buffer);
                return;
            }
            message = buffer;
        } else if frag_flags & flags::WITH_AFTERPART != 0 {
            if self.reassembly.is_some() {
                log::debug!(
                    "[FLOW] new message begins while a reassembly is open on flow {}",
                    self.id
                );
            }
            self.reassembly = Some(data.to_vec());
            return;
        } else {
            message = data.to_vec();
        }

        if !message.is_empty() {
            events.push(FlowEvent::Message(message));
        }
        self.reassembly = None;
        if frag_flags & flags::END != 0 {
            self.completed = true;
            events.push(FlowEvent::Completed);
        }
    }

    /// Drain the lost-fragment counter (consumed by stream dispatch).
    pub fn take_lost_fragments(&mut self) -> u32 {
        std::mem::take(&mut self.lost_fragments)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("completed", &self.completed)
            .finish()
    }
}
