// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram seal/open and the outbound packet builder.
//!
//! Every RTMFP datagram is:
//!
//! ```text
//! scrambled_id(u32) || AES-128-CBC( checksum(u16) || network-layer-data || 0xFF pad )
//! ```
//!
//! The session id on the wire is scrambled by XOR with the first two 32-bit
//! words of the encrypted body, so the id changes with every packet without
//! costing any bytes.

use std::time::Duration;

use crate::codec::checksum;
use crate::crypto::PacketCipher;
use crate::{Error, Result};

/// Marker for server-originated packets (normal session encoding).
pub const MARKER_SERVER: u8 = 0x4a;
/// Marker for handshake/symmetric-encoded packets.
pub const MARKER_SYMMETRIC: u8 = 0x0b;
/// Added to a marker when a timestamp echo follows the timestamp.
pub const MARKER_ECHO_BIT: u8 = 0x04;

/// Byte offset where the encrypted region starts (after the scrambled id).
pub const BODY_OFFSET: usize = 4;
/// Byte offset of the network-layer data (after id + checksum).
pub const DATA_OFFSET: usize = 6;
/// Smallest datagram that can carry a valid header.
pub const MIN_DATAGRAM: usize = 12;

/// Wall time in the protocol's 4-millisecond ticks, truncated to 16 bits.
pub fn time_4ms(now: Duration) -> u16 {
    ((now.as_millis() / 4) & 0xffff) as u16
}

/// Recover the real session id from a received datagram.
///
/// Returns `None` for datagrams too short to carry the three words.
pub fn unscramble_id(data: &[u8]) -> Option<u32> {
    if data.len() < MIN_DATAGRAM {
        return None;
    }
    let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    Some(word(0) ^ word(4) ^ word(8))
}

/// Overwrite the leading id word so the receiver unscrambles to `far_id`.
/// Must run after encryption: the mask words are ciphertext.
pub fn scramble_id(data: &mut [u8], far_id: u32) {
    debug_assert!(data.len() >= MIN_DATAGRAM);
    let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    let masked = word(4) ^ word(8) ^ far_id;
    data[..4].copy_from_slice(&masked.to_be_bytes());
}

/// Pad, checksum and encrypt a datagram in place.
///
/// `data` must start with a 6-byte placeholder (id + checksum) followed by
/// the network-layer payload. 0xFF padding brings the encrypted region to a
/// 16-byte multiple; the checksum covers payload and padding.
pub fn seal(cipher: &PacketCipher, data: &mut Vec<u8>) -> Result<()> {
    debug_assert!(data.len() >= DATA_OFFSET);
    let pad = (16 - (data.len() - BODY_OFFSET) % 16) % 16;
    data.resize(data.len() + pad, 0xff);
    let sum = checksum(&data[DATA_OFFSET..]);
    data[BODY_OFFSET..DATA_OFFSET].copy_from_slice(&sum.to_be_bytes());
    cipher.encrypt(&mut data[BODY_OFFSET..])
}

/// Decrypt a received datagram and verify its checksum.
///
/// Returns the raw decrypted datagram (id word untouched). A checksum
/// mismatch yields [`Error::InvalidChecksum`] and the caller drops the packet
/// without touching session state.
pub fn open(cipher: &PacketCipher, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < MIN_DATAGRAM || (data.len() - BODY_OFFSET) % 16 != 0 {
        return Err(Error::Truncated("datagram"));
    }
    let mut raw = data.to_vec();
    cipher.decrypt(&mut raw[BODY_OFFSET..])?;
    let declared = u16::from_be_bytes([raw[4], raw[5]]);
    let actual = checksum(&raw[DATA_OFFSET..]);
    if declared != actual {
        log::debug!("[PKT] checksum mismatch declared={declared:#06x} actual={actual:#06x}");
        return Err(Error::InvalidChecksum);
    }
    Ok(raw)
}

/// Staging buffer for the chunk area of one outbound packet.
///
/// Capacity is 1181 bytes of chunk data; the 6-byte crypto header and the
/// marker/timestamp prefix are added at flush time. The builder also tracks
/// which flow writer wrote last, so a writer appending consecutive chunks can
/// omit the repeated flow header (0x11 continuation chunks).
pub struct PacketBuilder {
    buf: Vec<u8>,
    last_writer: Option<u32>,
}

impl PacketBuilder {
    /// Chunk-area capacity of one packet.
    pub const CAPACITY: usize = 1181;

    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(Self::CAPACITY),
            last_writer: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still available for chunks (including their 3-byte headers).
    pub fn available(&self) -> usize {
        Self::CAPACITY - self.buf.len()
    }

    /// Flow writer that appended the previous chunk, if any.
    pub fn last_writer(&self) -> Option<u32> {
        self.last_writer
    }

    /// Append one `type(u8) || size(u16) || payload` chunk.
    pub fn write_chunk(&mut self, ty: u8, payload: &[u8], writer: Option<u32>) -> Result<()> {
        if 3 + payload.len() > self.available() {
            return Err(Error::PacketOverflow(payload.len()));
        }
        self.buf.push(ty);
        self.buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(payload);
        self.last_writer = writer;
        Ok(())
    }

    /// Drain the staged chunk area, resetting the writer-coalescing state.
    pub fn take(&mut self) -> Vec<u8> {
        self.last_writer = None;
        std::mem::take(&mut self.buf)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.last_writer = None;
    }
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HANDSHAKE_KEY;

    fn cipher() -> PacketCipher {
        PacketCipher::new(HANDSHAKE_KEY)
    }

    #[test]
    fn scramble_round_trip() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..64 {
            let id = rng.u32(..);
            let mut data = vec![0u8; 32];
            rng.fill(&mut data[4..]);
            scramble_id(&mut data, id);
            assert_eq!(unscramble_id(&data), Some(id));
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = cipher();
        let payload = b"\x0b\x12\x34\x30\x00\x03abc";
        let mut data = vec![0u8; DATA_OFFSET];
        data.extend_from_slice(payload);
        seal(&cipher, &mut data).unwrap();
        assert_eq!((data.len() - BODY_OFFSET) % 16, 0);
        let raw = open(&cipher, &data).unwrap();
        assert_eq!(&raw[DATA_OFFSET..DATA_OFFSET + payload.len()], payload);
        // Padding is 0xFF.
        assert!(raw[DATA_OFFSET + payload.len()..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn open_rejects_corruption() {
        let cipher = cipher();
        let mut data = vec![0u8; DATA_OFFSET];
        data.extend_from_slice(b"hello rtmfp");
        seal(&cipher, &mut data).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(matches!(
            open(&cipher, &data),
            Err(Error::InvalidChecksum) | Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn open_rejects_short_datagram() {
        assert!(open(&cipher(), &[0u8; 8]).is_err());
    }

    #[test]
    fn builder_capacity_is_enforced() {
        let mut builder = PacketBuilder::new();
        let big = vec![0u8; PacketBuilder::CAPACITY - 3];
        builder.write_chunk(0x10, &big, Some(1)).unwrap();
        assert_eq!(builder.available(), 0);
        assert!(builder.write_chunk(0x11, &[0], Some(1)).is_err());
        let drained = builder.take();
        assert_eq!(drained.len(), PacketBuilder::CAPACITY);
        assert_eq!(builder.last_writer(), None);
    }

    #[test]
    fn time_ticks_wrap() {
        assert_eq!(time_4ms(Duration::from_millis(4)), 1);
        assert_eq!(time_4ms(Duration::from_millis(0x10000 * 4)), 0);
    }
}
