//! RTP fixed header (RFC 3550 §5.1) shared by every packetizer.
//!
//! ```text
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! |                           timestamp                           |
//! |                             SSRC                              |
//! ```
//!
//! Padding, extension and CSRCs are never used, so the header is always
//! 12 bytes.

use bytes::BufMut;

pub const HEADER_LEN: usize = 12;

/// Numbering state of one RTP stream.
///
/// The sequence number advances on every [`write`](Self::write); the
/// timestamp only when the packetizer finishes an access unit. Both wrap.
#[derive(Debug, Clone)]
pub struct RtpHeader {
    pub pt: u8,
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::resume(pt, ssrc, 0, 0)
    }

    /// Random SSRC (RFC 3550 §8.1), numbering from zero.
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>())
    }

    /// Pick up an existing stream where it left off: same SSRC, next
    /// sequence number and timestamp.
    pub fn resume(pt: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        tracing::trace!(pt, ssrc = format_args!("{ssrc:08X}"), sequence, timestamp, "RTP numbering");
        Self {
            pt,
            ssrc,
            sequence,
            timestamp,
        }
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp of the access unit being packetized.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Header for the next packet. `marker` flags the last packet of an
    /// access unit.
    pub fn write(&mut self, marker: bool) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        let mut out = &mut header[..];
        out.put_u8(0x80);
        out.put_u8((u8::from(marker) << 7) | (self.pt & 0x7f));
        out.put_u16(self.sequence);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

/// Fields of a received RTP packet, as a conformant receiver sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacketView<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

/// Parse a fixed-header RTP packet (no CSRCs, no extension).
pub fn parse_packet(packet: &[u8]) -> Option<RtpPacketView<'_>> {
    if packet.len() < HEADER_LEN || packet[0] >> 6 != 2 {
        return None;
    }
    Some(RtpPacketView {
        marker: packet[1] & 0x80 != 0,
        payload_type: packet[1] & 0x7f,
        sequence: u16::from_be_bytes([packet[2], packet[3]]),
        timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
        ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        payload: &packet[HEADER_LEN..],
    })
}
