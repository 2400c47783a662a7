//! AAC audio in ADTS framing, sent as RFC 3640 `mpeg4-generic` (AAC-hbr).
//!
//! ADTS header (ISO/IEC 13818-7 §6.2):
//! ```text
//! +--------------+---+-----+---+---------+-----+---------+----------+-----+
//! | sync 0xFFF   |ID |layer|PA | profile | SFI | chan    | length   | ... |
//! | 12 bits      | 1 | 2   | 1 | 2       | 4   | 3 (+1)  | 13 bits  |     |
//! +--------------+---+-----+---+---------+-----+---------+----------+-----+
//! ```
//! The header is 7 bytes, or 9 when a CRC follows (protection absent = 0).
//!
//! RTP payload (RFC 3640 §3.2, AAC-hbr): a 16-bit AU-headers-length (16)
//! and one AU-header (13-bit size, 3-bit index) before the raw frame.

use bytes::{Buf, BytesMut};

use super::h264::DEFAULT_MTU;
use super::rtp::RtpHeader;
use super::{AccessUnitParser, Packetizer, ParsedUnit};

/// Samples per AAC frame.
pub const SAMPLES_PER_FRAME: u32 = 1024;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Fields of one ADTS frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (profile + 1).
    pub object_type: u8,
    pub sampling_index: u8,
    pub channels: u8,
    /// Header length: 7, or 9 with CRC.
    pub header_len: usize,
    /// Whole frame length including the header.
    pub frame_len: usize,
}

impl AdtsHeader {
    /// Parse a header at the start of `data`. Returns `None` when there
    /// are fewer than 7 bytes or the fields are not a plausible ADTS header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF6 != 0xF0 {
            return None;
        }
        let protection_absent = data[1] & 0x01 == 1;
        let object_type = ((data[2] >> 6) & 0x03) + 1;
        let sampling_index = (data[2] >> 2) & 0x0F;
        let channels = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);
        let header_len = if protection_absent { 7 } else { 9 };

        if sampling_index as usize >= SAMPLING_FREQUENCIES.len() || frame_len <= header_len {
            return None;
        }
        Some(Self {
            object_type,
            sampling_index,
            channels,
            header_len,
            frame_len,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLING_FREQUENCIES[self.sampling_index as usize]
    }

    /// Two-byte AudioSpecificConfig (ISO/IEC 14496-3 §1.6.2.1).
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let config: u16 = ((self.object_type as u16) << 11)
            | ((self.sampling_index as u16) << 7)
            | ((self.channels as u16) << 3);
        config.to_be_bytes()
    }
}

/// Splits an ADTS byte stream into frames, one access unit each.
///
/// Resynchronizes on the next sync word when a header is invalid. A frame
/// cut short by end of stream is left in the buffer for the framer to
/// discard.
#[derive(Debug, Default)]
pub struct AdtsParser {
    resyncs: u64,
}

impl AdtsParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccessUnitParser for AdtsParser {
    fn next_unit(&mut self, buf: &mut BytesMut, _at_eos: bool) -> Option<ParsedUnit> {
        loop {
            let sync = buf
                .windows(2)
                .position(|w| w[0] == 0xFF && w[1] & 0xF6 == 0xF0)?;
            if sync > 0 {
                self.resyncs += 1;
                tracing::trace!(skipped = sync, resyncs = self.resyncs, "ADTS resync");
                buf.advance(sync);
            }
            if buf.len() < 7 {
                return None;
            }
            match AdtsHeader::parse(buf) {
                Some(header) if buf.len() >= header.frame_len => {
                    return Some(ParsedUnit {
                        data: buf.split_to(header.frame_len).freeze(),
                        duration: SAMPLES_PER_FRAME,
                    });
                }
                Some(_) => return None,
                None => buf.advance(1),
            }
        }
    }
}

/// RFC 3640 AAC-hbr packetizer. Input access units are whole ADTS frames.
#[derive(Debug, Clone)]
pub struct AacPacketizer {
    header: RtpHeader,
    mtu: usize,
    config: Option<AdtsHeader>,
}

impl AacPacketizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mtu: DEFAULT_MTU,
            config: None,
        }
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            mtu: DEFAULT_MTU,
            config: None,
        }
    }

    /// AAC-LC, 44.1 kHz, stereo: what the SDP announces before a frame is seen.
    fn fallback() -> AdtsHeader {
        AdtsHeader {
            object_type: 2,
            sampling_index: 4,
            channels: 2,
            header_len: 7,
            frame_len: 0,
        }
    }

    fn effective_config(&self) -> AdtsHeader {
        self.config.unwrap_or_else(Self::fallback)
    }
}

impl Packetizer for AacPacketizer {
    fn packetize(&mut self, access_unit: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let Some(adts) = AdtsHeader::parse(access_unit) else {
            tracing::warn!(len = access_unit.len(), "dropping access unit without ADTS header");
            return Vec::new();
        };
        if self.config.map(|c| c.audio_specific_config()) != Some(adts.audio_specific_config()) {
            tracing::debug!(
                sample_rate = adts.sample_rate(),
                channels = adts.channels,
                "AAC config captured"
            );
            self.config = Some(adts);
        }

        let end = adts.frame_len.min(access_unit.len());
        if end <= adts.header_len {
            return Vec::new();
        }
        let raw = &access_unit[adts.header_len..end];
        let au_header = ((raw.len() as u16) << 3).to_be_bytes();
        let max_fragment = self.mtu - 4;

        let mut packets = Vec::new();
        let chunks: Vec<&[u8]> = raw.chunks(max_fragment.max(1)).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let hdr = self.header.write(i + 1 == chunks.len());
            let mut packet = Vec::with_capacity(12 + 4 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(&[0x00, 0x10]);
            packet.extend_from_slice(&au_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }
        self.header.advance_timestamp(timestamp_increment);
        packets
    }

    fn codec_name(&self) -> &'static str {
        "MPEG4-GENERIC"
    }

    fn clock_rate(&self) -> u32 {
        self.effective_config().sample_rate()
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn sdp_attributes(&self) -> Vec<String> {
        let cfg = self.effective_config();
        let asc = cfg.audio_specific_config();
        vec![
            format!(
                "a=rtpmap:{} {}/{}/{}",
                self.header.pt,
                self.codec_name(),
                cfg.sample_rate(),
                cfg.channels
            ),
            format!(
                "a=fmtp:{} streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={:02X}{:02X}",
                self.header.pt, asc[0], asc[1]
            ),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }

    fn renew(&self) -> Box<dyn Packetizer> {
        let mut renewed = self.clone();
        renewed.header = RtpHeader::resume(
            self.header.pt,
            self.header.ssrc,
            self.header.sequence(),
            self.header.timestamp(),
        );
        Box::new(renewed)
    }
}
