//! H.265 (HEVC) framing and RTP packetization (RFC 7798).
//!
//! Key differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header** (vs 1-byte in H.264).
//!   The NAL type is in bits 1..6 of the first byte.
//!
//! - **FU format**: a 2-byte payload header with type 49 followed by a
//!   1-byte FU header carrying S/E bits and the 6-bit NAL type.
//!
//! - **SDP attributes** (RFC 7798 §7.1):
//!   ```text
//!   a=rtpmap:96 H265/90000
//!   a=fmtp:96 sprop-vps=...;sprop-sps=...;sprop-pps=...
//!   ```

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::BytesMut;

use super::annexb::{self, NalRole};
use super::h264::DEFAULT_MTU;
use super::rtp::RtpHeader;
use super::{AccessUnitParser, Packetizer, ParsedUnit, VIDEO_CLOCK_RATE};

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const FU_TYPE: u8 = 49;

fn nal_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3f
}

/// H.265 RTP packetizer (RFC 7798 §4.4.1 single NAL, §4.4.3 FU).
#[derive(Debug, Clone)]
pub struct H265Packetizer {
    header: RtpHeader,
    mtu: usize,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H265Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::from_header(RtpHeader::new(pt, ssrc))
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::from_header(RtpHeader::with_random_ssrc(pt))
    }

    fn from_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            vps: None,
            sps: None,
            pps: None,
        }
    }

    fn capture(&mut self, nal: &[u8]) {
        let slot = match nal_type(nal) {
            NAL_VPS => &mut self.vps,
            NAL_SPS => &mut self.sps,
            NAL_PPS => &mut self.pps,
            _ => return,
        };
        if slot.as_deref() != Some(nal) {
            *slot = Some(nal.to_vec());
            tracing::debug!(nal_type = nal_type(nal), len = nal.len(), "H.265 parameter set captured");
        }
    }

    fn packetize_nal(&mut self, nal: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        if nal.len() < 2 {
            return packets;
        }

        if nal.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal);
            let mut packet = Vec::with_capacity(12 + nal.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal);
            packets.push(packet);
            return packets;
        }

        let payload_hdr = [(nal[0] & 0x81) | (FU_TYPE << 1), nal[1]];
        let original_type = nal_type(nal);
        let payload = &nal[2..];
        let max_fragment = self.mtu - 3;

        for (i, chunk) in payload.chunks(max_fragment).enumerate() {
            let first = i == 0;
            let last = (i + 1) * max_fragment >= payload.len();
            let fu_header =
                (if first { 0x80 } else { 0 }) | (if last { 0x40 } else { 0 }) | original_type;

            let hdr = self.header.write(is_last_nal && last);
            let mut packet = Vec::with_capacity(12 + 3 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(&payload_hdr);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type = original_type,
            nal_size = nal.len(),
            fragments = packets.len(),
            "FU fragmented NAL unit"
        );
        packets
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, access_unit: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = annexb::split_nal_units(access_unit);
        for nal in &nal_units {
            if nal.len() >= 2 {
                self.capture(nal);
            }
        }

        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i + 1 == nal_units.len();
            packets.append(&mut self.packetize_nal(nal, is_last));
        }
        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            "access unit packetized"
        );
        packets
    }

    fn codec_name(&self) -> &'static str {
        "H265"
    }

    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn sdp_attributes(&self) -> Vec<String> {
        let rtpmap = format!(
            "a=rtpmap:{} {}/{}",
            self.header.pt,
            self.codec_name(),
            self.clock_rate()
        );
        let sprops: Vec<String> = [
            ("sprop-vps", &self.vps),
            ("sprop-sps", &self.sps),
            ("sprop-pps", &self.pps),
        ]
        .iter()
        .filter_map(|(name, value)| {
            value
                .as_deref()
                .map(|v| format!("{name}={}", BASE64_STANDARD.encode(v)))
        })
        .collect();

        if sprops.is_empty() {
            vec![rtpmap]
        } else {
            vec![
                rtpmap,
                format!("a=fmtp:{} {}", self.header.pt, sprops.join(";")),
            ]
        }
    }

    fn is_configured(&self) -> bool {
        self.vps.is_some() && self.sps.is_some() && self.pps.is_some()
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

/// Access-unit delimiting for H.265 Annex B (ITU-T H.265 §7.4.2.4.4).
fn classify(nal: &[u8]) -> NalRole {
    if nal.len() < 2 {
        return NalRole::Other;
    }
    match nal_type(nal) {
        // first_slice_segment_in_pic_flag is the first bit after the NAL header
        0..=31 => NalRole::Vcl {
            first_in_picture: nal.len() > 2 && nal[2] & 0x80 != 0,
        },
        32..=35 | 39 | 41..=44 | 48..=55 => NalRole::Prefix,
        _ => NalRole::Other,
    }
}

/// Splits an H.265 Annex B byte stream into access units.
#[derive(Debug)]
pub struct H265AccessUnitParser {
    duration: u32,
    splitter: annexb::AnnexBSplitter,
}

impl H265AccessUnitParser {
    pub fn new(duration: u32) -> Self {
        Self {
            duration,
            splitter: annexb::AnnexBSplitter::new(),
        }
    }
}

impl AccessUnitParser for H265AccessUnitParser {
    fn next_unit(&mut self, buf: &mut BytesMut, at_eos: bool) -> Option<ParsedUnit> {
        self.splitter.next_unit(buf, at_eos, classify).map(|data| ParsedUnit {
            data,
            duration: self.duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VPS: [u8; 4] = [0x40, 0x01, 0x0C, 0x01];
    const SPS: [u8; 4] = [0x42, 0x01, 0x01, 0x01];
    const PPS: [u8; 3] = [0x44, 0x01, 0xC1];

    fn keyframe() -> Vec<u8> {
        [
            &[0u8, 0, 0, 1][..],
            &VPS[..],
            &[0, 0, 0, 1][..],
            &SPS[..],
            &[0, 0, 0, 1][..],
            &PPS[..],
            &[0, 0, 0, 1, 0x26, 0x01, 0xAF, 0x12][..],
        ]
        .concat()
    }

    #[test]
    fn captures_parameter_sets_for_sdp() {
        let mut p = H265Packetizer::new(96, 0x1234);
        assert!(!p.is_configured());
        assert_eq!(p.sdp_attributes(), vec!["a=rtpmap:96 H265/90000"]);

        let packets = p.packetize(&keyframe(), 3600);
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[3][1] & 0x80, 0x80, "marker on last NAL");
        assert_eq!(packets[0][1] & 0x80, 0);
        assert!(p.is_configured());

        let attrs = p.sdp_attributes();
        assert_eq!(attrs[0], "a=rtpmap:96 H265/90000");
        assert_eq!(
            attrs[1],
            "a=fmtp:96 sprop-vps=QAEMAQ==;sprop-sps=QgEBAQ==;sprop-pps=RAHB"
        );
    }

    #[test]
    fn large_nal_uses_fragmentation_units() {
        let mut p = H265Packetizer::new(96, 0x1234);
        let mut nal = vec![0x26, 0x01];
        nal.extend(vec![0x55; DEFAULT_MTU * 2]);
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 3);

        for pkt in &packets {
            assert_eq!((pkt[12] >> 1) & 0x3f, FU_TYPE);
            assert_eq!(pkt[13], 0x01);
            assert_eq!(pkt[14] & 0x3f, 19);
        }
        assert_eq!(packets[0][14] & 0xC0, 0x80);
        assert_eq!(packets[1][14] & 0xC0, 0x00);
        assert_eq!(packets[2][14] & 0xC0, 0x40);
        assert_eq!(packets[2][1] & 0x80, 0x80);

        let reassembled: usize = packets.iter().map(|p| p.len() - 15).sum();
        assert_eq!(reassembled, nal.len() - 2);
    }

    #[test]
    fn parser_yields_one_unit_per_picture() {
        let mut stream = keyframe();
        let trail = [0u8, 0, 0, 1, 0x02, 0x01, 0xD0, 0x44];
        stream.extend_from_slice(&trail);
        stream.extend_from_slice(&trail);

        let mut parser = H265AccessUnitParser::new(3600);
        let mut buf = BytesMut::from(&stream[..]);

        let mut units = Vec::new();
        while let Some(u) = parser.next_unit(&mut buf, false) {
            units.push(u);
        }
        while let Some(u) = parser.next_unit(&mut buf, true) {
            units.push(u);
        }
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0].data[..], &keyframe()[..]);
        assert_eq!(&units[1].data[..], &trail[..]);
        assert_eq!(&units[2].data[..], &trail[..]);
        assert!(buf.is_empty());
    }
}
