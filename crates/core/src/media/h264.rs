//! H.264 framing and RTP packetization (RFC 6184).
//!
//! NAL units that fit the MTU travel as single NAL unit packets (§5.6).
//! Larger ones are split into FU-A fragments (§5.8):
//!
//! ```text
//! FU indicator [F|NRI|28]  FU header [S|E|R|type]  fragment...
//! ```

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::BytesMut;

use super::annexb::{self, NalRole};
use super::rtp::{HEADER_LEN, RtpHeader};
use super::{AccessUnitParser, Packetizer, ParsedUnit, VIDEO_CLOCK_RATE};

pub(crate) const DEFAULT_MTU: usize = 1400;

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const FU_A: u8 = 28;

fn nal_type(nal: &[u8]) -> u8 {
    nal[0] & 0x1f
}

/// H.264 RTP packetizer, `packetization-mode=1`.
///
/// Parameter sets seen in the bitstream are kept for the SDP `fmtp` line.
#[derive(Debug, Clone)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
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
            sps: None,
            pps: None,
        }
    }

    fn capture(&mut self, nal: &[u8]) {
        let slot = match nal_type(nal) {
            NAL_SPS => &mut self.sps,
            NAL_PPS => &mut self.pps,
            _ => return,
        };
        if slot.as_deref() != Some(nal) {
            *slot = Some(nal.to_vec());
            tracing::debug!(nal_type = nal_type(nal), len = nal.len(), "H.264 parameter set captured");
        }
    }

    /// `fmtp` parameters derived from the SPS and PPS, once both are known.
    fn fmtp_parameters(&self) -> Vec<String> {
        let mut params = vec!["packetization-mode=1".to_string()];
        // profile_idc, constraint flags, level_idc
        if let Some(sps) = self.sps.as_deref().filter(|sps| sps.len() >= 4) {
            params.push(format!("profile-level-id={:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]));
        }
        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            params.push(format!(
                "sprop-parameter-sets={},{}",
                BASE64_STANDARD.encode(sps),
                BASE64_STANDARD.encode(pps)
            ));
        }
        params
    }

    fn packetize_nal(&mut self, nal: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        if nal.is_empty() {
            return Vec::new();
        }

        if nal.len() <= self.mtu {
            let mut packet = Vec::with_capacity(HEADER_LEN + nal.len());
            packet.extend_from_slice(&self.header.write(is_last_nal));
            packet.extend_from_slice(nal);
            return vec![packet];
        }

        let indicator = (nal[0] & 0x60) | FU_A;
        let original_type = nal_type(nal);
        let payload = &nal[1..];
        let max_fragment = self.mtu - 2;
        let count = payload.len().div_ceil(max_fragment);

        let packets: Vec<Vec<u8>> = payload
            .chunks(max_fragment)
            .enumerate()
            .map(|(i, chunk)| {
                let last = i + 1 == count;
                let fu_header = (u8::from(i == 0) << 7) | (u8::from(last) << 6) | original_type;
                let mut packet = Vec::with_capacity(HEADER_LEN + 2 + chunk.len());
                packet.extend_from_slice(&self.header.write(is_last_nal && last));
                packet.push(indicator);
                packet.push(fu_header);
                packet.extend_from_slice(chunk);
                packet
            })
            .collect();

        tracing::trace!(
            nal_type = original_type,
            nal_size = nal.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );
        packets
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, access_unit: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = annexb::split_nal_units(access_unit);
        for nal in &nal_units {
            self.capture(nal);
        }

        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            packets.append(&mut self.packetize_nal(nal, i + 1 == nal_units.len()));
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
        "H264"
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

    /// `a=rtpmap` then `a=fmtp` (RFC 6184 §8.2.1).
    fn sdp_attributes(&self) -> Vec<String> {
        vec![
            format!("a=rtpmap:{} H264/{}", self.header.pt, VIDEO_CLOCK_RATE),
            format!("a=fmtp:{} {}", self.header.pt, self.fmtp_parameters().join(";")),
        ]
    }

    fn is_configured(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }

    fn renew(&self) -> Box<dyn Packetizer> {
        Box::new(self.clone())
    }
}

/// Access-unit delimiting for H.264 Annex B (ITU-T H.264 §7.4.1.2.3).
fn classify(nal: &[u8]) -> NalRole {
    match nal[0] & 0x1f {
        // first_mb_in_slice is ue(v); a leading 1 bit encodes 0
        1..=5 => NalRole::Vcl {
            first_in_picture: nal.len() > 1 && nal[1] & 0x80 != 0,
        },
        6..=9 | 14..=18 => NalRole::Prefix,
        _ => NalRole::Other,
    }
}

/// Splits an H.264 Annex B byte stream into access units.
#[derive(Debug)]
pub struct H264AccessUnitParser {
    duration: u32,
    splitter: annexb::AnnexBSplitter,
}

impl H264AccessUnitParser {
    pub fn new(duration: u32) -> Self {
        Self {
            duration,
            splitter: annexb::AnnexBSplitter::new(),
        }
    }
}

impl AccessUnitParser for H264AccessUnitParser {
    fn next_unit(&mut self, buf: &mut BytesMut, at_eos: bool) -> Option<ParsedUnit> {
        self.splitter.next_unit(buf, at_eos, classify).map(|data| ParsedUnit {
            data,
            duration: self.duration,
        })
    }
}
