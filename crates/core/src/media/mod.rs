//! Media codecs: access-unit framing and RTP packetization.
//!
//! Two traits split the codec work:
//!
//! - [`AccessUnitParser`] finds access-unit boundaries in a raw
//!   elementary byte stream (used by [`crate::framer::Framer`]).
//! - [`Packetizer`] turns one access unit into RTP packets and describes
//!   the payload format in SDP (used by [`crate::sink::RtpSink`]).
//!
//! ## RTP overview (RFC 3550)
//!
//! Each access unit is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, 90 kHz for video, sample rate for audio.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit.
//!
//! ## Supported codecs
//!
//! | Codec | Module | Framing | RTP payload |
//! |-------|--------|---------|-------------|
//! | H.264 | [`h264`] | Annex B | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.265 | [`h265`] | Annex B | [RFC 7798](https://tools.ietf.org/html/rfc7798) |
//! | AAC   | [`aac`]  | ADTS    | [RFC 3640](https://tools.ietf.org/html/rfc3640) AAC-hbr |

pub mod aac;
pub mod annexb;
pub mod h264;
pub mod h265;
pub mod rtp;

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Elementary stream codec of one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    /// AAC carried in ADTS frames.
    Aac,
}

impl Codec {
    /// SDP media type (`m=` line).
    pub fn media_kind(&self) -> &'static str {
        match self {
            Codec::H264 | Codec::H265 => "video",
            Codec::Aac => "audio",
        }
    }

    /// Dynamic RTP payload type used for this codec.
    pub fn payload_type(&self) -> u8 {
        match self {
            Codec::H264 | Codec::H265 => 96,
            Codec::Aac => 97,
        }
    }

    /// Build the access-unit parser for this codec.
    ///
    /// `frame_rate` only matters for video, where it determines the
    /// timestamp increment between access units.
    pub fn parser(&self, frame_rate: u32) -> Box<dyn AccessUnitParser> {
        let duration = VIDEO_CLOCK_RATE / frame_rate.max(1);
        match self {
            Codec::H264 => Box::new(h264::H264AccessUnitParser::new(duration)),
            Codec::H265 => Box::new(h265::H265AccessUnitParser::new(duration)),
            Codec::Aac => Box::new(aac::AdtsParser::new()),
        }
    }

    /// Build a packetizer with a random SSRC (RFC 3550 §8.1).
    pub fn packetizer(&self) -> Box<dyn Packetizer> {
        let pt = self.payload_type();
        match self {
            Codec::H264 => Box::new(h264::H264Packetizer::with_random_ssrc(pt)),
            Codec::H265 => Box::new(h265::H265Packetizer::with_random_ssrc(pt)),
            Codec::Aac => Box::new(aac::AacPacketizer::with_random_ssrc(pt)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "h264"),
            Codec::H265 => write!(f, "h265"),
            Codec::Aac => write!(f, "aac"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            "aac" | "adts" => Ok(Codec::Aac),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}

/// A delimited access unit, still in its elementary-stream syntax
/// (Annex B with start codes for video, a full ADTS frame for audio).
#[derive(Debug, Clone)]
pub struct ParsedUnit {
    pub data: Bytes,
    /// Duration in RTP clock ticks.
    pub duration: u32,
}

/// Codec-aware access-unit delimiter.
///
/// Implementations buffer nothing themselves: the framer owns the scan
/// buffer and hands it in on every call.
pub trait AccessUnitParser: Send {
    /// Split the next complete access unit off the front of `buf`.
    ///
    /// Returns `None` when more data is needed. With `at_eos` set, no more
    /// data will ever arrive: the parser emits a trailing unit if the end of
    /// data delimits it, and leaves anything it cannot delimit in `buf` for
    /// the framer to discard.
    fn next_unit(&mut self, buf: &mut BytesMut, at_eos: bool) -> Option<ParsedUnit>;
}

/// Codec-specific RTP packetizer.
///
/// Each supported codec implements this trait, providing:
/// - **Packetization**: splitting an access unit into RTP-sized packets
/// - **SDP attributes**: codec parameters for the DESCRIBE response
/// - **RTP metadata**: payload type, clock rate, sequence/timestamp state
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it rather than reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one access unit into RTP packets.
    ///
    /// Each returned `Vec<u8>` is a complete RTP packet: 12-byte header
    /// (RFC 3550 §5.1) followed by the codec-specific payload.
    ///
    /// `timestamp_increment` advances the RTP timestamp after this unit.
    fn packetize(&mut self, access_unit: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>>;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`, `"H265"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551).
    fn payload_type(&self) -> u8;

    /// Synchronization source identifier.
    fn ssrc(&self) -> u32;

    /// SDP media-level attribute lines for this codec (`a=rtpmap`, `a=fmtp`).
    ///
    /// The track's `a=control` line is added by the subsession.
    fn sdp_attributes(&self) -> Vec<String>;

    /// Whether the out-of-band parameters needed for a complete SDP
    /// (parameter sets, audio config) have been seen.
    fn is_configured(&self) -> bool;

    /// Current RTP sequence number (for the `RTP-Info` header in PLAY responses).
    fn next_sequence(&self) -> u16;

    /// Current RTP timestamp as u32 (for the `RTP-Info` header in PLAY responses).
    fn next_rtp_timestamp(&self) -> u32;

    /// A fresh packetizer continuing this one's RTP numbering space
    /// (same SSRC, next sequence number and timestamp) and keeping any
    /// captured codec parameters.
    fn renew(&self) -> Box<dyn Packetizer>;
}
