//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): RTSP request/response signaling, one task per
//!   connection. Also carries interleaved RTP/RTCP (RFC 2326 §10.12).
//! - **HTTP** ([`http`]): RTSP tunneled through a GET/POST connection pair.
//! - **UDP** ([`udp`]): server-side RTP/RTCP socket pairs for unicast and
//!   multicast delivery.

pub mod http;
pub mod tcp;
pub mod udp;

pub use udp::{PortAllocator, UdpPair};
