use std::net::IpAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Lower transport requested in a `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

/// Parsed client-side transport info from the RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// RTP/AVP;unicast;client_port=8000-8001
/// RTP/AVP/TCP;unicast;interleaved=0-1
/// RTP/AVP;multicast
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    pub multicast: bool,
    /// Client's requested (RTP, RTCP) ports.
    pub client_port: Option<(u16, u16)>,
    /// Requested interleaved (RTP, RTCP) channel numbers.
    pub interleaved: Option<(u8, u8)>,
}

fn parse_pair(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = value.trim().parse().ok()?;
            Some((a, a.checked_add(1)?))
        }
    }
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// When the client lists several transports (comma separated), the
    /// first one that parses is used.
    ///
    /// ## Examples
    ///
    /// ```
    /// use streamer::session::transport::{LowerTransport, TransportHeader};
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.lower, LowerTransport::Udp);
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
    /// assert_eq!(th.interleaved, Some((2, 3)));
    ///
    /// assert!(TransportHeader::parse("RAW/RAW/UDP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        header.split(',').find_map(Self::parse_one)
    }

    fn parse_one(spec: &str) -> Option<Self> {
        let mut parts = spec.split(';').map(str::trim);
        let lower = match parts.next()? {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            _ => return None,
        };

        let mut th = TransportHeader {
            lower,
            multicast: false,
            client_port: None,
            interleaved: None,
        };
        for part in parts {
            if part == "multicast" {
                th.multicast = true;
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                th.client_port = Some(parse_pair(ports)?);
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                let (rtp, rtcp) = parse_pair(channels)?;
                th.interleaved = Some((u8::try_from(rtp).ok()?, u8::try_from(rtcp).ok()?));
            }
        }
        Some(th)
    }
}

/// Where a client wants one track delivered, resolved against its
/// connection.
#[derive(Debug, Clone)]
pub enum ClientTransport {
    Udp {
        client: IpAddr,
        rtp_port: u16,
        rtcp_port: u16,
    },
    /// On the RTSP connection (or HTTP tunnel) itself.
    Interleaved {
        tx: mpsc::Sender<Bytes>,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
    Multicast,
}
