use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;

use crate::error::{Result, StreamError};

const SERVER_PORT_MIN: u64 = 5000;
const SERVER_PORT_MAX: u64 = 65534;
const BIND_ATTEMPTS: usize = 64;

/// A bound (RTP, RTCP) server socket pair.
///
/// Per RFC 3550 §11 the RTP port is even and RTCP = RTP + 1.
#[derive(Debug)]
pub struct UdpPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

impl UdpPair {
    pub fn rtp_port(&self) -> u16 {
        self.rtp.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtcp.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Set the TTL used for packets sent to a multicast group.
    pub fn set_multicast_ttl(&self, ttl: u8) -> Result<()> {
        self.rtp
            .set_multicast_ttl_v4(ttl as u32)
            .map_err(|e| StreamError::transport_setup("multicast TTL", e))?;
        self.rtcp
            .set_multicast_ttl_v4(ttl as u32)
            .map_err(|e| StreamError::transport_setup("multicast TTL", e))?;
        Ok(())
    }
}

/// Hands out server port pairs that are actually bound.
///
/// Candidates come from a monotonic counter starting at 5000 that wraps
/// when the range is exhausted. A candidate whose ports are taken is
/// skipped.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    next: Arc<AtomicU64>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::starting_at(SERVER_PORT_MIN as u16)
    }

    pub fn starting_at(port: u16) -> Self {
        let even = (port as u64) & !1;
        Self {
            next: Arc::new(AtomicU64::new(even.max(2))),
        }
    }

    fn candidate(&self) -> u16 {
        let rtp = self.next.fetch_add(2, Ordering::SeqCst);
        if rtp > SERVER_PORT_MAX {
            tracing::warn!(rtp, "port range exhausted, wrapping to {SERVER_PORT_MIN}");
            self.next.store(SERVER_PORT_MIN + 2, Ordering::SeqCst);
            return SERVER_PORT_MIN as u16;
        }
        rtp as u16
    }

    /// Bind the next free even/odd pair on all interfaces.
    pub async fn allocate(&self) -> Result<UdpPair> {
        for _ in 0..BIND_ATTEMPTS {
            let rtp_port = self.candidate();
            let Ok(rtp) = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, rtp_port))).await
            else {
                continue;
            };
            let Ok(rtcp) =
                UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, rtp_port + 1))).await
            else {
                continue;
            };
            tracing::trace!(rtp_port, rtcp_port = rtp_port + 1, "allocated server ports");
            return Ok(UdpPair { rtp, rtcp });
        }
        Err(StreamError::PortRangeExhausted)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
