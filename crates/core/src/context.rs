use crate::config::StreamerConfig;
use crate::rtcp::RtcpSettings;
use crate::transport::udp::PortAllocator;

/// Everything the composed topology shares, built once at startup and
/// handed to each component that needs it.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: StreamerConfig,
    /// Server-side RTP/RTCP port pairs for every channel of the process.
    pub ports: PortAllocator,
    pub rtcp: RtcpSettings,
}

impl AppContext {
    pub fn new(config: StreamerConfig) -> Self {
        let rtcp = RtcpSettings {
            interval: config.rtcp_interval,
            cname: config.cname.clone(),
        };
        Self {
            config,
            ports: PortAllocator::new(),
            rtcp,
        }
    }

    /// Use a dedicated server port range (tests, or hosts with a firewall
    /// opening for a fixed range).
    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }
}
