//! Process start parameters.
//!
//! Everything here is read once at startup and never mutated afterwards.
//! There is no persisted state: a restart re-derives the whole topology
//! from a fresh [`StreamerConfig`].

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::media::Codec;

pub const DEFAULT_RTSP_PORT: u16 = 5554;
pub const DEFAULT_HTTP_TUNNEL_PORT: u16 = 8000;
pub const DEFAULT_MULTICAST_PORT: u16 = 18888;
pub const DEFAULT_MULTICAST_TTL: u8 = 255;
pub const DEFAULT_FRAME_RATE: u32 = 25;
pub const DEFAULT_VIDEO_ENDPOINT: &str = "/tmp/video.sock";
pub const DEFAULT_AUDIO_ENDPOINT: &str = "/tmp/audio.sock";

/// One elementary stream offered by the media session.
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// Filesystem path of the producer's socket, FIFO or file.
    pub endpoint: PathBuf,
    pub codec: Codec,
}

impl TrackConfig {
    pub fn new(endpoint: impl Into<PathBuf>, codec: Codec) -> Self {
        Self {
            endpoint: endpoint.into(),
            codec,
        }
    }
}

/// Destination of the shared feed in passive/multicast mode.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    /// RTP port of the first subsession. RTCP is always `port + 1`.
    pub port: u16,
    pub ttl: u8,
}

impl MulticastConfig {
    /// Pick a random source-specific multicast group in 232.0.1.0–232.255.255.255.
    pub fn random_ssm(port: u16, ttl: u8) -> Self {
        let bits: u32 = rand::random();
        let mut b = bits.to_be_bytes();
        // 232.0.0.x is reserved
        if b[1] == 0 && b[2] == 0 {
            b[2] = 1;
        }
        Self {
            group: Ipv4Addr::new(232, b[1], b[2], b[3]),
            port,
            ttl,
        }
    }

    /// RTP destination for the subsession at `index` (advertised order).
    ///
    /// Each subsession gets its own even/odd pair so RTCP stays at RTP + 1.
    pub fn rtp_destination(&self, index: usize) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port.wrapping_add(2 * index as u16))
    }

    pub fn rtcp_destination(&self, index: usize) -> SocketAddrV4 {
        let rtp = self.rtp_destination(index);
        SocketAddrV4::new(self.group, rtp.port().wrapping_add(1))
    }
}

/// A username/password pair accepted by the authenticator.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// How the restart controller reopens an endpoint after a clip ends.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Attempts made to reopen after end of stream before giving up.
    pub reopen_attempts: u32,
    /// Pause between two reopen attempts.
    pub reopen_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            reopen_attempts: 20,
            reopen_delay: Duration::from_millis(250),
        }
    }
}

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// RTSP control port.
    pub rtsp_port: u16,
    /// Passive/multicast topology when set, on-demand unicast otherwise.
    pub multicast: Option<MulticastConfig>,
    /// RTSP-over-HTTP tunnel port, if tunneling is enabled.
    pub http_tunnel_port: Option<u16>,
    /// Accepted credentials. Empty means unauthenticated access.
    pub credentials: Vec<Credential>,
    /// Realm announced in authentication challenges.
    pub auth_realm: String,
    pub video: Option<TrackConfig>,
    pub audio: Option<TrackConfig>,
    /// Stream name; the session is served at `rtsp://host:port/<name>`.
    pub stream_name: String,
    /// Human readable description (SDP `i=` line).
    pub description: String,
    /// Video frame rate used to timestamp access units.
    pub frame_rate: u32,
    pub restart: RestartPolicy,
    /// Interval between two RTCP sender reports.
    pub rtcp_interval: Duration,
    /// Host advertised in URLs and SDP. Detected when `None`.
    pub public_host: Option<String>,
    /// RTCP SDES CNAME.
    pub cname: String,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            rtsp_port: DEFAULT_RTSP_PORT,
            multicast: None,
            http_tunnel_port: None,
            credentials: Vec::new(),
            auth_realm: "Streaming Server".to_string(),
            video: Some(TrackConfig::new(DEFAULT_VIDEO_ENDPOINT, Codec::H265)),
            audio: Some(TrackConfig::new(DEFAULT_AUDIO_ENDPOINT, Codec::Aac)),
            stream_name: "live".to_string(),
            description: "NVS Streaming server".to_string(),
            frame_rate: DEFAULT_FRAME_RATE,
            restart: RestartPolicy::default(),
            rtcp_interval: Duration::from_secs(5),
            public_host: None,
            cname: default_cname(),
        }
    }
}

impl StreamerConfig {
    pub fn auth_enabled(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Configured tracks in advertised order (video first).
    pub fn tracks(&self) -> Vec<TrackConfig> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }
}

fn default_cname() -> String {
    let host = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("streamer@{host}")
}
