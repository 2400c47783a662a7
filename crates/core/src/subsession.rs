//! Media subsessions: how one elementary stream is delivered to clients.
//!
//! The delivery mode is fixed when the subsession is created:
//!
//! - [`OnDemandSubsession`]: a framer factory. Every client that plays
//!   gets its own framer and restart controller, played through a sink
//!   taken from the subsession's [`SinkPool`].
//! - [`PassiveSubsession`]: a reference to a [`MulticastGroup`] that is
//!   already streaming. Clients only learn where to listen; they never
//!   touch the group's controller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{MulticastConfig, RestartPolicy};
use crate::controller::{ControllerHandle, RestartController, SinkBinding};
use crate::error::{Result, StreamError};
use crate::framer::FramerFactory;
use crate::media::{Codec, Packetizer};
use crate::rtcp::RtcpSettings;
use crate::session::transport::ClientTransport;
use crate::sink::{Destination, RtpChannel, RtpSink};
use crate::transport::udp::PortAllocator;

const PROBE_DEADLINE: Duration = Duration::from_secs(2);
const PROBE_MAX_UNITS: usize = 300;

type SharedPacketizer = Arc<Mutex<Box<dyn Packetizer>>>;

/// Control name of the subsession at `index` (`a=control:` value).
pub fn track_id(index: usize) -> String {
    format!("track{}", index + 1)
}

/// Idle unicast sinks of one on-demand subsession.
///
/// A released sink keeps its socket pair, SSRC, RTP numbering space and
/// RTCP reporter and is handed to the next client.
pub struct SinkPool {
    track_id: String,
    codec: Codec,
    ports: PortAllocator,
    rtcp: RtcpSettings,
    idle: Mutex<Vec<RtpSink>>,
    created: AtomicUsize,
}

impl SinkPool {
    pub fn new(track_id: &str, codec: Codec, ports: PortAllocator, rtcp: RtcpSettings) -> Self {
        Self {
            track_id: track_id.to_string(),
            codec,
            ports,
            rtcp,
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Take an idle sink, or bind a new one.
    pub async fn acquire(&self) -> Result<RtpSink> {
        if let Some(sink) = self.idle.lock().pop() {
            tracing::trace!(track = %self.track_id, "reusing pooled sink");
            return Ok(sink);
        }
        let pair = self.ports.allocate().await?;
        let channel = RtpChannel::open(self.track_id.clone(), pair, &self.rtcp);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(RtpSink::new(channel, self.codec.packetizer()))
    }

    /// Return a stopped sink to the pool.
    pub fn release(&self, sink: RtpSink) {
        sink.channel().clear_destination();
        let mut idle = self.idle.lock();
        idle.push(sink);
        tracing::debug!(track = %self.track_id, idle = idle.len(), "sink returned to pool");
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sinks bound since the pool was created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub struct OnDemandSubsession {
    track_id: String,
    factory: FramerFactory,
    policy: RestartPolicy,
    pool: SinkPool,
    /// Packetizer used to describe the track; replaced once a probe has
    /// seen the codec parameters.
    describer: Mutex<Box<dyn Packetizer>>,
}

impl OnDemandSubsession {
    pub fn new(track_id: &str, factory: FramerFactory, policy: RestartPolicy, pool: SinkPool) -> Self {
        let describer = Mutex::new(factory.codec.packetizer());
        Self {
            track_id: track_id.to_string(),
            factory,
            policy,
            pool,
            describer,
        }
    }

    pub fn pool(&self) -> &SinkPool {
        &self.pool
    }

    pub fn factory(&self) -> &FramerFactory {
        &self.factory
    }

    /// Read the endpoint until the codec parameters are known, bounded by
    /// a deadline and a unit count. The probe framer is closed afterwards.
    async fn probe(&self) -> Option<Box<dyn Packetizer>> {
        let mut framer = match self.factory.open().await {
            Ok(framer) => framer,
            Err(e) => {
                tracing::warn!(track = %self.track_id, error = %e, "SDP probe could not open endpoint");
                return None;
            }
        };
        let mut scratch = self.factory.codec.packetizer();
        let probed = tokio::time::timeout(PROBE_DEADLINE, async {
            for _ in 0..PROBE_MAX_UNITS {
                let unit = framer.next_access_unit().await?;
                scratch.packetize(&unit.data, unit.duration);
                if scratch.is_configured() {
                    return Some(());
                }
            }
            None
        })
        .await;

        match probed {
            Ok(Some(())) => {
                tracing::debug!(track = %self.track_id, units = framer.units_produced(), "SDP probe complete");
                Some(scratch)
            }
            _ => {
                tracing::debug!(track = %self.track_id, "SDP probe found no codec parameters");
                None
            }
        }
    }

    async fn sdp_attributes(&self) -> Vec<String> {
        let configured = self.describer.lock().is_configured();
        if !configured && let Some(probed) = self.probe().await {
            *self.describer.lock() = probed;
        }
        self.describer.lock().sdp_attributes()
    }
}

/// The shared feed of one passive subsession.
///
/// The channel (socket pair, destination, RTCP reporter) lives as long as
/// the group. The packetizer in use changes with every restart cycle.
pub struct MulticastGroup {
    track_id: String,
    codec: Codec,
    config: MulticastConfig,
    index: usize,
    channel: Arc<RtpChannel>,
    packetizer: Mutex<SharedPacketizer>,
}

impl MulticastGroup {
    pub async fn open(
        track_id: &str,
        index: usize,
        codec: Codec,
        config: &MulticastConfig,
        ports: &PortAllocator,
        rtcp: &RtcpSettings,
    ) -> Result<Arc<Self>> {
        let pair = ports.allocate().await?;
        pair.set_multicast_ttl(config.ttl)?;
        let channel = RtpChannel::open(track_id, pair, rtcp);
        channel.set_destination(Destination::Udp {
            rtp: SocketAddr::V4(config.rtp_destination(index)),
            rtcp: SocketAddr::V4(config.rtcp_destination(index)),
        });
        tracing::info!(
            track = %track_id,
            group = %config.group,
            port = config.rtp_destination(index).port(),
            ttl = config.ttl,
            "multicast group ready"
        );
        Ok(Arc::new(Self {
            track_id: track_id.to_string(),
            codec,
            config: config.clone(),
            index,
            channel,
            packetizer: Mutex::new(Arc::new(Mutex::new(codec.packetizer()))),
        }))
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn channel(&self) -> &Arc<RtpChannel> {
        &self.channel
    }

    /// Packetizer of the current cycle.
    pub fn packetizer(&self) -> SharedPacketizer {
        self.packetizer.lock().clone()
    }

    pub(crate) fn install_packetizer(&self, packetizer: SharedPacketizer) {
        *self.packetizer.lock() = packetizer;
    }

    /// Sink for the first cycle.
    pub fn first_sink(&self) -> RtpSink {
        RtpSink::with_shared_packetizer(self.channel.clone(), self.packetizer())
    }

    pub fn rtp_port(&self) -> u16 {
        self.config.rtp_destination(self.index).port()
    }

    pub fn transport_response(&self) -> String {
        let port = self.rtp_port();
        format!(
            "RTP/AVP;multicast;destination={};port={}-{};ttl={}",
            self.config.group,
            port,
            port.wrapping_add(1),
            self.config.ttl
        )
    }
}

pub struct PassiveSubsession {
    group: Arc<MulticastGroup>,
}

impl PassiveSubsession {
    pub fn new(group: Arc<MulticastGroup>) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &Arc<MulticastGroup> {
        &self.group
    }
}

/// One elementary stream of a media session.
#[derive(Clone)]
pub enum Subsession {
    OnDemand(Arc<OnDemandSubsession>),
    Passive(Arc<PassiveSubsession>),
}

impl Subsession {
    /// Build a passive subsession whose group is driven by a restart
    /// controller. The controller is started here; failing to open the
    /// endpoint fails the whole call.
    pub async fn start_passive(
        group: Arc<MulticastGroup>,
        factory: FramerFactory,
        policy: RestartPolicy,
    ) -> Result<(Self, ControllerHandle)> {
        let binding = SinkBinding::PerCycle {
            group: group.clone(),
            sink: group.first_sink(),
        };
        let mut controller = RestartController::new(group.track_id(), factory, binding, policy);
        controller.start().await?;
        let handle = ControllerHandle::spawn(controller);
        Ok((Self::Passive(Arc::new(PassiveSubsession::new(group))), handle))
    }

    pub fn track_id(&self) -> &str {
        match self {
            Self::OnDemand(s) => &s.track_id,
            Self::Passive(s) => &s.group.track_id,
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            Self::OnDemand(s) => s.factory.codec,
            Self::Passive(s) => s.group.codec,
        }
    }

    /// Whether every client shares one server-side stream.
    pub fn is_shared_across_clients(&self) -> bool {
        matches!(self, Self::Passive(_))
    }

    /// SDP media section: `m=`, `c=`, codec attributes and `a=control`.
    pub async fn sdp_lines(&self) -> Vec<String> {
        let codec = self.codec();
        let mut lines = match self {
            Self::OnDemand(s) => {
                let mut lines = vec![
                    format!("m={} 0 RTP/AVP {}", codec.media_kind(), codec.payload_type()),
                    "c=IN IP4 0.0.0.0".to_string(),
                ];
                lines.extend(s.sdp_attributes().await);
                lines
            }
            Self::Passive(s) => {
                let group = &s.group;
                let mut lines = vec![
                    format!(
                        "m={} {} RTP/AVP {}",
                        codec.media_kind(),
                        group.rtp_port(),
                        codec.payload_type()
                    ),
                    format!("c=IN IP4 {}/{}", group.config.group, group.config.ttl),
                ];
                lines.extend(group.packetizer().lock().sdp_attributes());
                lines
            }
        };
        lines.push(format!("a=control:{}", self.track_id()));
        lines
    }

    /// Bind a client to this subsession.
    ///
    /// On-demand subsessions take a sink from the pool and point it at the
    /// client. Passive subsessions hand out the group regardless of what
    /// the client asked for.
    pub async fn bind_client(&self, transport: ClientTransport) -> Result<ClientBinding> {
        match self {
            Self::OnDemand(s) => {
                let destination = match transport {
                    ClientTransport::Udp {
                        client,
                        rtp_port,
                        rtcp_port,
                    } => Destination::Udp {
                        rtp: SocketAddr::new(client, rtp_port),
                        rtcp: SocketAddr::new(client, rtcp_port),
                    },
                    ClientTransport::Interleaved {
                        tx,
                        rtp_channel,
                        rtcp_channel,
                    } => Destination::Interleaved {
                        tx,
                        rtp_channel,
                        rtcp_channel,
                    },
                    ClientTransport::Multicast => {
                        return Err(StreamError::UnsupportedTransport(
                            "multicast requested from an on-demand stream".to_string(),
                        ));
                    }
                };
                let sink = s.pool.acquire().await?;
                sink.channel().set_destination(destination.clone());
                Ok(ClientBinding::OnDemand(OnDemandBinding {
                    subsession: s.clone(),
                    packetizer: sink.packetizer(),
                    server_ports: sink.channel().server_ports(),
                    destination,
                    sink: Some(sink),
                    controller: None,
                }))
            }
            Self::Passive(s) => Ok(ClientBinding::Passive(PassiveBinding {
                group: s.group.clone(),
            })),
        }
    }
}

pub struct OnDemandBinding {
    subsession: Arc<OnDemandSubsession>,
    packetizer: SharedPacketizer,
    server_ports: (u16, u16),
    destination: Destination,
    /// Present while stopped; moved into the controller while playing.
    sink: Option<RtpSink>,
    controller: Option<ControllerHandle>,
}

pub struct PassiveBinding {
    group: Arc<MulticastGroup>,
}

/// A client's hold on one subsession.
pub enum ClientBinding {
    OnDemand(OnDemandBinding),
    Passive(PassiveBinding),
}

impl ClientBinding {
    pub fn track_id(&self) -> &str {
        match self {
            Self::OnDemand(b) => &b.subsession.track_id,
            Self::Passive(b) => &b.group.track_id,
        }
    }

    pub fn is_playing(&self) -> bool {
        match self {
            Self::OnDemand(b) => b.controller.is_some(),
            Self::Passive(_) => true,
        }
    }

    /// Start delivery. On-demand bindings open their own framer here and
    /// fail with the open error if the endpoint is unavailable.
    pub async fn play(&mut self) -> Result<()> {
        let Self::OnDemand(b) = self else {
            return Ok(());
        };
        if b.controller.is_some() {
            return Ok(());
        }
        let sink = b.sink.take().ok_or(StreamError::ControllerStopped)?;
        let mut controller = RestartController::new(
            b.subsession.track_id.clone(),
            b.subsession.factory.clone(),
            SinkBinding::Persistent(sink),
            b.subsession.policy.clone(),
        );
        match controller.start().await {
            Ok(()) => {
                b.controller = Some(ControllerHandle::spawn(controller));
                Ok(())
            }
            Err(e) => {
                b.sink = controller.into_binding().into_persistent();
                Err(e)
            }
        }
    }

    /// Stop delivery and keep the sink for a later play.
    pub async fn pause(&mut self) {
        if let Self::OnDemand(b) = self
            && let Some(controller) = b.controller.take()
        {
            b.sink = controller.stop().await;
        }
    }

    /// Release the binding. An on-demand sink goes back to the pool; its
    /// framer and source are closed.
    pub async fn release(mut self) {
        self.pause().await;
        if let Self::OnDemand(b) = self
            && let Some(sink) = b.sink
        {
            b.subsession.pool.release(sink);
        }
    }

    /// `Transport` response header value.
    pub fn transport_response(&self) -> String {
        match self {
            Self::OnDemand(b) => {
                let ssrc = b.packetizer.lock().ssrc();
                match &b.destination {
                    Destination::Udp { rtp, rtcp } => format!(
                        "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
                        rtp.port(),
                        rtcp.port(),
                        b.server_ports.0,
                        b.server_ports.1,
                        ssrc
                    ),
                    Destination::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                        ..
                    } => format!(
                        "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08X}",
                        rtp_channel, rtcp_channel, ssrc
                    ),
                }
            }
            Self::Passive(b) => b.group.transport_response(),
        }
    }

    /// `RTP-Info` entry for this track.
    pub fn rtp_info(&self, base_url: &str) -> String {
        let packetizer = match self {
            Self::OnDemand(b) => b.packetizer.clone(),
            Self::Passive(b) => b.group.packetizer(),
        };
        let p = packetizer.lock();
        format!(
            "url={}/{};seq={};rtptime={}",
            base_url.trim_end_matches('/'),
            self.track_id(),
            p.next_sequence(),
            p.next_rtp_timestamp()
        )
    }
}
