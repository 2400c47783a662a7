//! RTP/RTCP sink pair.
//!
//! An [`RtpChannel`] is the long-lived half: the bound server socket pair,
//! the current client destination, sender statistics and the RTCP
//! reporter. An [`RtpSink`] plays at most one [`Framer`] at a time into a
//! channel through a codec [`Packetizer`].
//!
//! ## Play lifecycle
//!
//! ```text
//! start_playing(framer) -> PlayHandle { framer id, completion receiver }
//!     framer reaches end of stream -> Completion sent once, task ends
//! stop_playing()       -> framer handed back, no Completion is ever sent
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, StreamError};
use crate::framer::{Framer, FramerId};
use crate::media::Packetizer;
use crate::rtcp::{self, RtcpReporter, RtcpSettings, SenderInfo};
use crate::transport::tcp::interleaved_frame;
use crate::transport::udp::UdpPair;

/// Where a channel's packets go.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Unicast or multicast UDP, sent from the channel's bound socket pair.
    Udp { rtp: SocketAddr, rtcp: SocketAddr },
    /// `$`-framed on an RTSP connection (RFC 2326 §10.12).
    Interleaved {
        tx: mpsc::Sender<Bytes>,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

#[derive(Debug, Default)]
struct SenderStats {
    ssrc: u32,
    clock_rate: u32,
    packets: u32,
    octets: u32,
    /// Monotonic and wall-clock time of the last packet, with its RTP timestamp.
    last: Option<(Instant, SystemTime, u32)>,
}

/// The long-lived transport half of a sink.
pub struct RtpChannel {
    label: String,
    sockets: UdpPair,
    destination: Mutex<Option<Destination>>,
    stats: Mutex<SenderStats>,
    _reporter: RtcpReporter,
}

impl RtpChannel {
    /// Wrap a bound socket pair and start its RTCP reporter.
    pub fn open(label: impl Into<String>, sockets: UdpPair, rtcp: &RtcpSettings) -> Arc<Self> {
        let label = label.into();
        tracing::debug!(
            track = %label,
            rtp_port = sockets.rtp_port(),
            rtcp_port = sockets.rtcp_port(),
            "RTP channel opened"
        );
        Arc::new_cyclic(|weak| Self {
            label,
            sockets,
            destination: Mutex::new(None),
            stats: Mutex::new(SenderStats::default()),
            _reporter: RtcpReporter::spawn(weak.clone(), rtcp),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Server (RTP, RTCP) ports.
    pub fn server_ports(&self) -> (u16, u16) {
        (self.sockets.rtp_port(), self.sockets.rtcp_port())
    }

    pub fn sockets(&self) -> &UdpPair {
        &self.sockets
    }

    pub fn set_destination(&self, destination: Destination) {
        tracing::debug!(track = %self.label, ?destination, "destination set");
        *self.destination.lock() = Some(destination);
    }

    pub fn clear_destination(&self) {
        *self.destination.lock() = None;
    }

    pub fn destination(&self) -> Option<Destination> {
        self.destination.lock().clone()
    }

    /// Send one RTP packet. Without a destination the packet is dropped.
    pub async fn send_rtp(&self, packet: &[u8], clock_rate: u32) -> io::Result<()> {
        let Some(destination) = self.destination() else {
            return Ok(());
        };
        match destination {
            Destination::Udp { rtp, .. } => {
                self.sockets.rtp.send_to(packet, rtp).await?;
            }
            Destination::Interleaved {
                tx, rtp_channel, ..
            } => {
                if !self.queue_interleaved(&tx, interleaved_frame(rtp_channel, packet))? {
                    return Ok(());
                }
            }
        }
        self.record(packet, clock_rate);
        Ok(())
    }

    pub async fn send_rtcp(&self, packet: &[u8]) -> io::Result<()> {
        let Some(destination) = self.destination() else {
            return Ok(());
        };
        match destination {
            Destination::Udp { rtcp, .. } => {
                self.sockets.rtcp.send_to(packet, rtcp).await?;
            }
            Destination::Interleaved {
                tx, rtcp_channel, ..
            } => {
                self.queue_interleaved(&tx, interleaved_frame(rtcp_channel, packet))?;
            }
        }
        Ok(())
    }

    /// Queue a frame on the connection writer without waiting. A full queue
    /// means the client is not reading; the frame is dropped and `false`
    /// returned.
    fn queue_interleaved(&self, tx: &mpsc::Sender<Bytes>, frame: Bytes) -> io::Result<bool> {
        match tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                tracing::trace!(track = %self.label, "connection queue full, frame dropped");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn record(&self, packet: &[u8], clock_rate: u32) {
        if packet.len() < 12 {
            return;
        }
        let timestamp = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let mut stats = self.stats.lock();
        stats.ssrc = ssrc;
        stats.clock_rate = clock_rate;
        stats.packets = stats.packets.wrapping_add(1);
        stats.octets = stats.octets.wrapping_add((packet.len() - 12) as u32);
        stats.last = Some((Instant::now(), SystemTime::now(), timestamp));
    }

    /// RTP packets sent since the channel was opened.
    pub fn packets_sent(&self) -> u32 {
        self.stats.lock().packets
    }

    /// Sender info for an RTCP report, `None` before the first packet.
    pub fn sender_info(&self) -> Option<SenderInfo> {
        let stats = self.stats.lock();
        let (at, wall, timestamp) = stats.last?;
        let elapsed = at.elapsed();
        let ticks = (elapsed.as_secs_f64() * stats.clock_rate as f64) as u32;
        Some(SenderInfo {
            ssrc: stats.ssrc,
            ntp: rtcp::ntp_timestamp(wall + elapsed),
            rtp_timestamp: timestamp.wrapping_add(ticks),
            packet_count: stats.packets,
            octet_count: stats.octets,
        })
    }
}

impl Drop for RtpChannel {
    fn drop(&mut self) {
        tracing::debug!(track = %self.label, "RTP channel closed");
    }
}

/// Signal sent when a bound framer reaches end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub framer: FramerId,
    /// Access units delivered during the play.
    pub units: u64,
}

/// Returned by [`RtpSink::start_playing`].
#[derive(Debug)]
pub struct PlayHandle {
    pub framer: FramerId,
    /// Resolves once with the [`Completion`]. Closed without a value when
    /// the play is stopped instead.
    pub completion: oneshot::Receiver<Completion>,
}

struct ActivePlay {
    framer: FramerId,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Framer>,
}

pub struct RtpSink {
    channel: Arc<RtpChannel>,
    packetizer: Arc<Mutex<Box<dyn Packetizer>>>,
    play: Option<ActivePlay>,
}

impl RtpSink {
    pub fn new(channel: Arc<RtpChannel>, packetizer: Box<dyn Packetizer>) -> Self {
        Self::with_shared_packetizer(channel, Arc::new(Mutex::new(packetizer)))
    }

    pub fn with_shared_packetizer(
        channel: Arc<RtpChannel>,
        packetizer: Arc<Mutex<Box<dyn Packetizer>>>,
    ) -> Self {
        Self {
            channel,
            packetizer,
            play: None,
        }
    }

    /// A new sink on the same channel whose packetizer continues this one's
    /// RTP numbering space.
    pub fn renewed(&self) -> Self {
        let packetizer = self.packetizer.lock().renew();
        Self::new(self.channel.clone(), packetizer)
    }

    pub fn channel(&self) -> &Arc<RtpChannel> {
        &self.channel
    }

    pub fn packetizer(&self) -> Arc<Mutex<Box<dyn Packetizer>>> {
        self.packetizer.clone()
    }

    /// Whether a framer is bound and still being played.
    pub fn is_playing(&self) -> bool {
        self.play.as_ref().is_some_and(|p| !p.task.is_finished())
    }

    /// Identity of the framer bound by the last `start_playing`, until
    /// `stop_playing`.
    pub fn bound_framer(&self) -> Option<FramerId> {
        self.play.as_ref().map(|p| p.framer)
    }

    /// Bind `framer` and start delivering its access units.
    ///
    /// Fails with [`StreamError::AlreadyPlaying`] while another framer is
    /// still being played. A play that already reached end of stream is
    /// reaped first, destroying its framer.
    pub fn start_playing(&mut self, framer: Framer) -> Result<PlayHandle> {
        if self.is_playing() {
            return Err(StreamError::AlreadyPlaying);
        }
        if let Some(done) = self.play.take() {
            tracing::trace!(track = %self.channel.label(), framer = %done.framer, "reaping finished play");
        }

        let id = framer.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(play_loop(
            framer,
            self.channel.clone(),
            self.packetizer.clone(),
            stop_rx,
            done_tx,
        ));

        tracing::debug!(track = %self.channel.label(), framer = %id, "sink started playing");
        self.play = Some(ActivePlay {
            framer: id,
            stop_tx,
            task,
        });
        Ok(PlayHandle {
            framer: id,
            completion: done_rx,
        })
    }

    /// Unbind the current framer and hand it back.
    ///
    /// Once this returns, the play task has ended and no completion for it
    /// can be sent any more. Returns `None` when nothing was bound.
    pub async fn stop_playing(&mut self) -> Option<Framer> {
        let play = self.play.take()?;
        let _ = play.stop_tx.send(());
        match play.task.await {
            Ok(framer) => {
                tracing::debug!(track = %self.channel.label(), framer = %play.framer, "sink stopped");
                Some(framer)
            }
            Err(e) => {
                tracing::warn!(track = %self.channel.label(), error = %e, "play task did not finish cleanly");
                None
            }
        }
    }
}

async fn play_loop(
    mut framer: Framer,
    channel: Arc<RtpChannel>,
    packetizer: Arc<Mutex<Box<dyn Packetizer>>>,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Completion>,
) -> Framer {
    let start = tokio::time::Instant::now();
    let mut elapsed = Duration::ZERO;
    let mut units = 0u64;

    loop {
        let unit = tokio::select! {
            biased;
            _ = &mut stop_rx => return framer,
            unit = framer.next_access_unit() => unit,
        };
        let Some(unit) = unit else {
            tracing::debug!(track = %channel.label(), framer = %framer.id(), units, "framer reached end of stream");
            let _ = done_tx.send(Completion {
                framer: framer.id(),
                units,
            });
            return framer;
        };

        tokio::select! {
            biased;
            _ = &mut stop_rx => return framer,
            _ = tokio::time::sleep_until(start + elapsed) => {}
        }

        let (packets, clock_rate) = {
            let mut p = packetizer.lock();
            let packets = p.packetize(&unit.data, unit.duration);
            (packets, p.clock_rate())
        };
        let send_all = async {
            for packet in &packets {
                if let Err(e) = channel.send_rtp(packet, clock_rate).await {
                    tracing::trace!(track = %channel.label(), error = %e, "RTP send failed");
                }
            }
        };
        tokio::select! {
            biased;
            _ = &mut stop_rx => return framer,
            _ = send_all => {}
        }

        units += 1;
        elapsed += Duration::from_secs_f64(unit.duration as f64 / clock_rate.max(1) as f64);
    }
}
