//! RTCP sender reports (RFC 3550 §6.4.1) and source description (§6.5).
//!
//! Every report is a compound packet: one SR followed by an SDES chunk
//! carrying the CNAME.
//!
//! ```text
//! SR:   [V=2|P|RC=0|PT=200|length] [SSRC]
//!       [NTP sec] [NTP frac] [RTP timestamp] [packet count] [octet count]
//! SDES: [V=2|P|SC=1|PT=202|length] [SSRC] [CNAME=1|len|text...|0|pad]
//! ```

use std::sync::Weak;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::sink::RtpChannel;

const PT_SR: u8 = 200;
const PT_SDES: u8 = 202;
const SDES_CNAME: u8 = 1;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Sender-side counters at the moment a report is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    pub ssrc: u32,
    /// 64-bit NTP timestamp (seconds << 32 | fraction).
    pub ntp: u64,
    /// RTP timestamp corresponding to the same instant as `ntp`.
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// Convert wall-clock time to a 64-bit NTP timestamp.
pub fn ntp_timestamp(time: SystemTime) -> u64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Build the SR + SDES compound packet.
pub fn build_sender_report(info: &SenderInfo, cname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(28 + 12 + cname.len());

    packet.push(0x80);
    packet.push(PT_SR);
    packet.extend_from_slice(&6u16.to_be_bytes());
    packet.extend_from_slice(&info.ssrc.to_be_bytes());
    packet.extend_from_slice(&info.ntp.to_be_bytes());
    packet.extend_from_slice(&info.rtp_timestamp.to_be_bytes());
    packet.extend_from_slice(&info.packet_count.to_be_bytes());
    packet.extend_from_slice(&info.octet_count.to_be_bytes());

    let cname = &cname.as_bytes()[..cname.len().min(255)];
    // SSRC + type + len + text + at least one terminating null, padded to 32 bits
    let chunk_len = 4 + 2 + cname.len() + 1;
    let padded = chunk_len.div_ceil(4) * 4;

    packet.push(0x81);
    packet.push(PT_SDES);
    packet.extend_from_slice(&((padded / 4) as u16).to_be_bytes());
    packet.extend_from_slice(&info.ssrc.to_be_bytes());
    packet.push(SDES_CNAME);
    packet.push(cname.len() as u8);
    packet.extend_from_slice(cname);
    packet.resize(packet.len() + (padded - chunk_len) + 1, 0);

    packet
}

/// Reporting parameters shared by every RTP channel of the process.
#[derive(Debug, Clone)]
pub struct RtcpSettings {
    pub interval: Duration,
    pub cname: String,
}

/// Periodic RTCP task paired with one [`RtpChannel`].
///
/// The task holds only a weak reference and ends on its own once the
/// channel is gone. Dropping the reporter aborts it.
pub struct RtcpReporter {
    task: JoinHandle<()>,
}

impl RtcpReporter {
    pub fn spawn(channel: Weak<RtpChannel>, settings: &RtcpSettings) -> Self {
        let interval = settings.interval;
        let cname = settings.cname.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                // Nothing to report before the first RTP packet.
                let Some(info) = channel.sender_info() else {
                    continue;
                };
                let report = build_sender_report(&info, &cname);
                if let Err(e) = channel.send_rtcp(&report).await {
                    tracing::debug!(track = %channel.label(), error = %e, "RTCP send failed");
                } else {
                    tracing::trace!(
                        track = %channel.label(),
                        packets = info.packet_count,
                        octets = info.octet_count,
                        "RTCP sender report"
                    );
                }
            }
            tracing::trace!("RTCP reporter finished");
        });
        Self { task }
    }
}

impl Drop for RtcpReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
