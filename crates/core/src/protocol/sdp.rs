//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> 1 IN IP4 <addr>                ← origin
//! s=<description>                              ← session name
//! i=<name>                                     ← session information
//! t=0 0                                        ← timing (live stream)
//! a=tool:rtsp-streamer                         ← server software (§6)
//! a=type:broadcast
//! a=control:*                                  ← aggregate control
//! a=range:npt=0-                               ← open-ended live range
//! m=video 0 RTP/AVP 96                         ← one block per subsession
//! c=IN IP4 0.0.0.0
//! a=rtpmap:96 H265/90000
//! a=fmtp:96 sprop-vps=..;sprop-sps=..;sprop-pps=..
//! a=control:track1
//! ```
//!
//! Multicast subsessions carry their group port in `m=` and
//! `c=IN IP4 <group>/<ttl>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::media_session::MediaSession;

pub const SDP_TOOL: &str = "rtsp-streamer";

static SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Origin session id: wall-clock microseconds at first use, stable afterwards.
fn origin_session_id() -> u64 {
    let id = SESSION_ID.load(Ordering::Relaxed);
    if id != 0 {
        return id;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
        .max(1);
    match SESSION_ID.compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => now,
        Err(existing) => existing,
    }
}

/// Generate the SDP for `session` from its per-subsession media blocks.
pub fn generate_sdp(session: &MediaSession, host: &str, media: &[Vec<String>]) -> String {
    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!("o=- {} 1 IN IP4 {}", origin_session_id(), host),
        format!("s={}", session.description()),
        format!("i={}", session.name()),
        "t=0 0".to_string(),
        format!("a=tool:{SDP_TOOL}"),
        "a=type:broadcast".to_string(),
        "a=control:*".to_string(),
    ];
    if session.is_multicast() {
        sdp.push(format!("a=source-filter: incl IN IP4 * {host}"));
        sdp.push("a=rtcp-unicast: reflection".to_string());
    }
    sdp.push("a=range:npt=0-".to_string());
    for block in media {
        sdp.extend_from_slice(block);
    }

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}
