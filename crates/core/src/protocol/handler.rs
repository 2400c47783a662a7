use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::media_session::{MediaSessionRegistry, extract_track_id};
use crate::protocol::auth::Authenticator;
use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::server::ServerConfig;
use crate::session::SessionManager;
use crate::session::transport::{ClientTransport, LowerTransport, TransportHeader};

/// Handles RTSP method requests for a single control connection.
///
/// Tracks which sessions were created on this connection so they can be
/// released when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    media: MediaSessionRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    /// Writer of the connection that receives responses and interleaved data.
    tx: mpsc::Sender<Bytes>,
    nonce: String,
    next_channel: u8,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        media: MediaSessionRegistry,
        client_addr: SocketAddr,
        config: Arc<ServerConfig>,
        tx: mpsc::Sender<Bytes>,
    ) -> Self {
        MethodHandler {
            session_manager,
            media,
            client_addr,
            config,
            tx,
            nonce: Authenticator::new_nonce(),
            next_channel: 0,
            session_ids: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub async fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();
        let cseq = cseq.as_str();

        if let Some(auth) = &self.config.auth
            && !auth.authorize(request, &self.nonce)
        {
            tracing::warn!(peer = %self.client_addr, method = %request.method, "unauthorized request");
            let [digest, basic] = auth.challenges(&self.nonce);
            return RtspResponse::unauthorized()
                .add_header("CSeq", cseq)
                .add_header("WWW-Authenticate", &digest)
                .add_header("WWW-Authenticate", &basic);
        }

        match &request.method {
            Method::Options => self.handle_options(cseq),
            Method::Describe => self.handle_describe(cseq, &request.uri).await,
            Method::Setup => self.handle_setup(cseq, request).await,
            Method::Play => self.handle_play(cseq, request).await,
            Method::Pause => self.handle_pause(cseq, request).await,
            Method::Teardown => self.handle_teardown(cseq, request).await,
            Method::GetParameter | Method::SetParameter => self.handle_parameter(cseq, request),
            Method::Other(method) => {
                tracing::warn!(%method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", &Method::public_list())
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:5554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    async fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let Some(media) = self.media.resolve_from_uri(uri) else {
            tracing::warn!(uri, "DESCRIBE for unknown media session");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let host = self.host_from_uri_or_client(uri);
        let sdp = media.sdp(&host).await;
        let content_base = format!("{}/", uri.trim_end_matches('/'));

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &content_base)
            .with_body(sdp)
    }

    fn client_transport(&mut self, th: &TransportHeader, shared: bool) -> Option<ClientTransport> {
        if th.multicast {
            return Some(ClientTransport::Multicast);
        }
        match th.lower {
            LowerTransport::Tcp => {
                let (rtp_channel, rtcp_channel) = match th.interleaved {
                    Some(channels) => channels,
                    None => {
                        let rtp = self.next_channel;
                        (rtp, rtp.wrapping_add(1))
                    }
                };
                self.next_channel = self.next_channel.max(rtcp_channel.wrapping_add(1));
                Some(ClientTransport::Interleaved {
                    tx: self.tx.clone(),
                    rtp_channel,
                    rtcp_channel,
                })
            }
            LowerTransport::Udp => match th.client_port {
                Some((rtp_port, rtcp_port)) => Some(ClientTransport::Udp {
                    client: self.client_addr.ip(),
                    rtp_port,
                    rtcp_port,
                }),
                None if shared => Some(ClientTransport::Multicast),
                None => None,
            },
        }
    }

    async fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(media) = self.media.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown media session");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let subsession = match extract_track_id(&request.uri) {
            Some(track) => media.subsession(track),
            None if media.subsessions().len() == 1 => media.subsessions().first(),
            None => {
                tracing::warn!(uri = %request.uri, "aggregate SETUP on a multi-track session");
                return RtspResponse::aggregate_not_allowed().add_header("CSeq", cseq);
            }
        };
        let Some(subsession) = subsession else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown track");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Some(th) = TransportHeader::parse(transport_header) else {
            tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Some(client_transport) = self.client_transport(&th, subsession.is_shared_across_clients())
        else {
            tracing::warn!(%cseq, transport_header, "SETUP without client ports");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let existing = match request.session_id() {
            Some(id) => match self.session_manager.get_session(id) {
                Some(session) => Some(session),
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found().add_header("CSeq", cseq);
                }
            },
            None => None,
        };

        let binding = match subsession.bind_client(client_transport).await {
            Ok(binding) => binding,
            Err(e @ StreamError::UnsupportedTransport(_)) => {
                tracing::warn!(%cseq, track = %subsession.track_id(), error = %e, "transport rejected");
                return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
            }
            Err(e) => {
                tracing::error!(track = %subsession.track_id(), error = %e, "failed to bind client");
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        };
        let transport_response = binding.transport_response();

        let session = match existing {
            Some(session) => session,
            None => {
                let session = self
                    .session_manager
                    .create_session(&aggregate_url(&request.uri), media.clone());
                self.session_ids.push(session.id.clone());
                session
            }
        };
        session.add_binding(binding).await;

        tracing::info!(
            session_id = %session.id,
            peer = %self.client_addr,
            media = %media.path(),
            track = %subsession.track_id(),
            transport = %transport_response,
            "track set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    async fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = request.session_id().and_then(|id| self.session_manager.get_session(id))
        else {
            tracing::warn!(%cseq, "PLAY for missing or unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        // Numbering the client should expect, taken before delivery resumes.
        let rtp_info = session.rtp_info().await;
        if let Err(e) = session.play().await {
            return match e {
                StreamError::EndpointUnavailable { .. } => {
                    tracing::warn!(session_id = %session.id, error = %e, "stream endpoint unavailable");
                    RtspResponse::service_unavailable().add_header("CSeq", cseq)
                }
                e => {
                    tracing::error!(session_id = %session.id, error = %e, "PLAY failed");
                    RtspResponse::internal_error().add_header("CSeq", cseq)
                }
            };
        }
        tracing::info!(session_id = %session.id, "session started playing");

        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-");
        if !rtp_info.is_empty() {
            resp = resp.add_header("RTP-Info", &rtp_info);
        }
        resp
    }

    async fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = request.session_id().and_then(|id| self.session_manager.get_session(id))
        else {
            tracing::warn!(%cseq, "PAUSE for missing or unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        session.pause().await;
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    async fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.session_manager.remove_session(session_id) {
            Some(session) => {
                session.release().await;
                self.session_ids.retain(|id| id != session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER / SET_PARAMETER are used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, method = %request.method, bytes = request.body.len(), "parameter keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(session) = request.session_id().and_then(|id| self.session_manager.get_session(id)) {
            resp = resp.add_header("Session", &session.session_header_value());
        }
        resp
    }

    /// Release every session this connection created.
    pub async fn cleanup(&mut self) {
        let ids = std::mem::take(&mut self.session_ids);
        for session in self.session_manager.remove_sessions(&ids) {
            session.release().await;
        }
        if !ids.is_empty() {
            tracing::debug!(peer = %self.client_addr, sessions = ids.len(), "connection sessions released");
        }
    }
}

/// Aggregate URL of a request URI: the URI without its track suffix.
fn aggregate_url(uri: &str) -> String {
    let trimmed = uri.trim_end_matches('/');
    match extract_track_id(uri).and_then(|track| trimmed.strip_suffix(track)) {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => trimmed.to_string(),
    }
}
