//! Startup: translate a [`StreamerConfig`] into a running topology.
//!
//! ```text
//! on-demand: MediaSession[ OnDemand(track1), OnDemand(track2) ]
//!            framers are opened per client on PLAY
//! multicast: MediaSession[ Passive(track1), Passive(track2) ]
//!            one controller per track, started here; a failed first
//!            open aborts startup
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{MulticastConfig, StreamerConfig, TrackConfig};
use crate::context::AppContext;
use crate::controller::{ControllerHandle, ControllerState};
use crate::error::{Result, StreamError};
use crate::framer::FramerFactory;
use crate::media_session::MediaSession;
use crate::protocol::auth::Authenticator;
use crate::server::{ServerConfig, StreamingServer};
use crate::source::StreamEndpoint;
use crate::subsession::{self, MulticastGroup, OnDemandSubsession, SinkPool, Subsession};

pub struct Streamer {
    server: StreamingServer,
    media: Arc<MediaSession>,
    url: String,
    tunnel_port: Option<u16>,
    controllers: Vec<ControllerHandle>,
}

impl Streamer {
    pub async fn bootstrap(config: StreamerConfig) -> Result<Self> {
        Self::bootstrap_with(AppContext::new(config)).await
    }

    pub async fn bootstrap_with(ctx: AppContext) -> Result<Self> {
        let config = &ctx.config;

        let auth = config.auth_enabled().then(|| {
            let mut auth = Authenticator::new(&config.auth_realm);
            for credential in &config.credentials {
                auth.add_credential(&credential.username, &credential.password);
            }
            auth
        });
        let mut server = StreamingServer::create(
            config.rtsp_port,
            ServerConfig {
                public_host: config.public_host.clone(),
                auth,
            },
        )
        .await?;

        let mut media = MediaSession::new(&config.stream_name, &config.description);
        let mut controllers = Vec::new();
        for (index, track) in config.tracks().into_iter().enumerate() {
            let subsession = match &config.multicast {
                Some(multicast) => {
                    let (subsession, handle) = passive_subsession(&ctx, index, &track, multicast).await?;
                    controllers.push(handle);
                    subsession
                }
                None => on_demand_subsession(&ctx, index, &track),
            };
            media.add_subsession(subsession);
        }

        let media = server.add_session(media);
        let url = server.rtsp_url(&media);

        let mut tunnel_port = None;
        if let Some(port) = config.http_tunnel_port {
            if server.enable_http_tunnel(port).await {
                tunnel_port = server.http_tunnel_port();
            } else {
                tracing::warn!(port, "continuing without RTSP-over-HTTP tunneling");
            }
        }

        tracing::info!(
            %url,
            multicast = config.multicast.is_some(),
            tracks = media.subsessions().len(),
            "play this stream using the URL"
        );
        if let Some(port) = tunnel_port {
            tracing::info!(port, "RTSP-over-HTTP tunneling available");
        }

        Ok(Self {
            server,
            media,
            url,
            tunnel_port,
            controllers,
        })
    }

    /// Advertised stream URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Port of the HTTP tunnel, when tunneling is enabled.
    pub fn tunnel_port(&self) -> Option<u16> {
        self.tunnel_port
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn media_session(&self) -> &Arc<MediaSession> {
        &self.media
    }

    /// State watch of every multicast restart controller, by track.
    pub fn controller_watches(&self) -> Vec<(String, watch::Receiver<ControllerState>)> {
        self.controllers
            .iter()
            .map(|c| (c.label().to_string(), c.state_watch()))
            .collect()
    }

    /// Total controller transitions so far, by track.
    pub fn controller_transitions(&self) -> Vec<(String, u64)> {
        self.controllers
            .iter()
            .map(|c| (c.label().to_string(), c.transitions()))
            .collect()
    }

    /// Serve until the listener fails or a multicast stream cannot be
    /// reopened.
    pub async fn run(self) -> Result<()> {
        let Self {
            server,
            controllers,
            ..
        } = self;

        let mut joins = JoinSet::new();
        for handle in controllers {
            joins.spawn(async move {
                let label = handle.label().to_string();
                (label, handle.join().await)
            });
        }
        let controllers = async move {
            while let Some(done) = joins.join_next().await {
                match done {
                    Ok((label, Err(e))) => {
                        tracing::error!(track = %label, error = %e, "multicast stream stopped");
                        return Err(e);
                    }
                    Ok((label, Ok(()))) => {
                        tracing::debug!(track = %label, "controller finished");
                    }
                    Err(_) => return Err(StreamError::ControllerStopped),
                }
            }
            std::future::pending::<Result<()>>().await
        };

        tokio::select! {
            result = server.run() => result,
            result = controllers => result,
        }
    }
}

fn framer_factory(ctx: &AppContext, track: &TrackConfig) -> FramerFactory {
    FramerFactory::new(
        StreamEndpoint::new(&track.endpoint),
        track.codec,
        ctx.config.frame_rate,
    )
}

fn on_demand_subsession(ctx: &AppContext, index: usize, track: &TrackConfig) -> Subsession {
    let track_id = subsession::track_id(index);
    let pool = SinkPool::new(&track_id, track.codec, ctx.ports.clone(), ctx.rtcp.clone());
    tracing::debug!(track = %track_id, endpoint = %track.endpoint.display(), codec = ?track.codec, "on-demand subsession");
    Subsession::OnDemand(Arc::new(OnDemandSubsession::new(
        &track_id,
        framer_factory(ctx, track),
        ctx.config.restart.clone(),
        pool,
    )))
}

async fn passive_subsession(
    ctx: &AppContext,
    index: usize,
    track: &TrackConfig,
    multicast: &MulticastConfig,
) -> Result<(Subsession, ControllerHandle)> {
    let track_id = subsession::track_id(index);
    let group = MulticastGroup::open(&track_id, index, track.codec, multicast, &ctx.ports, &ctx.rtcp).await?;
    match Subsession::start_passive(group, framer_factory(ctx, track), ctx.config.restart.clone()).await {
        Ok(started) => Ok(started),
        Err(e) => {
            tracing::error!(track = %track_id, endpoint = %track.endpoint.display(), error = %e, "cannot start multicast stream");
            Err(e)
        }
    }
}
