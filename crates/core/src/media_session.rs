use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::sdp;
use crate::subsession::Subsession;

/// A named stream offered to clients (e.g. `/live` with video + audio).
///
/// Subsessions are kept in advertised order. A media session is composed
/// once at startup and only read afterwards.
pub struct MediaSession {
    name: String,
    description: String,
    subsessions: Vec<Subsession>,
}

impl MediaSession {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.trim_matches('/').to_string(),
            description: description.to_string(),
            subsessions: Vec::new(),
        }
    }

    pub fn add_subsession(&mut self, subsession: Subsession) {
        tracing::debug!(
            session = %self.name,
            track = %subsession.track_id(),
            shared = subsession.is_shared_across_clients(),
            "subsession added"
        );
        self.subsessions.push(subsession);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// URI path the session is served at: `/<name>`.
    pub fn path(&self) -> String {
        format!("/{}", self.name)
    }

    pub fn subsessions(&self) -> &[Subsession] {
        &self.subsessions
    }

    pub fn subsession(&self, track_id: &str) -> Option<&Subsession> {
        self.subsessions.iter().find(|s| s.track_id() == track_id)
    }

    /// Whether all subsessions are served from shared multicast feeds.
    pub fn is_multicast(&self) -> bool {
        !self.subsessions.is_empty() && self.subsessions.iter().all(Subsession::is_shared_across_clients)
    }

    /// Session description for DESCRIBE.
    pub async fn sdp(&self, host: &str) -> String {
        let mut media = Vec::with_capacity(self.subsessions.len());
        for subsession in &self.subsessions {
            media.push(subsession.sdp_lines().await);
        }
        sdp::generate_sdp(self, host, &media)
    }
}

/// Media sessions keyed by path.
///
/// The first session registered becomes the default: a URI whose path
/// matches nothing falls back to it.
#[derive(Clone, Default)]
pub struct MediaSessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<MediaSession>>>>,
    default_path: Arc<RwLock<Option<String>>>,
}

impl MediaSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: MediaSession) -> Arc<MediaSession> {
        let path = session.path();
        let session = Arc::new(session);
        self.sessions.write().insert(path.clone(), session.clone());
        let mut default = self.default_path.write();
        if default.is_none() {
            *default = Some(path.clone());
        }
        tracing::info!(path, tracks = session.subsessions().len(), "media session registered");
        session
    }

    pub fn get(&self, path: &str) -> Option<Arc<MediaSession>> {
        self.sessions.read().get(path).cloned()
    }

    /// Resolve the media session an RTSP URI refers to.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<MediaSession>> {
        self.get(extract_session_path(uri)).or_else(|| {
            let default = self.default_path.read();
            default.as_ref().and_then(|p| self.get(p))
        })
    }
}

fn uri_path(uri: &str) -> &str {
    let path = match uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
        .or_else(|| uri.strip_prefix("http://"))
    {
        Some(after) => after.find('/').map_or("/", |slash| &after[slash..]),
        None if uri.starts_with('/') => uri,
        None => "/",
    };
    let path = path.split(['?', '#']).next().unwrap_or(path);
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Session path of an RTSP URI.
///
/// `rtsp://host:5554/live/track1` -> `/live`,
/// `rtsp://host:5554/live/` -> `/live`,
/// `rtsp://host:5554` -> `/`.
pub fn extract_session_path(uri: &str) -> &str {
    let path = uri_path(uri);
    match path.rfind("/track") {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => path,
    }
}

/// Track control name at the end of a URI, if any.
///
/// `rtsp://host/live/track2` -> `track2`.
pub fn extract_track_id(uri: &str) -> Option<&str> {
    let path = uri_path(uri);
    let last = path.rsplit('/').next()?;
    let digits = last.strip_prefix("track")?;
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some(last)
}
