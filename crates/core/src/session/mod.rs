//! RTSP client sessions (RFC 2326 §3, §12.37).
//!
//! A client session is a server-side state object created by the first
//! successful SETUP and destroyed by TEARDOWN or when its connection
//! closes. It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The playback state: Ready -> Playing <-> Paused.
//! - One [`ClientBinding`] per track the client set up.
//! - A timeout (default 60s, per RFC 2326 §12.37) advertised to the client.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (removed, bindings released)
//! TCP disconnect -> (removed, via cleanup)
//! ```
//!
//! Releasing a session releases only what it owns: its framers close and
//! on-demand sinks go back to their pool. Shared multicast feeds are
//! untouched.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::Result;
use crate::media_session::MediaSession;
use crate::subsession::ClientBinding;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created via SETUP, not yet playing.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
}

pub struct ClientSession {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Aggregate URL of the media session, used for RTP-Info.
    pub base_url: String,
    media: Arc<MediaSession>,
    state: RwLock<SessionState>,
    bindings: tokio::sync::Mutex<Vec<ClientBinding>>,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
}

impl ClientSession {
    /// Create a new session with a unique auto-incrementing ID.
    pub fn new(base_url: &str, media: Arc<MediaSession>) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self {
            id: format!("{:016X}", id),
            base_url: base_url.trim_end_matches('/').to_string(),
            media,
            state: RwLock::new(SessionState::Ready),
            bindings: tokio::sync::Mutex::new(Vec::new()),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }

    pub fn media(&self) -> &Arc<MediaSession> {
        &self.media
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let old = std::mem::replace(&mut *self.state.write(), state);
        tracing::debug!(session_id = %self.id, old_state = ?old, new_state = ?state, "state transition");
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }

    /// Attach a binding. A binding for the same track set up earlier is
    /// released first.
    pub async fn add_binding(&self, binding: ClientBinding) {
        let mut bindings = self.bindings.lock().await;
        if let Some(pos) = bindings.iter().position(|b| b.track_id() == binding.track_id()) {
            let old = bindings.swap_remove(pos);
            tracing::debug!(session_id = %self.id, track = %old.track_id(), "replacing track binding");
            old.release().await;
        }
        bindings.push(binding);
    }

    pub async fn track_count(&self) -> usize {
        self.bindings.lock().await.len()
    }

    /// `RTP-Info` header value covering every bound track.
    pub async fn rtp_info(&self) -> String {
        let bindings = self.bindings.lock().await;
        bindings
            .iter()
            .map(|b| b.rtp_info(&self.base_url))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Start delivery on every track. If one track cannot start, tracks
    /// started by this call are paused again and the error is returned.
    pub async fn play(&self) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        for i in 0..bindings.len() {
            if let Err(e) = bindings[i].play().await {
                tracing::warn!(session_id = %self.id, track = %bindings[i].track_id(), error = %e, "PLAY failed");
                for started in bindings[..i].iter_mut() {
                    started.pause().await;
                }
                return Err(e);
            }
        }
        self.set_state(SessionState::Playing);
        Ok(())
    }

    pub async fn pause(&self) {
        let mut bindings = self.bindings.lock().await;
        for binding in bindings.iter_mut() {
            binding.pause().await;
        }
        self.set_state(SessionState::Paused);
    }

    /// Release every binding this session holds.
    pub async fn release(&self) {
        let bindings = std::mem::take(&mut *self.bindings.lock().await);
        let count = bindings.len();
        for binding in bindings {
            binding.release().await;
        }
        tracing::debug!(session_id = %self.id, tracks = count, "session released");
    }
}

/// Registry of active client sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<ClientSession>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session for `media` and register it.
    pub fn create_session(&self, base_url: &str, media: Arc<MediaSession>) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(base_url, media));
        let mut sessions = self.sessions.write();
        sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session_id = %session.id, base_url, total_sessions = sessions.len(), "session created");
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID. The caller releases it.
    pub fn remove_session(&self, id: &str) -> Option<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during TCP disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> Vec<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        let removed: Vec<_> = ids.iter().filter_map(|id| sessions.remove(id)).collect();
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media() -> Arc<MediaSession> {
        Arc::new(MediaSession::new("live", "Live"))
    }

    #[test]
    fn session_ids_are_unique_hex() {
        let a = ClientSession::new("rtsp://h/live", media());
        let b = ClientSession::new("rtsp://h/live", media());
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.session_header_value(), format!("{};timeout=60", a.id));
    }

    #[tokio::test]
    async fn empty_session_plays_and_pauses() {
        let session = ClientSession::new("rtsp://h/live/", media());
        assert_eq!(session.base_url, "rtsp://h/live");
        assert_eq!(session.state(), SessionState::Ready);
        session.play().await.unwrap();
        assert_eq!(session.state(), SessionState::Playing);
        session.pause().await;
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(session.rtp_info().await, "");
    }

    #[test]
    fn manager_create_get_remove() {
        let manager = SessionManager::new();
        let s1 = manager.create_session("rtsp://h/live", media());
        let s2 = manager.create_session("rtsp://h/live", media());
        assert_eq!(manager.len(), 2);
        assert!(manager.get_session(&s1.id).is_some());

        assert!(manager.remove_session(&s1.id).is_some());
        assert!(manager.remove_session(&s1.id).is_none());

        let removed = manager.remove_sessions(&[s2.id.clone(), "missing".to_string()]);
        assert_eq!(removed.len(), 1);
        assert!(manager.is_empty());
    }
}
