//! RTSP/1.0 signaling (RFC 2326).
//!
//! [`request`] parses what a client sends, [`response`] builds the
//! answer, [`handler`] dispatches one connection's requests onto media
//! and client sessions, [`sdp`] renders DESCRIBE bodies and [`auth`]
//! gates access.
//!
//! | Method | Effect |
//! |--------|--------|
//! | OPTIONS | lists methods; never challenged |
//! | DESCRIBE | SDP of a media session |
//! | SETUP | binds one track to a client session (UDP, TCP interleaved or multicast) |
//! | PLAY | starts every track of the session; `RTP-Info` for each |
//! | PAUSE | stops on-demand delivery, keeps the sinks |
//! | TEARDOWN | releases the session |
//! | GET_PARAMETER, SET_PARAMETER | keepalive |

pub mod auth;
pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::{Method, RtspRequest};
pub use response::{RtspResponse, Status};
