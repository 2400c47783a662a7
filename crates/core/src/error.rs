//! Error types for the streamer library.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while composing, serving or streaming a media session.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Input**: [`EndpointUnavailable`](Self::EndpointUnavailable): the
///   producer's socket/file could not be opened.
/// - **Startup**: [`TransportSetup`](Self::TransportSetup): a listener or
///   multicast socket could not be bound. Always fatal.
/// - **Sink**: [`AlreadyPlaying`](Self::AlreadyPlaying),
///   [`NotPlaying`](Self::NotPlaying).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`TrackNotFound`](Self::TrackNotFound),
///   [`UnsupportedTransport`](Self::UnsupportedTransport).
/// - **Protocol**: [`Parse`](Self::Parse): malformed RTSP messages.
///
/// An exhausted input stream is not represented here: it is the normal
/// [`Completion`](crate::sink::Completion) of a play operation.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream endpoint is missing or unreadable.
    #[error("endpoint unavailable: {}: {source}", path.display())]
    EndpointUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A listener or RTP socket could not be set up.
    #[error("transport setup failed ({what}): {source}")]
    TransportSetup {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// [`RtpSink::start_playing`](crate::sink::RtpSink::start_playing) was
    /// called while a framer is still bound.
    #[error("sink is already playing")]
    AlreadyPlaying,

    /// The operation needs an active play but the sink is stopped.
    #[error("sink is not playing")]
    NotPlaying,

    /// No client session with the given ID exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The request URI named a track the media session does not offer.
    #[error("track not found: {0}")]
    TrackNotFound(String),

    /// The client asked for a transport this subsession cannot deliver on.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Server-side UDP port allocation could not find a free pair.
    #[error("no free server port pair could be bound")]
    PortRangeExhausted,

    /// The restart controller task ended or was stopped.
    #[error("restart controller stopped")]
    ControllerStopped,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

impl StreamError {
    pub(crate) fn endpoint(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::EndpointUnavailable {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transport_setup(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::TransportSetup {
            what: what.into(),
            source,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
