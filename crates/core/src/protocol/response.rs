use std::fmt::Write;

/// `Server` header carried by every response.
pub const SERVER_AGENT: &str = concat!("rtsp-streamer/", env!("CARGO_PKG_VERSION"));

/// Status codes the server answers with (RFC 2326 §7.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    NotFound,
    SessionNotFound,
    AggregateNotAllowed,
    UnsupportedTransport,
    InternalError,
    NotImplemented,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::SessionNotFound => 454,
            Self::AggregateNotAllowed => 459,
            Self::UnsupportedTransport => 461,
            Self::InternalError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "Not Found",
            Self::SessionNotFound => "Session Not Found",
            Self::AggregateNotAllowed => "Aggregate Operation Not Allowed",
            Self::UnsupportedTransport => "Unsupported Transport",
            Self::InternalError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Response builder.
///
/// ```text
/// RTSP/1.0 200 OK
/// Server: rtsp-streamer/x.y.z
/// CSeq: 2
/// Content-Type: application/sdp
/// Content-Length: 142
///
/// v=0 ...
/// ```
///
/// `Content-Length` is derived from the body at serialization time.
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status: Status,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }

    pub fn bad_request() -> Self {
        Self::new(Status::BadRequest)
    }

    /// Credentials missing or wrong. The caller adds the challenges.
    pub fn unauthorized() -> Self {
        Self::new(Status::Unauthorized)
    }

    pub fn not_found() -> Self {
        Self::new(Status::NotFound)
    }

    pub fn session_not_found() -> Self {
        Self::new(Status::SessionNotFound)
    }

    /// SETUP on the aggregate URI of a session with several tracks.
    pub fn aggregate_not_allowed() -> Self {
        Self::new(Status::AggregateNotAllowed)
    }

    pub fn unsupported_transport() -> Self {
        Self::new(Status::UnsupportedTransport)
    }

    pub fn internal_error() -> Self {
        Self::new(Status::InternalError)
    }

    pub fn not_implemented() -> Self {
        Self::new(Status::NotImplemented)
    }

    /// The stream endpoint could not be opened.
    pub fn service_unavailable() -> Self {
        Self::new(Status::ServiceUnavailable)
    }

    pub fn status_code(&self) -> u16 {
        self.status.code()
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(256 + self.body.as_ref().map_or(0, String::len));
        let _ = write!(out, "RTSP/1.0 {} {}\r\n", self.status.code(), self.status.reason());
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if let Some(body) = &self.body {
            let _ = write!(out, "Content-Length: {}\r\n", body.len());
        }
        out.push_str("\r\n");
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_in_insertion_order() {
        let s = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS")
            .serialize();
        assert_eq!(
            s,
            "RTSP/1.0 200 OK\r\nServer: rtsp-streamer/0.1.0\r\nCSeq: 1\r\nPublic: OPTIONS\r\n\r\n"
        );
    }

    #[test]
    fn body_gets_content_length() {
        let s = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string())
            .serialize();
        assert!(s.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn status_lines() {
        for (response, line) in [
            (RtspResponse::service_unavailable(), "RTSP/1.0 503 Service Unavailable\r\n"),
            (RtspResponse::session_not_found(), "RTSP/1.0 454 Session Not Found\r\n"),
            (RtspResponse::aggregate_not_allowed(), "RTSP/1.0 459 Aggregate Operation Not Allowed\r\n"),
            (RtspResponse::unsupported_transport(), "RTSP/1.0 461 Unsupported Transport\r\n"),
        ] {
            assert!(response.serialize().starts_with(line));
        }
        assert_eq!(RtspResponse::not_found().status_code(), 404);
    }
}
