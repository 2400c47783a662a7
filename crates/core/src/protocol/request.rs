use std::fmt;

use crate::error::{ParseErrorKind, Result, StreamError};

/// RTSP methods the server dispatches on. Anything else is kept verbatim
/// and answered with `501 Not Implemented`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Other(String),
}

impl Method {
    /// Methods advertised in the `Public` header of an OPTIONS response.
    pub const SUPPORTED: [Method; 8] = [
        Method::Options,
        Method::Describe,
        Method::Setup,
        Method::Play,
        Method::Pause,
        Method::Teardown,
        Method::GetParameter,
        Method::SetParameter,
    ];

    pub fn parse(token: &str) -> Self {
        match token {
            "OPTIONS" => Self::Options,
            "DESCRIBE" => Self::Describe,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            "PAUSE" => Self::Pause,
            "TEARDOWN" => Self::Teardown,
            "GET_PARAMETER" => Self::GetParameter,
            "SET_PARAMETER" => Self::SetParameter,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
            Self::Other(token) => token,
        }
    }

    /// `Public` header value.
    pub fn public_list() -> String {
        Self::SUPPORTED
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request read from a control connection (RFC 2326 §6).
///
/// Header names keep their received spelling; lookups ignore case.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    /// Whatever followed the blank line (parameter names for
    /// GET_PARAMETER/SET_PARAMETER).
    pub body: String,
}

fn split_head(raw: &str) -> (&str, &str) {
    ["\r\n\r\n", "\n\n"]
        .iter()
        .find_map(|sep| raw.split_once(sep))
        .unwrap_or((raw, ""))
}

fn parse_error(kind: ParseErrorKind) -> StreamError {
    StreamError::Parse { kind }
}

impl RtspRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(parse_error(ParseErrorKind::EmptyRequest))?;
        let [method, uri, version] = match request_line.split_whitespace().collect::<Vec<_>>()[..] {
            [method, uri, version] => [method, uri, version],
            _ => return Err(parse_error(ParseErrorKind::InvalidRequestLine)),
        };
        if version != "RTSP/1.0" {
            tracing::warn!(version, "request is not RTSP/1.0");
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .ok_or(parse_error(ParseErrorKind::InvalidHeader))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            method: Method::parse(method),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body: body.to_string(),
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `CSeq`, echoed in the response.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, without its parameters.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_with_accept() {
        let req = RtspRequest::parse(
            "DESCRIBE rtsp://cam.local:5554/live RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, Method::Describe);
        assert_eq!(req.uri, "rtsp://cam.local:5554/live");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("2"));
        assert_eq!(req.get_header("accept"), Some("application/sdp"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn setup_keeps_transport_verbatim() {
        let req = RtspRequest::parse(
            "SETUP rtsp://cam.local:5554/live/track2 RTSP/1.0\r\n\
             CSeq: 4\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, Method::Setup);
        assert_eq!(req.get_header("TRANSPORT"), Some("RTP/AVP/TCP;unicast;interleaved=2-3"));
    }

    #[test]
    fn body_and_session_parameters() {
        let raw = "SET_PARAMETER rtsp://localhost:5554/live RTSP/1.0\r\n\
                   CSeq: 9\r\n\
                   Session: 000000000000000A;timeout=60\r\n\
                   Content-Length: 9\r\n\r\n\
                   ping: 1\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, Method::SetParameter);
        assert_eq!(req.session_id(), Some("000000000000000A"));
        assert_eq!(req.body, "ping: 1\r\n");
    }

    #[test]
    fn bare_newlines_accepted() {
        let req = RtspRequest::parse("PLAY rtsp://h/live RTSP/1.0\nCSeq: 5\nSession: 1\n\n").unwrap();
        assert_eq!(req.method, Method::Play);
        assert_eq!(req.session_id(), Some("1"));
    }

    #[test]
    fn unknown_method_is_preserved() {
        let req = RtspRequest::parse("RECORD rtsp://h/live RTSP/1.0\r\nCSeq: 1\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Other("RECORD".to_string()));
        assert_eq!(req.method.to_string(), "RECORD");
    }

    #[test]
    fn malformed_requests() {
        assert!(matches!(
            RtspRequest::parse(""),
            Err(StreamError::Parse { kind: ParseErrorKind::EmptyRequest })
        ));
        assert!(matches!(
            RtspRequest::parse("PLAY\r\n\r\n"),
            Err(StreamError::Parse { kind: ParseErrorKind::InvalidRequestLine })
        ));
        assert!(matches!(
            RtspRequest::parse("PLAY rtsp://h/live RTSP/1.0\r\nno colon here\r\n\r\n"),
            Err(StreamError::Parse { kind: ParseErrorKind::InvalidHeader })
        ));
    }

    #[test]
    fn public_list_order() {
        assert_eq!(
            Method::public_list(),
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER"
        );
    }
}
