//! RTSP control connections.
//!
//! One task per connection reads requests and one writer task owns the
//! socket's write half. Responses and interleaved RTP/RTCP
//! (RFC 2326 §10.12) share the writer's queue, so a `$` frame never
//! lands in the middle of a response.
//!
//! ```text
//! $ <channel:u8> <length:u16 BE> <payload...>
//! ```

use std::io;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{MethodHandler, RtspRequest};
use crate::server::ServerState;
use crate::transport::http;

/// Frames queued for one connection's writer.
pub(crate) const WRITE_QUEUE: usize = 1024;

const MAX_HEAD_LEN: usize = 16 * 1024;
const MAX_BODY_LEN: usize = 64 * 1024;

/// Wrap an RTP/RTCP packet for delivery on an RTSP connection.
pub fn interleaved_frame(channel: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u8(b'$');
    frame.put_u8(channel);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    frame.freeze()
}

/// One unit read from a control connection.
#[derive(Debug)]
pub enum Incoming {
    /// RTSP request text, including its body.
    Rtsp(String),
    /// `$`-framed data from the client (RTCP receiver reports).
    Interleaved { channel: u8, payload: Bytes },
    /// Head of an HTTP request; the body is left unread.
    Http(String),
}

fn is_http_request_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.nth(1)),
        (Some("GET" | "POST"), Some("HTTP/1.0" | "HTTP/1.1"))
    )
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Read the next message. Returns `None` at end of stream.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Incoming>> {
    loop {
        let buf = reader.fill_buf().await?;
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        match first {
            b'$' => {
                let mut header = [0u8; 4];
                reader.read_exact(&mut header).await?;
                let len = u16::from_be_bytes([header[2], header[3]]) as usize;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                return Ok(Some(Incoming::Interleaved {
                    channel: header[1],
                    payload: Bytes::from(payload),
                }));
            }
            // Stray line ends between messages.
            b'\r' | b'\n' => reader.consume(1),
            _ => break,
        }
    }

    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        head.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too long"));
        }
    }

    if head.lines().next().is_some_and(is_http_request_line) {
        return Ok(Some(Incoming::Http(head)));
    }

    let length = content_length(&head);
    if length > MAX_BODY_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request body too long"));
    }
    if length > 0 {
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        head.push_str(&String::from_utf8_lossy(&body));
    }
    Ok(Some(Incoming::Rtsp(head)))
}

/// Drain `rx` into `writer` until every sender is gone or a write fails.
pub(crate) fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, peer: SocketAddr) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                tracing::debug!(%peer, error = %e, "connection write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// RTSP request/response loop. Returns the reason for exiting.
pub(crate) async fn serve_requests<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    mut pending: Option<Incoming>,
    handler: &mut MethodHandler,
    tx: &mpsc::Sender<Bytes>,
    peer: SocketAddr,
) -> &'static str {
    loop {
        let message = match pending.take() {
            Some(message) => message,
            None => match read_message(reader).await {
                Ok(Some(message)) => message,
                Ok(None) => return "connection closed by client",
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "read error");
                    return "read error";
                }
            },
        };

        let text = match message {
            Incoming::Rtsp(text) => text,
            Incoming::Interleaved { channel, payload } => {
                tracing::trace!(%peer, channel, bytes = payload.len(), "discarding interleaved data from client");
                continue;
            }
            Incoming::Http(_) => {
                tracing::warn!(%peer, "HTTP request inside an RTSP stream");
                return "unexpected HTTP request";
            }
        };

        match RtspRequest::parse(&text) {
            Ok(request) => {
                tracing::debug!(
                    %peer,
                    method = %request.method,
                    uri = %request.uri,
                    version = %request.version,
                    "request"
                );

                let response = handler.handle(&request).await;

                tracing::debug!(%peer, status = response.status_code(), "response");

                if tx.send(Bytes::from(response.serialize())).await.is_err() {
                    return "write error";
                }
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "parse error");
            }
        }
    }
}

/// Serve one accepted connection: plain RTSP, or one leg of an HTTP tunnel.
pub(crate) async fn handle_connection(stream: TcpStream, state: ServerState) {
    let Ok(peer_addr) = stream.peer_addr() else {
        return;
    };
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let first = match read_message(&mut reader).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(%peer_addr, error = %e, "failed to read first message");
            return;
        }
    };
    if let Incoming::Http(head) = first {
        http::serve_tunnel_leg(head, reader, write_half, peer_addr, state).await;
        return;
    }

    tracing::info!(%peer_addr, "client connected");

    let (tx, rx) = mpsc::channel(WRITE_QUEUE);
    let writer = spawn_writer(write_half, rx, peer_addr);
    let mut handler = MethodHandler::new(
        state.sessions.clone(),
        state.media.clone(),
        peer_addr,
        state.config.clone(),
        tx.clone(),
    );

    let reason = serve_requests(&mut reader, Some(first), &mut handler, &tx, peer_addr).await;
    writer.abort();
    handler.cleanup().await;

    tracing::info!(%peer_addr, reason, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let frame = interleaved_frame(3, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(&frame[..], &[b'$', 3, 0, 3, 0xAA, 0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let raw: &[u8] = b"SET_PARAMETER rtsp://h/live RTSP/1.0\r\nCSeq: 4\r\nContent-Length: 6\r\n\r\nx: 1\r\nOPTIONS * RTSP/1.0\r\nCSeq: 5\r\n\r\n";
        let mut reader = BufReader::new(raw);

        let Some(Incoming::Rtsp(first)) = read_message(&mut reader).await.unwrap() else {
            panic!("expected RTSP message");
        };
        assert!(first.ends_with("\r\n\r\nx: 1\r\n"));
        let request = RtspRequest::parse(&first).unwrap();
        assert_eq!(request.body, "x: 1\r\n");

        let Some(Incoming::Rtsp(second)) = read_message(&mut reader).await.unwrap() else {
            panic!("expected RTSP message");
        };
        assert!(second.starts_with("OPTIONS * RTSP/1.0"));
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_interleaved_between_requests() {
        let mut raw = interleaved_frame(1, &[1, 2, 3, 4]).to_vec();
        raw.extend_from_slice(b"\r\nGET_PARAMETER rtsp://h/live RTSP/1.0\r\nCSeq: 9\r\n\r\n");
        let mut reader = BufReader::new(&raw[..]);

        match read_message(&mut reader).await.unwrap() {
            Some(Incoming::Interleaved { channel, payload }) => {
                assert_eq!(channel, 1);
                assert_eq!(&payload[..], &[1, 2, 3, 4]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            read_message(&mut reader).await.unwrap(),
            Some(Incoming::Rtsp(text)) if text.starts_with("GET_PARAMETER")
        ));
    }

    #[tokio::test]
    async fn detects_http_tunnel_request() {
        let raw: &[u8] = b"POST /live HTTP/1.0\r\nx-sessioncookie: abc\r\nContent-Length: 32767\r\n\r\nT1BUSU9OUw==";
        let mut reader = BufReader::new(raw);
        let Some(Incoming::Http(head)) = read_message(&mut reader).await.unwrap() else {
            panic!("expected HTTP head");
        };
        assert!(head.contains("x-sessioncookie: abc"));
        // Body stays in the reader for the tunnel.
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "T1BUSU9OUw==");
    }

    #[test]
    fn http_request_line_detection() {
        assert!(is_http_request_line("GET /live HTTP/1.1"));
        assert!(is_http_request_line("POST / HTTP/1.0"));
        assert!(!is_http_request_line("GET_PARAMETER rtsp://h/live RTSP/1.0"));
        assert!(!is_http_request_line("DESCRIBE rtsp://h/live RTSP/1.0"));
    }
}
