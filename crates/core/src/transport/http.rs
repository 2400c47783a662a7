//! RTSP-over-HTTP tunneling (the QuickTime GET/POST scheme).
//!
//! A client opens two HTTP connections carrying the same
//! `x-sessioncookie`:
//!
//! - **GET**: answered with `200 OK` and `application/x-rtsp-tunnelled`;
//!   RTSP responses and interleaved RTP flow back on it for its lifetime.
//! - **POST**: an endless body of base64 encoded RTSP requests. It is
//!   never answered.
//!
//! Decoded POST bytes are written into an in-memory pipe that the GET
//! leg's RTSP loop reads from. Closing the GET connection ends the tunnel
//! and releases its sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use crate::protocol::MethodHandler;
use crate::protocol::response::SERVER_AGENT;
use crate::server::ServerState;
use crate::transport::tcp::{WRITE_QUEUE, serve_requests, spawn_writer};

const PIPE_CAPACITY: usize = 64 * 1024;

type PipeWriter = Arc<tokio::sync::Mutex<DuplexStream>>;

/// Open tunnels, keyed by session cookie.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<Mutex<HashMap<String, PipeWriter>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, cookie: &str, writer: DuplexStream) {
        let previous = self
            .tunnels
            .lock()
            .insert(cookie.to_string(), Arc::new(tokio::sync::Mutex::new(writer)));
        if previous.is_some() {
            tracing::warn!(cookie, "tunnel cookie reused, replacing previous tunnel");
        }
    }

    fn get(&self, cookie: &str) -> Option<PipeWriter> {
        self.tunnels.lock().get(cookie).cloned()
    }

    fn remove(&self, cookie: &str) {
        self.tunnels.lock().remove(cookie);
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }
}

/// Incremental base64 decoder for POST bodies.
///
/// Input may be split anywhere, including inside a 4-character group, and
/// each request may carry its own `=` padding.
#[derive(Debug, Default)]
pub struct Base64Decoder {
    pending: Vec<u8>,
}

impl Base64Decoder {
    /// Feed raw body bytes and return everything decodable so far.
    pub fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
        self.pending
            .extend(input.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let complete = self.pending.len() / 4 * 4;
        let mut out = Vec::new();
        let mut start = 0;
        let mut end = 0;
        while end < complete {
            end += 4;
            if self.pending[end - 4..end].contains(&b'=') || end == complete {
                out.extend(STANDARD.decode(&self.pending[start..end])?);
                start = end;
            }
        }
        self.pending.drain(..complete);
        Ok(out)
    }
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

async fn reply_status<W: AsyncWrite + Unpin>(writer: &mut W, status: &str) {
    let response = format!("HTTP/1.0 {status}\r\nServer: {SERVER_AGENT}\r\nConnection: close\r\n\r\n");
    let _ = writer.write_all(response.as_bytes()).await;
    let _ = writer.shutdown().await;
}

/// Serve one HTTP connection that is (or claims to be) half of a tunnel.
pub(crate) async fn serve_tunnel_leg<R, W>(
    head: String,
    reader: R,
    mut writer: W,
    peer: SocketAddr,
    state: ServerState,
) where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let method = head.split_whitespace().next().unwrap_or_default();
    let Some(cookie) = header(&head, "x-sessioncookie").map(str::to_string) else {
        tracing::warn!(%peer, method, "HTTP request without x-sessioncookie");
        reply_status(&mut writer, "400 Bad Request").await;
        return;
    };

    match method {
        "GET" => serve_get(cookie, reader, writer, peer, state).await,
        "POST" => serve_post(cookie, reader, peer, state).await,
        _ => reply_status(&mut writer, "405 Method Not Allowed").await,
    }
}

async fn serve_get<R, W>(cookie: String, mut reader: R, mut writer: W, peer: SocketAddr, state: ServerState)
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let head = format!(
        "HTTP/1.0 200 OK\r\n\
         Server: {SERVER_AGENT}\r\n\
         Connection: close\r\n\
         Cache-Control: no-store\r\n\
         Pragma: no-cache\r\n\
         Content-Type: application/x-rtsp-tunnelled\r\n\r\n"
    );
    // Registered before answering: the POST leg may follow immediately.
    let (requests, pipe_writer) = tokio::io::duplex(PIPE_CAPACITY);
    state.tunnels.register(&cookie, pipe_writer);
    if writer.write_all(head.as_bytes()).await.is_err() {
        state.tunnels.remove(&cookie);
        return;
    }
    tracing::info!(%peer, cookie, "HTTP tunnel opened");

    let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
    let writer = spawn_writer(writer, rx, peer);
    let mut handler = MethodHandler::new(
        state.sessions.clone(),
        state.media.clone(),
        peer,
        state.config.clone(),
        tx.clone(),
    );
    let mut requests = BufReader::new(requests);

    let reason = tokio::select! {
        reason = serve_requests(&mut requests, None, &mut handler, &tx, peer) => reason,
        _ = wait_for_close(&mut reader) => "tunnel closed by client",
    };

    writer.abort();
    handler.cleanup().await;
    state.tunnels.remove(&cookie);
    tracing::info!(%peer, cookie, reason, "HTTP tunnel closed");
}

async fn wait_for_close<R: AsyncBufRead + Unpin>(reader: &mut R) {
    let mut scratch = [0u8; 512];
    while let Ok(n) = reader.read(&mut scratch).await {
        if n == 0 {
            break;
        }
    }
}

async fn serve_post<R>(cookie: String, mut reader: R, peer: SocketAddr, state: ServerState)
where
    R: AsyncBufRead + Unpin + Send,
{
    let Some(pipe) = state.tunnels.get(&cookie) else {
        tracing::warn!(%peer, cookie, "POST for unknown tunnel");
        return;
    };
    tracing::debug!(%peer, cookie, "HTTP tunnel request channel attached");

    let mut decoder = Base64Decoder::default();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let decoded = match decoder.push(&buf[..n]) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(%peer, cookie, error = %e, "invalid base64 in tunnel POST");
                break;
            }
        };
        if decoded.is_empty() {
            continue;
        }
        if pipe.lock().await.write_all(&decoded).await.is_err() {
            break;
        }
    }
    tracing::debug!(%peer, cookie, "HTTP tunnel request channel closed");
}
