//! Byte-stream input from a local producer.
//!
//! An endpoint is a filesystem path. Depending on what lives there, the
//! source connects to a Unix domain socket, opens a FIFO in non-blocking
//! mode, or reads a regular file. All three are driven by the runtime's
//! readiness events so a read never blocks the event loop.

use std::fmt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::net::UnixStream;
use tokio::net::unix::pipe;

use crate::error::{Result, StreamError};

const READ_CHUNK: usize = 64 * 1024;

/// Identifies one elementary stream's input channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEndpoint {
    path: PathBuf,
}

impl StreamEndpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}

enum Channel {
    Socket(UnixStream),
    Fifo(pipe::Receiver),
    File(tokio::fs::File),
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Channel::Socket(s) => Pin::new(s).poll_read(cx, buf),
            Channel::Fifo(p) => Pin::new(p).poll_read(cx, buf),
            Channel::File(f) => Pin::new(f).poll_read(cx, buf),
        }
    }
}

/// A live reader bound to one [`StreamEndpoint`].
///
/// Holds the channel open for its whole lifetime; dropping the source
/// closes it. There is no retry inside the source: a failed open is
/// reported to the caller, which owns the retry policy.
pub struct ByteStreamSource {
    endpoint: StreamEndpoint,
    channel: Channel,
    bytes_read: u64,
}

impl ByteStreamSource {
    /// Open the endpoint.
    ///
    /// Fails with [`StreamError::EndpointUnavailable`] when the path is
    /// missing, refuses the connection, or cannot be read.
    pub async fn open(endpoint: &StreamEndpoint) -> Result<Self> {
        let path = endpoint.path();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| StreamError::endpoint(path, e))?;
        let kind = meta.file_type();

        let channel = if kind.is_socket() {
            Channel::Socket(
                UnixStream::connect(path)
                    .await
                    .map_err(|e| StreamError::endpoint(path, e))?,
            )
        } else if kind.is_fifo() {
            Channel::Fifo(
                pipe::OpenOptions::new()
                    .open_receiver(path)
                    .map_err(|e| StreamError::endpoint(path, e))?,
            )
        } else {
            Channel::File(
                tokio::fs::File::open(path)
                    .await
                    .map_err(|e| StreamError::endpoint(path, e))?,
            )
        };

        tracing::debug!(endpoint = %endpoint, "byte-stream source opened");

        Ok(Self {
            endpoint: endpoint.clone(),
            channel,
            bytes_read: 0,
        })
    }

    pub fn endpoint(&self) -> &StreamEndpoint {
        &self.endpoint
    }

    /// Total bytes read since the source was opened.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read the next chunk of bytes. `Ok(None)` signals end of stream.
    pub async fn read_next(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let n = self.channel.read_buf(&mut buf).await?;
        if n == 0 {
            tracing::debug!(endpoint = %self.endpoint, total = self.bytes_read, "end of stream");
            return Ok(None);
        }
        self.bytes_read += n as u64;
        Ok(Some(buf.freeze()))
    }
}

impl Drop for ByteStreamSource {
    fn drop(&mut self) {
        tracing::trace!(endpoint = %self.endpoint, "byte-stream source closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("streamer-src-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn missing_endpoint_is_unavailable() {
        let endpoint = StreamEndpoint::new(temp_path("missing.sock"));
        match ByteStreamSource::open(&endpoint).await {
            Err(StreamError::EndpointUnavailable { path, .. }) => {
                assert_eq!(path, endpoint.path())
            }
            other => panic!("expected EndpointUnavailable, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn reads_file_to_end_of_stream() {
        let path = temp_path("clip.bin");
        std::fs::write(&path, b"hello elementary stream").unwrap();

        let mut source = ByteStreamSource::open(&StreamEndpoint::new(&path))
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = source.read_next().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello elementary stream");
        assert_eq!(source.bytes_read(), 23);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn reads_from_unix_socket_until_producer_closes() {
        let path = temp_path("producer.sock");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let producer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"abc").await.unwrap();
            conn.write_all(b"def").await.unwrap();
        });

        let mut source = ByteStreamSource::open(&StreamEndpoint::new(&path))
            .await
            .unwrap();
        producer.await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = source.read_next().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"abcdef");
        std::fs::remove_file(&path).ok();
    }
}
