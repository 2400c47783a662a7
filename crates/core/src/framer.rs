//! Elementary-stream framer.
//!
//! A [`Framer`] exclusively owns one [`ByteStreamSource`] and turns its
//! bytes into access units. Dropping the framer closes the source.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::media::{AccessUnitParser, Codec};
use crate::source::{ByteStreamSource, StreamEndpoint};

static FRAMER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of one framer instance, unique for the process lifetime.
///
/// Completions carry the identity of the framer that produced them so a
/// consumer can tell a current completion from a stale one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramerId(u64);

impl FramerId {
    fn next() -> Self {
        Self(FRAMER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FramerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// One delimited access unit.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    /// Duration in RTP clock ticks.
    pub duration: u32,
    /// Framer that produced this unit.
    pub origin: FramerId,
}

/// Everything needed to open a fresh framer on one endpoint.
#[derive(Debug, Clone)]
pub struct FramerFactory {
    pub endpoint: StreamEndpoint,
    pub codec: Codec,
    pub frame_rate: u32,
}

impl FramerFactory {
    pub fn new(endpoint: StreamEndpoint, codec: Codec, frame_rate: u32) -> Self {
        Self {
            endpoint,
            codec,
            frame_rate,
        }
    }

    pub async fn open(&self) -> Result<Framer> {
        Framer::open(&self.endpoint, self.codec, self.frame_rate).await
    }
}

pub struct Framer {
    id: FramerId,
    codec: Codec,
    source: ByteStreamSource,
    parser: Box<dyn AccessUnitParser>,
    buf: BytesMut,
    eos: bool,
    units: u64,
}

impl Framer {
    /// Wrap an opened source.
    pub fn new(source: ByteStreamSource, codec: Codec, frame_rate: u32) -> Self {
        let id = FramerId::next();
        tracing::debug!(framer = %id, endpoint = %source.endpoint(), %codec, "framer created");
        Self {
            id,
            codec,
            source,
            parser: codec.parser(frame_rate),
            buf: BytesMut::new(),
            eos: false,
            units: 0,
        }
    }

    /// Open `endpoint` and wrap the resulting source.
    pub async fn open(endpoint: &StreamEndpoint, codec: Codec, frame_rate: u32) -> Result<Self> {
        let source = ByteStreamSource::open(endpoint).await?;
        Ok(Self::new(source, codec, frame_rate))
    }

    pub fn id(&self) -> FramerId {
        self.id
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Access units produced so far.
    pub fn units_produced(&self) -> u64 {
        self.units
    }

    pub fn endpoint(&self) -> &StreamEndpoint {
        self.source.endpoint()
    }

    /// Produce the next access unit, or `None` once the source has ended
    /// and every unit that can still be delimited has been returned.
    ///
    /// A read error is treated like end of stream. Bytes left over at the
    /// end that do not form a complete unit are discarded.
    pub async fn next_access_unit(&mut self) -> Option<AccessUnit> {
        loop {
            if let Some(unit) = self.parser.next_unit(&mut self.buf, self.eos) {
                self.units += 1;
                return Some(AccessUnit {
                    data: unit.data,
                    duration: unit.duration,
                    origin: self.id,
                });
            }

            if self.eos {
                if !self.buf.is_empty() {
                    tracing::debug!(
                        framer = %self.id,
                        discarded = self.buf.len(),
                        "discarding truncated trailing unit"
                    );
                    self.buf.clear();
                }
                return None;
            }

            match self.source.read_next().await {
                Ok(Some(chunk)) => self.buf.extend_from_slice(&chunk),
                Ok(None) => self.eos = true,
                Err(e) => {
                    tracing::warn!(framer = %self.id, error = %e, "source read failed, treating as end of stream");
                    self.eos = true;
                }
            }
        }
    }
}

impl Drop for Framer {
    fn drop(&mut self) {
        tracing::debug!(framer = %self.id, units = self.units, "framer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::aac::tests::adts_frame;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    fn h264_stream(pictures: usize) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xce];
        for i in 0..pictures {
            data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, i as u8, 0x10]);
        }
        data
    }

    #[tokio::test]
    async fn file_endpoint_yields_every_unit_then_ends() {
        let path = std::env::temp_dir().join(format!("framer-file-{}.h264", std::process::id()));
        std::fs::write(&path, h264_stream(3)).unwrap();

        let mut framer = Framer::open(&StreamEndpoint::new(&path), Codec::H264, 25)
            .await
            .unwrap();
        let mut units = Vec::new();
        while let Some(unit) = framer.next_access_unit().await {
            assert_eq!(unit.origin, framer.id());
            assert_eq!(unit.duration, 3600);
            units.push(unit);
        }
        assert_eq!(units.len(), 3);
        assert_eq!(framer.units_produced(), 3);
        // Parameter sets travel with the first picture.
        assert_eq!(units[0].data[4], 0x67);
        assert!(framer.next_access_unit().await.is_none());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn socket_producer_three_units_then_close() {
        let path = std::env::temp_dir().join(format!("framer-sock-{}.sock", std::process::id()));
        std::fs::remove_file(&path).ok();
        let listener = UnixListener::bind(&path).unwrap();

        let producer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            for frame in [vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]] {
                conn.write_all(&adts_frame(&frame)).await.unwrap();
            }
            // A partial frame before closing is dropped by the framer.
            conn.write_all(&adts_frame(&[4u8; 40])[..12]).await.unwrap();
        });

        let mut framer = Framer::open(&StreamEndpoint::new(&path), Codec::Aac, 25)
            .await
            .unwrap();
        let mut sizes = Vec::new();
        while let Some(unit) = framer.next_access_unit().await {
            sizes.push(unit.data.len());
        }
        assert_eq!(sizes, vec![17, 27, 37]);

        producer.await.unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn leading_noise_is_not_buffered() {
        let path = std::env::temp_dir().join(format!("framer-noise-{}.sock", std::process::id()));
        std::fs::remove_file(&path).ok();
        let listener = UnixListener::bind(&path).unwrap();

        let producer = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let noise = vec![0xAAu8; 64 * 1024];
            for _ in 0..64 {
                conn.write_all(&noise).await.unwrap();
            }
            conn.write_all(&h264_stream(2)).await.unwrap();
        });

        let mut framer = Framer::open(&StreamEndpoint::new(&path), Codec::H264, 25)
            .await
            .unwrap();
        let first = framer.next_access_unit().await.unwrap();
        assert_eq!(&first.data[..5], &[0, 0, 0, 1, 0x67]);
        assert!(framer.buf.len() < 64);
        assert!(framer.next_access_unit().await.is_some());
        assert!(framer.next_access_unit().await.is_none());

        producer.await.unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn distinct_framers_have_distinct_ids() {
        let path = std::env::temp_dir().join(format!("framer-ids-{}.h264", std::process::id()));
        std::fs::write(&path, h264_stream(1)).unwrap();
        let endpoint = StreamEndpoint::new(&path);

        let a = Framer::open(&endpoint, Codec::H264, 25).await.unwrap();
        let b = Framer::open(&endpoint, Codec::H264, 25).await.unwrap();
        assert_ne!(a.id(), b.id());

        std::fs::remove_file(&path).ok();
    }
}
