//! Live elementary-stream RTSP server.
//!
//! A local producer writes H.264/H.265 (Annex B) or AAC (ADTS) into a
//! Unix socket, FIFO or file. The streamer frames it into access units and
//! serves it over RTSP with RTP/RTCP, either on demand (one framer per
//! client) or as one shared source-specific multicast feed. When the
//! producer's stream ends, the endpoint is reopened and streaming resumes.
//!
//! ```no_run
//! use streamer::{Streamer, StreamerConfig};
//!
//! # async fn demo() -> streamer::Result<()> {
//! let streamer = Streamer::bootstrap(StreamerConfig::default()).await?;
//! println!("{}", streamer.url());
//! streamer.run().await
//! # }
//! ```

pub mod app;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod framer;
pub mod media;
pub mod media_session;
pub mod protocol;
pub mod rtcp;
pub mod server;
pub mod session;
pub mod sink;
pub mod source;
pub mod subsession;
pub mod transport;

pub use app::Streamer;
pub use config::{Credential, MulticastConfig, RestartPolicy, StreamerConfig, TrackConfig};
pub use context::AppContext;
pub use controller::{ControllerHandle, ControllerState, RestartController};
pub use error::{Result, StreamError};
pub use media::{Codec, Packetizer};
pub use server::{ServerConfig, StreamingServer};
