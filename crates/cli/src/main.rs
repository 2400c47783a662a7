use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use streamer::config::{
    DEFAULT_AUDIO_ENDPOINT, DEFAULT_FRAME_RATE, DEFAULT_HTTP_TUNNEL_PORT, DEFAULT_MULTICAST_PORT,
    DEFAULT_MULTICAST_TTL, DEFAULT_RTSP_PORT, DEFAULT_VIDEO_ENDPOINT,
};
use streamer::{Codec, Credential, MulticastConfig, RestartPolicy, Streamer, StreamerConfig, TrackConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rtsp-streamer",
    version,
    about = "Live elementary-stream RTSP server (unicast on demand or SSM multicast)"
)]
struct Args {
    /// RTSP control port
    #[arg(long, short, default_value_t = DEFAULT_RTSP_PORT)]
    port: u16,

    /// Serve one shared multicast feed instead of per-client unicast
    #[arg(long, short)]
    multicast: bool,

    /// Multicast group (random SSM address when omitted)
    #[arg(long, requires = "multicast")]
    multicast_group: Option<Ipv4Addr>,

    /// RTP port of the first track; later tracks use the next even ports
    #[arg(long, default_value_t = DEFAULT_MULTICAST_PORT)]
    multicast_port: u16,

    #[arg(long, default_value_t = DEFAULT_MULTICAST_TTL)]
    ttl: u8,

    /// Accept RTSP-over-HTTP tunnels
    #[arg(long)]
    http: bool,

    #[arg(long, default_value_t = DEFAULT_HTTP_TUNNEL_PORT)]
    http_port: u16,

    /// Require credentials for every method except OPTIONS
    #[arg(long, requires_all = ["username", "password"])]
    auth: bool,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long, default_value = "Streaming Server")]
    realm: String,

    /// Video endpoint (Unix socket, FIFO or file)
    #[arg(long, default_value = DEFAULT_VIDEO_ENDPOINT)]
    video: PathBuf,

    /// h264 or h265
    #[arg(long, default_value = "h265")]
    video_codec: Codec,

    #[arg(long)]
    no_video: bool,

    /// Audio endpoint carrying AAC in ADTS
    #[arg(long, default_value = DEFAULT_AUDIO_ENDPOINT)]
    audio: PathBuf,

    #[arg(long)]
    no_audio: bool,

    /// Stream name, served at rtsp://host:port/<name>
    #[arg(long, default_value = "live")]
    name: String,

    #[arg(long, default_value = "NVS Streaming server")]
    description: String,

    #[arg(long, default_value_t = DEFAULT_FRAME_RATE)]
    frame_rate: u32,

    /// Reopen attempts after a clip ends before the stream is given up
    #[arg(long, default_value_t = 20)]
    reopen_attempts: u32,

    #[arg(long, default_value_t = 250)]
    reopen_delay_ms: u64,

    /// Host advertised in the stream URL and SDP
    #[arg(long)]
    public_host: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<StreamerConfig, String> {
        if self.no_video && self.no_audio {
            return Err("at least one of video and audio must be enabled".to_string());
        }
        if !matches!(self.video_codec, Codec::H264 | Codec::H265) {
            return Err(format!("{} is not a video codec", self.video_codec));
        }

        let multicast = self.multicast.then(|| match self.multicast_group {
            Some(group) => MulticastConfig {
                group,
                port: self.multicast_port,
                ttl: self.ttl,
            },
            None => MulticastConfig::random_ssm(self.multicast_port, self.ttl),
        });

        let credentials = match (self.auth, self.username, self.password) {
            (true, Some(username), Some(password)) => vec![Credential { username, password }],
            _ => Vec::new(),
        };

        Ok(StreamerConfig {
            rtsp_port: self.port,
            multicast,
            http_tunnel_port: self.http.then_some(self.http_port),
            credentials,
            auth_realm: self.realm,
            video: (!self.no_video).then(|| TrackConfig::new(self.video, self.video_codec)),
            audio: (!self.no_audio).then(|| TrackConfig::new(self.audio, Codec::Aac)),
            stream_name: self.name,
            description: self.description,
            frame_rate: self.frame_rate.max(1),
            restart: RestartPolicy {
                reopen_attempts: self.reopen_attempts,
                reopen_delay: Duration::from_millis(self.reopen_delay_ms),
            },
            public_host: self.public_host,
            ..StreamerConfig::default()
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rtsp-streamer: {e}");
            return ExitCode::from(2);
        }
    };

    let result = match Streamer::bootstrap(config).await {
        Ok(streamer) => {
            println!("Play this stream using the URL \"{}\"", streamer.url());
            if let Some(port) = streamer.tunnel_port() {
                println!("RTSP-over-HTTP tunneling is available on port {port}");
            }
            streamer.run().await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "streamer stopped");
            eprintln!("rtsp-streamer: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("rtsp-streamer").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_library_defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.rtsp_port, 5554);
        assert!(config.multicast.is_none());
        assert!(config.http_tunnel_port.is_none());
        assert!(!config.auth_enabled());
        assert_eq!(config.tracks().len(), 2);
        assert_eq!(config.restart.reopen_attempts, 20);
    }

    #[test]
    fn multicast_with_explicit_group() {
        let config = parse(&["--multicast", "--multicast-group", "232.1.2.3", "--ttl", "4"])
            .into_config()
            .unwrap();
        let mc = config.multicast.unwrap();
        assert_eq!(mc.group, Ipv4Addr::new(232, 1, 2, 3));
        assert_eq!(mc.port, 18888);
        assert_eq!(mc.ttl, 4);
    }

    #[test]
    fn auth_needs_both_credentials() {
        assert!(Args::try_parse_from(["rtsp-streamer", "--auth", "--username", "u"]).is_err());
        let config = parse(&["--auth", "--username", "u", "--password", "p"]).into_config().unwrap();
        assert!(config.auth_enabled());
    }

    #[test]
    fn rejects_empty_track_list_and_audio_video_codec() {
        assert!(parse(&["--no-video", "--no-audio"]).into_config().is_err());
        assert!(parse(&["--video-codec", "aac"]).into_config().is_err());
        let config = parse(&["--no-audio", "--video-codec", "h264", "--http"]).into_config().unwrap();
        assert_eq!(config.tracks().len(), 1);
        assert_eq!(config.tracks()[0].codec, Codec::H264);
        assert_eq!(config.http_tunnel_port, Some(8000));
    }
}
