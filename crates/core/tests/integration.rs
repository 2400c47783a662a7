//! End-to-end tests: a real server on an ephemeral port, driven over TCP
//! by a minimal RTSP client, with producers on local files and Unix
//! domain sockets.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use streamer::subsession::Subsession;
use streamer::transport::PortAllocator;
use streamer::transport::tcp::{Incoming, read_message};
use streamer::{AppContext, Codec, ControllerState, Credential, MulticastConfig, Streamer, StreamerConfig, TrackConfig};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UnixListener};
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(3);

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("streamer-it-{}-{name}", std::process::id()))
}

fn h264_clip(pictures: usize) -> Vec<u8> {
    let mut data = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xce];
    for i in 0..pictures {
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, i as u8, 0x10]);
    }
    data
}

fn video_only(endpoint: PathBuf) -> StreamerConfig {
    StreamerConfig {
        rtsp_port: 0,
        video: Some(TrackConfig::new(endpoint, Codec::H264)),
        audio: None,
        public_host: Some("127.0.0.1".to_string()),
        ..StreamerConfig::default()
    }
}

async fn start(config: StreamerConfig, first_port: u16) -> Streamer {
    let ctx = AppContext::new(config).with_ports(PortAllocator::starting_at(first_port));
    Streamer::bootstrap_with(ctx).await.unwrap()
}

struct Response {
    status: u16,
    text: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    }

    fn session_id(&self) -> String {
        let value = self.header("Session").expect("Session header");
        value.split(';').next().unwrap_or(value).to_string()
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    cseq: u32,
    base: String,
    /// Interleaved frames that arrived while waiting for a response.
    frames: Vec<(u8, Vec<u8>)>,
}

impl Client {
    async fn connect(url: &str, port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            cseq: 0,
            base: url.to_string(),
            frames: Vec::new(),
        }
    }

    async fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut raw = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        self.writer.write_all(raw.as_bytes()).await.unwrap();

        loop {
            let message = timeout(STEP, read_message(&mut self.reader))
                .await
                .expect("response in time")
                .unwrap()
                .expect("connection open");
            match message {
                Incoming::Rtsp(text) => {
                    let status = text
                        .split_whitespace()
                        .nth(1)
                        .and_then(|code| code.parse().ok())
                        .unwrap_or(0);
                    assert!(text.contains(&format!("CSeq: {}", self.cseq)), "{text}");
                    return Response { status, text };
                }
                Incoming::Interleaved { channel, payload } => self.frames.push((channel, payload.to_vec())),
                Incoming::Http(head) => panic!("unexpected HTTP message {head}"),
            }
        }
    }

    async fn next_frame(&mut self) -> (u8, Vec<u8>) {
        if !self.frames.is_empty() {
            return self.frames.remove(0);
        }
        loop {
            let message = timeout(STEP, read_message(&mut self.reader))
                .await
                .expect("frame in time")
                .unwrap()
                .expect("connection open");
            if let Incoming::Interleaved { channel, payload } = message {
                return (channel, payload.to_vec());
            }
        }
    }

    fn track(&self, n: usize) -> String {
        format!("{}/track{n}", self.base)
    }
}

#[tokio::test]
async fn interleaved_handshake_delivers_producer_content() {
    let path = temp_path("video.sock");
    std::fs::remove_file(&path).ok();
    let listener = UnixListener::bind(&path).unwrap();
    // Each open (SDP probe, then PLAY) is one producer connection.
    let producer = tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                if conn.write_all(&h264_clip(4)).await.is_ok() {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            });
        }
    });

    let streamer = start(video_only(path.clone()), 35000).await;
    let port = streamer.local_addr().unwrap().port();
    let url = streamer.url().to_string();
    assert_eq!(url, format!("rtsp://127.0.0.1:{port}/live"));
    tokio::spawn(streamer.run());

    let mut client = Client::connect(&url, port).await;

    let options = client.request("OPTIONS", &url, &[]).await;
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("PLAY"));

    let describe = client.request("DESCRIBE", &url, &[("Accept", "application/sdp")]).await;
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Base"), Some(format!("{url}/").as_str()));
    assert!(describe.text.contains("m=video 0 RTP/AVP 96"));
    assert!(describe.text.contains("a=control:track1"));
    assert!(describe.text.contains("sprop-parameter-sets="));

    let setup = client
        .request("SETUP", &client.track(1), &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")])
        .await;
    assert_eq!(setup.status, 200);
    assert!(setup.header("Transport").unwrap().starts_with("RTP/AVP/TCP;unicast;interleaved=0-1"));
    let session = setup.session_id();

    let play = client.request("PLAY", &url, &[("Session", &session)]).await;
    assert_eq!(play.status, 200);
    assert!(play.header("RTP-Info").unwrap().contains("track1;seq="));

    // Parameter sets first, then the first picture.
    let mut payloads = Vec::new();
    while payloads.len() < 3 {
        let (channel, packet) = client.next_frame().await;
        if channel != 0 {
            continue;
        }
        assert_eq!(packet[0] >> 6, 2, "RTP version");
        assert_eq!(packet[1] & 0x7f, 96);
        payloads.push(packet[12..].to_vec());
    }
    assert_eq!(payloads[0], [0x67, 0x42, 0x00, 0x1f]);
    assert_eq!(payloads[1], [0x68, 0xce]);
    assert_eq!(payloads[2], [0x65, 0x88, 0x00, 0x10]);

    let teardown = client.request("TEARDOWN", &url, &[("Session", &session)]).await;
    assert_eq!(teardown.status, 200);

    producer.abort();
    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn on_demand_release_returns_sink_to_pool() {
    let path = temp_path("pool.h264");
    std::fs::write(&path, h264_clip(50)).unwrap();

    let streamer = start(video_only(path.clone()), 35100).await;
    let port = streamer.local_addr().unwrap().port();
    let url = streamer.url().to_string();
    let Some(Subsession::OnDemand(track)) = streamer.media_session().subsession("track1").cloned() else {
        panic!("expected an on-demand subsession");
    };
    tokio::spawn(streamer.run());

    for round in 0..2 {
        let mut client = Client::connect(&url, port).await;
        let setup = client
            .request("SETUP", &client.track(1), &[("Transport", "RTP/AVP/TCP;unicast")])
            .await;
        assert_eq!(setup.status, 200);
        assert_eq!(track.pool().idle_count(), 0);
        let session = setup.session_id();

        assert_eq!(client.request("PLAY", &url, &[("Session", &session)]).await.status, 200);
        assert_eq!(client.request("PAUSE", &url, &[("Session", &session)]).await.status, 200);
        assert_eq!(client.request("TEARDOWN", &url, &[("Session", &session)]).await.status, 200);

        assert_eq!(track.pool().idle_count(), 1, "round {round}");
    }
    // The second client reused the first client's sink.
    assert_eq!(track.pool().created_count(), 1);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn unavailable_endpoint_fails_play_with_503() {
    let streamer = start(video_only(temp_path("absent.sock")), 35200).await;
    let port = streamer.local_addr().unwrap().port();
    let url = streamer.url().to_string();
    tokio::spawn(streamer.run());

    let mut client = Client::connect(&url, port).await;
    let describe = client.request("DESCRIBE", &url, &[]).await;
    assert_eq!(describe.status, 200);
    assert!(!describe.text.contains("sprop-parameter-sets="));

    let setup = client
        .request("SETUP", &client.track(1), &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")])
        .await;
    assert_eq!(setup.status, 200);
    let session = setup.session_id();
    assert_eq!(client.request("PLAY", &url, &[("Session", &session)]).await.status, 503);
}

#[tokio::test]
async fn auth_rejects_before_play() {
    let mut config = video_only(temp_path("auth.sock"));
    config.credentials.push(Credential {
        username: "viewer".to_string(),
        password: "secret".to_string(),
    });
    let streamer = start(config, 35300).await;
    let port = streamer.local_addr().unwrap().port();
    let url = streamer.url().to_string();
    tokio::spawn(streamer.run());

    let mut client = Client::connect(&url, port).await;
    assert_eq!(client.request("OPTIONS", &url, &[]).await.status, 200);

    let describe = client.request("DESCRIBE", &url, &[]).await;
    assert_eq!(describe.status, 401);
    assert!(describe.text.contains("WWW-Authenticate: Digest realm=\"Streaming Server\""));
    assert!(describe.text.contains("WWW-Authenticate: Basic realm=\"Streaming Server\""));

    let setup = client
        .request("SETUP", &client.track(1), &[("Transport", "RTP/AVP/TCP;unicast")])
        .await;
    assert_eq!(setup.status, 401);
    assert_eq!(
        client.request("PLAY", &url, &[("Session", "0000000000000001")]).await.status,
        401
    );

    let wrong = format!("Basic {}", STANDARD.encode("viewer:guess"));
    assert_eq!(
        client.request("DESCRIBE", &url, &[("Authorization", &wrong)]).await.status,
        401
    );
    let right = format!("Basic {}", STANDARD.encode("viewer:secret"));
    assert_eq!(
        client.request("DESCRIBE", &url, &[("Authorization", &right)]).await.status,
        200
    );
}

#[tokio::test]
async fn http_tunnel_carries_rtsp_and_is_advertised() {
    let config = StreamerConfig {
        rtsp_port: 0,
        http_tunnel_port: Some(0),
        public_host: Some("10.0.0.9".to_string()),
        ..StreamerConfig::default()
    };
    let streamer = start(config, 35400).await;
    let rtsp_port = streamer.local_addr().unwrap().port();
    let tunnel_port = streamer.tunnel_port().expect("tunnel enabled");
    assert_ne!(tunnel_port, 0);
    assert_eq!(streamer.url(), format!("rtsp://10.0.0.9:{rtsp_port}/live"));
    // Video and audio, both on demand.
    let media = streamer.media_session();
    assert!(!media.is_multicast());
    assert_eq!(media.subsessions().len(), 2);
    assert!(media.subsessions().iter().all(|s| matches!(s, Subsession::OnDemand(_))));
    assert!(streamer.controller_watches().is_empty());
    tokio::spawn(streamer.run());

    let get = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    let (get_read, mut get_write) = get.into_split();
    let mut get_reader = BufReader::new(get_read);
    get_write
        .write_all(
            b"GET /live HTTP/1.0\r\nx-sessioncookie: c00k1e\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n",
        )
        .await
        .unwrap();
    let Some(Incoming::Rtsp(head)) = timeout(STEP, read_message(&mut get_reader)).await.unwrap().unwrap()
    else {
        panic!("expected the tunnel response head");
    };
    assert!(head.starts_with("HTTP/1.0 200 OK"));
    assert!(head.contains("application/x-rtsp-tunnelled"));

    let mut post = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    post.write_all(
        b"POST /live HTTP/1.0\r\nx-sessioncookie: c00k1e\r\nContent-Type: application/x-rtsp-tunnelled\r\nContent-Length: 32767\r\n\r\n",
    )
    .await
    .unwrap();
    let options = STANDARD.encode("OPTIONS rtsp://10.0.0.9/live RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let (a, b) = options.as_bytes().split_at(5);
    post.write_all(a).await.unwrap();
    post.write_all(b).await.unwrap();

    let Some(Incoming::Rtsp(response)) = timeout(STEP, read_message(&mut get_reader)).await.unwrap().unwrap()
    else {
        panic!("expected an RTSP response on the GET leg");
    };
    assert!(response.starts_with("RTSP/1.0 200 OK"));
    assert!(response.contains("CSeq: 1"));
}

#[tokio::test]
async fn passive_clients_cause_no_controller_transitions() {
    let path = temp_path("shared.sock");
    std::fs::remove_file(&path).ok();
    let listener = UnixListener::bind(&path).unwrap();
    // Hold the producer connection open without data.
    let producer = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((conn, _)) = listener.accept().await {
            held.push(conn);
        }
    });

    let mut config = video_only(path.clone());
    config.multicast = Some(MulticastConfig {
        group: "232.9.8.7".parse().unwrap(),
        port: 35590,
        ttl: 1,
    });
    let streamer = start(config, 35500).await;
    let port = streamer.local_addr().unwrap().port();
    let url = streamer.url().to_string();
    let mut watches = streamer.controller_watches();
    assert_eq!(watches.len(), 1);
    let (label, state) = &mut watches[0];
    assert_eq!(label, "track1");
    assert_eq!(*state.borrow(), ControllerState::Streaming);
    state.mark_unchanged();
    tokio::spawn(streamer.run());

    for _ in 0..2 {
        let mut client = Client::connect(&url, port).await;
        let describe = client.request("DESCRIBE", &url, &[]).await;
        assert!(describe.text.contains("a=source-filter: incl IN IP4 * 127.0.0.1"));
        let setup = client
            .request("SETUP", &client.track(1), &[("Transport", "RTP/AVP;unicast;client_port=45100-45101")])
            .await;
        assert_eq!(setup.status, 200);
        assert_eq!(
            setup.header("Transport"),
            Some("RTP/AVP;multicast;destination=232.9.8.7;port=35590-35591;ttl=1")
        );
        let session = setup.session_id();
        assert_eq!(client.request("PLAY", &url, &[("Session", &session)]).await.status, 200);
        assert_eq!(client.request("TEARDOWN", &url, &[("Session", &session)]).await.status, 200);
    }

    // The shared feed never noticed the clients.
    let (_, state) = &watches[0];
    assert!(!state.has_changed().unwrap());
    assert_eq!(*state.borrow(), ControllerState::Streaming);

    producer.abort();
    std::fs::remove_file(&path).ok();
}
