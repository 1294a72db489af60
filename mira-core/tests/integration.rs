//! Integration tests: full receiver lifecycle over real TCP and UDP
//! sockets on localhost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mira_core::{
    DecodePipeline, DeviceIdentity, EventReceiver, FormatDescription, MemoryStore, MiraError,
    MirrorService, ReceiverConfig, RunningService, SinkEvent, Tlv8, TlvType, VideoFrame,
    event_channel,
};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingPipeline {
    formats: Mutex<Vec<FormatDescription>>,
    frames: Mutex<Vec<VideoFrame>>,
}

impl DecodePipeline for RecordingPipeline {
    fn configure(&self, format: &FormatDescription) {
        self.formats.lock().push(format.clone());
    }

    fn has_session(&self) -> bool {
        !self.formats.lock().is_empty()
    }

    fn submit(&self, frame: VideoFrame) {
        self.frames.lock().push(frame);
    }
}

struct Harness {
    service: MirrorService,
    running: RunningService,
    events: EventReceiver,
    pipeline: Arc<RecordingPipeline>,
}

fn local_config() -> ReceiverConfig {
    ReceiverConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        control_port: 0,
        data_port: 0,
        ..ReceiverConfig::default()
    }
}

async fn start() -> Harness {
    let identity = Arc::new(DeviceIdentity::with_device_id(
        Arc::new(MemoryStore::new()),
        "02:12:34:56:78:9A".into(),
    ));
    let pipeline = Arc::new(RecordingPipeline::default());
    let (tx, events) = event_channel();
    let service = MirrorService::new(local_config(), identity, pipeline.clone(), tx);
    let running = service.start().await.unwrap();
    Harness {
        service,
        running,
        events,
        pipeline,
    }
}

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

struct Client {
    stream: BufReader<TcpStream>,
    cseq: u32,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
            cseq: 0,
        }
    }

    async fn request(&mut self, method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> Reply {
        self.cseq += 1;
        let mut head = format!("{method} {path} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (k, v) in headers {
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        if !body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");

        let stream = self.stream.get_mut();
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), self.read_reply())
            .await
            .expect("timeout");
        assert_eq!(
            reply.header("cseq"),
            Some(self.cseq.to_string().as_str()),
            "{method} {path}"
        );
        reply
    }

    async fn read_reply(&mut self) -> Reply {
        let mut status_line = String::new();
        self.stream.read_line(&mut status_line).await.unwrap();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (k, v) = line.split_once(':').unwrap();
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }

        let len = headers
            .get("content-length")
            .map_or(0, |v: &String| v.parse::<usize>().unwrap());
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.unwrap();

        Reply {
            status,
            headers,
            body,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.unwrap();
    }
}

async fn wait_for_connections(running: &RunningService, count: usize) {
    for _ in 0..100 {
        if running.connection_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection count never reached {count}");
}

async fn next_event(events: &mut EventReceiver) -> SinkEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout")
        .expect("channel closed")
}

// ── Info request ─────────────────────────────────────────────────

#[tokio::test]
async fn test_info_request_does_not_disconnect() {
    let mut h = start().await;
    let mut client = Client::connect(h.running.local_addr()).await;

    let reply = client.request("GET", "/info", &[], b"").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-type"), Some("application/x-apple-binary-plist"));

    let plist::Value::Dictionary(dict) = plist::from_bytes::<plist::Value>(&reply.body).unwrap()
    else {
        panic!("expected dictionary");
    };
    assert_eq!(
        dict.get("deviceid").and_then(plist::Value::as_string),
        Some("02:12:34:56:78:9A")
    );
    for key in ["features", "model", "pi", "pk", "srcvers", "vv"] {
        assert!(dict.contains_key(key), "missing {key}");
    }

    wait_for_connections(&h.running, 1).await;
    drop(client);
    wait_for_connections(&h.running, 0).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.events.try_recv().is_err());
    h.service.stop();
}

// ── Streaming session ────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_session_lifecycle() {
    let mut h = start().await;
    let data_port = h.running.advertisement().data_port;
    let mut client = Client::connect(h.running.local_addr()).await;

    let reply = client
        .request(
            "SETUP",
            "rtsp://127.0.0.1/1",
            &[("Transport", "RTP/AVP/UDP;unicast;client_port=6000-6001")],
            b"",
        )
        .await;
    assert_eq!(reply.status, 200);
    let transport = reply.header("transport").unwrap();
    assert!(transport.contains(&format!(
        "client_port=6000-6001;server_port={}-{}",
        data_port,
        data_port + 1
    )));
    let session = reply.header("session").unwrap().to_string();
    assert!(!session.is_empty());

    let reply = client.request("RECORD", "rtsp://127.0.0.1/1", &[], b"").await;
    assert_eq!(reply.status, 200);
    assert_eq!(
        next_event(&mut h.events).await,
        SinkEvent::Connected {
            peer: "127.0.0.1".into()
        }
    );
    assert!(h.running.is_streaming());

    // Parameter sets then a key frame on the data port.
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender
        .send_to(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE], ("127.0.0.1", data_port))
        .await
        .unwrap();
    sender
        .send_to(&[0, 0, 0, 1, 0x65, 0x88, 0x84], ("127.0.0.1", data_port))
        .await
        .unwrap();
    // Control port is drained.
    sender
        .send_to(&[0x80, 0xD4, 0, 0], ("127.0.0.1", data_port + 1))
        .await
        .unwrap();

    for _ in 0..100 {
        if !h.pipeline.frames.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    {
        let frames = h.pipeline.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].key_frame);
        assert_eq!(&frames[0].data[..], &[0, 0, 0, 3, 0x65, 0x88, 0x84]);
    }

    drop(client);
    assert_eq!(next_event(&mut h.events).await, SinkEvent::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.events.try_recv().is_err());
    assert!(!h.running.is_streaming());
    h.service.stop();
}

#[tokio::test]
async fn test_record_without_setup_is_rejected() {
    let mut h = start().await;
    let mut client = Client::connect(h.running.local_addr()).await;

    let reply = client.request("RECORD", "rtsp://127.0.0.1/1", &[], b"").await;
    assert_eq!(reply.status, 455);

    drop(client);
    wait_for_connections(&h.running, 0).await;
    assert!(h.events.try_recv().is_err());
    h.service.stop();
}

// ── CSeq echo ────────────────────────────────────────────────────

#[tokio::test]
async fn test_every_method_echoes_cseq() {
    let h = start().await;
    let mut client = Client::connect(h.running.local_addr()).await;

    let reply = client.request("OPTIONS", "*", &[], b"").await;
    assert!(reply.header("public").unwrap().contains("SETUP"));

    client.request("POST", "/feedback", &[], b"").await;
    client.request("ANNOUNCE", "rtsp://127.0.0.1/1", &[], b"v=0\r\n").await;
    client.request("GET_PARAMETER", "rtsp://127.0.0.1/1", &[], b"").await;
    client.request("SET_PARAMETER", "rtsp://127.0.0.1/1", &[], b"volume: -20\r\n").await;
    client.request("TEARDOWN", "rtsp://127.0.0.1/1", &[], b"").await;

    let reply = client.request("FLUSH", "rtsp://127.0.0.1/1", &[], b"").await;
    assert_eq!(reply.status, 501);

    let reply = client.request("GET", "/missing", &[], b"").await;
    assert_eq!(reply.status, 404);
    h.service.stop();
}

#[tokio::test]
async fn test_malformed_request_keeps_connection_open() {
    let h = start().await;
    let mut client = Client::connect(h.running.local_addr()).await;

    client.send_raw(b"NONSENSE\r\n\r\n").await;
    client.send_raw(b"GET /info RTSP/1.0\r\nNo-CSeq: here\r\n\r\n").await;

    let reply = client.request("OPTIONS", "*", &[], b"").await;
    assert_eq!(reply.status, 200);
    h.service.stop();
}

// ── Pairing ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_pairing_over_the_wire() {
    let h = start().await;
    let mut client = Client::connect(h.running.local_addr()).await;

    // Finish before start is a phase mismatch.
    let body = Tlv8::new().with_byte(TlvType::State, 3).to_bytes();
    let reply = client.request("POST", "/pair-setup", &[], &body).await;
    assert_eq!(reply.header("content-type"), Some("application/pairing+tlv8"));
    let tlv = Tlv8::parse(&reply.body);
    assert_eq!(tlv.get_byte(TlvType::State), Some(2));
    assert_eq!(tlv.get_byte(TlvType::Error), Some(1));

    let body = Tlv8::new().with_byte(TlvType::State, 1).to_bytes();
    let reply = client.request("POST", "/pair-setup", &[], &body).await;
    let tlv = Tlv8::parse(&reply.body);
    assert_eq!(tlv.get_byte(TlvType::State), Some(2));
    assert_eq!(tlv.get(TlvType::PublicKey).map(<[u8]>::len), Some(32));
    assert_eq!(tlv.get(TlvType::Salt).map(<[u8]>::len), Some(16));

    let body = Tlv8::new()
        .with_byte(TlvType::State, 3)
        .with(TlvType::PublicKey, &[1u8; 384])
        .with(TlvType::Proof, &[2u8; 64])
        .to_bytes();
    let reply = client.request("POST", "/pair-setup", &[], &body).await;
    let tlv = Tlv8::parse(&reply.body);
    assert_eq!(tlv.get_byte(TlvType::State), Some(4));
    assert!(tlv.contains(TlvType::Proof));

    let body = Tlv8::new()
        .with_byte(TlvType::State, 1)
        .with(TlvType::PublicKey, &[9u8; 32])
        .to_bytes();
    let reply = client.request("POST", "/pair-verify", &[], &body).await;
    assert_eq!(Tlv8::parse(&reply.body).get_byte(TlvType::State), Some(2));

    let body = Tlv8::new().with_byte(TlvType::State, 3).to_bytes();
    let reply = client.request("POST", "/pair-verify", &[], &body).await;
    let tlv = Tlv8::parse(&reply.body);
    assert_eq!(tlv.get_byte(TlvType::State), Some(4));
    assert!(tlv.contains(TlvType::EncryptedData));
    h.service.stop();
}

// ── Start and stop ───────────────────────────────────────────────

#[tokio::test]
async fn test_stop_closes_connections() {
    let h = start().await;
    let mut client = Client::connect(h.running.local_addr()).await;
    client.request("OPTIONS", "*", &[], b"").await;

    h.service.stop();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.stream.read(&mut buf))
        .await
        .expect("timeout")
        .unwrap_or(0);
    assert_eq!(n, 0);

    tokio::time::timeout(Duration::from_secs(5), h.running.join())
        .await
        .expect("accept loop did not stop");
}

#[tokio::test]
async fn test_bind_failure_reports_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let (tx, mut events) = event_channel();
    let service = MirrorService::new(
        ReceiverConfig {
            control_port: port,
            port_attempts: 1,
            ..local_config()
        },
        Arc::new(DeviceIdentity::with_device_id(
            Arc::new(MemoryStore::new()),
            "02:00:00:00:00:02".into(),
        )),
        Arc::new(RecordingPipeline::default()),
        tx,
    );

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, MiraError::Bind { attempts: 1, .. }));
    assert!(matches!(
        next_event(&mut events).await,
        SinkEvent::Error { .. }
    ));
}

#[tokio::test]
async fn test_advertisement_matches_bound_ports() {
    let h = start().await;
    let ad = h.running.advertisement();
    assert_eq!(ad.control_port, h.running.local_addr().port());
    assert_ne!(ad.data_port, 0);
    assert_eq!(ad.device_id, "02:12:34:56:78:9A");
    assert!(
        ad.txt_records()
            .iter()
            .any(|(k, v)| k == "features" && v == "0x5A7FFFF7,0x1E")
    );
    h.service.stop();
}
