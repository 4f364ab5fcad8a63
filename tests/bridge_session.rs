//! Full bridge over a real local socket with the simulated adapter.

use heartsync_bridge::bridge::{
    spawn_accept_loop, spawn_heartbeat, AcceptLoop, BridgeEvent, BridgeServer, ConnectionManager,
    ServerConfig,
};
use heartsync_bridge::domain::models::PermissionState;
use heartsync_bridge::domain::settings::EndpointPaths;
use heartsync_bridge::infrastructure::bluetooth::{
    AdapterEvent, SampleSource, SimulatedAdapter, SimulationConfig,
};
use heartsync_bridge::infrastructure::ipc::codec::{encode, write_frame};
use heartsync_bridge::infrastructure::ipc::instance::{Acquire, InstanceGuard};
use heartsync_bridge::infrastructure::ipc::{BridgeMessage, ClientMessage, ErrorCode, FrameReader};
use interprocess::local_socket::{
    traits::Stream as _, GenericFilePath, Stream as LocalStream, ToFsName,
};
use interprocess::TryClone;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Harness {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    tx: mpsc::UnboundedSender<BridgeEvent>,
    server: JoinHandle<anyhow::Result<()>>,
    heartbeat: JoinHandle<()>,
    accept: AcceptLoop,
    guard: InstanceGuard,
}

impl Harness {
    fn start(heartbeat_interval: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = EndpointPaths::in_dir(dir.path().join("rt"));
        let Acquire::Acquired(mut guard) =
            InstanceGuard::acquire(&paths, Duration::from_millis(500)).unwrap()
        else {
            panic!("endpoint already owned");
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = SimulatedAdapter::new(
            tx.clone(),
            SimulationConfig {
                discovery_delay: Duration::from_millis(5),
                connect_delay: Duration::from_millis(5),
                notify_interval: Duration::from_millis(20),
                samples: SampleSource::bpm_script(&[65, 70, 75]),
                ..SimulationConfig::default()
            },
        );
        let config = ServerConfig {
            heartbeat_interval,
            shutdown_grace: Duration::from_millis(500),
        };
        let server = BridgeServer::new(ConnectionManager::new(Box::new(adapter)), tx.clone(), rx, config);

        let listener = guard.take_listener().unwrap();
        let accept = spawn_accept_loop(listener, paths.socket.clone(), tx.clone()).unwrap();
        let heartbeat = spawn_heartbeat(heartbeat_interval, tx.clone());
        let server = tokio::spawn(server.run());

        Self {
            _dir: dir,
            socket: paths.socket,
            tx,
            server,
            heartbeat,
            accept,
            guard,
        }
    }

    async fn stop(self) {
        let _ = self.tx.send(BridgeEvent::Shutdown);
        self.heartbeat.abort();
        self.server.await.unwrap().unwrap();
        let mut guard = self.guard;
        let accept = self.accept;
        tokio::task::spawn_blocking(move || {
            accept.stop();
            guard.release();
        })
        .await
        .unwrap();
    }
}

/// Blocking client used from `spawn_blocking`
struct TestClient {
    stream: LocalStream,
    reader: FrameReader<LocalStream>,
}

impl TestClient {
    fn connect(socket: &Path) -> Self {
        let name = socket.to_fs_name::<GenericFilePath>().unwrap();
        let stream = LocalStream::connect(name).unwrap();
        stream.set_recv_timeout(Some(Duration::from_secs(5))).unwrap();
        let reader = FrameReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send(&mut self, message: &ClientMessage) {
        write_frame(&mut self.stream, message).unwrap();
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Next message that is not a heartbeat
    fn recv(&mut self) -> BridgeMessage {
        loop {
            let message: BridgeMessage = self
                .reader
                .next_message()
                .expect("read failed")
                .expect("bridge closed the connection");
            if !matches!(message, BridgeMessage::BridgeHeartbeat { .. }) {
                return message;
            }
        }
    }

    fn recv_greeting(&mut self) {
        assert_eq!(self.recv(), BridgeMessage::Ready { version: 1 });
        assert_eq!(
            self.recv(),
            BridgeMessage::Permission {
                state: PermissionState::Authorized
            }
        );
    }

    /// Drain until the bridge closes the stream
    fn closed_by_bridge(&mut self) -> bool {
        loop {
            match self.reader.next_payload() {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(e) => return !e.is_timeout(),
            }
        }
    }
}

const SLOW_HEARTBEAT: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_connect_stream_disconnect() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&socket);
        client.recv_greeting();

        client.send(&ClientMessage::Scan { on: true });
        let found = client.recv();
        match found {
            BridgeMessage::DeviceFound { device } => {
                assert_eq!(device.id, "sim-hr-01");
                assert_eq!(device.name, "HeartSync Simulator");
            }
            other => panic!("expected device_found, got {:?}", other),
        }

        client.send(&ClientMessage::Connect {
            id: "sim-hr-01".to_string(),
        });
        let mut message = client.recv();
        // The second simulated device may still be reported before the scan stops
        if matches!(message, BridgeMessage::DeviceFound { .. }) {
            message = client.recv();
        }
        assert_eq!(
            message,
            BridgeMessage::Connected {
                device_id: "sim-hr-01".to_string(),
                name: Some("HeartSync Simulator".to_string())
            }
        );

        for expected in [65u16, 70, 75] {
            match client.recv() {
                BridgeMessage::HrData { bpm, timestamp, rr } => {
                    assert_eq!(bpm, expected);
                    assert!(timestamp > 0.0);
                    assert_eq!(rr, None);
                }
                other => panic!("expected hr_data, got {:?}", other),
            }
        }

        client.send(&ClientMessage::Status);
        assert_eq!(
            client.recv(),
            BridgeMessage::Status {
                permission: PermissionState::Authorized,
                connected: true,
                device_id: Some("sim-hr-01".to_string()),
                state: "connected".to_string()
            }
        );

        client.send(&ClientMessage::Disconnect);
        assert_eq!(
            client.recv(),
            BridgeMessage::Disconnected {
                device_id: "sim-hr-01".to_string(),
                reason: Some("requested".to_string())
            }
        );
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_client_is_refused() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut first = TestClient::connect(&socket);
        first.recv_greeting();

        let mut second = TestClient::connect(&socket);
        assert!(second.closed_by_bridge());

        first.send(&ClientMessage::Status);
        assert!(matches!(first.recv(), BridgeMessage::Status { .. }));
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_payload_keeps_connection() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&socket);
        client.recv_greeting();

        let body = br#"{"type":"reboot"}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        client.send_raw(&frame);
        match client.recv() {
            BridgeMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("expected error, got {:?}", other),
        }

        client.send(&ClientMessage::Connect {
            id: "never-scanned".to_string(),
        });
        match client.recv() {
            BridgeMessage::Error { code, .. } => assert_eq!(code, ErrorCode::DeviceNotFound),
            other => panic!("expected error, got {:?}", other),
        }

        client.send(&ClientMessage::Status);
        assert!(matches!(
            client.recv(),
            BridgeMessage::Status {
                connected: false,
                ..
            }
        ));
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_closes_client_and_frees_slot() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&socket);
        client.recv_greeting();
        client.send_raw(&65537u32.to_be_bytes());
        assert!(client.closed_by_bridge());

        // The slot is released, a new client is greeted
        let mut next = TestClient::connect(&socket);
        next.recv_greeting();
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sensor_survives_client_reattach() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&socket);
        client.recv_greeting();
        client.send(&ClientMessage::Scan { on: true });
        assert!(matches!(client.recv(), BridgeMessage::DeviceFound { .. }));
        client.send(&ClientMessage::Connect {
            id: "sim-hr-01".to_string(),
        });
        loop {
            if let BridgeMessage::Connected { .. } = client.recv() {
                break;
            }
        }
        drop(client);

        // Detach is processed asynchronously; retry until the slot is free
        let mut reattached = None;
        for _ in 0..50 {
            let mut candidate = TestClient::connect(&socket);
            if let Ok(Some(payload)) = candidate.reader.next_payload() {
                let message: BridgeMessage = serde_json::from_slice(&payload).unwrap();
                assert_eq!(message, BridgeMessage::Ready { version: 1 });
                reattached = Some(candidate);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let mut client = reattached.expect("could not reattach");
        client.send(&ClientMessage::Status);
        loop {
            if let BridgeMessage::Status { connected, device_id, .. } = client.recv() {
                assert!(connected);
                assert_eq!(device_id.as_deref(), Some("sim-hr-01"));
                break;
            }
        }
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_reaches_client() {
    let harness = Harness::start(Duration::from_millis(50));
    let socket = harness.socket.clone();

    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&socket);
        let mut heartbeats = 0;
        while heartbeats < 2 {
            let message: BridgeMessage = client.reader.next_message().unwrap().unwrap();
            if let BridgeMessage::BridgeHeartbeat { timestamp } = message {
                assert!(timestamp > 0.0);
                heartbeats += 1;
            }
        }
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_sensor_and_endpoint() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();

    let client = tokio::task::spawn_blocking({
        let socket = socket.clone();
        move || {
            let mut client = TestClient::connect(&socket);
            client.recv_greeting();
            client.send(&ClientMessage::Scan { on: true });
            client.recv();
            client.send(&ClientMessage::Connect {
                id: "sim-hr-01".to_string(),
            });
            loop {
                if let BridgeMessage::Connected { .. } = client.recv() {
                    break;
                }
            }
            client
        }
    })
    .await
    .unwrap();

    harness.stop().await;

    let mut client = client;
    let reason = tokio::task::spawn_blocking(move || loop {
        if let BridgeMessage::Disconnected { reason, .. } = client.recv() {
            return reason;
        }
    })
    .await
    .unwrap();
    assert_eq!(reason.as_deref(), Some("shutdown"));
    assert!(!socket.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adapter_failure_during_scan_recovers() {
    let harness = Harness::start(SLOW_HEARTBEAT);
    let socket = harness.socket.clone();
    let adapter_tx = harness.tx.clone();

    tokio::task::spawn_blocking(move || {
        let mut client = TestClient::connect(&socket);
        client.recv_greeting();
        client.send(&ClientMessage::Scan { on: true });
        assert!(matches!(client.recv(), BridgeMessage::DeviceFound { .. }));

        adapter_tx
            .send(BridgeEvent::Adapter(AdapterEvent::Fatal(
                "Bluetooth adapter stopped responding during scan".to_string(),
            )))
            .unwrap();
        loop {
            match client.recv() {
                BridgeMessage::DeviceFound { .. } => continue,
                BridgeMessage::Error { code, .. } => {
                    assert_eq!(code, ErrorCode::AdapterFailure);
                    break;
                }
                other => panic!("expected adapter_failure, got {:?}", other),
            }
        }

        client.send(&ClientMessage::Status);
        match client.recv() {
            BridgeMessage::Status { state, connected, .. } => {
                assert_eq!(state, "idle");
                assert!(!connected);
            }
            other => panic!("expected status, got {:?}", other),
        }

        client.send(&ClientMessage::Scan { on: true });
        assert!(matches!(client.recv(), BridgeMessage::DeviceFound { .. }));
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[test]
fn test_frame_prefix_matches_encoder() {
    let frame = encode(&ClientMessage::Disconnect).unwrap();
    assert_eq!(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize, frame.len() - 4);
}
