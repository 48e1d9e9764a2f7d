#![allow(dead_code)]

use firm_gateway::{
    ClientId, ClientInfo, ClientMode, CloseInfo, ConnectionState, Connector, EventFrame,
    GatewayClient, GatewayConfig, GatewayError, GatewayHandler, HelloOk, Outbound, RemoteError,
    RequestFrame, SocketEvent, SocketHandle,
};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Server end of one in-memory socket.
pub struct ServerSocket {
    pub to_client: mpsc::UnboundedSender<SocketEvent>,
    pub from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl ServerSocket {
    pub fn send_raw(&self, text: &str) {
        self.to_client
            .send(SocketEvent::Text(text.to_string()))
            .expect("client socket open");
    }

    pub fn send_json(&self, value: Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_event(&self, event: &str, payload: Value, seq: Option<u64>) {
        let mut frame = json!({"type": "event", "event": event, "payload": payload});
        if let Some(seq) = seq {
            frame["seq"] = json!(seq);
        }
        self.send_json(frame);
    }

    pub fn reply_ok(&self, id: &str, payload: Value) {
        self.send_json(json!({"type": "res", "id": id, "ok": true, "payload": payload}));
    }

    pub fn reply_err(&self, id: &str, code: &str, message: &str) {
        self.send_json(json!({
            "type": "res",
            "id": id,
            "ok": false,
            "error": {"code": code, "message": message}
        }));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(SocketEvent::Closed(CloseInfo::new(code, reason)));
    }

    pub async fn next_outbound(&mut self) -> Outbound {
        self.from_client.recv().await.expect("client frame")
    }

    pub async fn next_request(&mut self) -> RequestFrame {
        match self.next_outbound().await {
            Outbound::Text(text) => {
                let value: Value = serde_json::from_str(&text).expect("client sent json");
                assert_eq!(value["type"], "req");
                serde_json::from_value(value).expect("request frame")
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    pub fn try_next(&mut self) -> Option<Outbound> {
        self.from_client.try_recv().ok()
    }

    /// Challenge, read the connect request, accept it.
    pub async fn complete_handshake(&mut self) -> RequestFrame {
        self.send_event("connect.challenge", json!({"nonce": "n-1"}), None);
        let connect = self.next_request().await;
        assert_eq!(connect.method, "connect");
        self.reply_ok(
            &connect.id,
            json!({
                "type": "hello-ok",
                "protocol": 3,
                "features": {
                    "methods": ["agents.list", "services.list", "incidents.list"],
                    "events": ["tick", "incident.opened"]
                }
            }),
        );
        connect
    }
}

#[derive(Clone)]
pub struct MockConnector {
    sockets: mpsc::UnboundedSender<ServerSocket>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl Connector for MockConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<SocketHandle, GatewayError>> {
        self.attempts.lock().expect("attempts").push(Instant::now());
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Box::pin(async { Err(GatewayError::Connect("connection refused".to_string())) });
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.sockets.send(ServerSocket {
            to_client: in_tx,
            from_client: out_rx,
        });
        Box::pin(async move {
            Ok(SocketHandle {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

pub struct MockGateway {
    sockets: mpsc::UnboundedReceiver<ServerSocket>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl MockGateway {
    pub async fn accept(&mut self) -> ServerSocket {
        self.sockets.recv().await.expect("connect attempt")
    }

    pub fn try_accept(&mut self) -> Option<ServerSocket> {
        self.sockets.try_recv().ok()
    }

    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().expect("attempts").clone()
    }
}

pub fn mock_gateway() -> (MockConnector, MockGateway) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refusals = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    (
        MockConnector {
            sockets: tx,
            refusals: Arc::clone(&refusals),
            attempts: Arc::clone(&attempts),
        },
        MockGateway {
            sockets: rx,
            refusals,
            attempts,
        },
    )
}

#[derive(Default)]
pub struct Recorder {
    hellos: Mutex<Vec<HelloOk>>,
    events: Mutex<Vec<EventFrame>>,
    closes: Mutex<Vec<CloseInfo>>,
    gaps: Mutex<Vec<(u64, u64)>>,
    rejections: Mutex<Vec<RemoteError>>,
    connected: AtomicUsize,
}

impl Recorder {
    pub fn hellos(&self) -> Vec<HelloOk> {
        self.hellos.lock().expect("hellos").clone()
    }

    pub fn events(&self) -> Vec<EventFrame> {
        self.events.lock().expect("events").clone()
    }

    pub fn closes(&self) -> Vec<CloseInfo> {
        self.closes.lock().expect("closes").clone()
    }

    pub fn gaps(&self) -> Vec<(u64, u64)> {
        self.gaps.lock().expect("gaps").clone()
    }

    pub fn rejections(&self) -> Vec<RemoteError> {
        self.rejections.lock().expect("rejections").clone()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }
}

impl GatewayHandler for Recorder {
    fn on_hello(&self, hello: &HelloOk) {
        self.hellos.lock().expect("hellos").push(hello.clone());
    }

    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_event(&self, event: &EventFrame) {
        self.events.lock().expect("events").push(event.clone());
    }

    fn on_close(&self, close: &CloseInfo) {
        self.closes.lock().expect("closes").push(close.clone());
    }

    fn on_gap(&self, expected: u64, received: u64) {
        self.gaps.lock().expect("gaps").push((expected, received));
    }

    fn on_handshake_rejected(&self, error: &RemoteError) {
        self.rejections.lock().expect("rejections").push(error.clone());
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig::new("ws://gateway.test/ws").client(ClientInfo {
        id: ClientId::Test,
        mode: ClientMode::Test,
        ..ClientInfo::default()
    })
}

pub fn setup(config: GatewayConfig) -> (GatewayClient, MockGateway, Arc<Recorder>) {
    let (connector, gateway) = mock_gateway();
    let recorder = Arc::new(Recorder::default());
    let client = GatewayClient::with_connector(config, Arc::clone(&recorder), connector)
        .expect("valid config");
    (client, gateway, recorder)
}

/// Start the client and take it through a challenge-driven handshake.
pub async fn connect(client: &GatewayClient, gateway: &mut MockGateway) -> ServerSocket {
    client.start();
    let mut server = gateway.accept().await;
    server.complete_handshake().await;
    wait_for_state(client, ConnectionState::Connected).await;
    server
}

pub async fn wait_for_state(client: &GatewayClient, want: ConnectionState) {
    let mut rx = client.watch_state();
    while *rx.borrow_and_update() != want {
        rx.changed().await.expect("state channel open");
    }
}

pub fn assert_elapsed(from: Instant, to: Instant, expected_ms: u64) {
    let elapsed = to.duration_since(from);
    let expected = Duration::from_millis(expected_ms);
    let slack = Duration::from_millis(1);
    assert!(
        elapsed + slack >= expected && elapsed <= expected + slack,
        "expected ~{expected_ms}ms, got {elapsed:?}"
    );
}
