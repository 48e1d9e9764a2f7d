mod mock_data;

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use clap::Parser;
use firm_gateway::frame::{decode_request, encode_frame};
use firm_gateway::handshake::CONNECT_METHOD;
use firm_gateway::{
    ConnectParams, EventFrame, Features, Frame, HelloOk, RemoteError, RequestFrame,
    ResponseFrame, CHALLENGE_EVENT, PROTOCOL_VERSION,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:18789";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    token: Option<String>,
    challenge: bool,
    tick_interval: Option<Duration>,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "firm-mock-gateway")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Require this token in the connect request. Falls back to
    /// FIRM_GATEWAY_TOKEN.
    #[arg(long)]
    token: Option<String>,
    /// Skip the connect.challenge so clients fall back to their timer.
    #[arg(long, default_value_t = false)]
    no_challenge: bool,
    /// Seconds between tick events, 0 disables them.
    #[arg(long, default_value_t = 5)]
    tick_secs: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct GatewayState {
    config: Config,
    ticks: broadcast::Sender<EventFrame>,
    next_conn: AtomicU64,
    open_conns: AtomicU64,
    started: Instant,
}

struct Session {
    conn_id: String,
    authed: bool,
}

impl GatewayState {
    fn new(config: Config) -> Self {
        let (ticks, _) = broadcast::channel(64);
        Self {
            config,
            ticks,
            next_conn: AtomicU64::new(1),
            open_conns: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn start_ticker(self: Arc<Self>) {
        let Some(every) = self.config.tick_interval else {
            return;
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            let mut seq = 0u64;
            loop {
                interval.tick().await;
                seq += 1;
                let mut tick = EventFrame::new("tick", json!({"ts": Utc::now().timestamp_millis()}));
                tick.seq = Some(seq);
                // No subscribers is fine.
                let _ = self.ticks.send(tick);
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let conn_id = format!("conn-{}", self.next_conn.fetch_add(1, Ordering::SeqCst));
        let open = self.open_conns.fetch_add(1, Ordering::SeqCst) + 1;
        info!(event = "socket_open", conn_id = %conn_id, remote = %remote, open);

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let write_conn = conn_id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = ws_sender.send(Message::Text(text)).await {
                    warn!(event = "write_error", conn_id = %write_conn, error = %err);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut session = Session {
            conn_id,
            authed: false,
        };
        let mut ticks = self.ticks.subscribe();

        if self.config.challenge {
            let nonce = format!("{}-{}", session.conn_id, Utc::now().timestamp_micros());
            let challenge = EventFrame::new(
                CHALLENGE_EVENT,
                json!({"nonce": nonce, "ts": Utc::now().timestamp_millis()}),
            );
            send_frame(&tx, &session.conn_id, &Frame::Event(challenge));
        }

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    let message = match inbound {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            warn!(event = "read_error", conn_id = %session.conn_id, error = %err);
                            break;
                        }
                        None => break,
                    };
                    match message {
                        Message::Text(text) => {
                            if self.config.debug {
                                debug!(event = "frame_received", conn_id = %session.conn_id, raw = %text);
                            }
                            let request = match decode_request(&text) {
                                Ok(request) => request,
                                Err(err) => {
                                    warn!(event = "frame_invalid", conn_id = %session.conn_id, error = %err);
                                    continue;
                                }
                            };
                            let response = self.handle_request(&mut session, request);
                            send_frame(&tx, &session.conn_id, &Frame::Response(response));
                        }
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|frame| (frame.code, frame.reason.into_owned()))
                                .unwrap_or((1005, String::new()));
                            info!(event = "client_close", conn_id = %session.conn_id, code, reason = %reason);
                            break;
                        }
                        Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
                tick = ticks.recv() => match tick {
                    Ok(tick) => {
                        if session.authed {
                            send_frame(&tx, &session.conn_id, &Frame::Event(tick));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "tick_lagged", conn_id = %session.conn_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let open = self.open_conns.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(event = "socket_closed", conn_id = %session.conn_id, open);
        drop(tx);
        let _ = write_task.await;
    }

    fn handle_request(&self, session: &mut Session, request: RequestFrame) -> ResponseFrame {
        if request.method == CONNECT_METHOD {
            return self.handle_connect(session, request);
        }
        if !session.authed {
            return ResponseFrame::failure(
                request.id,
                RemoteError::new("E_NOT_CONNECTED", "send connect first"),
            );
        }
        debug!(event = "request", conn_id = %session.conn_id, method = %request.method);
        if request.method == "health" {
            return ResponseFrame::success(request.id, self.health());
        }
        match mock_data::lookup(&request.method, &request.params) {
            Some(payload) => ResponseFrame::success(request.id, payload),
            None => ResponseFrame::failure(
                request.id,
                RemoteError::new(
                    "E_UNKNOWN_METHOD",
                    format!("unknown method: {}", request.method),
                ),
            ),
        }
    }

    fn handle_connect(&self, session: &mut Session, request: RequestFrame) -> ResponseFrame {
        if session.authed {
            return ResponseFrame::failure(
                request.id,
                RemoteError::new("E_ALREADY_CONNECTED", "connect already accepted"),
            );
        }
        let params: ConnectParams = match serde_json::from_value(request.params) {
            Ok(params) => params,
            Err(err) => {
                return ResponseFrame::failure(
                    request.id,
                    RemoteError::new("E_INVALID_PARAMS", format!("bad connect params: {err}")),
                )
            }
        };
        if !(params.min_protocol..=params.max_protocol).contains(&PROTOCOL_VERSION) {
            warn!(
                event = "connect_protocol_mismatch",
                conn_id = %session.conn_id,
                min = params.min_protocol,
                max = params.max_protocol
            );
            return ResponseFrame::failure(
                request.id,
                RemoteError::new(
                    "E_PROTOCOL",
                    format!("server speaks protocol {PROTOCOL_VERSION}"),
                ),
            );
        }
        if let Some(expected) = &self.config.token {
            let presented = params.auth.as_ref().map(|auth| auth.token.as_str());
            if presented != Some(expected.as_str()) {
                warn!(event = "connect_auth_failed", conn_id = %session.conn_id, client = %params.client.id);
                return ResponseFrame::failure(request.id, RemoteError::new("E_AUTH", "invalid token"));
            }
        }

        session.authed = true;
        info!(
            event = "connect_ok",
            conn_id = %session.conn_id,
            client = %params.client.id,
            mode = %params.client.mode,
            version = %params.client.version,
            role = %params.role
        );
        let mut extra = Map::new();
        extra.insert(
            "server".to_string(),
            json!({"name": "firm-mock-gateway", "connId": session.conn_id}),
        );
        let hello = HelloOk {
            kind: "hello-ok".to_string(),
            protocol: Some(PROTOCOL_VERSION),
            features: Features {
                methods: mock_data::METHODS.iter().map(|m| m.to_string()).collect(),
                events: mock_data::EVENTS.iter().map(|e| e.to_string()).collect(),
            },
            extra,
        };
        match serde_json::to_value(hello) {
            Ok(payload) => ResponseFrame::success(request.id, payload),
            Err(err) => ResponseFrame::failure(request.id, RemoteError::new("E_INTERNAL", err.to_string())),
        }
    }

    fn health(&self) -> Value {
        json!({
            "status": "ok",
            "uptimeMs": self.started.elapsed().as_millis() as u64,
            "connections": self.open_conns.load(Ordering::SeqCst),
            "ts": Utc::now().to_rfc3339(),
        })
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, conn_id: &str, frame: &Frame) {
    match encode_frame(frame) {
        Ok(text) => {
            let _ = tx.send(text);
        }
        Err(err) => warn!(event = "frame_encode_error", conn_id = %conn_id, error = %err),
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_addr", addr = %config.addr);
    }

    let gateway = Arc::new(GatewayState::new(config.clone()));
    gateway.clone().start_ticker();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(gateway);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "gateway_error", error = %err);
            return;
        }
    };

    info!(
        event = "gateway_start",
        addr = %config.addr,
        auth = config.token.is_some(),
        challenge = config.challenge
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "gateway_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        gateway.handle_socket(socket, addr).await;
    })
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = if args.addr.trim().is_empty() {
        std::env::var("FIRM_MOCK_GATEWAY_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
    } else {
        args.addr
    };
    let token = args.token.or_else(|| {
        std::env::var("FIRM_GATEWAY_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty())
    });
    Config {
        addr,
        token,
        challenge: !args.no_challenge,
        tick_interval: (args.tick_secs > 0).then(|| Duration::from_secs(args.tick_secs)),
        debug: args.debug,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FIRM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(std::io::stdout))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
