use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use firm_gateway::config::{ENV_TOKEN, ENV_URL};
use firm_gateway::{
    ClientId, ClientInfo, ClientMode, CloseInfo, ConnectionState, EventFrame, GatewayClient,
    GatewayConfig, GatewayHandler, HelloOk, RemoteError,
};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "firm-gateway-probe", about = "Connect to a gateway, issue one request, tail events")]
struct Args {
    /// Gateway WebSocket URL. Falls back to FIRM_GATEWAY_URL.
    #[arg(long)]
    url: Option<String>,
    /// Shared token. Falls back to FIRM_GATEWAY_TOKEN.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    method: Option<String>,
    /// Request params as JSON.
    #[arg(long, default_value = "{}")]
    params: String,
    /// Keep printing events for this many seconds after the request.
    #[arg(long, default_value_t = 0)]
    tail: u64,
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

/// Writes every callback as one JSON line on stdout.
struct ProbeHandler;

impl ProbeHandler {
    fn emit(&self, kind: &str, body: Value) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "body": body,
        });
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

impl GatewayHandler for ProbeHandler {
    fn on_hello(&self, hello: &HelloOk) {
        self.emit("hello", serde_json::to_value(hello).unwrap_or(Value::Null));
    }

    fn on_event(&self, event: &EventFrame) {
        self.emit("event", serde_json::to_value(event).unwrap_or(Value::Null));
    }

    fn on_close(&self, close: &CloseInfo) {
        self.emit(
            "close",
            json!({"code": close.code, "reason": close.reason, "auth": close.is_auth_failure()}),
        );
    }

    fn on_gap(&self, expected: u64, received: u64) {
        self.emit("gap", json!({"expected": expected, "received": received}));
    }

    fn on_handshake_rejected(&self, error: &RemoteError) {
        self.emit("rejected", json!({"code": error.code, "message": error.message}));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = resolve_config(&args)?;
    let params: Value = serde_json::from_str(&args.params)
        .with_context(|| format!("--params is not valid JSON: {}", args.params))?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let client = GatewayClient::new(config, ProbeHandler).context("invalid gateway config")?;
    client.start();
    let outcome = tokio::select! {
        result = run(&client, args.method.as_deref(), params, timeout, args.tail) => result,
        _ = tokio::signal::ctrl_c() => {
            debug!("probe_interrupted");
            Ok(())
        }
    };
    client.stop().await;
    outcome
}

async fn run(
    client: &GatewayClient,
    method: Option<&str>,
    params: Value,
    timeout: Duration,
    tail: u64,
) -> Result<()> {
    tokio::time::timeout(timeout, wait_connected(client))
        .await
        .with_context(|| format!("not connected after {}ms", timeout.as_millis()))?;

    if let Some(method) = method {
        let payload: Value = client
            .request_with_timeout(method, params, timeout)
            .await
            .with_context(|| format!("{method} failed"))?;
        ProbeHandler.emit("response", json!({"method": method, "payload": payload}));
    }

    if tail > 0 {
        tokio::time::sleep(Duration::from_secs(tail)).await;
    }
    Ok(())
}

async fn wait_connected(client: &GatewayClient) {
    let mut state = client.watch_state();
    loop {
        let current = *state.borrow_and_update();
        if current == ConnectionState::Connected {
            return;
        }
        debug!(state = current.as_str(), "probe_waiting");
        if state.changed().await.is_err() {
            warn!("probe_state_channel_closed");
            return;
        }
    }
}

fn resolve_config(args: &Args) -> Result<GatewayConfig> {
    let url = args
        .url
        .clone()
        .or_else(|| env_non_empty(ENV_URL))
        .filter(|url| !url.trim().is_empty());
    let Some(url) = url else {
        bail!("no gateway url: pass --url or set {ENV_URL}");
    };
    let mut config = GatewayConfig::new(url.trim()).client(ClientInfo {
        id: ClientId::Cli,
        mode: ClientMode::Probe,
        ..ClientInfo::default()
    });
    if let Some(token) = args.token.clone().or_else(|| env_non_empty(ENV_TOKEN)) {
        config = config.token(token);
    }
    config.validate()?;
    Ok(config)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FIRM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries the JSON lines, logs go to stderr.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(io::stderr))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
