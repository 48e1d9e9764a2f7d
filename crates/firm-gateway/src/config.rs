//! Client configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::backoff::BackoffConfig;
use crate::error::GatewayError;
use crate::frame::DEFAULT_MAX_FRAME_BYTES;

pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_CHALLENGE_WAIT: Duration = Duration::from_millis(750);
pub const DEFAULT_ROLE: &str = "operator";
pub const DEFAULT_SCOPES: &[&str] = &["operator.read", "operator.write"];

pub const ENV_URL: &str = "FIRM_GATEWAY_URL";
pub const ENV_TOKEN: &str = "FIRM_GATEWAY_TOKEN";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "FIRM_GATEWAY_REQUEST_TIMEOUT_MS";
pub const ENV_JITTER: &str = "FIRM_GATEWAY_RECONNECT_JITTER";

/// Client ids the gateway recognizes. Anything else is refused at connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClientId {
    ControlUi,
    WebchatUi,
    Cli,
    GatewayClient,
    NodeHost,
    Test,
}

impl ClientId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientId::ControlUi => "control-ui",
            ClientId::WebchatUi => "webchat-ui",
            ClientId::Cli => "cli",
            ClientId::GatewayClient => "gateway-client",
            ClientId::NodeHost => "node-host",
            ClientId::Test => "test",
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "control-ui" => Ok(ClientId::ControlUi),
            "webchat-ui" => Ok(ClientId::WebchatUi),
            "cli" => Ok(ClientId::Cli),
            "gateway-client" => Ok(ClientId::GatewayClient),
            "node-host" => Ok(ClientId::NodeHost),
            "test" => Ok(ClientId::Test),
            other => Err(format!("Unknown client id: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    Ui,
    Webchat,
    Cli,
    Backend,
    Probe,
    Test,
}

impl ClientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Ui => "ui",
            ClientMode::Webchat => "webchat",
            ClientMode::Cli => "cli",
            ClientMode::Backend => "backend",
            ClientMode::Probe => "probe",
            ClientMode::Test => "test",
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity block sent in the connect request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub version: String,
    pub platform: String,
    pub mode: ClientMode,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: ClientId::ControlUi,
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: env::consts::OS.to_string(),
            mode: ClientMode::Ui,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    pub token: Option<String>,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
    /// How long to wait for a `connect.challenge` before sending the
    /// handshake unprompted.
    pub challenge_wait: Duration,
    pub backoff: BackoffConfig,
    /// Per-request timeout. `None` waits until the response or a disconnect.
    pub request_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            client: ClientInfo::default(),
            role: DEFAULT_ROLE.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            challenge_wait: DEFAULT_CHALLENGE_WAIT,
            backoff: BackoffConfig::default(),
            request_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Build from `FIRM_GATEWAY_*` environment variables.
    pub fn from_env() -> Result<Self, GatewayError> {
        let url = env_non_empty(ENV_URL)
            .ok_or_else(|| GatewayError::Config(format!("{ENV_URL} is not set")))?;
        let mut config = Self::new(url);
        config.token = env_non_empty(ENV_TOKEN);
        if let Some(raw) = env_non_empty(ENV_REQUEST_TIMEOUT_MS) {
            let ms = raw.trim().parse::<u64>().map_err(|err| {
                GatewayError::Config(format!("{ENV_REQUEST_TIMEOUT_MS}='{raw}': {err}"))
            })?;
            config.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(raw) = env_non_empty(ENV_JITTER) {
            config.backoff.jitter = raw
                .trim()
                .parse::<f64>()
                .map_err(|err| GatewayError::Config(format!("{ENV_JITTER}='{raw}': {err}")))?;
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn client(mut self, client: ClientInfo) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn protocol_range(mut self, min: u32, max: u32) -> Self {
        self.min_protocol = min;
        self.max_protocol = max;
        self
    }

    #[must_use]
    pub fn challenge_wait(mut self, wait: Duration) -> Self {
        self.challenge_wait = wait;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let url = Url::parse(&self.url)
            .map_err(|err| GatewayError::Config(format!("invalid url '{}': {err}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(GatewayError::Config(format!(
                "url scheme must be ws or wss, got '{}'",
                url.scheme()
            )));
        }
        if self.min_protocol > self.max_protocol {
            return Err(GatewayError::Config(format!(
                "min protocol {} exceeds max protocol {}",
                self.min_protocol, self.max_protocol
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(GatewayError::Config("max frame bytes must be > 0".to_string()));
        }
        self.backoff.validate().map_err(GatewayError::Config)
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
