//! Connect negotiation for one socket.
//!
//! After the socket opens, the client waits briefly for a `connect.challenge`
//! event. Whichever comes first, the challenge or the timer, sends the single
//! connect request; the other trigger finds the gate already closed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::config::{ClientInfo, GatewayConfig};

pub const CONNECT_METHOD: &str = "connect";
pub const CHALLENGE_EVENT: &str = "connect.challenge";
/// Close code the client uses when the gateway rejects the handshake.
pub const CONNECT_FAILED_CLOSE_CODE: u16 = 4008;
pub const CONNECT_FAILED_REASON: &str = "connect failed";

/// Why the handshake went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Challenge,
    Timer,
}

/// Per-socket, single-use handshake gate.
#[derive(Debug)]
pub struct HandshakeState {
    sent: bool,
    deadline: Option<Instant>,
}

impl HandshakeState {
    /// Arm the challenge timer for a freshly opened socket.
    pub fn arm(deadline: Instant) -> Self {
        Self {
            sent: false,
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Pass through the gate. Returns true exactly once per socket; every
    /// later trigger is a no-op. Cancels the timer either way.
    pub fn try_send(&mut self) -> bool {
        self.deadline = None;
        if self.sent {
            return false;
        }
        self.sent = true;
        true
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAuth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

impl ConnectParams {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            min_protocol: config.min_protocol,
            max_protocol: config.max_protocol,
            client: config.client.clone(),
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            auth: config
                .token
                .as_ref()
                .map(|token| ConnectAuth {
                    token: token.clone(),
                }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Successful connect response: the negotiated protocol plus the gateway's
/// capability manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HelloOk {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub features: Features,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl HelloOk {
    /// Lenient parse; a payload of the wrong shape yields an empty manifest.
    pub fn from_payload(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn supports_method(&self, method: &str) -> bool {
        self.features.methods.iter().any(|m| m == method)
    }

    pub fn supports_event(&self, event: &str) -> bool {
        self.features.events.iter().any(|e| e == event)
    }
}
