//! Gateway protocol client for the firm operator dashboard.
//!
//! One persistent WebSocket carries correlated `req`/`res` frames and
//! server-pushed `event` frames. The client negotiates a `connect` handshake
//! on every socket and reconnects with capped exponential backoff until it
//! is stopped.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod listeners;
pub mod pending;
pub mod socket;

pub use backoff::{Backoff, BackoffConfig};
pub use client::GatewayClient;
pub use config::{ClientId, ClientInfo, ClientMode, GatewayConfig, PROTOCOL_VERSION};
pub use connection::ConnectionState;
pub use error::{GatewayError, GatewayResult, RemoteError};
pub use frame::{EventFrame, Frame, InboundFrame, RequestFrame, ResponseFrame};
pub use handler::GatewayHandler;
pub use handshake::{ConnectParams, Features, HelloOk, CHALLENGE_EVENT, CONNECT_FAILED_CLOSE_CODE};
pub use listeners::{EventListeners, Subscription};
pub use socket::{CloseInfo, Connector, Outbound, SocketEvent, SocketHandle, WsConnector};
