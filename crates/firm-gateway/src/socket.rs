//! Transport seam between the reactor and the wire.
//!
//! A [`Connector`] opens one socket and hands back a [`SocketHandle`]: a
//! channel for outbound frames and a channel of inbound socket events. The
//! WebSocket implementation runs a small pump task per socket; tests plug in
//! their own connector.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::GatewayError;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code and reason exactly as the transport reported them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The socket went away without a close frame.
    pub fn abnormal() -> Self {
        Self::new(CLOSE_ABNORMAL, "")
    }

    /// Custom application range plus a reason mentioning auth. Whether to
    /// stop retrying is up to the owner.
    pub fn is_auth_failure(&self) -> bool {
        let reason = self.reason.to_lowercase();
        (4000..=4099).contains(&self.code)
            && (reason.contains("auth") || reason.contains("unauthorized"))
    }

    pub fn to_error(&self) -> GatewayError {
        GatewayError::ConnectionClosed {
            code: self.code,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(CloseInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed(CloseInfo),
}

/// One open socket. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct SocketHandle {
    pub outgoing: mpsc::UnboundedSender<Outbound>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketHandle {
    /// Queue a text frame. Returns false once the socket is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.outgoing.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self, info: CloseInfo) {
        let _ = self.outgoing.send(Outbound::Close(info));
    }
}

pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`. Resolves once the socket is open.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SocketHandle, GatewayError>>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SocketHandle, GatewayError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| GatewayError::Connect(err.to_string()))?;
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(ws, out_rx, in_tx));
            Ok(SocketHandle {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

async fn pump<S>(
    ws: S,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    in_tx: mpsc::UnboundedSender<SocketEvent>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        debug!("gateway_socket_send_error: {err}");
                        let _ = in_tx.send(SocketEvent::Closed(CloseInfo::abnormal()));
                        break;
                    }
                }
                Some(Outbound::Close(info)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(info.code),
                        reason: Cow::Owned(info.reason),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = in_tx.send(SocketEvent::Text(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    let info = frame
                        .map(|frame| CloseInfo::new(u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or_else(|| CloseInfo::new(CLOSE_NO_STATUS, ""));
                    let _ = in_tx.send(SocketEvent::Closed(info));
                    let _ = sink.close().await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("gateway_socket_read_error: {err}");
                    let _ = in_tx.send(SocketEvent::Closed(CloseInfo::abnormal()));
                    break;
                }
                None => {
                    let _ = in_tx.send(SocketEvent::Closed(CloseInfo::abnormal()));
                    break;
                }
            },
        }
    }
}
