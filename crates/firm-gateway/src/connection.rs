//! The connection reactor.
//!
//! One task per started client owns the socket, the pending-call table, the
//! handshake gate and the backoff state. Every state transition is a reaction
//! to exactly one of: a socket event, a timer, or a command from a client
//! handle. Nothing here is shared, so nothing is locked.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::frame::{decode_inbound, encode_request, InboundFrame, RequestFrame};
use crate::handler::GatewayHandler;
use crate::handshake::{
    ConnectParams, HandshakeState, HelloOk, Trigger, CHALLENGE_EVENT, CONNECT_FAILED_CLOSE_CODE,
    CONNECT_FAILED_REASON, CONNECT_METHOD,
};
use crate::pending::{CallResult, Continuation, PendingCalls, Settled};
use crate::socket::{CloseInfo, Connector, SocketEvent, SocketHandle, CLOSE_NORMAL};

pub const STOPPED_REASON: &str = "client stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Opening,
    /// Socket open, connect request not yet answered.
    HandshakePending,
    Connected,
    /// Socket gone, next attempt scheduled.
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Requests may be sent while the socket is open, handshake or not.
    pub fn is_socket_open(self) -> bool {
        matches!(
            self,
            ConnectionState::HandshakePending | ConnectionState::Connected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Opening => "opening",
            ConnectionState::HandshakePending => "handshake_pending",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Request {
        method: String,
        params: Value,
        timeout: Option<Duration>,
        reply: oneshot::Sender<CallResult>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

enum SessionEnd {
    Closed(CloseInfo),
    /// `None` when every client handle was dropped.
    Stopped(Option<oneshot::Sender<()>>),
}

enum Step {
    Continue,
    End(SessionEnd),
}

enum Offline<T> {
    Ready(T),
    Stop(Option<oneshot::Sender<()>>),
}

pub(crate) struct Reactor {
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn GatewayHandler>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    pending: PendingCalls,
    backoff: Backoff,
}

impl Reactor {
    pub(crate) fn new(
        config: Arc<GatewayConfig>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn GatewayHandler>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            config,
            connector,
            handler,
            commands,
            state,
            pending: PendingCalls::new(),
            backoff,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Opening);
            debug!(url = %self.config.url, "gateway_connecting");
            let connect = self.connector.connect(&self.config.url);
            let opened = match self.wait_offline(connect).await {
                Offline::Ready(opened) => opened,
                Offline::Stop(done) => return self.finish(done, None),
            };

            let end = match opened {
                Ok(socket) => self.run_session(socket).await,
                Err(err) => {
                    warn!("gateway_connect_error: {err}");
                    SessionEnd::Closed(CloseInfo::abnormal())
                }
            };
            match end {
                SessionEnd::Closed(close) => self.on_socket_closed(close),
                SessionEnd::Stopped(done) => {
                    return self.finish(done, Some(CloseInfo::new(CLOSE_NORMAL, STOPPED_REASON)))
                }
            }

            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "gateway_reconnect_scheduled");
            if let Offline::Stop(done) = self.wait_offline(tokio::time::sleep(delay)).await {
                return self.finish(done, None);
            }
        }
    }

    /// Drive `fut` while no socket is open. Requests arriving meanwhile fail
    /// fast; a stop request wins over `fut`.
    async fn wait_offline<F: Future>(&mut self, fut: F) -> Offline<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Offline::Ready(output),
                command = self.commands.recv() => match command {
                    Some(Command::Request { reply, .. }) => {
                        let _ = reply.send(Err(GatewayError::NotConnected));
                    }
                    Some(Command::Stop { done }) => return Offline::Stop(Some(done)),
                    None => return Offline::Stop(None),
                },
            }
        }
    }

    async fn run_session(&mut self, mut socket: SocketHandle) -> SessionEnd {
        self.set_state(ConnectionState::HandshakePending);
        let mut handshake = HandshakeState::arm(Instant::now() + self.config.challenge_wait);
        let mut last_seq: Option<u64> = None;

        loop {
            let step = tokio::select! {
                event = socket.incoming.recv() => match event {
                    Some(SocketEvent::Text(text)) => {
                        self.on_text(&text, &socket, &mut handshake, &mut last_seq)
                    }
                    Some(SocketEvent::Closed(close)) => Step::End(SessionEnd::Closed(close)),
                    None => Step::End(SessionEnd::Closed(CloseInfo::abnormal())),
                },
                () = sleep_until_opt(handshake.deadline()) => {
                    self.send_handshake(&socket, &mut handshake, Trigger::Timer)
                }
                () = sleep_until_opt(self.pending.next_deadline()) => {
                    let expired = self.pending.expire(Instant::now());
                    debug!(expired, "gateway_requests_timed_out");
                    Step::Continue
                }
                command = self.commands.recv() => match command {
                    Some(Command::Request { method, params, timeout, reply }) => {
                        self.send_request(&socket, method, params, timeout, reply);
                        Step::Continue
                    }
                    Some(Command::Stop { done }) => {
                        socket.close(CloseInfo::new(CLOSE_NORMAL, STOPPED_REASON));
                        Step::End(SessionEnd::Stopped(Some(done)))
                    }
                    None => {
                        socket.close(CloseInfo::new(CLOSE_NORMAL, STOPPED_REASON));
                        Step::End(SessionEnd::Stopped(None))
                    }
                },
            };
            if let Step::End(end) = step {
                handshake.cancel();
                return end;
            }
        }
    }

    fn on_text(
        &mut self,
        text: &str,
        socket: &SocketHandle,
        handshake: &mut HandshakeState,
        last_seq: &mut Option<u64>,
    ) -> Step {
        let frame = match decode_inbound(text, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("gateway_frame_dropped: {err}");
                return Step::Continue;
            }
        };
        match frame {
            InboundFrame::Event(event) => {
                if event.event == CHALLENGE_EVENT {
                    return self.send_handshake(socket, handshake, Trigger::Challenge);
                }
                if let Some(seq) = event.seq {
                    if let Some(expected) = last_seq.and_then(|last| last.checked_add(1)) {
                        if seq > expected {
                            warn!("gateway_event_gap: expected={expected} received={seq}");
                            self.handler.on_gap(expected, seq);
                        }
                    }
                    *last_seq = Some(seq);
                }
                self.handler.on_event(&event);
                Step::Continue
            }
            InboundFrame::Response(response) => {
                let id = response.id.clone();
                match self.pending.settle(&id, response.into_result()) {
                    None => {
                        debug!(id = %id, "gateway_response_unmatched");
                        Step::Continue
                    }
                    Some(Settled::Caller) => Step::Continue,
                    Some(Settled::Handshake(Ok(payload))) => {
                        self.on_hello(&payload);
                        Step::Continue
                    }
                    Some(Settled::Handshake(Err(err))) => {
                        let rejected = GatewayError::HandshakeRejected(err.clone());
                        warn!("gateway_handshake_rejected: {rejected}");
                        self.handler.on_handshake_rejected(&err);
                        let close = CloseInfo::new(CONNECT_FAILED_CLOSE_CODE, CONNECT_FAILED_REASON);
                        socket.close(close.clone());
                        Step::End(SessionEnd::Closed(close))
                    }
                }
            }
        }
    }

    fn send_handshake(
        &mut self,
        socket: &SocketHandle,
        handshake: &mut HandshakeState,
        trigger: Trigger,
    ) -> Step {
        if !handshake.try_send() {
            debug!(?trigger, "gateway_handshake_already_sent");
            return Step::Continue;
        }
        let params = match serde_json::to_value(ConnectParams::from_config(&self.config)) {
            Ok(params) => params,
            Err(err) => {
                warn!("gateway_handshake_encode_error: {err}");
                return Step::Continue;
            }
        };
        let id = self.pending.next_id();
        self.pending.register(id.clone(), Continuation::Handshake, None);
        debug!(?trigger, id = %id, "gateway_handshake_sent");
        if let Err(err) = self.send_frame(socket, &id, CONNECT_METHOD, params) {
            debug!("gateway_handshake_send_error: {err}");
            self.pending.fail(&id, err);
        }
        Step::Continue
    }

    fn send_request(
        &mut self,
        socket: &SocketHandle,
        method: String,
        params: Value,
        timeout: Option<Duration>,
        reply: oneshot::Sender<CallResult>,
    ) {
        let id = self.pending.next_id();
        let timeout = timeout.or(self.config.request_timeout);
        self.pending.register(id.clone(), Continuation::Caller(reply), timeout);
        if let Err(err) = self.send_frame(socket, &id, &method, params) {
            self.pending.fail(&id, err);
        }
    }

    fn send_frame(
        &self,
        socket: &SocketHandle,
        id: &str,
        method: &str,
        params: Value,
    ) -> Result<(), GatewayError> {
        let text = encode_request(&RequestFrame {
            id: id.to_string(),
            method: method.to_string(),
            params,
        })?;
        if socket.send_text(text) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn on_hello(&mut self, payload: &Value) {
        let hello = HelloOk::from_payload(payload);
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);
        info!(
            protocol = ?hello.protocol,
            methods = hello.features.methods.len(),
            events = hello.features.events.len(),
            "gateway_connected"
        );
        self.handler.on_connected();
        self.handler.on_hello(&hello);
    }

    fn on_socket_closed(&mut self, close: CloseInfo) {
        self.set_state(ConnectionState::Reconnecting);
        let flushed = self.pending.flush_all(&close.to_error());
        info!(
            code = close.code,
            reason = %close.reason,
            flushed,
            "gateway_closed"
        );
        self.handler.on_close(&close);
    }

    fn finish(&mut self, done: Option<oneshot::Sender<()>>, close: Option<CloseInfo>) {
        let flushed = self.pending.flush_all(&GatewayError::ClientStopped);
        self.set_state(ConnectionState::Stopped);
        info!(flushed, "gateway_client_stopped");
        if let Some(close) = close {
            self.handler.on_close(&close);
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "gateway_state");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
