use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::connection::{Command, ConnectionState, Reactor};
use crate::error::{GatewayError, GatewayResult};
use crate::frame::FrameError;
use crate::handler::GatewayHandler;
use crate::socket::{Connector, WsConnector};

/// Cloneable handle to one gateway connection.
///
/// The owner constructs it, calls [`start`](Self::start) when the app
/// mounts and [`stop`](Self::stop) when it unmounts, and passes clones to
/// whoever needs to issue requests. Dropping every clone stops the
/// connection as well.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn GatewayHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, handler: impl GatewayHandler) -> GatewayResult<Self> {
        Self::with_connector(config, handler, WsConnector)
    }

    pub fn with_connector(
        config: GatewayConfig,
        handler: impl GatewayHandler,
        connector: impl Connector,
    ) -> GatewayResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                connector: Arc::new(connector),
                handler: Arc::new(handler),
                state: Arc::new(state),
                running: Mutex::new(None),
            }),
        })
    }

    /// Begin connecting. No-op while a connection loop is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        let (commands, rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.connector),
            Arc::clone(&self.inner.handler),
            rx,
            Arc::clone(&self.inner.state),
        );
        debug!(url = %self.inner.config.url, "gateway_client_start");
        *running = Some(Running {
            commands,
            task: tokio::spawn(reactor.run()),
        });
    }

    /// Stop reconnecting, close the socket and fail every outstanding
    /// request with [`GatewayError::ClientStopped`]. Returns once that has
    /// happened.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        let (done, done_rx) = oneshot::channel();
        if running.commands.send(Command::Stop { done }).is_ok() {
            let _ = done_rx.await;
        }
        let _ = running.task.await;
    }

    /// Send `method` and deserialize the response payload into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> GatewayResult<T> {
        let payload = self.dispatch(method, params, None).await?;
        decode_payload(payload)
    }

    pub async fn request_value(&self, method: &str, params: impl Serialize) -> GatewayResult<Value> {
        self.dispatch(method, params, None).await
    }

    /// Like [`request`](Self::request), failing with
    /// [`GatewayError::Timeout`] if no response arrives within `timeout`.
    pub async fn request_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
        timeout: Duration,
    ) -> GatewayResult<T> {
        let payload = self.dispatch(method, params, Some(timeout)).await?;
        decode_payload(payload)
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    async fn dispatch(
        &self,
        method: &str,
        params: impl Serialize,
        timeout: Option<Duration>,
    ) -> GatewayResult<Value> {
        if !self.state().is_socket_open() {
            return Err(GatewayError::NotConnected);
        }
        let commands = self
            .running()
            .as_ref()
            .map(|running| running.commands.clone())
            .ok_or(GatewayError::NotConnected)?;
        let params = serde_json::to_value(params)
            .map_err(|err| GatewayError::Frame(FrameError::Encode(err.to_string())))?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                timeout,
                reply,
            })
            .map_err(|_| GatewayError::NotConnected)?;
        rx.await.unwrap_or(Err(GatewayError::ClientStopped))
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Value) -> GatewayResult<T> {
    serde_json::from_value(payload).map_err(|err| GatewayError::InvalidPayload(err.to_string()))
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}
