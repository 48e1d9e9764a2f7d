use std::sync::Arc;

use crate::error::RemoteError;
use crate::frame::EventFrame;
use crate::handshake::HelloOk;
use crate::socket::CloseInfo;

/// Owner callbacks. All of them run on the connection task in the order the
/// transport delivered the underlying frames, so they must not block.
pub trait GatewayHandler: Send + Sync + 'static {
    /// Handshake accepted; carries the gateway's capability manifest.
    fn on_hello(&self, _hello: &HelloOk) {}

    /// Fired right before `on_hello`, once the client counts as connected.
    fn on_connected(&self) {}

    /// Every inbound event except `connect.challenge`.
    fn on_event(&self, _event: &EventFrame) {}

    /// The socket closed, for any reason. Code and reason are passed through
    /// unchanged.
    fn on_close(&self, _close: &CloseInfo) {}

    /// An event's `seq` skipped ahead of the last one seen on this socket.
    fn on_gap(&self, _expected: u64, _received: u64) {}

    fn on_handshake_rejected(&self, _error: &RemoteError) {}
}

impl GatewayHandler for () {}

impl<T: GatewayHandler + ?Sized> GatewayHandler for Arc<T> {
    fn on_hello(&self, hello: &HelloOk) {
        (**self).on_hello(hello);
    }

    fn on_connected(&self) {
        (**self).on_connected();
    }

    fn on_event(&self, event: &EventFrame) {
        (**self).on_event(event);
    }

    fn on_close(&self, close: &CloseInfo) {
        (**self).on_close(close);
    }

    fn on_gap(&self, expected: u64, received: u64) {
        (**self).on_gap(expected, received);
    }

    fn on_handshake_rejected(&self, error: &RemoteError) {
        (**self).on_handshake_rejected(error);
    }
}
