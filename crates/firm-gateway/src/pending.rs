//! In-flight request bookkeeping.
//!
//! The table is owned by the connection reactor and never shared, so it is a
//! plain map with no interior locking.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult, RemoteError};

pub type CallResult = GatewayResult<Value>;

/// Who is waiting on a response.
#[derive(Debug)]
pub enum Continuation {
    Caller(oneshot::Sender<CallResult>),
    /// The connect request; its outcome is consumed by the reactor itself.
    Handshake,
}

#[derive(Debug)]
pub struct PendingCall {
    pub continuation: Continuation,
    pub deadline: Option<(Instant, Duration)>,
}

/// What a resolved or rejected entry was waiting on.
#[derive(Debug, PartialEq)]
pub enum Settled {
    Caller,
    Handshake(Result<Value, RemoteError>),
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<String, PendingCall>,
    next_id: u64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation id. Ids are never reused by one table.
    pub fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub fn register(&mut self, id: String, continuation: Continuation, timeout: Option<Duration>) {
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
        self.calls.insert(
            id,
            PendingCall {
                continuation,
                deadline,
            },
        );
    }

    /// Settle the call registered under `id` with a server response.
    /// Unknown ids return `None`.
    pub fn settle(&mut self, id: &str, outcome: Result<Value, RemoteError>) -> Option<Settled> {
        let call = self.calls.remove(id)?;
        match call.continuation {
            Continuation::Caller(tx) => {
                let _ = tx.send(outcome.map_err(GatewayError::Remote));
                Some(Settled::Caller)
            }
            Continuation::Handshake => Some(Settled::Handshake(outcome)),
        }
    }

    pub fn resolve(&mut self, id: &str, payload: Value) -> Option<Settled> {
        self.settle(id, Ok(payload))
    }

    pub fn reject(&mut self, id: &str, error: RemoteError) -> Option<Settled> {
        self.settle(id, Err(error))
    }

    /// Fail one caller with a local error, e.g. when its frame could not be sent.
    pub fn fail(&mut self, id: &str, error: GatewayError) -> bool {
        match self.calls.remove(id) {
            Some(PendingCall {
                continuation: Continuation::Caller(tx),
                ..
            }) => {
                let _ = tx.send(Err(error));
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Reject every registered call once and empty the table. Returns how
    /// many callers were notified.
    pub fn flush_all(&mut self, error: &GatewayError) -> usize {
        let mut notified = 0;
        for (_, call) in self.calls.drain() {
            if let Continuation::Caller(tx) = call.continuation {
                let _ = tx.send(Err(error.clone()));
                notified += 1;
            }
        }
        notified
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls
            .values()
            .filter_map(|call| call.deadline.map(|(at, _)| at))
            .min()
    }

    /// Reject calls whose deadline has passed with `GatewayError::Timeout`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| matches!(call.deadline, Some((at, _)) if at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut count = 0;
        for id in expired {
            if let Some(call) = self.calls.remove(&id) {
                if let (Continuation::Caller(tx), Some((_, timeout))) =
                    (call.continuation, call.deadline)
                {
                    let _ = tx.send(Err(GatewayError::Timeout(timeout)));
                }
                count += 1;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caller(table: &mut PendingCalls) -> (String, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let id = table.next_id();
        table.register(id.clone(), Continuation::Caller(tx), None);
        (id, rx)
    }

    #[test]
    fn ids_increase_in_allocation_order() {
        let mut table = PendingCalls::new();
        assert_eq!(table.next_id(), "1");
        assert_eq!(table.next_id(), "2");
        assert_eq!(table.next_id(), "3");
    }

    #[test]
    fn responses_correlate_by_id_not_arrival_order() {
        let mut table = PendingCalls::new();
        let (a, mut rx_a) = caller(&mut table);
        let (b, mut rx_b) = caller(&mut table);
        let (c, mut rx_c) = caller(&mut table);

        assert_eq!(table.resolve(&c, json!("c")), Some(Settled::Caller));
        assert_eq!(table.resolve(&a, json!("a")), Some(Settled::Caller));
        assert_eq!(
            table.reject(&b, RemoteError::new("E_X", "b failed")),
            Some(Settled::Caller)
        );

        assert_eq!(rx_a.try_recv().expect("a"), Ok(json!("a")));
        assert_eq!(
            rx_b.try_recv().expect("b"),
            Err(GatewayError::Remote(RemoteError::new("E_X", "b failed")))
        );
        assert_eq!(rx_c.try_recv().expect("c"), Ok(json!("c")));
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_and_duplicate_ids_are_ignored() {
        let mut table = PendingCalls::new();
        let (id, mut rx) = caller(&mut table);
        assert_eq!(table.resolve("404", json!(null)), None);
        assert_eq!(table.resolve(&id, json!(1)), Some(Settled::Caller));
        assert_eq!(table.resolve(&id, json!(2)), None);
        assert_eq!(rx.try_recv().expect("first"), Ok(json!(1)));
    }

    #[test]
    fn flush_rejects_each_caller_once() {
        let mut table = PendingCalls::new();
        let mut receivers: Vec<_> = (0..3).map(|_| caller(&mut table).1).collect();
        let id = table.next_id();
        table.register(id, Continuation::Handshake, None);

        let error = GatewayError::ConnectionClosed {
            code: 1006,
            reason: String::new(),
        };
        assert_eq!(table.flush_all(&error), 3);
        assert!(table.is_empty());
        for rx in receivers.iter_mut() {
            assert_eq!(rx.try_recv().expect("flushed"), Err(error.clone()));
        }
        assert_eq!(table.flush_all(&GatewayError::ClientStopped), 0);
    }

    #[test]
    fn handshake_outcome_is_returned_to_owner() {
        let mut table = PendingCalls::new();
        let id = table.next_id();
        table.register(id.clone(), Continuation::Handshake, None);
        assert_eq!(
            table.resolve(&id, json!({"type": "hello-ok"})),
            Some(Settled::Handshake(Ok(json!({"type": "hello-ok"}))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_calls_time_out() {
        let mut table = PendingCalls::new();
        let (tx, mut rx) = oneshot::channel();
        let id = table.next_id();
        table.register(id, Continuation::Caller(tx), Some(Duration::from_secs(5)));
        let (_, _keep) = caller(&mut table);

        let deadline = table.next_deadline().expect("deadline");
        assert_eq!(table.expire(deadline - Duration::from_millis(1)), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(table.expire(Instant::now()), 1);
        assert_eq!(
            rx.try_recv().expect("timed out"),
            Err(GatewayError::Timeout(Duration::from_secs(5)))
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), None);
    }
}
