//! The hub boundary: send/invoke plus a stream of server-pushed frames.
//!
//! Implementations own sockets and wire encoding; they do NOT own retry or
//! reconnect policy. A closed frame receiver is the one and only signal that
//! the connection dropped.

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_types::events::{Ack, ClientCommand};

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("hub refused connection: {0}")]
    Refused(String),

    #[error("transport unreachable: {0}")]
    Unreachable(String),
}

/// Failure of a single invoke. Never retried automatically — retry policy
/// belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("not connected")]
    NotConnected,

    #[error("operation timed out")]
    Timeout,

    #[error("server rejected operation: {0}")]
    Rejected(String),

    #[error("connection lost mid-operation")]
    ConnectionLost,
}

/// A connectable hub endpoint.
///
/// `connect` yields an invoker plus the inbound frame stream for that
/// session. Frames are raw wire text; decoding happens in exactly one place
/// upstream ([`parley_types::events::decode_event`]).
pub trait Hub: Send + Sync + 'static {
    type Invoker: HubInvoker;

    fn connect(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<(Self::Invoker, mpsc::UnboundedReceiver<String>), ConnError>> + Send;
}

/// Fire a remote operation and await the server ack. Cheaply cloneable so
/// in-flight invokes survive the supervisor replacing the session.
pub trait HubInvoker: Clone + Send + Sync + 'static {
    fn invoke(
        &self,
        command: ClientCommand,
    ) -> impl Future<Output = Result<Ack, OpError>> + Send;
}
