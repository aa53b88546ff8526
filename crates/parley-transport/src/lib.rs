//! Hub transport layer: connection lifecycle, supervised reconnect, and
//! remote invokes with server acks.
//!
//! The physical hub implementation (WebSocket, SignalR-style, in-memory) sits
//! behind the [`Hub`] trait; this crate owns everything above it — the
//! connection state machine, jittered exponential backoff, invoke timeouts,
//! and the single ordered signal stream consumed by the sync coordinator.

pub mod connection;
pub mod hub;
pub mod memory;

pub use connection::{
    BackoffConfig, ConnectionPhase, ConnectionState, Transport, TransportSignal,
};
pub use hub::{ConnError, Hub, HubInvoker, OpError};
pub use memory::{InvokeRequest, MemoryHub};
