//! Channel-backed in-memory hub.
//!
//! Drives the loopback tests: the test side receives every invoke as an
//! [`InvokeRequest`] and answers whenever it chooses, pushes server events as
//! wire frames, and can drop the live session to exercise reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use parley_types::events::{Ack, ClientCommand, ServerEvent};

use crate::hub::{ConnError, Hub, HubInvoker, OpError};

/// An invoke captured by the hub, waiting for the test side to respond.
pub struct InvokeRequest {
    pub command: ClientCommand,
    pub respond: oneshot::Sender<Result<Ack, OpError>>,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<MemoryHubInner>,
}

struct MemoryHubInner {
    requests: mpsc::UnboundedSender<InvokeRequest>,
    session: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connects: AtomicU32,
    refuse: AtomicBool,
}

impl MemoryHub {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InvokeRequest>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(MemoryHubInner {
                requests,
                session: Mutex::new(None),
                connects: AtomicU32::new(0),
                refuse: AtomicBool::new(false),
            }),
        };
        (hub, requests_rx)
    }

    /// Push a server event to the live session as an encoded wire frame.
    /// Silently dropped when no session is up, like a real server would.
    pub fn push_event(&self, event: &ServerEvent) {
        let frame = serde_json::to_string(event).expect("event serializes");
        self.push_raw(frame);
    }

    /// Push a raw frame, bypassing encoding. For malformed-frame tests.
    pub fn push_raw(&self, frame: String) {
        let session = self.inner.session.lock().expect("session lock poisoned");
        if let Some(tx) = session.as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Sever the live session; the client sees its frame stream close.
    pub fn drop_connection(&self) {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .take();
    }

    /// Refuse (or stop refusing) new connection attempts.
    pub fn set_refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::Relaxed)
    }
}

impl Hub for MemoryHub {
    type Invoker = MemoryInvoker;

    async fn connect(
        &self,
        _user_id: Uuid,
    ) -> Result<(MemoryInvoker, mpsc::UnboundedReceiver<String>), ConnError> {
        if self.inner.refuse.load(Ordering::Relaxed) {
            return Err(ConnError::Refused("hub offline".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.session.lock().expect("session lock poisoned") = Some(tx);
        self.inner.connects.fetch_add(1, Ordering::Relaxed);
        Ok((
            MemoryInvoker {
                requests: self.inner.requests.clone(),
            },
            rx,
        ))
    }
}

/// Invoker routing every command to the test side with a reply slot.
/// Shared across sessions so an in-flight invoke can resolve after the
/// session that issued it was replaced.
#[derive(Clone)]
pub struct MemoryInvoker {
    requests: mpsc::UnboundedSender<InvokeRequest>,
}

impl HubInvoker for MemoryInvoker {
    async fn invoke(&self, command: ClientCommand) -> Result<Ack, OpError> {
        let (respond, response) = oneshot::channel();
        self.requests
            .send(InvokeRequest { command, respond })
            .map_err(|_| OpError::ConnectionLost)?;
        response.await.map_err(|_| OpError::ConnectionLost)?
    }
}
