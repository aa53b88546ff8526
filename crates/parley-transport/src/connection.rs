//! Connection state machine and supervised reconnect loop.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                                  |  stream closed
//!                                  v
//!                             Reconnecting <-> (backoff, retry)
//! ```
//!
//! The supervisor retries forever until `disconnect()` is called. Every
//! lifecycle edge and every decoded inbound frame is pushed into one ordered
//! signal queue so the consumer sees a single serialized stream.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::events::{Ack, ClientCommand, ServerEvent, decode_event};

use crate::hub::{Hub, HubInvoker, OpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Owned solely by the transport; everything else reads it via `watch`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Signals handed to the sync coordinator, in delivery order.
#[derive(Debug)]
pub enum TransportSignal {
    /// Session established (initial connect or after a reconnect)
    Connected,
    /// Session lost, supervisor is backing off and retrying
    Reconnecting,
    /// Explicit disconnect completed; no further signals follow
    Closed,
    /// Decoded server push event
    Event(ServerEvent),
    /// Inbound frame failed the wire decode and was dropped
    BadFrame(String),
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Exponential delay for the given attempt, jittered to ±50% so a fleet
    /// of clients does not reconnect in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(6));
        let capped = exp.min(self.cap);
        capped.mul_f64(rand::rng().random_range(0.5..1.5))
    }
}

/// Handle to the hub connection. Cloneable; one supervisor task per session.
pub struct Transport<H: Hub> {
    inner: Arc<TransportInner<H>>,
}

impl<H: Hub> Clone for Transport<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct TransportInner<H: Hub> {
    hub: H,
    invoke_timeout: Duration,
    backoff: BackoffConfig,
    state_tx: watch::Sender<ConnectionState>,
    invoker: RwLock<Option<H::Invoker>>,
    signal_tx: mpsc::UnboundedSender<TransportSignal>,
    shutdown_tx: watch::Sender<bool>,
}

impl<H: Hub> Transport<H> {
    pub fn new(
        hub: H,
        invoke_timeout: Duration,
        backoff: BackoffConfig,
        signal_tx: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TransportInner {
                hub,
                invoke_timeout,
                backoff,
                state_tx,
                invoker: RwLock::new(None),
                signal_tx,
                shutdown_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Start the supervisor for this user's session. One connection per user:
    /// calling while a session is live is a no-op.
    pub fn connect(&self, user_id: Uuid) {
        if self.state().phase != ConnectionPhase::Disconnected {
            warn!(%user_id, "connect() ignored: session already running");
            return;
        }
        let _ = self.inner.shutdown_tx.send(false);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_supervisor(inner, user_id).await;
        });
    }

    /// Stop the session. The supervisor emits `Closed` and exits; in-flight
    /// invokes resolve on their own (no operation-scoped cancellation).
    pub fn disconnect(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Fire a remote operation. Fails immediately when not connected; a fixed
    /// timeout converts a hung ack into `OpError::Timeout`. Never retries.
    pub async fn invoke(&self, command: ClientCommand) -> Result<Ack, OpError> {
        let invoker = {
            if self.inner.state_tx.borrow().phase != ConnectionPhase::Connected {
                return Err(OpError::NotConnected);
            }
            self.inner
                .invoker
                .read()
                .expect("invoker lock poisoned")
                .clone()
                .ok_or(OpError::NotConnected)?
        };
        match tokio::time::timeout(self.inner.invoke_timeout, invoker.invoke(command)).await {
            Ok(result) => result,
            Err(_) => Err(OpError::Timeout),
        }
    }
}

impl<H: Hub> TransportInner<H> {
    fn set_state(&self, phase: ConnectionPhase, attempts: u32, error: Option<String>) {
        self.state_tx.send_modify(|s| {
            s.phase = phase;
            s.reconnect_attempts = attempts;
            if error.is_some() {
                s.last_error = error.clone();
            }
        });
    }

    fn clear_invoker(&self) {
        *self.invoker.write().expect("invoker lock poisoned") = None;
    }
}

async fn run_supervisor<H: Hub>(inner: Arc<TransportInner<H>>, user_id: Uuid) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut attempts: u32 = 0;
    let mut ever_connected = false;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let phase = if ever_connected || attempts > 0 {
            ConnectionPhase::Reconnecting
        } else {
            ConnectionPhase::Connecting
        };
        inner.set_state(phase, attempts, None);

        match inner.hub.connect(user_id).await {
            Ok((invoker, mut frames)) => {
                *inner.invoker.write().expect("invoker lock poisoned") = Some(invoker);
                attempts = 0;
                ever_connected = true;
                inner.set_state(ConnectionPhase::Connected, 0, None);
                let _ = inner.signal_tx.send(TransportSignal::Connected);
                info!(%user_id, "hub session established");

                let dropped = pump_frames(&inner, &mut frames, &mut shutdown_rx).await;
                inner.clear_invoker();

                if !dropped {
                    // Explicit disconnect
                    break;
                }
                warn!(%user_id, "hub session dropped, entering reconnect");
                inner.set_state(ConnectionPhase::Reconnecting, attempts, None);
                let _ = inner.signal_tx.send(TransportSignal::Reconnecting);
            }
            Err(e) => {
                attempts += 1;
                warn!(%user_id, attempt = attempts, error = %e, "hub connect failed");
                inner.set_state(
                    if ever_connected {
                        ConnectionPhase::Reconnecting
                    } else {
                        ConnectionPhase::Connecting
                    },
                    attempts,
                    Some(e.to_string()),
                );
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        let delay = inner.backoff.delay(attempts);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    inner.clear_invoker();
    inner.set_state(ConnectionPhase::Disconnected, 0, None);
    let _ = inner.signal_tx.send(TransportSignal::Closed);
    info!(%user_id, "transport stopped");
}

/// Forward decoded frames until the stream closes (returns true) or shutdown
/// is requested (returns false).
async fn pump_frames<H: Hub>(
    inner: &TransportInner<H>,
    frames: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return false;
                }
            }
            frame = frames.recv() => match frame {
                Some(raw) => match decode_event(&raw) {
                    Ok(event) => {
                        let _ = inner.signal_tx.send(TransportSignal::Event(event));
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping malformed inbound frame");
                        let _ = inner.signal_tx.send(TransportSignal::BadFrame(e.to_string()));
                    }
                },
                None => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use parley_types::events::ClientCommand;

    fn transport_with_hub(
        hub: MemoryHub,
    ) -> (
        Transport<MemoryHub>,
        mpsc::UnboundedReceiver<TransportSignal>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Transport::new(
            hub,
            Duration::from_secs(10),
            BackoffConfig::default(),
            tx,
        );
        (transport, rx)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        };
        // Jitter is ±50%, so bound-check rather than compare exactly.
        assert!(backoff.delay(0) <= Duration::from_millis(750));
        assert!(backoff.delay(3) >= Duration::from_millis(2000));
        for attempt in 0..20 {
            assert!(backoff.delay(attempt) <= Duration::from_secs(45));
        }
    }

    #[tokio::test]
    async fn invoke_fails_fast_when_disconnected() {
        let (hub, _requests) = MemoryHub::new();
        let (transport, _signals) = transport_with_hub(hub);
        let err = transport
            .invoke(ClientCommand::DeleteMessage {
                message_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_without_ack() {
        let (hub, mut requests) = MemoryHub::new();
        let (transport, mut signals) = transport_with_hub(hub);
        transport.connect(Uuid::new_v4());
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Connected)
        ));

        // Swallow the request without ever responding.
        tokio::spawn(async move {
            let _req = requests.recv().await;
            std::future::pending::<()>().await;
        });

        let err = transport
            .invoke(ClientCommand::LeaveConversation {
                conversation_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_drop_and_stops_on_disconnect() {
        let (hub, _requests) = MemoryHub::new();
        let (transport, mut signals) = transport_with_hub(hub.clone());
        transport.connect(Uuid::new_v4());

        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Connected)
        ));
        assert_eq!(transport.state().phase, ConnectionPhase::Connected);

        hub.drop_connection();
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Reconnecting)
        ));
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Connected)
        ));
        assert_eq!(hub.connect_count(), 2);

        transport.disconnect();
        assert!(matches!(signals.recv().await, Some(TransportSignal::Closed)));
        assert_eq!(transport.state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_surfaced_not_defaulted() {
        let (hub, _requests) = MemoryHub::new();
        let (transport, mut signals) = transport_with_hub(hub.clone());
        transport.connect(Uuid::new_v4());
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::Connected)
        ));

        hub.push_raw("{\"type\":\"ReceiveMessage\",\"data\":{}}".into());
        assert!(matches!(
            signals.recv().await,
            Some(TransportSignal::BadFrame(_))
        ));
    }
}
