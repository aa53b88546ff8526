//! Public chat session handle.
//!
//! `ChatClient::spawn` wires the transport supervisor and the coordinator
//! task together and returns a cheap cloneable handle. Reads go through a
//! `watch`-published [`ChatSnapshot`]; writes go through the coordinator's
//! inbound queue and come back on per-call oneshots.

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use parley_rest::ConversationApi;
use parley_transport::{ConnectionState, Hub, Transport};
use parley_types::models::{Conversation, Message, MessageType};

use crate::config::SyncConfig;
use crate::coordinator::{Inbound, Intent, SyncCoordinator};
use crate::error::SyncError;
use crate::typing::TypingUser;

/// The local user's identity, stamped onto optimistic messages.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
}

/// Consistent point-in-time view of the session, republished after every
/// coordinator step. Cheap to clone into a UI layer.
#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    pub connection_state: ConnectionState,
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<Uuid>,
    /// Ordered log of the active conversation, empty when none is open.
    pub messages: Vec<Message>,
    /// Who else is typing in the active conversation.
    pub typing_users: Vec<TypingUser>,
}

pub struct ChatClient<H: Hub> {
    transport: Transport<H>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    snapshot_rx: watch::Receiver<ChatSnapshot>,
}

impl<H: Hub> Clone for ChatClient<H> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            inbound_tx: self.inbound_tx.clone(),
            snapshot_rx: self.snapshot_rx.clone(),
        }
    }
}

impl<H: Hub> ChatClient<H> {
    /// Start a chat session: spawns the transport supervisor and the
    /// coordinator task, then begins connecting as `profile.user_id`.
    pub fn spawn<R: ConversationApi>(
        profile: UserProfile,
        config: SyncConfig,
        hub: H,
        rest: R,
    ) -> Self {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot::default());

        let transport = Transport::new(
            hub,
            config.invoke_timeout,
            config.backoff.clone(),
            signal_tx,
        );

        // Transport signals join the same ordered queue as everything else.
        let forward_tx = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                if forward_tx.send(Inbound::Transport(signal)).is_err() {
                    break;
                }
            }
        });

        let user_id = profile.user_id;
        let coordinator = SyncCoordinator::new(
            profile,
            config,
            transport.clone(),
            rest,
            inbound_tx.clone(),
            inbound_rx,
            snapshot_tx,
        );
        tokio::spawn(coordinator.run());
        transport.connect(user_id);

        Self {
            transport,
            inbound_tx,
            snapshot_rx,
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribe to snapshot updates; `changed().await` then `borrow()`.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Stop the session. The supervisor emits its final signal and the
    /// coordinator shuts down after it.
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Send a message optimistically. Resolves with the provisional id as
    /// soon as the local echo is committed; delivery progress shows up on the
    /// message's `delivery` field in later snapshots.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        content: String,
        message_type: MessageType,
        reply_to: Option<Uuid>,
    ) -> Result<Uuid, SyncError> {
        self.request(|respond| Intent::SendMessage {
            conversation_id,
            content,
            message_type,
            reply_to,
            respond,
        })
        .await
    }

    /// Re-send a failed message under a fresh provisional id.
    pub async fn retry_message(&self, message_id: Uuid) -> Result<Uuid, SyncError> {
        self.request(|respond| Intent::RetryMessage {
            message_id,
            respond,
        })
        .await
    }

    pub async fn edit_message(&self, message_id: Uuid, content: String) -> Result<(), SyncError> {
        self.request(|respond| Intent::EditMessage {
            message_id,
            content,
            respond,
        })
        .await
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), SyncError> {
        self.request(|respond| Intent::DeleteMessage {
            message_id,
            respond,
        })
        .await
    }

    /// Open a conversation: it becomes the active one, its room is joined
    /// and a history page is fetched in the background.
    pub async fn join_conversation(&self, conversation_id: Uuid) -> Result<(), SyncError> {
        self.request(|respond| Intent::JoinConversation {
            conversation_id,
            respond,
        })
        .await
    }

    pub fn leave_conversation(&self, conversation_id: Uuid) {
        let _ = self
            .inbound_tx
            .send(Inbound::Intent(Intent::LeaveConversation { conversation_id }));
    }

    /// Mark messages read. Batched behind a short window before the receipt
    /// goes out; fire-and-forget from the caller's perspective.
    pub fn mark_read(&self, conversation_id: Uuid, message_ids: Vec<Uuid>) {
        let _ = self.inbound_tx.send(Inbound::Intent(Intent::MarkRead {
            conversation_id,
            message_ids,
        }));
    }

    /// Report local typing activity. Call on every keypress; the debounce
    /// collapses the stream into at most one start and one stop.
    pub fn set_typing(&self, conversation_id: Uuid, is_typing: bool) {
        let _ = self.inbound_tx.send(Inbound::Intent(Intent::SetTyping {
            conversation_id,
            is_typing,
        }));
    }

    pub async fn create_conversation(
        &self,
        user_ids: Vec<Uuid>,
        product_id: Option<Uuid>,
    ) -> Result<Conversation, SyncError> {
        self.request(|respond| Intent::CreateConversation {
            user_ids,
            product_id,
            respond,
        })
        .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, SyncError>>) -> Intent,
    ) -> Result<T, SyncError> {
        let (respond, rx) = oneshot::channel();
        self.inbound_tx
            .send(Inbound::Intent(make(respond)))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }
}
