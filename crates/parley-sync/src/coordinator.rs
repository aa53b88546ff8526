//! Single-writer sync coordinator.
//!
//! One task owns every store. Transport signals, user intents, and the
//! results of spawned invokes/REST calls all arrive on one ordered inbound
//! queue; the loop itself only ever suspends in its `select!`, so a mutation
//! committed by one arm is visible to the next without any locking.
//!
//! `Connected` is the reconciliation point: re-join the active conversation
//! and replay the REST snapshot to repair whatever drifted while offline.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_rest::{ConversationApi, RestError};
use parley_transport::{ConnectionPhase, Hub, OpError, Transport, TransportSignal};
use parley_types::api::{CreateConversationRequest, MessagePage};
use parley_types::events::{Ack, ClientCommand, ServerEvent};
use parley_types::models::{Conversation, DeliveryState, Message, MessageType};

use crate::client::{ChatSnapshot, UserProfile};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::index::ConversationIndex;
use crate::receipts::ReadReceiptTracker;
use crate::store::MessageStore;
use crate::typing::{TypingAggregator, TypingEmit};

/// Everything that can arrive on the coordinator's inbound queue.
pub(crate) enum Inbound {
    Transport(TransportSignal),
    Intent(Intent),
    SendResult {
        conversation_id: Uuid,
        temp_id: Uuid,
        result: Result<Ack, OpError>,
    },
    JoinResult {
        conversation_id: Uuid,
        result: Result<Ack, OpError>,
    },
    HistoryResult {
        conversation_id: Uuid,
        result: Result<MessagePage, RestError>,
    },
    ReconcileResult(Result<Vec<Conversation>, RestError>),
    MarkReadResult {
        conversation_id: Uuid,
        ids: Vec<Uuid>,
        result: Result<Ack, OpError>,
    },
    Created {
        result: Result<Conversation, RestError>,
        respond: oneshot::Sender<Result<Conversation, SyncError>>,
    },
}

/// User intents, handed in from [`crate::client::ChatClient`].
pub(crate) enum Intent {
    SendMessage {
        conversation_id: Uuid,
        content: String,
        message_type: MessageType,
        reply_to: Option<Uuid>,
        respond: oneshot::Sender<Result<Uuid, SyncError>>,
    },
    RetryMessage {
        message_id: Uuid,
        respond: oneshot::Sender<Result<Uuid, SyncError>>,
    },
    EditMessage {
        message_id: Uuid,
        content: String,
        respond: oneshot::Sender<Result<(), SyncError>>,
    },
    DeleteMessage {
        message_id: Uuid,
        respond: oneshot::Sender<Result<(), SyncError>>,
    },
    MarkRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    },
    SetTyping {
        conversation_id: Uuid,
        is_typing: bool,
    },
    JoinConversation {
        conversation_id: Uuid,
        respond: oneshot::Sender<Result<(), SyncError>>,
    },
    LeaveConversation {
        conversation_id: Uuid,
    },
    CreateConversation {
        user_ids: Vec<Uuid>,
        product_id: Option<Uuid>,
        respond: oneshot::Sender<Result<Conversation, SyncError>>,
    },
}

/// Room membership for the active conversation, orthogonal to the
/// connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Idle,
    Joining(Uuid),
    Joined(Uuid),
}

pub(crate) struct SyncCoordinator<H: Hub, R: ConversationApi> {
    profile: UserProfile,
    config: SyncConfig,
    transport: Transport<H>,
    rest: R,
    store: MessageStore,
    index: ConversationIndex,
    typing: TypingAggregator,
    receipts: ReadReceiptTracker,
    active_conversation: Option<Uuid>,
    join_state: JoinState,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
}

impl<H: Hub, R: ConversationApi> SyncCoordinator<H, R> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        profile: UserProfile,
        config: SyncConfig,
        transport: Transport<H>,
        rest: R,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        inbound_rx: mpsc::UnboundedReceiver<Inbound>,
        snapshot_tx: watch::Sender<ChatSnapshot>,
    ) -> Self {
        let typing = TypingAggregator::new(config.typing_ttl, config.typing_debounce);
        let receipts = ReadReceiptTracker::new(config.read_batch_window);
        Self {
            profile,
            config,
            transport,
            rest,
            store: MessageStore::new(),
            index: ConversationIndex::new(),
            typing,
            receipts,
            active_conversation: None,
            join_state: JoinState::Idle,
            inbound_tx,
            inbound_rx,
            snapshot_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(user_id = %self.profile.user_id, "sync coordinator started");
        loop {
            self.publish();
            let typing_deadline = self.typing.local_deadline();
            let remote_typing_deadline = self.typing.next_remote_expiry();
            let flush_deadline = self.receipts.flush_deadline();

            tokio::select! {
                inbound = self.inbound_rx.recv() => match inbound {
                    Some(Inbound::Transport(TransportSignal::Closed)) => {
                        info!("transport closed, ending chat session");
                        break;
                    }
                    Some(inbound) => self.handle(inbound),
                    None => break,
                },
                _ = deadline_sleep(typing_deadline) => {
                    if let Some(emit) = self.typing.local_expire(Instant::now()) {
                        self.emit_typing(emit);
                    }
                }
                // Stale remote indicators must clear even on a quiet session,
                // so the earliest TTL is a wakeup, not just a read-time filter.
                _ = deadline_sleep(remote_typing_deadline) => {
                    self.typing.sweep_remote(Instant::now());
                }
                _ = deadline_sleep(flush_deadline) => self.flush_receipts(),
            }
        }
        self.publish();
        info!("sync coordinator stopped");
    }

    // -- snapshot fan-out --

    fn publish(&self) {
        let now = Instant::now();
        let snapshot = ChatSnapshot {
            connection_state: self.transport.state(),
            conversations: self.index.list(),
            active_conversation: self.active_conversation,
            messages: self
                .active_conversation
                .map(|id| self.store.list(id).to_vec())
                .unwrap_or_default(),
            typing_users: self
                .active_conversation
                .map(|id| self.typing.active_typists(id, self.profile.user_id, now))
                .unwrap_or_default(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    // -- inbound dispatch --

    fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Transport(signal) => self.handle_transport(signal),
            Inbound::Intent(intent) => self.handle_intent(intent),
            Inbound::SendResult {
                conversation_id,
                temp_id,
                result,
            } => self.handle_send_result(conversation_id, temp_id, result),
            Inbound::JoinResult {
                conversation_id,
                result,
            } => self.handle_join_result(conversation_id, result),
            Inbound::HistoryResult {
                conversation_id,
                result,
            } => self.handle_history_result(conversation_id, result),
            Inbound::ReconcileResult(result) => self.handle_reconcile_result(result),
            Inbound::MarkReadResult {
                conversation_id,
                ids,
                result,
            } => match result {
                Ok(_) => self.receipts.acknowledge(&ids),
                Err(e) => {
                    // Best-effort signal: park the batch for the
                    // reconnect-triggered resend.
                    debug!(error = %e, "MarkAsRead batch failed, requeueing");
                    self.receipts.requeue(conversation_id, ids);
                }
            },
            Inbound::Created { result, respond } => match result {
                Ok(conversation) => {
                    // local_only until a REST snapshot echoes it back
                    self.index.upsert(conversation.clone(), true);
                    let _ = respond.send(Ok(conversation));
                }
                Err(e) => {
                    let _ = respond.send(Err(SyncError::Rest(e)));
                }
            },
        }
    }

    fn handle_transport(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Connected => {
                info!("hub connected, reconciling state");
                self.receipts.arm(Instant::now());
                self.spawn_reconcile();
                if let Some(active) = self.active_conversation {
                    self.start_join(active);
                }
            }
            TransportSignal::Reconnecting => {
                info!("hub connection lost, reconnect in progress");
                self.join_state = JoinState::Idle;
            }
            TransportSignal::Event(event) => self.route_event(event),
            TransportSignal::BadFrame(error) => {
                warn!(error, "inbound frame rejected by wire decode");
            }
            // Intercepted in run()
            TransportSignal::Closed => {}
        }
    }

    // -- inbound event routing table --

    fn route_event(&mut self, event: ServerEvent) {
        let me = self.profile.user_id;
        match event {
            ServerEvent::ReceiveMessage { message } => {
                if !self.store.append(message.clone()) {
                    debug!(message_id = %message.id, "duplicate delivery ignored");
                    return;
                }
                if !self
                    .index
                    .apply_incoming_message(&message, me, self.active_conversation)
                {
                    warn!(conversation_id = %message.conversation_id, "message for unknown conversation, reconciling");
                    self.spawn_reconcile();
                }
                // A delivered message implies its sender stopped typing.
                self.typing
                    .clear_remote(message.conversation_id, message.sender_id);
                // The open window reads incoming messages as they land.
                if Some(message.conversation_id) == self.active_conversation
                    && message.sender_id != me
                {
                    self.apply_local_read(message.conversation_id, &[message.id]);
                }
            }
            ServerEvent::MessageEdited {
                message_id,
                conversation_id,
                content,
                edited_at,
            } => {
                if self.store.edit(message_id, content.clone(), edited_at) {
                    self.index.apply_edit(conversation_id, message_id, &content);
                } else {
                    debug!(%message_id, "edit for unknown message dropped");
                }
            }
            ServerEvent::MessageDeleted {
                message_id,
                conversation_id,
            } => {
                if self.store.remove(message_id).is_some() {
                    let fallback = self.store.last(conversation_id).cloned();
                    self.index.apply_remove(conversation_id, message_id, fallback);
                }
            }
            ServerEvent::UserTyping {
                conversation_id,
                user_id,
                user_name,
                is_typing,
            } => {
                if user_id == me {
                    return;
                }
                if is_typing {
                    self.typing
                        .observe_remote(conversation_id, user_id, user_name, Instant::now());
                } else {
                    self.typing.clear_remote(conversation_id, user_id);
                }
            }
            ServerEvent::MessagesRead {
                conversation_id,
                reader_id,
                read_up_to,
            } => {
                self.store
                    .mark_read_up_to(conversation_id, read_up_to, reader_id);
                if reader_id == me {
                    // Echo of our own read state: recount unread, and release
                    // receipt bookkeeping for everything the server confirmed.
                    self.index.apply_read_receipt(
                        conversation_id,
                        self.store.unread_from_others(conversation_id, me),
                    );
                    let confirmed: Vec<Uuid> = self
                        .store
                        .list(conversation_id)
                        .iter()
                        .take_while(|m| m.timestamp <= read_up_to)
                        .map(|m| m.id)
                        .collect();
                    self.receipts.forget(&confirmed);
                }
            }
            ServerEvent::MessageDelivered { message_id, .. } => {
                self.store.mark_delivered(message_id);
            }
            ServerEvent::MessageError { message_id, reason } => {
                warn!(?message_id, reason, "server reported message error");
                if let Some(id) = message_id {
                    self.store.mark_failed(id);
                }
            }
            ServerEvent::UserStatusChanged { user_id, online } => {
                self.index.set_participant_online(user_id, online);
            }
            ServerEvent::UserJoinedConversation {
                conversation_id,
                participant,
            } => {
                if self.index.contains(conversation_id) {
                    self.index.participant_joined(conversation_id, participant);
                } else {
                    // First sighting of a conversation created elsewhere; the
                    // REST snapshot carries its metadata.
                    info!(%conversation_id, "new conversation observed via push, reconciling");
                    self.spawn_reconcile();
                }
            }
            ServerEvent::UserLeftConversation {
                conversation_id,
                user_id,
            } => {
                self.index.participant_left(conversation_id, user_id);
            }
        }
    }

    // -- intents --

    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::SendMessage {
                conversation_id,
                content,
                message_type,
                reply_to,
                respond,
            } => {
                if !self.connected() {
                    let _ = respond.send(Err(SyncError::NotConnected));
                    return;
                }
                if let Some(emit) =
                    self.typing
                        .local_update(conversation_id, false, Instant::now())
                {
                    self.emit_typing(emit);
                }
                let temp_id = self.start_send(conversation_id, content, message_type, reply_to);
                let _ = respond.send(Ok(temp_id));
            }
            Intent::RetryMessage {
                message_id,
                respond,
            } => {
                if !self.connected() {
                    let _ = respond.send(Err(SyncError::NotConnected));
                    return;
                }
                let failed = self
                    .store
                    .get(message_id)
                    .filter(|m| m.delivery == DeliveryState::Failed)
                    .cloned();
                let Some(failed) = failed else {
                    let _ = respond.send(Err(SyncError::UnknownMessage(message_id)));
                    return;
                };
                // Retry re-enters the optimistic protocol under a fresh temp id.
                self.store.remove(message_id);
                let temp_id = self.start_send(
                    failed.conversation_id,
                    failed.content,
                    failed.message_type,
                    failed.reply_to,
                );
                let _ = respond.send(Ok(temp_id));
            }
            Intent::EditMessage {
                message_id,
                content,
                respond,
            } => {
                if !self.connected() {
                    let _ = respond.send(Err(SyncError::NotConnected));
                    return;
                }
                let Some(conversation_id) =
                    self.store.get(message_id).map(|m| m.conversation_id)
                else {
                    let _ = respond.send(Err(SyncError::UnknownMessage(message_id)));
                    return;
                };
                self.store.edit(message_id, content.clone(), Utc::now());
                self.index.apply_edit(conversation_id, message_id, &content);
                self.spawn_logged(
                    ClientCommand::EditMessage {
                        message_id,
                        content,
                    },
                    "EditMessage",
                );
                let _ = respond.send(Ok(()));
            }
            Intent::DeleteMessage {
                message_id,
                respond,
            } => {
                if !self.connected() {
                    let _ = respond.send(Err(SyncError::NotConnected));
                    return;
                }
                let Some(removed) = self.store.remove(message_id) else {
                    let _ = respond.send(Err(SyncError::UnknownMessage(message_id)));
                    return;
                };
                let fallback = self.store.last(removed.conversation_id).cloned();
                self.index
                    .apply_remove(removed.conversation_id, message_id, fallback);
                self.spawn_logged(ClientCommand::DeleteMessage { message_id }, "DeleteMessage");
                let _ = respond.send(Ok(()));
            }
            Intent::MarkRead {
                conversation_id,
                message_ids,
            } => {
                self.apply_local_read(conversation_id, &message_ids);
            }
            Intent::SetTyping {
                conversation_id,
                is_typing,
            } => {
                if let Some(emit) =
                    self.typing
                        .local_update(conversation_id, is_typing, Instant::now())
                {
                    self.emit_typing(emit);
                }
            }
            Intent::JoinConversation {
                conversation_id,
                respond,
            } => {
                if let Some(previous) = self.active_conversation
                    && previous != conversation_id
                    && let Some(emit) = self.typing.local_update(previous, false, Instant::now())
                {
                    self.emit_typing(emit);
                }
                self.active_conversation = Some(conversation_id);
                self.index.set_active(Some(conversation_id));
                if self.connected() {
                    self.start_join(conversation_id);
                }
                // Not connected: the Connected handler re-issues the join.
                let _ = respond.send(Ok(()));
            }
            Intent::LeaveConversation { conversation_id } => {
                if let Some(emit) =
                    self.typing
                        .local_update(conversation_id, false, Instant::now())
                {
                    self.emit_typing(emit);
                }
                if self.active_conversation == Some(conversation_id) {
                    self.active_conversation = None;
                    self.index.set_active(None);
                    self.join_state = JoinState::Idle;
                }
                if self.connected() {
                    self.spawn_logged(
                        ClientCommand::LeaveConversation { conversation_id },
                        "LeaveConversation",
                    );
                }
            }
            Intent::CreateConversation {
                user_ids,
                product_id,
                respond,
            } => {
                let rest = self.rest.clone();
                let tx = self.inbound_tx.clone();
                tokio::spawn(async move {
                    let result = rest
                        .create_conversation(CreateConversationRequest {
                            user_ids,
                            product_id,
                        })
                        .await;
                    let _ = tx.send(Inbound::Created { result, respond });
                });
            }
        }
    }

    // -- optimistic send protocol --

    fn start_send(
        &mut self,
        conversation_id: Uuid,
        content: String,
        message_type: MessageType,
        reply_to: Option<Uuid>,
    ) -> Uuid {
        let temp_id = Uuid::new_v4();
        let msg = Message {
            id: temp_id,
            conversation_id,
            sender_id: self.profile.user_id,
            sender_name: self.profile.name.clone(),
            sender_avatar: self.profile.avatar.clone(),
            content: content.clone(),
            message_type,
            timestamp: Utc::now(),
            is_read: true,
            is_edited: false,
            edited_at: None,
            reply_to,
            delivery: DeliveryState::Pending,
        };
        self.store.append(msg.clone());
        self.index
            .apply_incoming_message(&msg, self.profile.user_id, self.active_conversation);

        let command = ClientCommand::SendMessage {
            conversation_id,
            content,
            message_type,
            reply_to,
        };
        let transport = self.transport.clone();
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let result = transport.invoke(command).await;
            let _ = tx.send(Inbound::SendResult {
                conversation_id,
                temp_id,
                result,
            });
        });
        temp_id
    }

    fn handle_send_result(
        &mut self,
        conversation_id: Uuid,
        temp_id: Uuid,
        result: Result<Ack, OpError>,
    ) {
        match result {
            Ok(Ack::Message(confirmed)) => {
                let confirmed = *confirmed;
                debug!(%temp_id, confirmed_id = %confirmed.id, "send confirmed");
                self.store
                    .replace_temp(conversation_id, temp_id, confirmed.clone());
                self.index
                    .apply_confirmed(conversation_id, temp_id, &confirmed);
            }
            Ok(Ack::Ok) => {
                warn!(%temp_id, "SendMessage ack carried no confirmed message");
                self.store.mark_failed(temp_id);
            }
            Err(e) => {
                // Surfaced on the entry itself; the user decides on retry.
                warn!(%temp_id, error = %e, "send failed");
                self.store.mark_failed(temp_id);
            }
        }
    }

    // -- room membership & reconciliation --

    fn start_join(&mut self, conversation_id: Uuid) {
        self.join_state = JoinState::Joining(conversation_id);
        let transport = self.transport.clone();
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let result = transport
                .invoke(ClientCommand::JoinConversation { conversation_id })
                .await;
            let _ = tx.send(Inbound::JoinResult {
                conversation_id,
                result,
            });
        });

        let rest = self.rest.clone();
        let tx = self.inbound_tx.clone();
        let user_id = self.profile.user_id;
        let page_size = self.config.history_page_size;
        tokio::spawn(async move {
            let result = rest.get_messages(conversation_id, user_id, 1, page_size).await;
            let _ = tx.send(Inbound::HistoryResult {
                conversation_id,
                result,
            });
        });
    }

    fn handle_join_result(&mut self, conversation_id: Uuid, result: Result<Ack, OpError>) {
        if self.active_conversation != Some(conversation_id) {
            return;
        }
        match result {
            Ok(_) => {
                info!(%conversation_id, "joined conversation room");
                self.join_state = JoinState::Joined(conversation_id);
            }
            Err(e) => {
                // No immediate retry; the next Connected re-issues the join.
                warn!(%conversation_id, error = %e, "join failed");
                self.join_state = JoinState::Idle;
            }
        }
    }

    fn handle_history_result(
        &mut self,
        conversation_id: Uuid,
        result: Result<MessagePage, RestError>,
    ) {
        match result {
            Ok(page) => {
                let mut added = 0;
                for msg in page.messages {
                    if self.store.append(msg) {
                        added += 1;
                    }
                }
                debug!(%conversation_id, added, "history page merged");
            }
            Err(e) => {
                warn!(%conversation_id, error = %e, "history fetch failed, keeping local log");
            }
        }
    }

    fn spawn_reconcile(&self) {
        let rest = self.rest.clone();
        let tx = self.inbound_tx.clone();
        let user_id = self.profile.user_id;
        tokio::spawn(async move {
            let result = rest.get_conversations(user_id).await;
            let _ = tx.send(Inbound::ReconcileResult(result));
        });
    }

    fn handle_reconcile_result(&mut self, result: Result<Vec<Conversation>, RestError>) {
        match result {
            Ok(snapshot) => {
                let count = snapshot.len();
                self.index.merge_snapshot(snapshot);
                self.index.set_active(self.active_conversation);
                info!(count, "conversation snapshot reconciled");
            }
            Err(e) => {
                // Last-known-good stands; the next reconnect retries.
                warn!(error = %e, "reconciliation failed, keeping last-known-good state");
            }
        }
    }

    // -- read receipts --

    fn apply_local_read(&mut self, conversation_id: Uuid, message_ids: &[Uuid]) {
        // Only genuinely new reads produce receipts; re-marking is a no-op.
        let flipped = self.store.mark_read_ids(conversation_id, message_ids);
        if flipped.is_empty() {
            return;
        }
        self.index.apply_read_receipt(
            conversation_id,
            self.store
                .unread_from_others(conversation_id, self.profile.user_id),
        );
        self.receipts
            .enqueue(conversation_id, &flipped, Instant::now());
    }

    fn flush_receipts(&mut self) {
        for (conversation_id, ids) in self.receipts.take_batches() {
            if !self.connected() {
                self.receipts.requeue(conversation_id, ids);
                continue;
            }
            let command = ClientCommand::MarkAsRead {
                conversation_id,
                message_ids: ids.clone(),
            };
            let transport = self.transport.clone();
            let tx = self.inbound_tx.clone();
            tokio::spawn(async move {
                let result = transport.invoke(command).await;
                let _ = tx.send(Inbound::MarkReadResult {
                    conversation_id,
                    ids,
                    result,
                });
            });
        }
    }

    // -- plumbing --

    fn connected(&self) -> bool {
        self.transport.state().phase == ConnectionPhase::Connected
    }

    fn emit_typing(&self, emit: TypingEmit) {
        self.spawn_logged(
            ClientCommand::SetTyping {
                conversation_id: emit.conversation_id,
                is_typing: emit.is_typing,
            },
            "SetTyping",
        );
    }

    /// Fire an invoke whose failure is best-effort: logged, never retried,
    /// never surfaced to the UI.
    fn spawn_logged(&self, command: ClientCommand, what: &'static str) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.invoke(command).await {
                debug!(op = what, error = %e, "best-effort invoke failed");
            }
        });
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
