//! Conversation summary cache.
//!
//! A projection merged from the REST snapshot and live push updates. The
//! coordinator is the only writer; `last_message`/`unread_count` are derived
//! here, never written by the UI.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use parley_types::models::{Conversation, Message, Participant};

#[derive(Default)]
pub struct ConversationIndex {
    conversations: HashMap<Uuid, Conversation>,
    /// Created optimistically, not yet echoed by a REST snapshot. Preserved
    /// across merges so a just-created conversation cannot be lost to a
    /// reconnect race.
    local_only: HashSet<Uuid>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<&Conversation> {
        self.conversations.get(&conversation_id)
    }

    pub fn contains(&self, conversation_id: Uuid) -> bool {
        self.conversations.contains_key(&conversation_id)
    }

    /// Insert or overwrite a conversation. `local_only` marks entries the
    /// REST side has not confirmed yet.
    pub fn upsert(&mut self, conversation: Conversation, local_only: bool) {
        if local_only {
            self.local_only.insert(conversation.id);
        }
        self.conversations.insert(conversation.id, conversation);
    }

    /// Merge a REST snapshot: authoritative for existence and metadata.
    /// Locally newer message projections survive (an optimistic send during
    /// the gap can postdate the snapshot), and local-only conversations are
    /// kept rather than dropped.
    pub fn merge_snapshot(&mut self, snapshot: Vec<Conversation>) {
        let mut merged: HashMap<Uuid, Conversation> = HashMap::with_capacity(snapshot.len());

        for mut remote in snapshot {
            self.local_only.remove(&remote.id);
            if let Some(local) = self.conversations.get(&remote.id) {
                remote.is_active = local.is_active;
                if local.last_message_at > remote.last_message_at {
                    remote.last_message = local.last_message.clone();
                    remote.last_message_at = local.last_message_at;
                    remote.unread_count = local.unread_count;
                }
            }
            merged.insert(remote.id, remote);
        }

        for id in &self.local_only {
            if let Some(local) = self.conversations.remove(id) {
                debug!(conversation_id = %id, "preserving local-only conversation across merge");
                merged.insert(*id, local);
            }
        }

        self.conversations = merged;
    }

    /// Project an incoming message: bump the last-message fields, and count
    /// it unread iff it came from someone else into a non-active
    /// conversation. Returns false when the conversation is unknown.
    pub fn apply_incoming_message(&mut self, msg: &Message, me: Uuid, active: Option<Uuid>) -> bool {
        let Some(conv) = self.conversations.get_mut(&msg.conversation_id) else {
            return false;
        };
        if msg.timestamp >= conv.last_message_at || conv.last_message.is_none() {
            conv.last_message = Some(msg.clone());
            conv.last_message_at = msg.timestamp;
        }
        if msg.sender_id != me && active != Some(conv.id) {
            conv.unread_count += 1;
        }
        true
    }

    /// Reset the unread counter after a read watermark moved. The remaining
    /// count is computed against the message log by the coordinator.
    pub fn apply_read_receipt(&mut self, conversation_id: Uuid, remaining_unread: u32) {
        if let Some(conv) = self.conversations.get_mut(&conversation_id) {
            conv.unread_count = remaining_unread;
        }
    }

    /// Keep the last-message preview in step with an edit.
    pub fn apply_edit(&mut self, conversation_id: Uuid, message_id: Uuid, content: &str) {
        if let Some(conv) = self.conversations.get_mut(&conversation_id)
            && let Some(last) = conv.last_message.as_mut()
            && last.id == message_id
        {
            last.content = content.to_string();
            last.is_edited = true;
        }
    }

    /// Replace the last-message preview when the previewed message was
    /// deleted; `fallback` is the new newest message, if any.
    pub fn apply_remove(&mut self, conversation_id: Uuid, message_id: Uuid, fallback: Option<Message>) {
        if let Some(conv) = self.conversations.get_mut(&conversation_id)
            && conv.last_message.as_ref().is_some_and(|m| m.id == message_id)
        {
            conv.last_message_at = fallback
                .as_ref()
                .map(|m| m.timestamp)
                .unwrap_or(conv.last_message_at);
            conv.last_message = fallback;
        }
    }

    /// Swap a temp-id preview for the confirmed message after a send ack.
    pub fn apply_confirmed(&mut self, conversation_id: Uuid, temp_id: Uuid, confirmed: &Message) {
        if let Some(conv) = self.conversations.get_mut(&conversation_id)
            && conv.last_message.as_ref().is_some_and(|m| m.id == temp_id)
        {
            conv.last_message = Some(confirmed.clone());
            conv.last_message_at = confirmed.timestamp;
        }
    }

    pub fn participant_joined(&mut self, conversation_id: Uuid, participant: Participant) {
        if let Some(conv) = self.conversations.get_mut(&conversation_id) {
            if let Some(existing) = conv
                .participants
                .iter_mut()
                .find(|p| p.user_id == participant.user_id)
            {
                *existing = participant;
            } else {
                conv.participants.push(participant);
            }
        }
    }

    pub fn participant_left(&mut self, conversation_id: Uuid, user_id: Uuid) {
        if let Some(conv) = self.conversations.get_mut(&conversation_id) {
            conv.participants.retain(|p| p.user_id != user_id);
        }
    }

    pub fn set_participant_online(&mut self, user_id: Uuid, online: bool) {
        for conv in self.conversations.values_mut() {
            for p in conv.participants.iter_mut() {
                if p.user_id == user_id {
                    p.online = online;
                }
            }
        }
    }

    pub fn set_active(&mut self, active: Option<Uuid>) {
        for conv in self.conversations.values_mut() {
            conv.is_active = active == Some(conv.id);
        }
    }

    /// Conversations sorted by recency, newest first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self.conversations.values().cloned().collect();
        out.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn last_message_at(&self, conversation_id: Uuid) -> Option<DateTime<Utc>> {
        self.conversations
            .get(&conversation_id)
            .map(|c| c.last_message_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parley_types::models::{ConversationType, DeliveryState, MessageType};

    fn conversation(id: Uuid, at_secs: i64) -> Conversation {
        Conversation {
            id,
            participants: vec![],
            last_message: None,
            last_message_at: Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap(),
            unread_count: 0,
            is_active: false,
            conversation_type: ConversationType::BuyerSeller,
            product_context: None,
        }
    }

    fn message(conversation_id: Uuid, sender_id: Uuid, at_secs: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            sender_name: "bo".into(),
            sender_avatar: None,
            content: "hey".into(),
            message_type: MessageType::Text,
            timestamp: Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap(),
            is_read: false,
            is_edited: false,
            edited_at: None,
            reply_to: None,
            delivery: DeliveryState::Sent,
        }
    }

    #[test]
    fn unread_counts_only_foreign_messages_in_inactive_conversations() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let active = Uuid::new_v4();

        let mut index = ConversationIndex::new();
        index.upsert(conversation(conv, 0), false);
        index.upsert(conversation(active, 0), false);

        for i in 1..=3 {
            index.apply_incoming_message(&message(conv, other, i), me, Some(active));
        }
        index.apply_incoming_message(&message(conv, me, 4), me, Some(active));
        index.apply_incoming_message(&message(active, other, 5), me, Some(active));

        assert_eq!(index.get(conv).unwrap().unread_count, 3);
        assert_eq!(index.get(active).unwrap().unread_count, 0);

        index.apply_read_receipt(conv, 0);
        assert_eq!(index.get(conv).unwrap().unread_count, 0);
    }

    #[test]
    fn merge_preserves_local_only_and_adds_rest_conversations() {
        let mut index = ConversationIndex::new();
        let local = conversation(Uuid::new_v4(), 10);
        let shared = conversation(Uuid::new_v4(), 5);
        let rest_only = conversation(Uuid::new_v4(), 7);

        index.upsert(local.clone(), true);
        index.upsert(shared.clone(), false);

        index.merge_snapshot(vec![shared.clone(), rest_only.clone()]);

        let listed = index.list();
        assert_eq!(listed.len(), 3);
        assert!(index.contains(local.id));
        assert!(index.contains(shared.id));
        assert!(index.contains(rest_only.id));
    }

    #[test]
    fn merge_drops_stale_conversations_but_keeps_newer_local_projection() {
        let mut index = ConversationIndex::new();
        let stale = conversation(Uuid::new_v4(), 0);
        let mut fresh = conversation(Uuid::new_v4(), 0);
        index.upsert(stale.clone(), false);

        // A message landed locally after the snapshot was cut.
        fresh.last_message_at = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        fresh.unread_count = 2;
        index.upsert(fresh.clone(), false);

        index.merge_snapshot(vec![conversation(fresh.id, 0)]);

        assert!(!index.contains(stale.id));
        let merged = index.get(fresh.id).unwrap();
        assert_eq!(merged.last_message_at, fresh.last_message_at);
        assert_eq!(merged.unread_count, 2);
    }

    #[test]
    fn list_is_sorted_by_recency() {
        let mut index = ConversationIndex::new();
        let a = conversation(Uuid::new_v4(), 1);
        let b = conversation(Uuid::new_v4(), 9);
        let c = conversation(Uuid::new_v4(), 5);
        index.upsert(a.clone(), false);
        index.upsert(b.clone(), false);
        index.upsert(c.clone(), false);

        let ids: Vec<Uuid> = index.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
    }
}
