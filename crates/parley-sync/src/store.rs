//! In-memory per-conversation message log.
//!
//! Ordering is total: `(timestamp, id)`. Wire order is advisory only — the
//! hub delivers at-least-once and may reorder across a reconnect, so the sort
//! key plus id-based dedup is what restores a consistent view.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use parley_types::models::{DeliveryState, Message};

fn sort_key(msg: &Message) -> (DateTime<Utc>, Uuid) {
    (msg.timestamp, msg.id)
}

#[derive(Default)]
pub struct MessageStore {
    logs: HashMap<Uuid, Vec<Message>>,
    /// message id -> conversation id, for O(1) by-id lookups and dedup
    by_id: HashMap<Uuid, Uuid>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message at its sorted position. Idempotent: a message whose
    /// id is already present is a no-op and returns false.
    pub fn append(&mut self, msg: Message) -> bool {
        if self.by_id.contains_key(&msg.id) {
            return false;
        }
        let log = self.logs.entry(msg.conversation_id).or_default();
        let pos = log
            .binary_search_by_key(&sort_key(&msg), sort_key)
            .unwrap_or_else(|pos| pos);
        self.by_id.insert(msg.id, msg.conversation_id);
        log.insert(pos, msg);
        true
    }

    /// Swap a pending entry for its server-confirmed form, preserving list
    /// position. If the confirmed id already arrived via push, the pending
    /// entry is simply dropped (dedup wins).
    pub fn replace_temp(&mut self, conversation_id: Uuid, temp_id: Uuid, confirmed: Message) -> bool {
        if self.by_id.contains_key(&confirmed.id) {
            return self.remove(temp_id).is_some();
        }
        let Some(log) = self.logs.get_mut(&conversation_id) else {
            return false;
        };
        let Some(pos) = log.iter().position(|m| m.id == temp_id) else {
            return false;
        };
        self.by_id.remove(&temp_id);
        self.by_id.insert(confirmed.id, conversation_id);
        log[pos] = confirmed;
        true
    }

    /// Mark a pending entry failed. Never removes it — the drafted content
    /// stays visible and retryable.
    pub fn mark_failed(&mut self, message_id: Uuid) -> bool {
        self.update(message_id, |m| m.delivery = DeliveryState::Failed)
    }

    pub fn mark_delivered(&mut self, message_id: Uuid) -> bool {
        self.update(message_id, |m| {
            if m.delivery == DeliveryState::Sent {
                m.delivery = DeliveryState::Delivered;
            }
        })
    }

    pub fn edit(&mut self, message_id: Uuid, content: String, edited_at: DateTime<Utc>) -> bool {
        self.update(message_id, |m| {
            m.content = content.clone();
            m.is_edited = true;
            m.edited_at = Some(edited_at);
        })
    }

    pub fn remove(&mut self, message_id: Uuid) -> Option<Message> {
        let conversation_id = self.by_id.remove(&message_id)?;
        let log = self.logs.get_mut(&conversation_id)?;
        let pos = log.iter().position(|m| m.id == message_id)?;
        Some(log.remove(pos))
    }

    pub fn get(&self, message_id: Uuid) -> Option<&Message> {
        let conversation_id = self.by_id.get(&message_id)?;
        self.logs
            .get(conversation_id)?
            .iter()
            .find(|m| m.id == message_id)
    }

    /// Current ordered log for a conversation. Snapshot of in-memory state,
    /// not a stream.
    pub fn list(&self, conversation_id: Uuid) -> &[Message] {
        self.logs
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn last(&self, conversation_id: Uuid) -> Option<&Message> {
        self.logs.get(&conversation_id)?.last()
    }

    /// Flip `is_read` on the given ids. Returns the ids that actually
    /// changed; already-read ids are filtered out so callers emit receipts
    /// only for genuinely new reads.
    pub fn mark_read_ids(&mut self, conversation_id: Uuid, ids: &[Uuid]) -> Vec<Uuid> {
        let Some(log) = self.logs.get_mut(&conversation_id) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for msg in log.iter_mut() {
            if !msg.is_read && ids.contains(&msg.id) {
                msg.is_read = true;
                changed.push(msg.id);
            }
        }
        changed
    }

    /// Apply an echoed read receipt: flip `is_read` on everything at or
    /// before the watermark that the reader did not send themselves.
    pub fn mark_read_up_to(
        &mut self,
        conversation_id: Uuid,
        watermark: DateTime<Utc>,
        reader: Uuid,
    ) -> usize {
        let Some(log) = self.logs.get_mut(&conversation_id) else {
            return 0;
        };
        let mut changed = 0;
        for msg in log.iter_mut() {
            if msg.timestamp > watermark {
                break;
            }
            if !msg.is_read && msg.sender_id != reader {
                msg.is_read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Unread messages from senders other than `me`.
    pub fn unread_from_others(&self, conversation_id: Uuid, me: Uuid) -> u32 {
        self.list(conversation_id)
            .iter()
            .filter(|m| !m.is_read && m.sender_id != me)
            .count() as u32
    }

    fn update(&mut self, message_id: Uuid, f: impl FnOnce(&mut Message)) -> bool {
        let Some(conversation_id) = self.by_id.get(&message_id) else {
            return false;
        };
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return false;
        };
        match log.iter_mut().find(|m| m.id == message_id) {
            Some(msg) => {
                f(msg);
                true
            }
            None => false,
        }
    }
}

/// Position of a message within its visual group (avatar collapsing in the
/// UI). Pure projection over the ordered log; nothing here is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPosition {
    pub first_in_group: bool,
    pub last_in_group: bool,
}

/// Messages from the same sender within a 5-minute gap collapse into one
/// visual group.
pub fn group_positions(messages: &[Message]) -> Vec<GroupPosition> {
    let gap = ChronoDuration::minutes(5);
    let same_group = |a: &Message, b: &Message| {
        a.sender_id == b.sender_id && b.timestamp - a.timestamp < gap
    };
    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| GroupPosition {
            first_in_group: i == 0 || !same_group(&messages[i - 1], msg),
            last_in_group: i + 1 == messages.len() || !same_group(msg, &messages[i + 1]),
        })
        .collect()
}
