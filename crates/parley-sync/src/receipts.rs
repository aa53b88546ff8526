//! Read receipt batching.
//!
//! A user scrolling through a backlog marks dozens of messages in a burst;
//! batching them behind a short window turns that into one `MarkAsRead`
//! invoke. Already-acknowledged ids are dropped on enqueue, which makes the
//! whole operation idempotent and safe to resend after a reconnect.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

pub struct ReadReceiptTracker {
    window: Duration,
    /// Confirmed by the server; re-marking these is a no-op.
    acknowledged: HashSet<Uuid>,
    /// Waiting for the next flush, keyed by conversation.
    pending: HashMap<Uuid, HashSet<Uuid>>,
    flush_at: Option<Instant>,
}

impl ReadReceiptTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            acknowledged: HashSet::new(),
            pending: HashMap::new(),
            flush_at: None,
        }
    }

    /// Queue ids for the next batch. Duplicates against acknowledged and
    /// already-pending ids are dropped. Returns how many were newly queued.
    pub fn enqueue(&mut self, conversation_id: Uuid, ids: &[Uuid], now: Instant) -> usize {
        let bucket = self.pending.entry(conversation_id).or_default();
        let mut added = 0;
        for id in ids {
            if !self.acknowledged.contains(id) && bucket.insert(*id) {
                added += 1;
            }
        }
        if added > 0 && self.flush_at.is_none() {
            self.flush_at = Some(now + self.window);
        }
        added
    }

    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|ids| !ids.is_empty())
    }

    /// Drain everything queued. The caller issues one invoke per
    /// conversation and reports back via `acknowledge` or `requeue`.
    pub fn take_batches(&mut self) -> Vec<(Uuid, Vec<Uuid>)> {
        self.flush_at = None;
        self.pending
            .drain()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(conv, ids)| (conv, ids.into_iter().collect()))
            .collect()
    }

    /// The batch invoke succeeded; these ids never need to be sent again.
    pub fn acknowledge(&mut self, ids: &[Uuid]) {
        self.acknowledged.extend(ids.iter().copied());
    }

    /// Drop ids whose read state the server has confirmed through a receipt
    /// echo. Bounds the acknowledged set over a long session; re-marking a
    /// forgotten id resends a receipt, which the server treats as a no-op.
    pub fn forget(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.acknowledged.remove(id);
        }
    }

    /// The batch invoke failed; put the ids back so a reconnect-triggered
    /// flush can resend them.
    pub fn requeue(&mut self, conversation_id: Uuid, ids: Vec<Uuid>) {
        self.pending
            .entry(conversation_id)
            .or_default()
            .extend(ids);
    }

    /// Arm the flush timer if something is waiting (called on reconnect).
    pub fn arm(&mut self, now: Instant) {
        if self.has_pending() && self.flush_at.is_none() {
            self.flush_at = Some(now + self.window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReadReceiptTracker {
        ReadReceiptTracker::new(Duration::from_millis(500))
    }

    #[test]
    fn enqueue_batches_within_one_window() {
        let conv = Uuid::new_v4();
        let now = Instant::now();
        let mut receipts = tracker();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(receipts.enqueue(conv, &[a], now), 1);
        assert_eq!(receipts.enqueue(conv, &[b, a], now + Duration::from_millis(100)), 1);

        // One deadline for the whole burst.
        assert_eq!(receipts.flush_deadline(), Some(now + Duration::from_millis(500)));

        let batches = receipts.take_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);
        assert_eq!(receipts.flush_deadline(), None);
    }

    #[test]
    fn acknowledged_ids_are_never_requeued() {
        let conv = Uuid::new_v4();
        let now = Instant::now();
        let mut receipts = tracker();

        let id = Uuid::new_v4();
        receipts.enqueue(conv, &[id], now);
        let batches = receipts.take_batches();
        receipts.acknowledge(&batches[0].1);

        assert_eq!(receipts.enqueue(conv, &[id], now), 0);
        assert!(!receipts.has_pending());
        assert_eq!(receipts.flush_deadline(), None);
    }

    #[test]
    fn forget_releases_acknowledged_ids() {
        let conv = Uuid::new_v4();
        let now = Instant::now();
        let mut receipts = tracker();

        let id = Uuid::new_v4();
        receipts.enqueue(conv, &[id], now);
        let batch = receipts.take_batches().remove(0).1;
        receipts.acknowledge(&batch);
        assert_eq!(receipts.enqueue(conv, &[id], now), 0);

        // Once the server echoed the read state, the id can be let go.
        receipts.forget(&[id]);
        assert_eq!(receipts.enqueue(conv, &[id], now), 1);
    }

    #[test]
    fn failed_batch_is_resent_after_rearm() {
        let conv = Uuid::new_v4();
        let now = Instant::now();
        let mut receipts = tracker();

        let id = Uuid::new_v4();
        receipts.enqueue(conv, &[id], now);
        let batches = receipts.take_batches();
        receipts.requeue(conv, batches.into_iter().next().unwrap().1);

        assert!(receipts.has_pending());
        assert_eq!(receipts.flush_deadline(), None);

        receipts.arm(now + Duration::from_secs(2));
        assert_eq!(
            receipts.flush_deadline(),
            Some(now + Duration::from_millis(2500))
        );
        let retried = receipts.take_batches();
        assert_eq!(retried[0].1, vec![id]);
    }
}
