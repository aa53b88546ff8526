//! Typing indicators.
//!
//! Remote facts are data with a TTL, checked lazily at read time — no timer
//! per typist. The TTL (5s default) is a safety net against a missed stop
//! event and is deliberately longer than the sender-side 3s debounce.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Short-lived "user X is typing in conversation Y" fact.
#[derive(Debug, Clone)]
pub struct TypingFact {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub expires_at: Instant,
}

/// What observers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub user_name: String,
}

/// A typing-start/stop signal the coordinator should emit over the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingEmit {
    pub conversation_id: Uuid,
    pub is_typing: bool,
}

struct LocalTyping {
    conversation_id: Uuid,
    stop_at: Instant,
}

pub struct TypingAggregator {
    ttl: Duration,
    debounce: Duration,
    remote: Vec<TypingFact>,
    local: Option<LocalTyping>,
}

impl TypingAggregator {
    pub fn new(ttl: Duration, debounce: Duration) -> Self {
        Self {
            ttl,
            debounce,
            remote: Vec::new(),
            local: None,
        }
    }

    /// Upsert a remote fact, refreshing its expiry. Sweeps expired entries
    /// opportunistically to bound memory.
    pub fn observe_remote(&mut self, conversation_id: Uuid, user_id: Uuid, user_name: String, now: Instant) {
        self.remote.retain(|f| f.expires_at > now);
        let expires_at = now + self.ttl;
        if let Some(fact) = self
            .remote
            .iter_mut()
            .find(|f| f.conversation_id == conversation_id && f.user_id == user_id)
        {
            fact.expires_at = expires_at;
            fact.user_name = user_name;
        } else {
            self.remote.push(TypingFact {
                conversation_id,
                user_id,
                user_name,
                expires_at,
            });
        }
    }

    /// Explicit stop event removes the fact ahead of its TTL.
    pub fn clear_remote(&mut self, conversation_id: Uuid, user_id: Uuid) {
        self.remote
            .retain(|f| !(f.conversation_id == conversation_id && f.user_id == user_id));
    }

    /// Who is typing right now, excluding the given user (never show the
    /// viewer their own indicator).
    pub fn active_typists(&self, conversation_id: Uuid, excluding: Uuid, now: Instant) -> Vec<TypingUser> {
        self.remote
            .iter()
            .filter(|f| {
                f.conversation_id == conversation_id && f.user_id != excluding && f.expires_at > now
            })
            .map(|f| TypingUser {
                user_id: f.user_id,
                user_name: f.user_name.clone(),
            })
            .collect()
    }

    /// Local debounce: start fires immediately, repeated keypresses only push
    /// the stop deadline out, and an explicit stop fires immediately.
    pub fn local_update(&mut self, conversation_id: Uuid, is_typing: bool, now: Instant) -> Option<TypingEmit> {
        if is_typing {
            let already = self
                .local
                .as_ref()
                .is_some_and(|l| l.conversation_id == conversation_id);
            self.local = Some(LocalTyping {
                conversation_id,
                stop_at: now + self.debounce,
            });
            (!already).then_some(TypingEmit {
                conversation_id,
                is_typing: true,
            })
        } else {
            let was = self.local.take();
            was.filter(|l| l.conversation_id == conversation_id)
                .map(|l| TypingEmit {
                    conversation_id: l.conversation_id,
                    is_typing: false,
                })
        }
    }

    /// Earliest remote fact expiry. The coordinator polls this so a stale
    /// indicator clears even when no other traffic arrives.
    pub fn next_remote_expiry(&self) -> Option<Instant> {
        self.remote.iter().map(|f| f.expires_at).min()
    }

    /// Drop expired remote facts. Called when the expiry deadline fires.
    pub fn sweep_remote(&mut self, now: Instant) {
        self.remote.retain(|f| f.expires_at > now);
    }

    /// Deadline for the pending local stop, if one is armed.
    pub fn local_deadline(&self) -> Option<Instant> {
        self.local.as_ref().map(|l| l.stop_at)
    }

    /// Called when the deadline fires: emits the debounced stop.
    pub fn local_expire(&mut self, now: Instant) -> Option<TypingEmit> {
        if self.local.as_ref().is_some_and(|l| l.stop_at <= now) {
            let local = self.local.take()?;
            return Some(TypingEmit {
                conversation_id: local.conversation_id,
                is_typing: false,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> TypingAggregator {
        TypingAggregator::new(Duration::from_secs(5), Duration::from_secs(3))
    }

    #[test]
    fn fact_expires_after_ttl_without_refresh() {
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        let me = Uuid::new_v4();
        let t0 = Instant::now();

        let mut typing = aggregator();
        typing.observe_remote(conv, user, "ana".into(), t0);

        assert_eq!(typing.active_typists(conv, me, t0 + Duration::from_secs(4)).len(), 1);
        assert!(typing
            .active_typists(conv, me, t0 + Duration::from_secs(6))
            .is_empty());
    }

    #[test]
    fn refresh_extends_expiry() {
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        let me = Uuid::new_v4();
        let t0 = Instant::now();

        let mut typing = aggregator();
        typing.observe_remote(conv, user, "ana".into(), t0);
        typing.observe_remote(conv, user, "ana".into(), t0 + Duration::from_secs(4));

        assert_eq!(typing.active_typists(conv, me, t0 + Duration::from_secs(8)).len(), 1);
    }

    #[test]
    fn expiry_deadline_tracks_earliest_fact_and_sweep_clears_it() {
        let conv = Uuid::new_v4();
        let t0 = Instant::now();

        let mut typing = aggregator();
        assert_eq!(typing.next_remote_expiry(), None);

        typing.observe_remote(conv, Uuid::new_v4(), "ana".into(), t0);
        typing.observe_remote(conv, Uuid::new_v4(), "bo".into(), t0 + Duration::from_secs(2));
        assert_eq!(typing.next_remote_expiry(), Some(t0 + Duration::from_secs(5)));

        typing.sweep_remote(t0 + Duration::from_secs(5));
        assert_eq!(typing.next_remote_expiry(), Some(t0 + Duration::from_secs(7)));

        typing.sweep_remote(t0 + Duration::from_secs(7));
        assert_eq!(typing.next_remote_expiry(), None);
    }

    #[test]
    fn explicit_stop_removes_fact() {
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        let me = Uuid::new_v4();
        let t0 = Instant::now();

        let mut typing = aggregator();
        typing.observe_remote(conv, user, "ana".into(), t0);
        typing.clear_remote(conv, user);
        assert!(typing.active_typists(conv, me, t0).is_empty());
    }

    #[test]
    fn own_indicator_is_excluded() {
        let conv = Uuid::new_v4();
        let me = Uuid::new_v4();
        let t0 = Instant::now();

        let mut typing = aggregator();
        typing.observe_remote(conv, me, "me".into(), t0);
        assert!(typing.active_typists(conv, me, t0).is_empty());
    }

    #[test]
    fn local_start_emits_once_and_stop_is_debounced() {
        let conv = Uuid::new_v4();
        let t0 = Instant::now();
        let mut typing = aggregator();

        assert_eq!(
            typing.local_update(conv, true, t0),
            Some(TypingEmit { conversation_id: conv, is_typing: true })
        );
        // Repeated keypresses refresh the deadline silently.
        assert_eq!(typing.local_update(conv, true, t0 + Duration::from_secs(1)), None);
        assert_eq!(
            typing.local_deadline(),
            Some(t0 + Duration::from_secs(4))
        );

        // Nothing fires early.
        assert_eq!(typing.local_expire(t0 + Duration::from_secs(3)), None);
        assert_eq!(
            typing.local_expire(t0 + Duration::from_secs(4)),
            Some(TypingEmit { conversation_id: conv, is_typing: false })
        );
        assert_eq!(typing.local_deadline(), None);
    }

    #[test]
    fn explicit_local_stop_emits_immediately() {
        let conv = Uuid::new_v4();
        let t0 = Instant::now();
        let mut typing = aggregator();

        typing.local_update(conv, true, t0);
        assert_eq!(
            typing.local_update(conv, false, t0 + Duration::from_millis(100)),
            Some(TypingEmit { conversation_id: conv, is_typing: false })
        );
        assert_eq!(typing.local_deadline(), None);
    }
}
