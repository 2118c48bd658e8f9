// Message merge policy: dedup and ordered insertion proposals.

use std::time::Duration;

use crate::state::Message;

pub(crate) const DEFAULT_DEDUP_TOLERANCE: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeDecision {
    /// Same logical message as the entry at this index.
    Duplicate(usize),
    /// Insert at this index to keep `sent_at` ascending, after any equal timestamps.
    InsertAt(usize),
}

/// Decides how an incoming message lands in a conversation's timeline. It never writes;
/// the directory applies the decision.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MessageStore {
    tolerance_ms: i64,
}

impl MessageStore {
    pub(crate) fn new(tolerance: Duration) -> Self {
        Self {
            tolerance_ms: i64::try_from(tolerance.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Same logical message: identical id, or same sender and content with timestamps
    /// inside the tolerance window (local echo vs. network copy).
    pub(crate) fn is_duplicate(&self, a: &Message, b: &Message) -> bool {
        if a.id == b.id {
            return true;
        }
        a.sender_address == b.sender_address
            && a.content == b.content
            && a.sent_at.abs_diff(b.sent_at) <= self.tolerance_ms.unsigned_abs()
    }

    /// `existing` must already be sorted by `sent_at`.
    pub(crate) fn propose(&self, existing: &[Message], incoming: &Message) -> MergeDecision {
        let lo_ts = incoming.sent_at.saturating_sub(self.tolerance_ms);
        let hi_ts = incoming.sent_at.saturating_add(self.tolerance_ms);
        let lo = existing.partition_point(|m| m.sent_at < lo_ts);
        let hi = existing.partition_point(|m| m.sent_at <= hi_ts);
        if let Some(i) = existing[lo..hi].iter().position(|m| self.is_duplicate(m, incoming)) {
            return MergeDecision::Duplicate(lo + i);
        }
        // Same id far outside the window still means the same message.
        if let Some(i) = existing.iter().position(|m| m.id == incoming.id) {
            return MergeDecision::Duplicate(i);
        }
        MergeDecision::InsertAt(existing.partition_point(|m| m.sent_at <= incoming.sent_at))
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TOLERANCE)
    }
}
