// Conversation directory: the single writer of conversation records.

use std::collections::HashMap;

use crate::state::{Address, AssetInfo, ConversationKey, ConversationSummary, GroupMetadata, Message};

use super::store::{MergeDecision, MessageStore};

#[derive(Debug, Clone)]
pub(crate) struct ConversationRecord {
    pub(crate) key: ConversationKey,
    pub(crate) peer_address: Address,
    pub(crate) topic: String,
    /// Sorted by `sent_at`, ties in arrival order.
    pub(crate) messages: Vec<Message>,
    pub(crate) preview: String,
    pub(crate) last_message_at: i64,
    pub(crate) unread_count: u32,
    pub(crate) shared_assets: Vec<AssetInfo>,
    pub(crate) group: Option<GroupMetadata>,
    // Optimistic rows the network has not confirmed yet, with the number of in-flight
    // sends relying on each.
    pending: HashMap<String, u32>,
    // Echo id -> id of the row it landed in.
    echoes: HashMap<String, String>,
}

impl ConversationRecord {
    fn new(key: ConversationKey, peer_address: Address) -> Self {
        Self {
            key,
            peer_address,
            topic: String::new(),
            messages: vec![],
            preview: String::new(),
            last_message_at: 0,
            unread_count: 0,
            shared_assets: vec![],
            group: None,
            pending: HashMap::new(),
            echoes: HashMap::new(),
        }
    }

    /// A duplicate either joins a pending echo or confirms it. A confirmed row takes the
    /// authoritative id and timestamp and no longer depends on any send.
    fn absorb(&mut self, existing: usize, incoming: Message, source: MergeSource) -> MergeOutcome {
        let row_id = self.messages[existing].id.clone();
        let Some(claims) = self.pending.get_mut(&row_id) else {
            return MergeOutcome::Duplicate;
        };
        match source {
            MergeSource::LocalEcho => {
                *claims += 1;
                self.echoes.insert(incoming.id, row_id);
                MergeOutcome::Duplicate
            }
            MergeSource::History | MergeSource::Live => {
                self.pending.remove(&row_id);
                self.echoes.retain(|_, row| *row != row_id);
                self.messages.remove(existing);
                let at = self
                    .messages
                    .partition_point(|m| m.sent_at <= incoming.sent_at);
                self.messages.insert(at, incoming);
                self.refresh_preview();
                MergeOutcome::Confirmed
            }
        }
    }

    /// Drop one send's claim on its echo row. The row goes away only when no other
    /// pending send relies on it and the network never confirmed it.
    fn retract(&mut self, echo_id: &str) -> bool {
        let Some(row_id) = self.echoes.remove(echo_id) else {
            return false;
        };
        let Some(claims) = self.pending.get_mut(&row_id) else {
            return false;
        };
        *claims = claims.saturating_sub(1);
        if *claims > 0 {
            return false;
        }
        self.pending.remove(&row_id);
        self.messages.retain(|m| m.id != row_id);
        self.refresh_preview();
        true
    }

    fn refresh_preview(&mut self) {
        match self.messages.last() {
            Some(m) => {
                self.preview = m.content.clone();
                self.last_message_at = m.sent_at;
            }
            None => {
                self.preview.clear();
                self.last_message_at = 0;
            }
        }
    }

    fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            key: self.key.clone(),
            peer_address: self.peer_address.clone(),
            preview: self.preview.clone(),
            last_message_at: self.last_message_at,
            unread_count: self.unread_count,
            shared_assets: self.shared_assets.clone(),
            group: self.group.clone(),
        }
    }
}

/// Fields to insert or merge. `None` leaves the stored value untouched.
#[derive(Debug, Clone)]
pub(crate) struct ConversationUpsert {
    pub(crate) key: ConversationKey,
    pub(crate) peer_address: Address,
    pub(crate) topic: Option<String>,
    pub(crate) shared_assets: Option<Vec<AssetInfo>>,
    pub(crate) group: Option<GroupMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeSource {
    /// Backlog fetched from the protocol. Never counts as unread.
    History,
    /// Delivered by a live subscription or returned by a send.
    Live,
    /// Optimistic copy of a message the local user just sent.
    LocalEcho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    UnknownConversation,
    Duplicate,
    Inserted,
    /// An optimistic echo was replaced by its authoritative copy.
    Confirmed,
}

pub(crate) struct ConversationDirectory {
    store: MessageStore,
    records: HashMap<ConversationKey, ConversationRecord>,
}

impl ConversationDirectory {
    pub(crate) fn new(store: MessageStore) -> Self {
        Self {
            store,
            records: HashMap::new(),
        }
    }

    /// Returns true when the conversation was new. Stored messages are always kept.
    pub(crate) fn upsert(&mut self, upsert: ConversationUpsert) -> bool {
        let ConversationUpsert {
            key,
            peer_address,
            topic,
            shared_assets,
            group,
        } = upsert;

        let inserted = !self.records.contains_key(&key);
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| ConversationRecord::new(key, peer_address.clone()));

        record.peer_address = peer_address;
        if let Some(topic) = topic.filter(|t| !t.is_empty()) {
            record.topic = topic;
        }
        if let Some(assets) = shared_assets {
            record.shared_assets = assets;
        }
        if group.is_some() {
            record.group = group;
        }
        inserted
    }

    /// Route one message through the store's dedup policy and apply it.
    ///
    /// Unread only grows for live messages from someone else in a conversation that is
    /// not open.
    pub(crate) fn merge_message(
        &mut self,
        key: &ConversationKey,
        message: Message,
        source: MergeSource,
        local_user: &Address,
        open: Option<&ConversationKey>,
    ) -> MergeOutcome {
        let Some(record) = self.records.get_mut(key) else {
            return MergeOutcome::UnknownConversation;
        };
        let index = match self.store.propose(&record.messages, &message) {
            MergeDecision::Duplicate(existing) => return record.absorb(existing, message, source),
            MergeDecision::InsertAt(i) => i,
        };

        let counts_as_unread = source == MergeSource::Live
            && &message.sender_address != local_user
            && open != Some(key);

        if source == MergeSource::LocalEcho {
            record.pending.insert(message.id.clone(), 1);
            record.echoes.insert(message.id.clone(), message.id.clone());
        }
        record.messages.insert(index, message);
        record.refresh_preview();
        if counts_as_unread {
            record.unread_count = record.unread_count.saturating_add(1);
        }
        MergeOutcome::Inserted
    }

    /// Undo the optimistic insert of a failed send. Returns whether a row was removed.
    pub(crate) fn retract_message(&mut self, key: &ConversationKey, echo_id: &str) -> bool {
        match self.records.get_mut(key) {
            Some(record) => record.retract(echo_id),
            None => false,
        }
    }

    pub(crate) fn mark_read(&mut self, key: &ConversationKey) -> bool {
        match self.records.get_mut(key) {
            Some(record) => {
                record.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_shared_assets(&mut self, key: &ConversationKey, assets: Vec<AssetInfo>) {
        if let Some(record) = self.records.get_mut(key) {
            record.shared_assets = assets;
        }
    }

    pub(crate) fn remove(&mut self, key: &ConversationKey) -> Option<ConversationRecord> {
        self.records.remove(key)
    }

    pub(crate) fn get(&self, key: &ConversationKey) -> Option<&ConversationRecord> {
        self.records.get(key)
    }

    pub(crate) fn contains(&self, key: &ConversationKey) -> bool {
        self.records.contains_key(key)
    }

    pub(crate) fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.records
            .get(key)
            .map(|r| r.messages.clone())
            .unwrap_or_default()
    }

    /// Direct conversations and their peers; groups are gated by membership instead.
    pub(crate) fn direct_conversations(&self) -> Vec<(ConversationKey, Address)> {
        self.records
            .values()
            .filter_map(|r| r.key.peer().map(|peer| (r.key.clone(), peer.clone())))
            .collect()
    }

    /// Newest activity first.
    pub(crate) fn summaries(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> =
            self.records.values().map(ConversationRecord::summary).collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        list
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
