// Admission of conversations into the directory: initial load, discovery, and the
// periodic access recheck.

use std::collections::HashSet;

use super::directory::{ConversationUpsert, MergeSource};
use super::streams::{spawn_subscription, StreamEvent};
use super::*;
use crate::access;
use crate::error::AccessDenial;
use crate::hidden;
use crate::messaging::{group_of, key_of};
use crate::state::{AssetInfo, GroupMetadata, HiddenMarker, Message};
use crate::updates::AccessVerdict;

/// A conversation that passed its gate, with the history to seed it.
pub(crate) struct Admission {
    pub(crate) key: ConversationKey,
    pub(crate) peer: Address,
    pub(crate) topic: String,
    pub(crate) handle: SharedConversation,
    pub(crate) shared_assets: Vec<AssetInfo>,
    pub(crate) group: Option<GroupMetadata>,
    pub(crate) history: Vec<Message>,
}

pub(crate) enum AdmissionOutcome {
    Admitted(Box<Admission>),
    Hidden(ConversationKey),
    Denied(ConversationKey, AccessDenial),
    NotMember(ConversationKey),
    Failed(ConversationKey, String),
}

/// Gate one protocol conversation. Groups pass on membership, direct conversations on
/// shared assets. `user_assets` is `None` when the local lookup failed.
pub(crate) async fn admit(
    handle: SharedConversation,
    account: &Address,
    user_assets: Option<&[AssetInfo]>,
    cache: &OwnershipCache,
    hidden_markers: &[HiddenMarker],
) -> AdmissionOutcome {
    let key = key_of(handle.as_ref());
    let peer = handle.peer_address();
    let group = group_of(handle.as_ref()).map(|(_, g)| g);

    if hidden::is_hidden(hidden_markers, &peer, group.as_ref().map(|g| g.name.as_str())) {
        return AdmissionOutcome::Hidden(key);
    }

    let shared_assets = match &group {
        Some(g) => {
            if !g.is_member(account) {
                return AdmissionOutcome::NotMember(key);
            }
            vec![]
        }
        None => {
            let Some(user_assets) = user_assets else {
                return AdmissionOutcome::Failed(key, "own assets unavailable".to_string());
            };
            let peer_assets = match cache.get_assets(&peer).await {
                Ok(a) => a,
                Err(e) => return AdmissionOutcome::Failed(key, e.to_string()),
            };
            match access::evaluate(user_assets, &peer_assets) {
                Ok(shared) => shared,
                Err(denial) => return AdmissionOutcome::Denied(key, denial),
            }
        }
    };

    let history = match handle.messages().await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(conversation = %key, err = %e, "history fetch failed");
            vec![]
        }
    };

    AdmissionOutcome::Admitted(Box::new(Admission {
        key,
        peer,
        topic: handle.topic(),
        handle,
        shared_assets,
        group,
        history,
    }))
}

impl AppCore {
    pub(super) fn load_conversations(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let epoch = self.epoch;
        let account = sess.account.clone();
        let client = sess.client.clone();
        let cache = self.cache.clone();
        let markers = self.services.hidden.get();
        let tx = self.core_sender.clone();

        self.state.is_loading_conversations = true;
        self.emit_state();

        self.runtime.spawn(async move {
            let result = async {
                let listed = client.list_conversations().await?;
                let user_assets = match cache.get_assets(&account).await {
                    Ok(a) => Some(a),
                    Err(e) => {
                        tracing::warn!(err = %e, "own asset lookup failed");
                        None
                    }
                };

                // Several protocol handles can map to one group; the first one wins.
                let mut seen = HashSet::new();
                let handles: Vec<SharedConversation> = listed
                    .into_iter()
                    .filter(|h| seen.insert(key_of(h.as_ref())))
                    .collect();

                let outcomes = futures::future::join_all(handles.into_iter().map(|h| {
                    admit(h, &account, user_assets.as_deref(), &cache, &markers)
                }))
                .await;
                Ok::<_, EngineError>(outcomes)
            }
            .await;
            Self::post(&tx, InternalEvent::ConversationsLoaded { epoch, result });
        });
    }

    pub(super) fn on_conversations_loaded(&mut self, result: Result<Vec<AdmissionOutcome>, EngineError>) {
        self.state.is_loading_conversations = false;
        match result {
            Ok(outcomes) => {
                let total = outcomes.len();
                let mut admitted = 0usize;
                for outcome in outcomes {
                    if self.apply_admission(outcome) {
                        admitted += 1;
                    }
                }
                tracing::info!(total, admitted, "initial conversations loaded");
                self.emit_state();
            }
            Err(e) => {
                tracing::warn!(err = %e, "conversation list failed");
                self.set_error(e.to_string());
            }
        }
    }

    /// Write an admitted conversation into the directory and open its stream.
    /// Returns whether anything was admitted.
    pub(super) fn apply_admission(&mut self, outcome: AdmissionOutcome) -> bool {
        let admission = match outcome {
            AdmissionOutcome::Admitted(a) => a,
            AdmissionOutcome::Hidden(key) => {
                tracing::debug!(conversation = %key, "hidden, skipped");
                return false;
            }
            AdmissionOutcome::Denied(key, denial) => {
                tracing::debug!(conversation = %key, reason = %denial, "no shared assets, skipped");
                return false;
            }
            AdmissionOutcome::NotMember(key) => {
                tracing::debug!(conversation = %key, "not a group member, skipped");
                return false;
            }
            AdmissionOutcome::Failed(key, err) => {
                tracing::warn!(conversation = %key, err = %err, "admission failed");
                return false;
            }
        };
        let Some(sess) = self.session.as_mut() else {
            return false;
        };
        let Admission {
            key,
            peer,
            topic,
            handle,
            shared_assets,
            group,
            history,
        } = *admission;

        sess.handles.entry(key.clone()).or_insert(handle);
        sess.revoked.remove(&key);
        let account = sess.account.clone();

        self.directory.upsert(ConversationUpsert {
            key: key.clone(),
            peer_address: peer,
            topic: Some(topic),
            shared_assets: Some(shared_assets),
            group,
        });
        let open = self.state.current_conversation.clone();
        for message in history {
            self.directory
                .merge_message(&key, message, MergeSource::History, &account, open.as_ref());
        }
        self.ensure_message_stream(&key);
        true
    }

    pub(super) fn ensure_discovery_stream(&mut self) {
        let epoch = self.epoch;
        let tx = self.core_sender.clone();
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.streams.has_discovery() {
            return;
        }
        let generation = sess.streams.next_generation();
        let client = sess.client.clone();
        let sub = spawn_subscription(
            self.runtime.handle(),
            async move { client.stream_conversations().await },
            move |ev| match ev {
                StreamEvent::Item(handle) => {
                    Self::post(&tx, InternalEvent::ConversationDiscovered { epoch, handle });
                }
                StreamEvent::Failed(e) => Self::post(
                    &tx,
                    InternalEvent::StreamClosed {
                        epoch,
                        target: StreamTarget::Discovery,
                        generation,
                        error: Some(e),
                    },
                ),
                StreamEvent::Ended => Self::post(
                    &tx,
                    InternalEvent::StreamClosed {
                        epoch,
                        target: StreamTarget::Discovery,
                        generation,
                        error: None,
                    },
                ),
            },
        );
        sess.streams.set_discovery(generation, sub);
        tracing::debug!(generation, "discovery stream opened");
    }

    pub(super) fn on_conversation_discovered(&mut self, handle: SharedConversation) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let key = key_of(handle.as_ref());
        if self.directory.contains(&key) {
            // Already visible; at most make sure it is streaming.
            self.ensure_message_stream(&key);
            return;
        }
        tracing::info!(conversation = %key, "conversation discovered");

        let epoch = self.epoch;
        let account = sess.account.clone();
        let cache = self.cache.clone();
        let markers = self.services.hidden.get();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let user_assets = match cache.get_assets(&account).await {
                Ok(a) => Some(a),
                Err(e) => {
                    tracing::warn!(err = %e, "own asset lookup failed");
                    None
                }
            };
            let outcome = admit(handle, &account, user_assets.as_deref(), &cache, &markers).await;
            Self::post(&tx, InternalEvent::ConversationAdmitted { epoch, outcome });
        });
    }

    /// Re-evaluate every direct conversation against fresh ownership data, and gate the
    /// ones an earlier recheck removed again so they can come back.
    pub(super) fn recheck_access(&mut self) {
        // Re-open a discovery feed that broke since the last tick.
        self.ensure_discovery_stream();

        let Some(sess) = self.session.as_ref() else {
            return;
        };
        if self.recheck_in_flight {
            tracing::debug!("access recheck already running");
            return;
        }
        let targets = self.directory.direct_conversations();
        let revoked: Vec<SharedConversation> = sess.revoked.values().cloned().collect();
        if targets.is_empty() && revoked.is_empty() {
            return;
        }
        self.recheck_in_flight = true;

        let epoch = self.epoch;
        let account = sess.account.clone();
        let cache = self.cache.clone();
        let markers = self.services.hidden.get();
        let tx = self.core_sender.clone();
        tracing::debug!(
            conversations = targets.len(),
            revoked = revoked.len(),
            "access recheck"
        );
        self.runtime.spawn(async move {
            let (verdicts, readmissions) = match cache.get_assets(&account).await {
                Ok(user_assets) => {
                    let verdicts = futures::future::join_all(targets.into_iter().map(|(key, peer)| {
                        let cache = cache.clone();
                        let user_assets = &user_assets;
                        async move {
                            let shared = match cache.get_assets(&peer).await {
                                Ok(peer_assets) => Some(access::shared_assets(user_assets, &peer_assets)),
                                Err(e) => {
                                    tracing::debug!(peer = %peer.short(), err = %e, "recheck lookup failed");
                                    None
                                }
                            };
                            AccessVerdict { key, shared }
                        }
                    }))
                    .await;
                    let readmissions = futures::future::join_all(revoked.into_iter().map(|h| {
                        admit(h, &account, Some(user_assets.as_slice()), &cache, &markers)
                    }))
                    .await;
                    (verdicts, readmissions)
                }
                Err(e) => {
                    tracing::warn!(err = %e, "own asset lookup failed, recheck skipped");
                    (vec![], vec![])
                }
            };
            Self::post(
                &tx,
                InternalEvent::AccessRechecked {
                    epoch,
                    verdicts,
                    readmissions,
                },
            );
        });
    }

    pub(super) fn apply_access_verdicts(
        &mut self,
        verdicts: Vec<AccessVerdict>,
        readmissions: Vec<AdmissionOutcome>,
    ) {
        self.recheck_in_flight = false;
        let mut changed = false;
        for AccessVerdict { key, shared } in verdicts {
            let Some(shared) = shared else {
                continue;
            };
            if !self.directory.contains(&key) {
                continue;
            }
            if shared.is_empty() {
                tracing::info!(conversation = %key, "shared assets gone, removing conversation");
                self.revoke_conversation(&key);
            } else {
                self.directory.set_shared_assets(&key, shared);
            }
            changed = true;
        }
        for outcome in readmissions {
            match outcome {
                AdmissionOutcome::Admitted(admission) => {
                    tracing::info!(conversation = %admission.key, "shared assets back, restoring conversation");
                    changed |= self.apply_admission(AdmissionOutcome::Admitted(admission));
                }
                AdmissionOutcome::Hidden(key) | AdmissionOutcome::NotMember(key) => {
                    if let Some(sess) = self.session.as_mut() {
                        sess.revoked.remove(&key);
                    }
                }
                AdmissionOutcome::Denied(..) | AdmissionOutcome::Failed(..) => {}
            }
        }
        if changed {
            self.emit_state();
        }
    }

    /// Drop a conversation that lost its shared assets but keep its handle, so a later
    /// recheck can restore it.
    fn revoke_conversation(&mut self, key: &ConversationKey) {
        let handle = self
            .session
            .as_ref()
            .and_then(|s| s.handles.get(key).cloned());
        self.drop_conversation(key);
        if let (Some(sess), Some(handle)) = (self.session.as_mut(), handle) {
            sess.revoked.insert(key.clone(), handle);
        }
    }

    /// Cancel the conversation's stream, wait for it, then forget the record and handle.
    pub(super) fn drop_conversation(&mut self, key: &ConversationKey) {
        if let Some(sess) = self.session.as_mut() {
            if let Some(sub) = sess.streams.take_message_stream(key) {
                self.runtime.block_on(sub.shutdown());
            }
            sess.handles.remove(key);
        }
        self.directory.remove(key);
        if self.state.current_conversation.as_ref() == Some(key) {
            self.state.current_conversation = None;
        }
    }
}
