// Chat operations: per-conversation streams, start/send, groups, hide.

use super::directory::{MergeOutcome, MergeSource};
use super::streams::{spawn_subscription, StreamEvent};
use super::*;
use crate::access;
use crate::error::MessagingError;
use crate::hidden;
use crate::messaging::ConversationContext;
use crate::state::{now_millis, GroupMetadata, Message};

impl AppCore {
    /// Open the message subscription for `key` unless one is already running.
    pub(super) fn ensure_message_stream(&mut self, key: &ConversationKey) {
        let epoch = self.epoch;
        let tx = self.core_sender.clone();
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.streams.has_message_stream(key) {
            return;
        }
        let Some(handle) = sess.handles.get(key).cloned() else {
            tracing::warn!(conversation = %key, "no protocol handle, stream not opened");
            return;
        };

        let generation = sess.streams.next_generation();
        let stream_key = key.clone();
        let sub = spawn_subscription(
            self.runtime.handle(),
            async move { handle.stream_messages().await },
            move |ev| {
                let closed = |error| InternalEvent::StreamClosed {
                    epoch,
                    target: StreamTarget::Conversation(stream_key.clone()),
                    generation,
                    error,
                };
                let ev = match ev {
                    StreamEvent::Item(message) => InternalEvent::MessageReceived {
                        epoch,
                        key: stream_key.clone(),
                        generation,
                        message,
                    },
                    StreamEvent::Failed(e) => closed(Some(e)),
                    StreamEvent::Ended => closed(None),
                };
                Self::post(&tx, ev);
            },
        );
        sess.streams.insert_message_stream(key.clone(), generation, sub);
        tracing::debug!(conversation = %key, generation, "message stream opened");
    }

    pub(super) fn on_message_received(&mut self, key: &ConversationKey, generation: u64, message: Message) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let account = sess.account.clone();
        let open = self.state.current_conversation.clone();
        match self
            .directory
            .merge_message(key, message, MergeSource::Live, &account, open.as_ref())
        {
            MergeOutcome::Inserted | MergeOutcome::Confirmed => self.emit_state(),
            MergeOutcome::Duplicate => {
                tracing::trace!(conversation = %key, generation, "duplicate message dropped");
            }
            MergeOutcome::UnknownConversation => {
                tracing::debug!(conversation = %key, generation, "message for removed conversation dropped");
            }
        }
    }

    /// A consumption loop ended on its own. The entry is cleared so the next
    /// `ensure_*` call can reopen it; nothing is retried here.
    pub(super) fn on_stream_closed(&mut self, target: StreamTarget, generation: u64, error: Option<String>) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.streams.remove_if_generation(&target, generation).is_none() {
            return;
        }
        match error {
            Some(err) => tracing::warn!(?target, generation, err = %err, "stream failed"),
            None => tracing::info!(?target, generation, "stream ended"),
        }
    }

    pub(super) fn open_conversation(&mut self, key: &ConversationKey) {
        if !self.directory.contains(key) {
            tracing::warn!(conversation = %key, "open of unknown conversation ignored");
            return;
        }
        self.state.current_conversation = Some(key.clone());
        self.directory.mark_read(key);
        self.ensure_message_stream(key);
        self.emit_state();
    }

    pub(super) fn start_chat(&mut self, peer_address: &str, reply: Reply<Vec<Message>>) {
        let Some(sess) = self.session.as_ref().filter(|_| self.state.session.is_connected()) else {
            self.fail(reply, EngineError::NotConnected);
            return;
        };
        let peer = match Address::parse(peer_address) {
            Ok(p) => p,
            Err(e) => {
                self.fail(reply, e);
                return;
            }
        };

        let epoch = self.epoch;
        let account = sess.account.clone();
        let client = sess.client.clone();
        let cache = self.cache.clone();
        let tx = self.core_sender.clone();

        // Re-initiating contact un-hides the peer.
        if let Err(e) = self.services.hidden.remove(&peer, None) {
            tracing::warn!(err = %e, "failed to clear hidden marker");
        }
        self.set_busy(|b| b.starting_chat = true);
        tracing::info!(peer = %peer.short(), "start chat");

        self.runtime.spawn(async move {
            let result = async {
                let user_assets = cache.get_assets(&account).await?;
                let peer_assets = cache.get_assets(&peer).await?;
                let shared_assets = access::evaluate(&user_assets, &peer_assets)?;
                let handle = client.new_conversation(&peer, None).await?;
                let history = handle.messages().await?;
                Ok::<_, EngineError>(StartedChat {
                    admission: Admission {
                        key: ConversationKey::direct(&peer),
                        peer,
                        topic: handle.topic(),
                        handle,
                        shared_assets,
                        group: None,
                        history,
                    },
                })
            }
            .await;
            Self::post(&tx, InternalEvent::ChatStarted { epoch, result, reply });
        });
    }

    pub(super) fn on_chat_started(&mut self, result: EngineResult<StartedChat>, reply: Reply<Vec<Message>>) {
        self.set_busy(|b| b.starting_chat = false);
        let StartedChat { admission } = match result {
            Ok(started) => started,
            Err(e) => {
                tracing::info!(err = %e, "start chat rejected");
                self.fail(reply, e);
                return;
            }
        };
        let key = admission.key.clone();
        self.apply_admission(AdmissionOutcome::Admitted(Box::new(admission)));
        self.open_conversation(&key);
        respond(reply, Ok(self.directory.messages(&key)));
    }

    /// Optimistic send into the open conversation: the echo lands first and is
    /// retracted if the protocol rejects the send.
    pub(super) fn send_message(&mut self, content: String, reply: Reply<()>) {
        let Some(sess) = self.session.as_ref().filter(|_| self.state.session.is_connected()) else {
            self.fail(reply, EngineError::NotConnected);
            return;
        };
        let Some(key) = self.state.current_conversation.clone() else {
            self.fail(reply, EngineError::NoActiveConversation);
            return;
        };
        if content.trim().is_empty() {
            respond(reply, Ok(()));
            return;
        }
        let Some(handle) = sess.handles.get(&key).cloned() else {
            self.fail(reply, EngineError::NoActiveConversation);
            return;
        };
        let account = sess.account.clone();

        let echo = Message::new(account.clone(), content.clone(), now_millis());
        let echo_id = echo.id.clone();
        self.directory
            .merge_message(&key, echo, MergeSource::LocalEcho, &account, Some(&key));
        self.ensure_message_stream(&key);
        self.sends_in_flight += 1;
        self.state.busy.sending = true;
        self.emit_state();

        let epoch = self.epoch;
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = handle.send(&content).await;
            Self::post(
                &tx,
                InternalEvent::MessageSent {
                    epoch,
                    key,
                    echo_id,
                    result,
                    reply,
                },
            );
        });
    }

    pub(super) fn on_message_sent(
        &mut self,
        key: &ConversationKey,
        echo_id: &str,
        result: Result<Message, MessagingError>,
        reply: Reply<()>,
    ) {
        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
        self.state.busy.sending = self.sends_in_flight > 0;
        match result {
            Ok(sent) => {
                if let Some(sess) = self.session.as_ref() {
                    let account = sess.account.clone();
                    let open = self.state.current_conversation.clone();
                    // The network copy normally collapses into the echo.
                    self.directory
                        .merge_message(key, sent, MergeSource::Live, &account, open.as_ref());
                }
                self.emit_state();
                respond(reply, Ok(()));
            }
            Err(e) => {
                tracing::warn!(conversation = %key, err = %e, "send failed, echo retracted");
                self.directory.retract_message(key, echo_id);
                self.emit_state();
                self.fail(reply, e.into());
            }
        }
    }

    pub(super) fn create_group(&mut self, name: &str, members: &[String], reply: Reply<ConversationKey>) {
        let Some(sess) = self.session.as_ref().filter(|_| self.state.session.is_connected()) else {
            self.fail(reply, EngineError::NotConnected);
            return;
        };
        let name = name.trim().to_string();
        if name.is_empty() {
            self.fail(reply, EngineError::InvalidGroup("group name is empty".to_string()));
            return;
        }
        let mut parsed = match members
            .iter()
            .map(|m| Address::parse(m))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(p) => p,
            Err(e) => {
                self.fail(reply, e);
                return;
            }
        };
        let account = sess.account.clone();
        parsed.push(account.clone());
        parsed.sort();
        parsed.dedup();
        let others: Vec<Address> = parsed.iter().filter(|m| **m != account).cloned().collect();
        if others.is_empty() {
            self.fail(
                reply,
                EngineError::InvalidGroup("a group needs at least one other member".to_string()),
            );
            return;
        }

        let metadata = GroupMetadata {
            name: name.clone(),
            members: parsed,
        };
        let key = ConversationKey::group(name.clone());
        if let Err(e) = self.services.hidden.remove(&account, Some(&name)) {
            tracing::warn!(err = %e, "failed to clear hidden group marker");
        }

        let epoch = self.epoch;
        let client = sess.client.clone();
        let tx = self.core_sender.clone();
        self.set_busy(|b| b.creating_group = true);
        tracing::info!(group = %name, members = metadata.members.len(), "create group");

        self.runtime.spawn(async move {
            let result = async {
                let context = ConversationContext {
                    conversation_id: key.to_string(),
                    group: Some(metadata.clone()),
                };
                let mut handles = Vec::with_capacity(others.len());
                for member in &others {
                    handles.push(client.new_conversation(member, Some(context.clone())).await?);
                }
                let mut handles = handles.into_iter();
                let Some(primary) = handles.next() else {
                    return Err(EngineError::InvalidGroup("no members".to_string()));
                };
                let history = primary.messages().await.unwrap_or_default();
                Ok::<_, EngineError>(StartedChat {
                    admission: Admission {
                        key,
                        peer: others[0].clone(),
                        topic: primary.topic(),
                        handle: primary,
                        shared_assets: vec![],
                        group: Some(metadata),
                        history,
                    },
                })
            }
            .await;
            Self::post(&tx, InternalEvent::GroupCreated { epoch, result, reply });
        });
    }

    pub(super) fn on_group_created(&mut self, result: EngineResult<StartedChat>, reply: Reply<ConversationKey>) {
        self.set_busy(|b| b.creating_group = false);
        match result {
            Ok(StartedChat { admission }) => {
                let key = admission.key.clone();
                self.apply_admission(AdmissionOutcome::Admitted(Box::new(admission)));
                self.open_conversation(&key);
                respond(reply, Ok(key));
            }
            Err(e) => {
                tracing::warn!(err = %e, "group creation failed");
                self.fail(reply, e);
            }
        }
    }

    /// Persist a hidden marker and drop the conversation. Protocol data is untouched.
    pub(super) fn hide_conversation(&mut self, key: &ConversationKey) {
        let Some(record) = self.directory.get(key) else {
            return;
        };
        let group_name = record.group.as_ref().map(|g| g.name.clone());
        let marker = hidden::marker_for(&record.peer_address, group_name.as_deref());
        if let Err(e) = self.services.hidden.add(marker) {
            tracing::warn!(conversation = %key, err = %e, "failed to persist hidden marker");
        }
        tracing::info!(conversation = %key, topic = %record.topic, "conversation hidden");
        self.drop_conversation(key);
        self.emit_state();
    }
}
