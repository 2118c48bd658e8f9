mod chat;
mod config;
mod directory;
mod gating;
mod session;
mod storage;
mod store;
mod streams;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::error::{EngineError, EngineResult};
use crate::messaging::{SharedConversation, SharedMessagingClient};
use crate::network::NetworkValidator;
use crate::ownership::OwnershipCache;
use crate::state::{Address, AppState, BusyState, ConversationKey};
use crate::updates::{respond, AppUpdate, CoreMsg, InternalEvent, Reply, Request};
use crate::Services;

use directory::ConversationDirectory;
use store::MessageStore;
use streams::StreamRegistry;

pub(crate) use config::load_app_config;
pub(crate) use gating::{Admission, AdmissionOutcome};
pub(crate) use streams::StreamTarget;

/// Result of a successful connect: the account and its protocol client.
pub(crate) struct Established {
    pub(crate) account: Address,
    pub(crate) client: SharedMessagingClient,
}

pub(crate) struct StartedChat {
    pub(crate) admission: Admission,
}

struct Session {
    account: Address,
    client: SharedMessagingClient,
    // Primary protocol handle per visible conversation.
    handles: HashMap<ConversationKey, SharedConversation>,
    // Direct conversations a recheck removed. Every later recheck gates them again.
    revoked: HashMap<ConversationKey, SharedConversation>,
    streams: StreamRegistry,
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    data_dir: String,
    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    services: Services,
    validator: NetworkValidator,
    cache: Arc<OwnershipCache>,
    directory: ConversationDirectory,

    session: Option<Session>,

    // Bumped on every connect attempt and teardown; async results from older epochs
    // are dropped.
    epoch: u64,
    pending_connect: Vec<Sender<EngineResult<()>>>,
    recheck_in_flight: bool,
    sends_in_flight: usize,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        services: Services,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let state = AppState::empty();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let validator = NetworkValidator::new(config.required_chain());
        let cache = Arc::new(OwnershipCache::new(
            services.ownership.clone(),
            config.ownership_ttl(),
        ));
        let directory = ConversationDirectory::new(MessageStore::new(config.dedup_tolerance()));

        tracing::info!(
            chain_id = validator.required().chain_id,
            ttl_secs = config.ownership_ttl().as_secs(),
            dedup_ms = config.dedup_tolerance().as_millis() as u64,
            "core configured"
        );

        let this = Self {
            state,
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            data_dir,
            config,
            runtime,
            services,
            validator,
            cache,
            directory,
            session: None,
            epoch: 0,
            pending_connect: vec![],
            recheck_in_flight: false,
            sends_in_flight: 0,
        };

        // Ensure TokenTalkApp::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    /// Refresh the directory projection and publish a full snapshot.
    fn emit_state(&mut self) {
        self.state.conversations = self.directory.summaries();
        self.state.messages = match &self.state.current_conversation {
            Some(key) => self.directory.messages(key),
            None => vec![],
        };
        self.state.is_connected = self.state.session.is_connected();
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    /// Put an error in the single user-visible slot. Kept until the UI clears it.
    fn set_error(&mut self, msg: impl Into<String>) {
        self.state.error = Some(msg.into());
        self.emit_state();
    }

    /// Report a failure to the waiting caller, or to the error slot when nobody waits.
    fn fail<T>(&mut self, reply: Reply<T>, err: EngineError) {
        match reply {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => self.set_error(err.to_string()),
        }
    }

    fn set_busy(&mut self, f: impl FnOnce(&mut BusyState)) {
        let mut next = self.state.busy.clone();
        f(&mut next);
        if next != self.state.busy {
            self.state.busy = next;
            self.emit_state();
        }
    }

    fn post(tx: &Sender<CoreMsg>, ev: InternalEvent) {
        let _ = tx.send(CoreMsg::Internal(Box::new(ev)));
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action` directly: it can contain message content.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Request(request) => {
                tracing::info!(request = request.tag(), "request");
                self.handle_request(request);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
            CoreMsg::Shutdown => self.shutdown(),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Connect => self.connect(false, None),
            AppAction::RestoreSession => self.restore_session(),
            AppAction::Disconnect => self.disconnect(None),
            AppAction::StartChat { peer_address } => self.start_chat(&peer_address, None),
            AppAction::SendMessage { content } => self.send_message(content, None),
            AppAction::OpenConversation { key } => self.open_conversation(&key),
            AppAction::MarkRead { key } => {
                if self.directory.mark_read(&key) {
                    self.emit_state();
                }
            }
            AppAction::HideConversation { key } => self.hide_conversation(&key),
            AppAction::CreateGroup { name, members } => self.create_group(&name, &members, None),
            AppAction::RecheckAccess => self.recheck_access(),
            AppAction::ClearError => {
                if self.state.error.take().is_some() {
                    self.emit_state();
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { reply } => self.connect(false, Some(reply)),
            Request::Disconnect { reply } => self.disconnect(Some(reply)),
            Request::StartChat {
                peer_address,
                reply,
            } => self.start_chat(&peer_address, Some(reply)),
            Request::SendMessage { content, reply } => self.send_message(content, Some(reply)),
            Request::CreateGroup {
                name,
                members,
                reply,
            } => self.create_group(&name, &members, Some(reply)),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::RestoreAuthorized { epoch } => {
                if epoch == self.epoch {
                    self.connect(true, None);
                }
            }
            InternalEvent::ConnectFinished {
                epoch,
                silent,
                result,
            } => self.on_connect_finished(epoch, silent, result),
            InternalEvent::NetworkChanged { epoch, chain_id } => {
                if epoch == self.epoch {
                    self.on_network_changed(chain_id);
                }
            }
            InternalEvent::NetworkCorrected { epoch, result } => {
                if epoch == self.epoch {
                    self.on_network_corrected(result);
                }
            }
            InternalEvent::ConversationsLoaded { epoch, result } => {
                if epoch == self.epoch {
                    self.on_conversations_loaded(result);
                }
            }
            InternalEvent::ConversationDiscovered { epoch, handle } => {
                if epoch == self.epoch {
                    self.on_conversation_discovered(handle);
                }
            }
            InternalEvent::ConversationAdmitted { epoch, outcome } => {
                if epoch == self.epoch && self.apply_admission(outcome) {
                    self.emit_state();
                }
            }
            InternalEvent::MessageReceived {
                epoch,
                key,
                generation,
                message,
            } => {
                if epoch == self.epoch {
                    self.on_message_received(&key, generation, message);
                }
            }
            InternalEvent::StreamClosed {
                epoch,
                target,
                generation,
                error,
            } => {
                if epoch == self.epoch {
                    self.on_stream_closed(target, generation, error);
                }
            }
            InternalEvent::ChatStarted {
                epoch,
                result,
                reply,
            } => {
                if epoch != self.epoch {
                    respond(reply, Err(EngineError::SessionEnded));
                    return;
                }
                self.on_chat_started(result, reply);
            }
            InternalEvent::MessageSent {
                epoch,
                key,
                echo_id,
                result,
                reply,
            } => {
                if epoch != self.epoch {
                    respond(reply, Err(EngineError::SessionEnded));
                    return;
                }
                self.on_message_sent(&key, &echo_id, result, reply);
            }
            InternalEvent::GroupCreated {
                epoch,
                result,
                reply,
            } => {
                if epoch != self.epoch {
                    respond(reply, Err(EngineError::SessionEnded));
                    return;
                }
                self.on_group_created(result, reply);
            }
            InternalEvent::AccessRecheckDue { epoch } => {
                if epoch == self.epoch {
                    self.recheck_access();
                }
            }
            InternalEvent::AccessRechecked {
                epoch,
                verdicts,
                readmissions,
            } => {
                if epoch == self.epoch {
                    self.apply_access_verdicts(verdicts, readmissions);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("core shutdown");
        self.teardown_session(false);
    }
}
