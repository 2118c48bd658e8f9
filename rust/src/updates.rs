use flume::Sender;

use crate::core::{AdmissionOutcome, Established, StartedChat, StreamTarget};
use crate::error::{EngineError, EngineResult, MessagingError, NetworkError};
use crate::messaging::SharedConversation;
use crate::state::{AppState, ConversationKey, Message};
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

pub(crate) type Reply<T> = Option<Sender<EngineResult<T>>>;

/// Answer a waiting caller, if there is one.
pub(crate) fn respond<T>(reply: Reply<T>, result: EngineResult<T>) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}

pub(crate) enum CoreMsg {
    Action(AppAction),
    Request(Request),
    Internal(Box<InternalEvent>),
    Shutdown,
}

/// Actions whose caller blocks on the outcome.
pub(crate) enum Request {
    Connect {
        reply: Sender<EngineResult<()>>,
    },
    Disconnect {
        reply: Sender<EngineResult<()>>,
    },
    StartChat {
        peer_address: String,
        reply: Sender<EngineResult<Vec<Message>>>,
    },
    SendMessage {
        content: String,
        reply: Sender<EngineResult<()>>,
    },
    CreateGroup {
        name: String,
        members: Vec<String>,
        reply: Sender<EngineResult<ConversationKey>>,
    },
}

impl Request {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "Connect",
            Request::Disconnect { .. } => "Disconnect",
            Request::StartChat { .. } => "StartChat",
            Request::SendMessage { .. } => "SendMessage",
            Request::CreateGroup { .. } => "CreateGroup",
        }
    }
}

/// Results of async work, posted back to the actor. Every variant carries the session
/// epoch it was started under; the actor drops anything from an older epoch.
pub(crate) enum InternalEvent {
    // Session
    RestoreAuthorized {
        epoch: u64,
    },
    ConnectFinished {
        epoch: u64,
        silent: bool,
        result: Result<Established, EngineError>,
    },
    NetworkChanged {
        epoch: u64,
        chain_id: u64,
    },
    NetworkCorrected {
        epoch: u64,
        result: Result<(), NetworkError>,
    },

    // Directory
    ConversationsLoaded {
        epoch: u64,
        result: Result<Vec<AdmissionOutcome>, EngineError>,
    },
    ConversationDiscovered {
        epoch: u64,
        handle: SharedConversation,
    },
    ConversationAdmitted {
        epoch: u64,
        outcome: AdmissionOutcome,
    },

    // Streams
    MessageReceived {
        epoch: u64,
        key: ConversationKey,
        generation: u64,
        message: Message,
    },
    StreamClosed {
        epoch: u64,
        target: StreamTarget,
        generation: u64,
        error: Option<String>,
    },

    // Chat
    ChatStarted {
        epoch: u64,
        result: EngineResult<StartedChat>,
        reply: Reply<Vec<Message>>,
    },
    MessageSent {
        epoch: u64,
        key: ConversationKey,
        echo_id: String,
        result: Result<Message, MessagingError>,
        reply: Reply<()>,
    },
    GroupCreated {
        epoch: u64,
        result: EngineResult<StartedChat>,
        reply: Reply<ConversationKey>,
    },

    // Access
    AccessRecheckDue {
        epoch: u64,
    },
    AccessRechecked {
        epoch: u64,
        verdicts: Vec<AccessVerdict>,
        readmissions: Vec<AdmissionOutcome>,
    },
}

/// Outcome of re-evaluating one direct conversation. `shared` is `None` when a lookup
/// failed and the conversation should be left alone.
pub(crate) struct AccessVerdict {
    pub(crate) key: ConversationKey,
    pub(crate) shared: Option<Vec<crate::state::AssetInfo>>,
}
