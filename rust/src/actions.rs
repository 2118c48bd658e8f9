use crate::state::ConversationKey;

#[derive(Debug, Clone)]
pub enum AppAction {
    // Session
    Connect,
    RestoreSession,
    Disconnect,

    // Chat
    StartChat {
        peer_address: String,
    },
    SendMessage {
        content: String,
    },
    OpenConversation {
        key: ConversationKey,
    },
    MarkRead {
        key: ConversationKey,
    },
    HideConversation {
        key: ConversationKey,
    },
    CreateGroup {
        name: String,
        members: Vec<String>,
    },

    // Access
    RecheckAccess,

    // UI
    ClearError,
}

impl AppAction {
    /// Log-safe action tag (never includes message content).
    pub fn tag(&self) -> &'static str {
        match self {
            // Session
            AppAction::Connect => "Connect",
            AppAction::RestoreSession => "RestoreSession",
            AppAction::Disconnect => "Disconnect",

            // Chat
            AppAction::StartChat { .. } => "StartChat",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::MarkRead { .. } => "MarkRead",
            AppAction::HideConversation { .. } => "HideConversation",
            AppAction::CreateGroup { .. } => "CreateGroup",

            // Access
            AppAction::RecheckAccess => "RecheckAccess",

            // UI
            AppAction::ClearError => "ClearError",
        }
    }
}
