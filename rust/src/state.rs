use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Normalize a user-supplied account address: trim and lower-case.
pub fn normalize_address(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

/// `0x` followed by 40 hex digits, after normalization.
pub fn is_valid_address(input: &str) -> bool {
    let normalized = normalize_address(input);
    let Some(body) = normalized.strip_prefix("0x") else {
        return false;
    };
    body.len() == 40 && hex::decode(body).is_ok()
}

/// A normalized account address. Equality is always on the lower-cased form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(normalize_address(raw.as_ref()))
    }

    /// Like [`Address::new`] but rejects anything that is not a hex account.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        if !is_valid_address(raw) {
            return Err(EngineError::InvalidAddress(raw.trim().to_string()));
        }
        Ok(Self::new(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x1234…abcd`, for log lines.
    pub fn short(&self) -> String {
        let chars = self.0.chars().count();
        if chars <= 12 {
            return self.0.clone();
        }
        let head: String = self.0.chars().take(6).collect();
        let tail: String = self.0.chars().skip(chars - 4).collect();
        format!("{head}…{tail}")
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Erc721,
    Erc1155,
    #[serde(other)]
    Unknown,
}

/// One owned contract class. Not per token: contracts are de-duplicated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub contract_address: Address,
    pub contract_name: String,
    pub asset_type: AssetType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_address: Address,
    pub content: String,
    /// Unix milliseconds.
    pub sent_at: i64,
}

impl Message {
    pub fn new(sender_address: Address, content: impl Into<String>, sent_at: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_address,
            content: content.into(),
            sent_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub name: String,
    pub members: Vec<Address>,
}

impl GroupMetadata {
    pub fn is_member(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m == address)
    }
}

/// Directory and stream-registry key. Direct conversations are keyed by the
/// normalized peer, groups by their group id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKey {
    Direct { peer: Address },
    Group { id: String },
}

const DIRECT_PREFIX: &str = "direct:";
const GROUP_PREFIX: &str = "group:";

impl ConversationKey {
    pub fn direct(peer: &Address) -> Self {
        Self::Direct { peer: peer.clone() }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::Group { id: id.into() }
    }

    /// Key for a protocol-level conversation id such as `group:Apes`.
    pub fn from_conversation_id(conversation_id: &str) -> Self {
        conversation_id
            .parse()
            .unwrap_or_else(|_| Self::group(conversation_id.trim()))
    }

    pub fn peer(&self) -> Option<&Address> {
        match self {
            Self::Direct { peer } => Some(peer),
            Self::Group { .. } => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { peer } => write!(f, "{DIRECT_PREFIX}{peer}"),
            Self::Group { id } => write!(f, "{GROUP_PREFIX}{id}"),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(peer) = s.strip_prefix(DIRECT_PREFIX) {
            return Ok(Self::Direct {
                peer: Address::parse(peer)?,
            });
        }
        if let Some(id) = s.strip_prefix(GROUP_PREFIX) {
            if !id.is_empty() {
                return Ok(Self::group(id));
            }
        }
        Err(EngineError::InvalidConversationKey(s.to_string()))
    }
}

/// Persisted "hidden conversation" marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenMarker {
    pub peer_address: Address,
    pub group_name: Option<String>,
    /// Unix milliseconds.
    pub hidden_at: i64,
}

impl HiddenMarker {
    /// Any member's handle can surface a group, so group markers match on the name alone.
    pub fn matches(&self, peer: &Address, group_name: Option<&str>) -> bool {
        match (self.group_name.as_deref(), group_name) {
            (Some(mine), Some(theirs)) => mine == theirs,
            (None, None) => &self.peer_address == peer,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the wallet moved to another chain and a correction is in flight.
    NetworkMismatch,
    Disconnecting,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::NetworkMismatch)
    }
}

/// "In flight" flags for operations the UI should reflect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusyState {
    pub starting_chat: bool,
    pub sending: bool,
    pub creating_group: bool,
}

impl BusyState {
    pub fn idle() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub peer_address: Address,
    pub preview: String,
    pub last_message_at: i64,
    pub unread_count: u32,
    pub shared_assets: Vec<AssetInfo>,
    pub group: Option<GroupMetadata>,
}

#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub session: SessionStatus,
    pub is_connected: bool,
    pub account: Option<Address>,
    pub conversations: Vec<ConversationSummary>,
    pub current_conversation: Option<ConversationKey>,
    /// Messages of the open conversation, oldest first.
    pub messages: Vec<Message>,
    pub is_loading_conversations: bool,
    pub busy: BusyState,
    pub error: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            session: SessionStatus::Disconnected,
            is_connected: false,
            account: None,
            conversations: vec![],
            current_conversation: None,
            messages: vec![],
            is_loading_conversations: false,
            busy: BusyState::idle(),
            error: None,
        }
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| &c.key == key)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
