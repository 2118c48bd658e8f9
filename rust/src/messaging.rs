//! Messaging protocol seam. The engine never speaks the wire protocol itself;
//! a host crate adapts its protocol client to these traits.

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::error::MessagingError;
use crate::state::{Address, ConversationKey, GroupMetadata, Message};
use crate::wallet::SharedWalletProvider;

/// Protocol-level conversation context. Group conversations carry their metadata here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub group: Option<GroupMetadata>,
}

pub type MessageStream = BoxStream<'static, Result<Message, MessagingError>>;
pub type ConversationStream = BoxStream<'static, Result<SharedConversation, MessagingError>>;

#[async_trait::async_trait]
pub trait ConversationHandle: Send + Sync + 'static {
    fn peer_address(&self) -> Address;

    /// Protocol topic; stable per conversation.
    fn topic(&self) -> String;

    fn context(&self) -> Option<ConversationContext>;

    /// Full history, oldest first.
    async fn messages(&self) -> Result<Vec<Message>, MessagingError>;

    /// Live messages, including ones the local account sends.
    async fn stream_messages(&self) -> Result<MessageStream, MessagingError>;

    /// Returns the message as recorded by the network (authoritative timestamp).
    async fn send(&self, content: &str) -> Result<Message, MessagingError>;
}

pub type SharedConversation = Arc<dyn ConversationHandle>;

/// Group metadata of a handle, if it is a group conversation.
pub fn group_of(handle: &dyn ConversationHandle) -> Option<(String, GroupMetadata)> {
    let ctx = handle.context()?;
    ctx.group.map(|g| (ctx.conversation_id, g))
}

/// Directory key a handle maps to.
pub fn key_of(handle: &dyn ConversationHandle) -> ConversationKey {
    match group_of(handle) {
        Some((conversation_id, _)) => ConversationKey::from_conversation_id(&conversation_id),
        None => ConversationKey::direct(&handle.peer_address()),
    }
}

#[async_trait::async_trait]
pub trait MessagingClient: Send + Sync + 'static {
    async fn list_conversations(&self) -> Result<Vec<SharedConversation>, MessagingError>;

    /// Get or create the conversation with `peer` (optionally under a context).
    async fn new_conversation(
        &self,
        peer: &Address,
        context: Option<ConversationContext>,
    ) -> Result<SharedConversation, MessagingError>;

    /// Conversations created after the call, involving the local account.
    async fn stream_conversations(&self) -> Result<ConversationStream, MessagingError>;
}

pub type SharedMessagingClient = Arc<dyn MessagingClient>;

#[async_trait::async_trait]
pub trait MessagingConnector: Send + Sync + 'static {
    /// `createClient(signer)`: the wallet signs whatever the protocol needs for `account`.
    async fn create_client(
        &self,
        account: &Address,
        wallet: SharedWalletProvider,
    ) -> Result<SharedMessagingClient, MessagingError>;
}
