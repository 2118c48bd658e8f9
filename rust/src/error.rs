//! Error taxonomy for the engine and its collaborator seams.

use crate::state::Address;

/// Wallet provider error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    /// No wallet provider is installed
    #[error("No crypto wallet found")]
    NotFound,
    /// The user declined the account request
    #[error("Wallet access was rejected")]
    Rejected,
    /// The wallet does not know the requested chain
    #[error("Chain {0} is not configured in the wallet")]
    UnrecognizedChain(u64),
    /// The wallet returned no accounts
    #[error("No wallet account available")]
    NoAccount,
    /// Any other provider failure
    #[error("Wallet request failed: {0}")]
    Provider(String),
}

/// Network validation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// Connected to a different chain than the required one
    #[error("Please connect to {expected_name} (chain {expected}); wallet is on chain {actual}")]
    WrongNetwork {
        expected: u64,
        expected_name: String,
        actual: u64,
    },
    /// Switching chains failed
    #[error("Failed to switch to {0} network")]
    SwitchFailed(String),
    /// Registering the chain with the wallet failed
    #[error("Failed to add {0} network")]
    AddChainFailed(String),
    /// Wallet error while validating
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// Messaging protocol error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    /// Client creation failed
    #[error("Failed to connect to the messaging network: {0}")]
    ClientCreation(String),
    /// Peer is not reachable on the messaging network
    #[error("{0} is not on the messaging network")]
    PeerUnreachable(Address),
    /// The protocol rejected a send
    #[error("Message rejected: {0}")]
    SendRejected(String),
    /// A subscription could not be opened or broke
    #[error("Stream failed: {0}")]
    Stream(String),
    /// Opaque transport failure
    #[error("Messaging transport error: {0}")]
    Transport(String),
}

/// Ownership lookup error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    /// Missing API credentials
    #[error("Ownership API key is not configured")]
    MissingApiKey,
    /// HTTP failure
    #[error("Ownership request failed: {0}")]
    Request(String),
    /// Unexpected payload
    #[error("Ownership response could not be decoded: {0}")]
    Decode(String),
}

/// Local persistence error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Why a direct conversation is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenial {
    /// The local user holds no assets
    #[error("You don't own any NFTs on this network, so you can't start a chat")]
    UserOwnsNothing,
    /// The peer holds no assets
    #[error("This address doesn't own any NFTs on this network")]
    PeerOwnsNothing,
    /// Both hold assets but none in common
    #[error("You and this address don't share any NFT collections")]
    NoOverlap,
}

/// User-facing engine error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Operation needs a connected session
    #[error("Please connect your wallet first")]
    NotConnected,
    /// `send_message` without an open conversation
    #[error("No active conversation")]
    NoActiveConversation,
    /// Malformed account address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    /// Malformed conversation key
    #[error("Invalid conversation key: {0}")]
    InvalidConversationKey(String),
    /// Group creation input was unusable
    #[error("Invalid group: {0}")]
    InvalidGroup(String),
    /// Access gate rejected the peer
    #[error(transparent)]
    AccessDenied(#[from] AccessDenial),
    /// Wallet failure
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// Network validation failure
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// Messaging protocol failure
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// Ownership lookup failure
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    /// The session went away while the request was in flight
    #[error("Session ended before the request completed")]
    SessionEnded,
    /// The engine actor is gone
    #[error("Engine is not running")]
    EngineStopped,
}

pub type EngineResult<T> = Result<T, EngineError>;
