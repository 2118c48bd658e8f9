//! Wallet provider seam (accounts, chain id, chain switching).

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::error::WalletError;
use crate::state::Address;

/// Chain parameters handed to the wallet when it has to learn a new chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub chain_name: String,
    pub currency_name: String,
    pub currency_symbol: String,
    pub currency_decimals: u8,
    pub rpc_urls: Vec<String>,
    pub block_explorer_urls: Vec<String>,
}

impl ChainConfig {
    pub fn linea_mainnet() -> Self {
        Self {
            chain_id: 59144,
            chain_name: "Linea Mainnet".to_string(),
            currency_name: "ETH".to_string(),
            currency_symbol: "ETH".to_string(),
            currency_decimals: 18,
            rpc_urls: vec!["https://rpc.linea.build".to_string()],
            block_explorer_urls: vec!["https://lineascan.build".to_string()],
        }
    }

    /// `0xe708` style id used by EIP-1193 wallets.
    pub fn hex_chain_id(&self) -> String {
        format!("{:#x}", self.chain_id)
    }
}

#[async_trait::async_trait]
pub trait WalletProvider: Send + Sync + 'static {
    /// Prompt the user for account access.
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;

    /// Accounts already authorized for this origin. Never prompts.
    async fn authorized_accounts(&self) -> Result<Vec<Address>, WalletError>;

    async fn chain_id(&self) -> Result<u64, WalletError>;

    /// Fails with [`WalletError::UnrecognizedChain`] when the wallet has never seen the chain.
    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError>;

    async fn add_chain(&self, chain: &ChainConfig) -> Result<(), WalletError>;

    /// Chain-changed notifications. Ends when the provider goes away.
    fn network_changes(&self) -> BoxStream<'static, u64>;
}

pub type SharedWalletProvider = Arc<dyn WalletProvider>;
