//! Network validator: keeps the wallet on the required chain.

use crate::error::{NetworkError, WalletError};
use crate::wallet::{ChainConfig, WalletProvider};

#[derive(Clone, Debug)]
pub struct NetworkValidator {
    required: ChainConfig,
}

impl NetworkValidator {
    pub fn new(required: ChainConfig) -> Self {
        Self { required }
    }

    pub fn required(&self) -> &ChainConfig {
        &self.required
    }

    pub fn is_required_chain(&self, chain_id: u64) -> bool {
        chain_id == self.required.chain_id
    }

    pub async fn validate(&self, wallet: &dyn WalletProvider) -> Result<(), NetworkError> {
        let actual = wallet.chain_id().await?;
        if self.is_required_chain(actual) {
            return Ok(());
        }
        Err(NetworkError::WrongNetwork {
            expected: self.required.chain_id,
            expected_name: self.required.chain_name.clone(),
            actual,
        })
    }

    /// Validate; on mismatch switch (adding the chain if the wallet does not know it)
    /// and validate exactly once more.
    pub async fn ensure(&self, wallet: &dyn WalletProvider) -> Result<(), NetworkError> {
        match self.validate(wallet).await {
            Ok(()) => return Ok(()),
            Err(NetworkError::WrongNetwork { actual, .. }) => {
                tracing::info!(
                    actual,
                    required = self.required.chain_id,
                    "wrong network, switching"
                );
            }
            Err(e) => return Err(e),
        }

        self.switch(wallet).await?;
        self.validate(wallet).await
    }

    async fn switch(&self, wallet: &dyn WalletProvider) -> Result<(), NetworkError> {
        let name = self.required.chain_name.clone();
        match wallet.switch_chain(self.required.chain_id).await {
            Ok(()) => Ok(()),
            Err(WalletError::UnrecognizedChain(_)) => {
                tracing::info!(chain = %self.required.hex_chain_id(), "chain unknown to wallet, adding");
                wallet.add_chain(&self.required).await.map_err(|e| {
                    tracing::warn!(%e, "add_chain failed");
                    NetworkError::AddChainFailed(name)
                })
            }
            Err(e) => {
                tracing::warn!(%e, "switch_chain failed");
                Err(NetworkError::SwitchFailed(name))
            }
        }
    }
}
