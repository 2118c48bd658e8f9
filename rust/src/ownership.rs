//! Ownership lookups: the remote API seam and the TTL cache in front of it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::OwnershipError;
use crate::state::{Address, AssetInfo, AssetType};

pub const DEFAULT_OWNERSHIP_TTL: Duration = Duration::from_secs(5 * 60);

#[async_trait::async_trait]
pub trait OwnershipApi: Send + Sync + 'static {
    /// Distinct owned contracts of `address` on the configured chain.
    async fn owned_assets(&self, address: &Address) -> Result<Vec<AssetInfo>, OwnershipError>;
}

pub type SharedOwnershipApi = Arc<dyn OwnershipApi>;

const ALCHEMY_LINEA_URL: &str = "https://linea-mainnet.g.alchemy.com";
const UNKNOWN_CONTRACT_NAME: &str = "Unknown Contract";
// Bound pagination so a wallet with a huge collection cannot stall a gate check.
const MAX_PAGES: usize = 20;

/// Alchemy NFT API (`getNFTsForOwner`) on Linea.
pub struct AlchemyOwnershipApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedNftsPage {
    #[serde(default)]
    owned_nfts: Vec<OwnedNft>,
    #[serde(default)]
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedNft {
    contract: NftContract,
    #[serde(default)]
    token_type: Option<AssetType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NftContract {
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    token_type: Option<AssetType>,
}

impl AlchemyOwnershipApi {
    pub fn new(base_url: Option<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| ALCHEMY_LINEA_URL.to_string()),
            api_key: api_key.into(),
        }
    }

    /// Reads `ALCHEMY_API_KEY`.
    pub fn from_env(base_url: Option<String>) -> Result<Self, OwnershipError> {
        let key = std::env::var("ALCHEMY_API_KEY").map_err(|_| OwnershipError::MissingApiKey)?;
        if key.trim().is_empty() {
            return Err(OwnershipError::MissingApiKey);
        }
        Ok(Self::new(base_url, key.trim()))
    }

    async fn fetch_page(
        &self,
        owner: &Address,
        page_key: Option<&str>,
    ) -> Result<OwnedNftsPage, OwnershipError> {
        let url = format!("{}/nft/v3/{}/getNFTsForOwner", self.base_url, self.api_key);
        let mut query: Vec<(&str, &str)> = vec![("owner", owner.as_str()), ("withMetadata", "true")];
        if let Some(k) = page_key {
            query.push(("pageKey", k));
        }
        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| OwnershipError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OwnershipError::Request(format!("HTTP {status}")));
        }
        resp.json::<OwnedNftsPage>()
            .await
            .map_err(|e| OwnershipError::Decode(e.to_string()))
    }
}

/// Collapse per-token entries into one entry per contract, first seen wins.
fn dedup_by_contract(nfts: impl IntoIterator<Item = OwnedNft>) -> Vec<AssetInfo> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for nft in nfts {
        let contract_address = Address::new(&nft.contract.address);
        if !seen.insert(contract_address.clone()) {
            continue;
        }
        let contract_name = nft
            .contract
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_CONTRACT_NAME.to_string());
        out.push(AssetInfo {
            contract_address,
            contract_name,
            asset_type: nft
                .token_type
                .or(nft.contract.token_type)
                .unwrap_or(AssetType::Unknown),
        });
    }
    out
}

#[async_trait::async_trait]
impl OwnershipApi for AlchemyOwnershipApi {
    async fn owned_assets(&self, address: &Address) -> Result<Vec<AssetInfo>, OwnershipError> {
        let mut nfts = Vec::new();
        let mut page_key: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(address, page_key.as_deref()).await?;
            nfts.extend(page.owned_nfts);
            page_key = page.page_key.filter(|k| !k.is_empty());
            if page_key.is_none() {
                break;
            }
        }
        let assets = dedup_by_contract(nfts);
        tracing::debug!(owner = %address.short(), contracts = assets.len(), "owned assets fetched");
        Ok(assets)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    assets: Vec<AssetInfo>,
    fetched_at: Instant,
}

/// Address -> owned contracts, expiring lazily after `ttl`.
///
/// Concurrent misses for the same address are not coalesced; each performs its own
/// lookup and the last writer wins. Failed lookups are never cached.
pub struct OwnershipCache {
    api: SharedOwnershipApi,
    ttl: Duration,
    entries: RwLock<HashMap<Address, CacheEntry>>,
}

impl OwnershipCache {
    pub fn new(api: SharedOwnershipApi, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_assets(&self, address: &Address) -> Result<Vec<AssetInfo>, OwnershipError> {
        self.get_assets_at(address, Instant::now()).await
    }

    pub(crate) async fn get_assets_at(
        &self,
        address: &Address,
        now: Instant,
    ) -> Result<Vec<AssetInfo>, OwnershipError> {
        if let Some(hit) = self.cached_at(address, now) {
            return Ok(hit);
        }
        let assets = self.api.owned_assets(address).await?;
        let entry = CacheEntry {
            assets: assets.clone(),
            fetched_at: now,
        };
        match self.entries.write() {
            Ok(mut g) => {
                g.insert(address.clone(), entry);
            }
            Err(poison) => {
                poison.into_inner().insert(address.clone(), entry);
            }
        }
        Ok(assets)
    }

    /// Fresh cached value, if any.
    pub(crate) fn cached_at(&self, address: &Address, now: Instant) -> Option<Vec<AssetInfo>> {
        let read = |entries: &HashMap<Address, CacheEntry>| {
            entries
                .get(address)
                .filter(|e| now.saturating_duration_since(e.fetched_at) < self.ttl)
                .map(|e| e.assets.clone())
        };
        match self.entries.read() {
            Ok(g) => read(&g),
            Err(poison) => read(&poison.into_inner()),
        }
    }

    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut g) => g.clear(),
            Err(poison) => poison.into_inner().clear(),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(g) => g.len(),
            Err(poison) => poison.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
