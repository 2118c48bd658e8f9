use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::store::DEFAULT_DEDUP_TOLERANCE;
use crate::ownership::DEFAULT_OWNERSHIP_TTL;
use crate::wallet::ChainConfig;

const CONFIG_FILE: &str = "tokentalk_config.json";

const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RECHECK_JITTER: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) required_chain_id: Option<u64>,
    pub(crate) chain_name: Option<String>,
    pub(crate) chain_rpc_urls: Option<Vec<String>>,
    pub(crate) chain_explorer_urls: Option<Vec<String>>,
    pub(crate) ownership_cache_ttl_secs: Option<u64>,
    pub(crate) access_recheck_interval_secs: Option<u64>,
    pub(crate) access_recheck_jitter_secs: Option<u64>,
    pub(crate) dedup_tolerance_ms: Option<u64>,
    pub(crate) disable_auto_restore: Option<bool>,
    pub(crate) ownership_api_url: Option<String>,
    pub(crate) ownership_api_key: Option<String>,
}

pub(crate) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "invalid config, using defaults");
            AppConfig::default()
        }
    }
}

fn non_empty(urls: &Option<Vec<String>>) -> Option<Vec<String>> {
    let urls: Vec<String> = urls
        .as_ref()?
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    (!urls.is_empty()).then_some(urls)
}

impl AppConfig {
    /// Linea mainnet unless overridden field by field.
    pub(crate) fn required_chain(&self) -> ChainConfig {
        let mut chain = ChainConfig::linea_mainnet();
        if let Some(id) = self.required_chain_id {
            chain.chain_id = id;
        }
        if let Some(name) = self.chain_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            chain.chain_name = name.to_string();
        }
        if let Some(urls) = non_empty(&self.chain_rpc_urls) {
            chain.rpc_urls = urls;
        }
        if let Some(urls) = non_empty(&self.chain_explorer_urls) {
            chain.block_explorer_urls = urls;
        }
        chain
    }

    pub(crate) fn ownership_ttl(&self) -> Duration {
        self.ownership_cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_OWNERSHIP_TTL)
    }

    pub(crate) fn recheck_interval(&self) -> Duration {
        self.access_recheck_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECHECK_INTERVAL)
    }

    pub(crate) fn recheck_jitter(&self) -> Duration {
        self.access_recheck_jitter_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECHECK_JITTER)
    }

    pub(crate) fn dedup_tolerance(&self) -> Duration {
        self.dedup_tolerance_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DEDUP_TOLERANCE)
    }

    pub(crate) fn auto_restore_enabled(&self) -> bool {
        self.disable_auto_restore != Some(true)
    }

    pub(crate) fn ownership_api_url(&self) -> Option<String> {
        self.ownership_api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(ToString::to_string)
    }

    pub(crate) fn ownership_api_key(&self) -> Option<String> {
        self.ownership_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(ToString::to_string)
    }
}
