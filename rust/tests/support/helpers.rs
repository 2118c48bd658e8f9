use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokentalk_core::{
    Address, AppReconciler, AppState, AppUpdate, ConversationKey, Services, TokenTalkApp,
};

use super::fakes::{FakeConnector, FakeNetwork, FakeOwnership, FakeWallet};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn wait_until(what: &str, timeout: Duration, f: impl FnMut() -> bool) {
    wait_until_with_poll(what, timeout, Duration::from_millis(20), f);
}

pub fn wait_until_with_poll(
    what: &str,
    timeout: Duration,
    poll: Duration,
    mut f: impl FnMut() -> bool,
) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(poll);
    }
    panic!("{what}: condition not met within {timeout:?}");
}

/// Ownership lookups are never served from cache and the recheck timer never fires on
/// its own, so tests drive rechecks explicitly.
pub fn write_config(data_dir: &str) {
    let path = std::path::Path::new(data_dir).join("tokentalk_config.json");
    let v = serde_json::json!({
        "ownership_cache_ttl_secs": 0,
        "access_recheck_interval_secs": 3600,
        "access_recheck_jitter_secs": 0,
        "dedup_tolerance_ms": 1000,
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

#[derive(Clone)]
pub struct Collector(pub Arc<Mutex<Vec<AppUpdate>>>);

impl Collector {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn revs(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(AppUpdate::rev).collect()
    }
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

/// One local user wired to shared fakes.
pub struct Harness {
    pub me: Address,
    pub app: Arc<TokenTalkApp>,
    pub network: Arc<FakeNetwork>,
    pub wallet: Arc<FakeWallet>,
    pub ownership: Arc<FakeOwnership>,
    pub connector: Arc<FakeConnector>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(me: Address) -> Self {
        let network = FakeNetwork::new();
        let wallet = FakeWallet::new(me.clone());
        let ownership = FakeOwnership::new();
        let dir = tempfile::tempdir().unwrap();
        Self::start(me, network, wallet, ownership, dir)
    }

    /// Start an app over existing fakes and data dir (e.g. to simulate a relaunch).
    pub fn start(
        me: Address,
        network: Arc<FakeNetwork>,
        wallet: Arc<FakeWallet>,
        ownership: Arc<FakeOwnership>,
        dir: TempDir,
    ) -> Self {
        let data_dir = dir.path().to_string_lossy().to_string();
        write_config(&data_dir);
        let connector = FakeConnector::new(network.clone());
        let services = Services::with_json_hidden_store(
            wallet.clone(),
            connector.clone(),
            ownership.clone(),
            &data_dir,
        );
        let app = TokenTalkApp::new(data_dir, services);
        Self {
            me,
            app,
            network,
            wallet,
            ownership,
            connector,
            dir,
        }
    }

    /// Drop the app and start a new one over the same fakes and data dir.
    pub fn relaunch(self) -> Self {
        let Self {
            me,
            app,
            network,
            wallet,
            ownership,
            dir,
            ..
        } = self;
        drop(app);
        Self::start(me, network, wallet, ownership, dir)
    }

    pub fn data_dir(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn state(&self) -> AppState {
        self.app.state()
    }

    pub fn wait(&self, what: &str, mut f: impl FnMut(&AppState) -> bool) -> AppState {
        wait_until(what, TIMEOUT, || f(&self.app.state()));
        self.app.state()
    }

    pub fn connect(&self) {
        self.app.connect().unwrap();
        assert!(self.state().is_connected);
    }

    /// Conversations are visible and every one of them is streaming.
    pub fn wait_streams(&self, message_streams: usize) {
        wait_until("message streams open", TIMEOUT, || {
            self.network.open_message_streams() == message_streams
        });
    }

    pub fn unread(&self, key: &ConversationKey) -> Option<u32> {
        self.state().conversation(key).map(|c| c.unread_count)
    }
}
