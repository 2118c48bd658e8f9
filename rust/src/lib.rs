mod access;
mod actions;
mod core;
mod error;
mod hidden;
mod logging;
mod messaging;
mod network;
mod ownership;
mod state;
mod updates;
mod wallet;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use access::*;
pub use actions::AppAction;
pub use error::*;
pub use hidden::*;
pub use logging::init_logging;
pub use messaging::*;
pub use network::*;
pub use ownership::*;
pub use state::*;
pub use updates::AppUpdate;
pub use wallet::*;

use crate::updates::{CoreMsg, Request};

/// External collaborators the engine talks to. Injected once at construction.
#[derive(Clone)]
pub struct Services {
    pub wallet: SharedWalletProvider,
    pub messaging: Arc<dyn MessagingConnector>,
    pub ownership: SharedOwnershipApi,
    pub hidden: SharedHiddenStore,
}

impl Services {
    /// Services with the default JSON hidden-conversation store under `data_dir`.
    pub fn with_json_hidden_store(
        wallet: SharedWalletProvider,
        messaging: Arc<dyn MessagingConnector>,
        ownership: SharedOwnershipApi,
        data_dir: &str,
    ) -> Self {
        Self {
            wallet,
            messaging,
            ownership,
            hidden: Arc::new(JsonHiddenStore::new(data_dir)),
        }
    }
}

/// Alchemy-backed ownership lookups, keyed from `tokentalk_config.json` or
/// `ALCHEMY_API_KEY`.
pub fn alchemy_ownership_api(data_dir: &str) -> Result<AlchemyOwnershipApi, OwnershipError> {
    let config = core::load_app_config(data_dir);
    let base_url = config.ownership_api_url();
    match config.ownership_api_key() {
        Some(key) => Ok(AlchemyOwnershipApi::new(base_url, key)),
        None => AlchemyOwnershipApi::from_env(base_url),
    }
}

pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

pub struct TokenTalkApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

impl TokenTalkApp {
    pub fn new(data_dir: String, services: Services) -> Arc<Self> {
        logging::init_logging();
        tracing::info!(data_dir = %data_dir, "TokenTalkApp::new() starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                services,
            );
            while let Ok(msg) = core_rx.recv() {
                let stop = matches!(msg, CoreMsg::Shutdown);
                core.handle_message(msg);
                if stop {
                    break;
                }
            }
        });

        let app = Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        });
        app.dispatch(AppAction::RestoreSession);
        app
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    /// Block until the actor answers. Must not be called from a reconciler callback
    /// running on the update thread while the actor waits on it.
    fn request<T>(&self, make: impl FnOnce(Sender<EngineResult<T>>) -> Request) -> EngineResult<T> {
        let (tx, rx) = flume::bounded(1);
        self.core_tx
            .send(CoreMsg::Request(make(tx)))
            .map_err(|_| EngineError::EngineStopped)?;
        rx.recv().map_err(|_| EngineError::EngineStopped)?
    }

    /// Connect the wallet account. No-op when already connected; joins an attempt
    /// already in flight.
    pub fn connect(&self) -> EngineResult<()> {
        self.request(|reply| Request::Connect { reply })
    }

    /// Returns once every subscription is cancelled and session state is cleared.
    pub fn disconnect(&self) -> EngineResult<()> {
        self.request(|reply| Request::Disconnect { reply })
    }

    /// Gate, open and select a direct conversation. Returns its messages.
    pub fn start_chat(&self, peer_address: &str) -> EngineResult<Vec<Message>> {
        let peer_address = peer_address.to_string();
        self.request(|reply| Request::StartChat {
            peer_address,
            reply,
        })
    }

    /// Send into the open conversation.
    pub fn send_message(&self, content: &str) -> EngineResult<()> {
        let content = content.to_string();
        self.request(|reply| Request::SendMessage { content, reply })
    }

    pub fn create_group(&self, name: &str, members: &[String]) -> EngineResult<ConversationKey> {
        let name = name.to_string();
        let members = members.to_vec();
        self.request(|reply| Request::CreateGroup {
            name,
            members,
            reply,
        })
    }
}

impl Drop for TokenTalkApp {
    fn drop(&mut self) {
        let _ = self.core_tx.send(CoreMsg::Shutdown);
    }
}
