// Session lifecycle: connect, auto-restore, network monitoring, teardown.

use std::convert::Infallible;

use futures::StreamExt;

use super::streams::{close_all, spawn_interval, spawn_subscription, StreamEvent};
use super::*;
use crate::error::{NetworkError, WalletError};
use crate::messaging::MessagingConnector;
use crate::network::NetworkValidator;
use crate::state::SessionStatus;
use crate::wallet::SharedWalletProvider;

/// Accounts, network, client. Nothing is kept unless every step succeeds.
async fn establish(
    wallet: SharedWalletProvider,
    connector: Arc<dyn MessagingConnector>,
    validator: NetworkValidator,
    silent: bool,
) -> Result<Established, EngineError> {
    let accounts = if silent {
        wallet.authorized_accounts().await?
    } else {
        wallet.request_accounts().await?
    };
    let account = accounts.into_iter().next().ok_or(WalletError::NoAccount)?;
    tracing::info!(account = %account.short(), "account authorized");

    validator.ensure(wallet.as_ref()).await?;

    let client = connector.create_client(&account, wallet.clone()).await?;
    tracing::info!(account = %account.short(), "messaging client created");
    Ok(Established { account, client })
}

impl AppCore {
    pub(super) fn connect(&mut self, silent: bool, reply: Option<Sender<EngineResult<()>>>) {
        match self.state.session {
            SessionStatus::Connecting => {
                tracing::debug!("connect already in flight");
                self.pending_connect.extend(reply);
                return;
            }
            s if s.is_connected() => {
                respond(reply, Ok(()));
                return;
            }
            _ => {}
        }

        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        self.pending_connect.extend(reply);
        self.state.session = SessionStatus::Connecting;
        if !silent {
            self.state.error = None;
        }
        self.emit_state();

        let wallet = self.services.wallet.clone();
        let connector = self.services.messaging.clone();
        let validator = self.validator.clone();
        let tx = self.core_sender.clone();
        tracing::info!(silent, epoch, "connect");
        self.runtime.spawn(async move {
            let result = establish(wallet, connector, validator, silent).await;
            Self::post(
                &tx,
                InternalEvent::ConnectFinished {
                    epoch,
                    silent,
                    result,
                },
            );
        });
    }

    /// Silent connect when the wallet already authorized an account and the user did not
    /// explicitly disconnect last time.
    pub(super) fn restore_session(&mut self) {
        if !self.config.auto_restore_enabled() {
            tracing::debug!("auto-restore disabled by config");
            return;
        }
        if self.state.session != SessionStatus::Disconnected {
            return;
        }
        if self.explicitly_disconnected() {
            tracing::info!("auto-restore skipped after explicit disconnect");
            return;
        }

        let epoch = self.epoch;
        let wallet = self.services.wallet.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            match wallet.authorized_accounts().await {
                Ok(accounts) if !accounts.is_empty() => {
                    Self::post(&tx, InternalEvent::RestoreAuthorized { epoch });
                }
                Ok(_) => tracing::debug!("auto-restore: no authorized account"),
                Err(e) => tracing::debug!(err = %e, "auto-restore: wallet unavailable"),
            }
        });
    }

    pub(super) fn on_connect_finished(
        &mut self,
        epoch: u64,
        silent: bool,
        result: Result<Established, EngineError>,
    ) {
        if epoch != self.epoch {
            // A disconnect overtook this attempt; whatever it produced is discarded.
            tracing::debug!(epoch, current = self.epoch, "stale connect result dropped");
            return;
        }
        let pending = std::mem::take(&mut self.pending_connect);

        let Established { account, client } = match result {
            Ok(est) => est,
            Err(e) => {
                tracing::warn!(err = %e, silent, "connect failed");
                self.state.session = SessionStatus::Disconnected;
                if !silent {
                    self.state.error = Some(e.to_string());
                }
                for tx in pending {
                    let _ = tx.send(Err(e.clone()));
                }
                self.emit_state();
                return;
            }
        };

        self.persist_explicit_disconnect(false);
        self.session = Some(Session {
            account: account.clone(),
            client,
            handles: HashMap::new(),
            revoked: HashMap::new(),
            streams: StreamRegistry::default(),
        });
        self.state.session = SessionStatus::Connected;
        self.state.account = Some(account.clone());
        self.state.error = None;
        tracing::info!(account = %account.short(), "connected");
        for tx in pending {
            let _ = tx.send(Ok(()));
        }
        self.emit_state();

        self.start_network_monitor();
        self.ensure_discovery_stream();
        self.start_access_recheck_timer();
        self.load_conversations();
    }

    fn start_network_monitor(&mut self) {
        let epoch = self.epoch;
        let wallet = self.services.wallet.clone();
        let tx = self.core_sender.clone();
        let sub = spawn_subscription(
            self.runtime.handle(),
            async move { Ok::<_, Infallible>(wallet.network_changes().map(Ok).boxed()) },
            move |ev| match ev {
                StreamEvent::Item(chain_id) => {
                    Self::post(&tx, InternalEvent::NetworkChanged { epoch, chain_id });
                }
                StreamEvent::Failed(_) | StreamEvent::Ended => {
                    tracing::debug!("network change feed ended");
                }
            },
        );
        if let Some(sess) = self.session.as_mut() {
            sess.streams.add_background(sub);
        }
    }

    fn start_access_recheck_timer(&mut self) {
        let epoch = self.epoch;
        let tx = self.core_sender.clone();
        let sub = spawn_interval(
            self.runtime.handle(),
            self.config.recheck_interval(),
            self.config.recheck_jitter(),
            move || {
                tx.send(CoreMsg::Internal(Box::new(InternalEvent::AccessRecheckDue {
                    epoch,
                })))
                .is_ok()
            },
        );
        if let Some(sess) = self.session.as_mut() {
            sess.streams.add_background(sub);
        }
    }

    pub(super) fn on_network_changed(&mut self, chain_id: u64) {
        if self.session.is_none() {
            return;
        }
        if self.validator.is_required_chain(chain_id) {
            if self.state.session == SessionStatus::NetworkMismatch {
                tracing::info!(chain_id, "back on required network");
                self.state.session = SessionStatus::Connected;
                self.emit_state();
            }
            return;
        }
        if self.state.session == SessionStatus::NetworkMismatch {
            // A correction is already running; it re-validates on its own.
            return;
        }

        tracing::warn!(
            chain_id,
            required = self.validator.required().chain_id,
            "wallet switched network"
        );
        self.state.session = SessionStatus::NetworkMismatch;
        self.emit_state();

        let epoch = self.epoch;
        let wallet = self.services.wallet.clone();
        let validator = self.validator.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let result = validator.ensure(wallet.as_ref()).await;
            Self::post(&tx, InternalEvent::NetworkCorrected { epoch, result });
        });
    }

    pub(super) fn on_network_corrected(&mut self, result: Result<(), NetworkError>) {
        if self.session.is_none() {
            return;
        }
        match result {
            Ok(()) => {
                tracing::info!("network corrected");
                if self.state.session == SessionStatus::NetworkMismatch {
                    self.state.session = SessionStatus::Connected;
                    self.emit_state();
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "network correction failed, disconnecting");
                self.teardown_session(false);
                self.set_error(e.to_string());
            }
        }
    }

    pub(super) fn disconnect(&mut self, reply: Option<Sender<EngineResult<()>>>) {
        self.teardown_session(true);
        respond(reply, Ok(()));
    }

    /// Cancel and await every subscription, then drop the client and all session state.
    /// `explicit` marks a user-requested disconnect, which suppresses auto-restore.
    pub(super) fn teardown_session(&mut self, explicit: bool) {
        self.epoch = self.epoch.wrapping_add(1);

        if let Some(mut sess) = self.session.take() {
            self.state.session = SessionStatus::Disconnecting;
            self.emit_state();

            tracing::info!(
                account = %sess.account.short(),
                subscriptions = sess.streams.open_subscription_count(),
                conversations = self.directory.len(),
                "closing session"
            );
            let subs = sess.streams.drain();
            self.runtime.block_on(close_all(subs));
            sess.handles.clear();
            drop(sess.client);
        }

        for tx in std::mem::take(&mut self.pending_connect) {
            let _ = tx.send(Err(EngineError::SessionEnded));
        }

        self.directory.clear();
        self.cache.clear();
        self.recheck_in_flight = false;
        self.sends_in_flight = 0;
        self.state.account = None;
        self.state.current_conversation = None;
        self.state.is_loading_conversations = false;
        self.state.busy = BusyState::idle();
        if explicit {
            self.persist_explicit_disconnect(true);
        }
        self.state.session = SessionStatus::Disconnected;
        self.emit_state();
    }
}
