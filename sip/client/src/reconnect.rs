//! Reconnection controller: keeps every account registered through
//! transport loss and network flaps.
//!
//! The controller owns no account state. It watches the network signal
//! and per-account down notifications, waits out the stability delay,
//! then drives one bounded recovery task per account which tells the
//! account actor to rebuild its transport and re-register.

use crate::account::{AccountKey, Command, Shared};
use crate::actor::spawn_account;
use crate::config::ReconnectConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// Notifications feeding the controller
pub(crate) enum ControllerMsg {
    /// An account lost its transport and wants to be recovered
    AccountDown(AccountKey),
    /// Application demand: retry everything right now, counters reset
    ForceReconnect,
}

pub(crate) fn spawn_controller(
    shared: Arc<Shared>,
    msgs: mpsc::UnboundedReceiver<ControllerMsg>,
    network: watch::Receiver<bool>,
) {
    let controller = ReconnectController {
        shared,
        msgs,
        network,
        active: HashSet::new(),
        parked: HashSet::new(),
        pending: HashSet::new(),
        recover_all: false,
        stability_deadline: None,
        tasks: JoinSet::new(),
    };

    tokio::spawn(controller.run());
}

struct ReconnectController {
    shared: Arc<Shared>,
    msgs: mpsc::UnboundedReceiver<ControllerMsg>,
    network: watch::Receiver<bool>,

    /// Accounts with a recovery task in flight; a second trigger for any
    /// of these is a no-op
    active: HashSet<AccountKey>,

    /// Accounts that exhausted their attempts; left alone until an
    /// external trigger (network change or force) clears them
    parked: HashSet<AccountKey>,

    /// Accounts waiting for the stability deadline
    pending: HashSet<AccountKey>,
    /// Recover every account once the deadline passes
    recover_all: bool,

    stability_deadline: Option<Instant>,

    tasks: JoinSet<(AccountKey, bool)>,
}

impl ReconnectController {
    async fn run(mut self) {
        loop {
            let deadline = self.stability_deadline;

            tokio::select! {
                changed = self.network.changed() => {
                    if changed.is_err() {
                        break;
                    }

                    let up = *self.network.borrow_and_update();
                    self.on_network_changed(up);
                }

                msg = self.msgs.recv() => {
                    match msg {
                        Some(ControllerMsg::AccountDown(key)) => self.on_account_down(key),
                        Some(ControllerMsg::ForceReconnect) => self.on_force().await,
                        None => break,
                    }
                }

                _ = wait_deadline(deadline) => {
                    self.stability_deadline = None;
                    self.on_stability_deadline().await;
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Ok((key, success)) = joined {
                        self.active.remove(&key);

                        if !success {
                            log::warn!("recovery of {key} gave up, waiting for an external trigger");
                            self.parked.insert(key);
                        }
                    }
                }
            }
        }
    }

    fn on_network_changed(&mut self, up: bool) {
        if !up {
            log::info!("network lost, cancelling reconnection work");

            // cancel all in-flight recovery, keep the account list
            self.tasks.abort_all();
            self.active.clear();
            self.pending.clear();
            self.recover_all = false;
            self.stability_deadline = None;
            self.parked.clear();

            for handle in self.shared.accounts.read().values() {
                let _ = handle.commands.send(Command::NetworkLost);
            }
        } else {
            log::info!("network is back, waiting for it to stabilize");

            self.parked.clear();
            self.recover_all = true;
            self.stability_deadline =
                Some(Instant::now() + self.shared.config.reconnect.stability_delay);
        }
    }

    fn on_account_down(&mut self, key: AccountKey) {
        if self.active.contains(&key) || self.parked.contains(&key) {
            return;
        }

        self.pending.insert(key);

        if self.stability_deadline.is_none() {
            self.stability_deadline =
                Some(Instant::now() + self.shared.config.reconnect.stability_delay);
        }
    }

    async fn on_force(&mut self) {
        // counters live in the recovery tasks; clearing the parked set is
        // what "reset" means across triggers
        self.parked.clear();
        self.pending.clear();
        self.recover_all = false;
        self.stability_deadline = None;

        let keys = self.all_account_keys().await;
        self.recover(keys).await;
    }

    async fn on_stability_deadline(&mut self) {
        // re-check: the network may have flapped again meanwhile
        if !*self.network.borrow() {
            log::debug!("network went away again before the stability deadline");
            self.pending.clear();
            self.recover_all = false;
            return;
        }

        let keys = if self.recover_all {
            self.recover_all = false;
            self.pending.clear();
            self.all_account_keys().await
        } else {
            self.pending.drain().collect()
        };

        self.recover(keys).await;
    }

    /// Every known account; falls back to the persistent store when the
    /// in-memory set is empty (process restart)
    async fn all_account_keys(&self) -> Vec<AccountKey> {
        let keys: Vec<_> = self.shared.accounts.read().keys().cloned().collect();

        if !keys.is_empty() {
            return keys;
        }

        let recovered = timeout(
            self.shared.config.reconnect.recovery_timeout,
            self.shared.store.list_registered_accounts(),
        )
        .await;

        let configs = match recovered {
            Ok(Ok(configs)) => configs,
            Ok(Err(e)) => {
                log::warn!("account recovery from store failed, {e}");
                return vec![];
            }
            Err(_) => {
                log::warn!("account recovery from store timed out");
                return vec![];
            }
        };

        let mut keys = Vec::with_capacity(configs.len());

        for config in configs {
            let key = config.key();
            let handle = spawn_account(self.shared.clone(), config);

            self.shared
                .accounts
                .write()
                .insert(key.clone(), handle);
            keys.push(key);
        }

        keys
    }

    async fn recover(&mut self, keys: Vec<AccountKey>) {
        for key in keys {
            if self.active.contains(&key) {
                // already being recovered, idempotent by design
                continue;
            }

            let Some(commands) = self
                .shared
                .accounts
                .read()
                .get(&key)
                .map(|handle| handle.commands.clone())
            else {
                continue;
            };

            self.active.insert(key.clone());

            let config = self.shared.config.reconnect.clone();
            self.tasks
                .spawn(recovery_loop(key, commands, config));
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Try to bring one account back, backing off exponentially between
/// attempts. Returns whether the account registered again.
async fn recovery_loop(
    key: AccountKey,
    commands: mpsc::UnboundedSender<Command>,
    config: ReconnectConfig,
) -> (AccountKey, bool) {
    for attempt in 1..=config.max_attempts {
        log::debug!("recovery attempt {attempt} for {key}");

        let (notify, outcome) = oneshot::channel();

        if commands.send(Command::Reconnect { notify }).is_err() {
            // account was removed
            return (key, false);
        }

        match timeout(config.register_timeout, outcome).await {
            Ok(Ok(Ok(()))) => {
                log::info!("recovered {key} after {attempt} attempt(s)");
                return (key, true);
            }
            Ok(Ok(Err(e))) => {
                log::debug!("recovery attempt {attempt} for {key} failed, {e}");
            }
            Ok(Err(_)) => {
                log::debug!("recovery attempt {attempt} for {key} was dropped");
            }
            Err(_) => {
                log::debug!("recovery attempt {attempt} for {key} timed out");
            }
        }

        if attempt < config.max_attempts {
            sleep(calculate_backoff(
                attempt,
                config.backoff_base,
                config.backoff_max,
            ))
            .await;
        }
    }

    (key, false)
}

/// Backoff before attempt `n + 1`:
/// `min(base * 2^(n-1) + jitter, max)` with `jitter` uniform in `[0, base)`
pub(crate) fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    debug_assert!(attempt >= 1);

    let shift = (attempt - 1).min(16);
    let exp = base.saturating_mul(1u32 << shift);
    let jitter = base.mul_f64(rand::random::<f64>());

    (exp + jitter).min(max)
}
