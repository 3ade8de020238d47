//! Multi-account SIP client engine.
//!
//! The engine registers accounts against their registrars over an
//! application provided message transport, drives one call per account
//! through its dialog state machine and keeps every binding alive across
//! network loss via the reconnection controller.
//!
//! Construction happens through [`ClientBuilder`]; the application
//! consumes a single ordered [`ClientEvent`] stream and issues commands
//! through [`Client`], addressed by [`AccountKey`].

#![warn(unreachable_pub)]

use parking_lot::RwLock;
use sip_core::transport::Connector;
use sip_msg::uri::SipUri;
use sip_msg::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

mod account;
mod actor;
mod call;
mod config;
mod dialog;
mod events;
mod media;
mod reconnect;
mod registration;
mod store;
mod util;

pub use account::{AccountConfig, AccountKey};
pub use config::{ClientConfig, ReconnectConfig};
pub use events::{
    CallDirection, CallEndReason, CallInfo, ClientEvent, RegistrationState,
};
pub use media::{MediaEngine, MediaError, SdpDirection};
pub use store::{AccountStore, CallLogEntry, NullStore, StoreError};

use account::{Command, Shared};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountKey),
    #[error("account {0} already exists")]
    DuplicateAccount(AccountKey),
    #[error(transparent)]
    Core(#[from] sip_core::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("credentials were rejected")]
    AuthRejected,
    #[error("registration rejected with status {0}")]
    RegistrationRejected(StatusCode),
    #[error(transparent)]
    Message(#[from] sip_msg::MessageError),
}

/// Builder for [`Client`]
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    media: Option<Arc<dyn MediaEngine>>,
    store: Arc<dyn AccountStore>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            connector: None,
            media: None,
            store: Arc::new(NullStore),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the transport connector, mandatory
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the media engine, mandatory
    pub fn media(mut self, media: Arc<dyn MediaEngine>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the persistent store, defaults to [`NullStore`]
    pub fn store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.store = store;
        self
    }

    /// Build the client and its event stream.
    ///
    /// Must run inside a tokio runtime; the reconnection controller task
    /// is started here.
    ///
    /// # Panics
    ///
    /// Panics when no connector or no media engine was set.
    pub fn build(self) -> (Client, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();
        let (network_tx, network_rx) = watch::channel(true);

        let shared = Arc::new(Shared {
            config: self.config,
            connector: self.connector.expect("connector must be set"),
            media: self.media.expect("media engine must be set"),
            store: self.store,
            events: events_tx,
            accounts: RwLock::new(HashMap::new()),
            controller: controller_tx,
            network: network_tx,
        });

        reconnect::spawn_controller(shared.clone(), controller_rx, network_rx);

        (Client { shared }, events_rx)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the engine. Cheap to clone; all methods address accounts by
/// their [`AccountKey`].
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Add an account and start registering it.
    ///
    /// The outcome is reported through
    /// [`ClientEvent::RegistrationStateChanged`].
    pub fn register(&self, config: AccountConfig) -> Result<AccountKey, ClientError> {
        let key = config.key();

        {
            let mut accounts = self.shared.accounts.write();

            if accounts.contains_key(&key) {
                return Err(ClientError::DuplicateAccount(key));
            }

            let handle = actor::spawn_account(self.shared.clone(), config.clone());
            accounts.insert(key.clone(), handle);
        }

        let shared = self.shared.clone();
        let persisted = config;
        tokio::spawn(async move {
            if let Err(e) = shared.store.upsert_account(&persisted).await {
                log::warn!("failed to persist account, {e}");
            }
        });

        self.shared.command(&key, Command::Register)?;

        Ok(key)
    }

    /// Remove the binding and the account. Resolves once the registrar
    /// answered or the un-REGISTER timed out.
    pub async fn unregister(&self, key: &AccountKey) -> Result<(), ClientError> {
        let (done, finished) = oneshot::channel();

        self.shared.command(key, Command::Unregister { done })?;

        let _ = finished.await;

        self.shared.accounts.write().remove(key);

        Ok(())
    }

    /// Current registration state of an account
    pub fn registration_state(&self, key: &AccountKey) -> Option<RegistrationState> {
        self.shared
            .accounts
            .read()
            .get(key)
            .map(|handle| handle.registration.borrow().clone())
    }

    /// Wait until the account reaches a settled registration state
    /// (`Ok` or `Failed`)
    pub async fn wait_for_registration(
        &self,
        key: &AccountKey,
    ) -> Result<RegistrationState, ClientError> {
        let mut registration = self
            .shared
            .accounts
            .read()
            .get(key)
            .map(|handle| handle.registration.clone())
            .ok_or_else(|| ClientError::UnknownAccount(key.clone()))?;

        let state = registration
            .wait_for(|state| {
                matches!(
                    state,
                    RegistrationState::Ok { .. } | RegistrationState::Failed { .. }
                )
            })
            .await
            .map_err(|_| ClientError::UnknownAccount(key.clone()))?;

        Ok(state.clone())
    }

    /// Start an outgoing call to `target`, e.g. `sip:bob@example.com`
    pub fn make_call(&self, key: &AccountKey, target: &str) -> Result<(), ClientError> {
        let target: SipUri = target.parse()?;
        self.shared.command(key, Command::MakeCall { target })
    }

    /// Accept the pending incoming call
    pub fn accept_call(&self, key: &AccountKey) -> Result<(), ClientError> {
        self.shared.command(key, Command::Accept)
    }

    /// Decline the pending incoming call with `603 Decline`
    pub fn decline_call(&self, key: &AccountKey) -> Result<(), ClientError> {
        self.shared.command(key, Command::Decline)
    }

    /// Hang up, cancel or terminate the active call
    pub fn end_call(&self, key: &AccountKey) -> Result<(), ClientError> {
        self.shared.command(key, Command::Hangup)
    }

    pub fn hold(&self, key: &AccountKey) -> Result<(), ClientError> {
        self.shared.command(key, Command::Hold)
    }

    pub fn resume(&self, key: &AccountKey) -> Result<(), ClientError> {
        self.shared.command(key, Command::Resume)
    }

    pub fn set_muted(&self, key: &AccountKey, muted: bool) -> Result<(), ClientError> {
        self.shared.command(key, Command::SetMuted(muted))
    }

    /// Send DTMF digits via INFO, one request per digit with the
    /// mandated inter-digit gap
    pub fn send_dtmf(&self, key: &AccountKey, digits: &str) -> Result<(), ClientError> {
        self.shared.command(
            key,
            Command::SendDtmf {
                digits: digits.to_string(),
            },
        )
    }

    /// Deflect the ringing incoming call to another target via REFER
    pub fn deflect_call(&self, key: &AccountKey, target: &str) -> Result<(), ClientError> {
        let target: SipUri = target.parse()?;
        self.shared.command(key, Command::Deflect { target })
    }

    /// Feed the platform's network availability signal into the
    /// reconnection controller
    pub fn set_network_available(&self, available: bool) {
        self.shared.network.send_replace(available);
    }

    /// Reset all reconnection counters and retry every account
    /// immediately, skipping the stability delay
    pub fn force_reconnect(&self) {
        let _ = self
            .shared
            .controller
            .send(reconnect::ControllerMsg::ForceReconnect);
    }
}
