use crate::config::ClientConfig;
use crate::events::{ClientEvent, RegistrationState};
use crate::media::MediaEngine;
use crate::reconnect::ControllerMsg;
use crate::store::AccountStore;
use crate::ClientError;
use bytesstr::BytesStr;
use parking_lot::RwLock;
use sip_auth::{DigestCredentials, DigestUser};
use sip_core::transport::Connector;
use sip_msg::uri::SipUri;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// `username@domain`, the process wide identifier of an account
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey(BytesStr);

impl AccountKey {
    pub fn new(username: &str, domain: &str) -> Self {
        Self(BytesStr::from(format!("{username}@{domain}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to bring one account online
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub username: String,
    pub domain: String,

    /// Plaintext password, exclusive with `ha1`
    pub password: Option<String>,
    /// Precomputed digest hash, used when no password is stored
    pub ha1: Option<String>,

    pub display_name: Option<String>,

    /// Opaque transport url handed to the [`Connector`]
    pub transport_url: String,

    /// Push notification token forwarded in the Contact `pn-token` param
    pub push_token: Option<String>,
    /// Push provider (`fcm` or `apns`) for the `pn-provider` param
    pub push_provider: Option<String>,

    /// Override the engine wide registration expiry
    pub expiry: Option<Duration>,
}

impl AccountConfig {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.username, &self.domain)
    }

    pub(crate) fn registrar_uri(&self) -> SipUri {
        SipUri::new(self.domain.as_str())
    }

    pub(crate) fn credentials(&self) -> DigestCredentials {
        let mut credentials = DigestCredentials::new();

        let user = if let Some(password) = &self.password {
            DigestUser::new(self.username.as_str(), password.as_bytes())
        } else if let Some(ha1) = &self.ha1 {
            DigestUser::with_ha1(self.username.as_str(), ha1.as_str())
        } else {
            DigestUser::new(self.username.as_str(), "")
        };

        credentials.set_default(user);
        credentials
    }
}

/// Commands accepted by an account actor.
///
/// All stimuli of an account, application calls included, are funneled
/// through this mailbox so state transitions never race.
pub(crate) enum Command {
    Register,
    Unregister { done: oneshot::Sender<()> },
    /// Issued by the reconnection controller: tear down the transport,
    /// open a new one and register, reporting the outcome
    Reconnect {
        notify: oneshot::Sender<Result<(), ClientError>>,
    },
    /// The network is gone, drop the transport without recovery
    NetworkLost,
    MakeCall { target: SipUri },
    Accept,
    Decline,
    Hangup,
    Hold,
    Resume,
    SetMuted(bool),
    SendDtmf { digits: String },
    Deflect { target: SipUri },
}

/// Registry entry of a live account
pub(crate) struct AccountHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) registration: watch::Receiver<RegistrationState>,
}

/// State shared between the facade, the account actors and the
/// reconnection controller.
///
/// Components never hold references to each other, they hold the arena
/// and look accounts up by key.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) media: Arc<dyn MediaEngine>,
    pub(crate) store: Arc<dyn AccountStore>,
    pub(crate) events: mpsc::UnboundedSender<ClientEvent>,
    pub(crate) accounts: RwLock<HashMap<AccountKey, AccountHandle>>,
    pub(crate) controller: mpsc::UnboundedSender<ControllerMsg>,
    pub(crate) network: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            log::debug!("event receiver dropped");
        }
    }

    pub(crate) fn command(&self, key: &AccountKey, command: Command) -> Result<(), ClientError> {
        let accounts = self.accounts.read();

        let handle = accounts
            .get(key)
            .ok_or_else(|| ClientError::UnknownAccount(key.clone()))?;

        handle
            .commands
            .send(command)
            .map_err(|_| ClientError::UnknownAccount(key.clone()))
    }

    /// Persist a registration state change without blocking the caller
    pub(crate) fn persist_registration_state(
        self: &Arc<Self>,
        key: &AccountKey,
        state: &RegistrationState,
    ) {
        let shared = self.clone();
        let key = key.clone();
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = shared.store.update_registration_state(&key, &state).await {
                log::warn!("failed to persist registration state of {key}, {e}");
            }
        });
    }
}
