use crate::BaseHeaders;
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_msg::msg::StatusLine;
use sip_msg::{Headers, Method};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

mod client;
mod client_inv;
mod server;

pub use client::ClientTsx;
pub use client_inv::ClientInvTsx;
pub use server::{ServerInvTsx, ServerTsx};

pub mod consts {
    use std::time::Duration;

    /// INVITE transaction timeout (Timer B)
    pub const TIMER_B: Duration = Duration::from_secs(32);
    /// Non-INVITE transaction timeout (Timer F)
    pub const TIMER_F: Duration = Duration::from_secs(32);
    /// Window in which 2xx retransmissions are still accepted after the
    /// first 2xx (Timer M)
    pub const TIMER_M: Duration = Duration::from_secs(32);

    pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";
}

/// Transaction identifier: the topmost Via branch plus the CSeq method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TsxKey {
    pub branch: BytesStr,
    pub method: Method,
}

impl TsxKey {
    /// Create a key for a new client transaction with a freshly
    /// generated branch
    pub(crate) fn client(method: &Method) -> Self {
        Self {
            branch: generate_branch(),
            method: method.clone(),
        }
    }
}

/// Response received inside a transaction
#[derive(Debug)]
pub struct TsxResponse {
    pub line: StatusLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

pub(crate) type TsxSender = mpsc::UnboundedSender<TsxResponse>;

/// Table of in-flight transactions of one connection
#[derive(Default)]
pub(crate) struct Transactions {
    client: Mutex<HashMap<TsxKey, TsxSender>>,
    server: Mutex<HashSet<TsxKey>>,
}

impl Transactions {
    /// Route a response to the client transaction it belongs to.
    ///
    /// Returns the response back if no transaction matches.
    pub(crate) fn route_response(&self, key: &TsxKey, response: TsxResponse) -> Option<TsxResponse> {
        let map = self.client.lock();

        match map.get(key) {
            Some(sender) => sender.send(response).map_err(|e| e.0).err(),
            None => Some(response),
        }
    }

    pub(crate) fn register_client(&self, key: TsxKey) -> mpsc::UnboundedReceiver<TsxResponse> {
        let (tx, rx) = mpsc::unbounded_channel();

        match self.client.lock().entry(key) {
            Entry::Occupied(e) => panic!("tried to create a second transaction for {:?}", e.key()),
            Entry::Vacant(e) => {
                e.insert(tx);
            }
        }

        rx
    }

    pub(crate) fn remove_client(&self, key: &TsxKey) {
        self.client.lock().remove(key);
    }

    /// Track a server transaction key. Returns false if the key is already
    /// known, which marks the incoming request as a retransmission.
    pub(crate) fn register_server(&self, key: TsxKey) -> bool {
        self.server.lock().insert(key)
    }

    pub(crate) fn remove_server(&self, key: &TsxKey) {
        self.server.lock().remove(key);
    }

    pub(crate) fn is_server_retransmission(&self, key: &TsxKey) -> bool {
        self.server.lock().contains(key)
    }
}

/// A client transaction's entry in the [`Transactions`] table.
///
/// Removes itself from the table on drop.
pub(crate) struct TsxRegistration {
    pub(crate) endpoint: crate::Endpoint,
    pub(crate) key: TsxKey,
    receiver: mpsc::UnboundedReceiver<TsxResponse>,
}

impl TsxRegistration {
    pub(crate) fn create(endpoint: crate::Endpoint, key: TsxKey) -> Self {
        let receiver = endpoint.transactions().register_client(key.clone());

        Self {
            endpoint,
            key,
            receiver,
        }
    }

    pub(crate) async fn receive(&mut self) -> TsxResponse {
        match self.receiver.recv().await {
            Some(response) => response,
            // sender lives in the transaction table until this
            // registration is dropped
            None => std::future::pending().await,
        }
    }
}

impl Drop for TsxRegistration {
    fn drop(&mut self) {
        self.endpoint.transactions().remove_client(&self.key);
    }
}

impl std::fmt::Debug for TsxRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsxRegistration")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

fn generate_branch() -> BytesStr {
    use rand::distr::Alphanumeric;
    use rand::{rng, Rng};

    consts::RFC3261_BRANCH_PREFIX
        .bytes()
        .chain(rng().sample_iter(Alphanumeric).take(23))
        .map(char::from)
        .collect::<String>()
        .into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn branch_has_magic_cookie() {
        let branch = generate_branch();
        assert!(branch.starts_with(consts::RFC3261_BRANCH_PREFIX));
        assert_eq!(branch.len(), consts::RFC3261_BRANCH_PREFIX.len() + 23);
    }

    #[test]
    fn branches_are_unique() {
        assert_ne!(generate_branch(), generate_branch());
    }
}
