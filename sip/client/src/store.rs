//! Persistent store contract.
//!
//! Store operations never gate signaling: every call site fires the
//! update and only logs failures.

use crate::account::{AccountConfig, AccountKey};
use crate::events::{CallDirection, CallEndReason, RegistrationState};
use bytesstr::BytesStr;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// One finished call, appended to the call history
#[derive(Debug, Clone)]
pub struct CallLogEntry {
    pub account: AccountKey,
    pub direction: CallDirection,
    pub remote: BytesStr,
    pub start_time: SystemTime,
    pub connect_time: Option<SystemTime>,
    pub end_time: SystemTime,
    pub reason: CallEndReason,
    pub last_status: Option<u16>,
}

/// Interface of the persistent store consumed by the engine
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync + 'static {
    /// Accounts that were registered when the process last ran, used by
    /// the reconnection controller to recover after a restart
    async fn list_registered_accounts(&self) -> Result<Vec<AccountConfig>, StoreError>;

    async fn upsert_account(&self, account: &AccountConfig) -> Result<(), StoreError>;

    async fn update_registration_state(
        &self,
        key: &AccountKey,
        state: &RegistrationState,
    ) -> Result<(), StoreError>;

    async fn append_call_log(&self, entry: &CallLogEntry) -> Result<(), StoreError>;
}

/// Store that remembers nothing, the default when the application does
/// not provide one
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait::async_trait]
impl AccountStore for NullStore {
    async fn list_registered_accounts(&self) -> Result<Vec<AccountConfig>, StoreError> {
        Ok(vec![])
    }

    async fn upsert_account(&self, _account: &AccountConfig) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_registration_state(
        &self,
        _key: &AccountKey,
        _state: &RegistrationState,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn append_call_log(&self, _entry: &CallLogEntry) -> Result<(), StoreError> {
        Ok(())
    }
}
