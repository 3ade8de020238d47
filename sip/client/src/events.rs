use crate::account::AccountKey;
use bytesstr::BytesStr;
use sip_msg::{CodeKind, StatusCode};
use std::time::SystemTime;

/// Registration state of one account as visible to the application and
/// the persistent store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// No binding exists or the transport is gone
    None,
    /// A REGISTER (initial or refresh) is in flight
    InProgress,
    /// The registrar accepted the binding
    Ok { expires_at: SystemTime },
    /// Registration failed and will not be retried automatically
    Failed { reason: BytesStr },
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    NormalHangup,
    Busy,
    NoAnswer,
    Rejected,
    NetworkError,
    Cancelled,
    Deflected,
    Timeout,
    Error,
}

impl CallEndReason {
    /// Map a negative final INVITE response onto an end reason
    pub fn from_status(code: StatusCode) -> Self {
        match code.into_u16() {
            486 | 600 => CallEndReason::Busy,
            408 | 480 => CallEndReason::NoAnswer,
            487 => CallEndReason::Cancelled,
            603 => CallEndReason::Rejected,
            601..=699 => CallEndReason::Rejected,
            _ => match code.kind() {
                CodeKind::RequestFailure | CodeKind::ServerFailure | CodeKind::Redirection => {
                    CallEndReason::Error
                }
                _ => CallEndReason::Error,
            },
        }
    }
}

/// Snapshot describing a call in listener events
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub account: AccountKey,
    pub call_id: BytesStr,
    pub direction: CallDirection,
    pub local: BytesStr,
    pub remote: BytesStr,
    pub remote_display_name: Option<BytesStr>,
}

/// The single event stream produced by the engine.
///
/// Per call, events are delivered in state machine transition order.
#[derive(Debug)]
pub enum ClientEvent {
    RegistrationStateChanged {
        account: AccountKey,
        state: RegistrationState,
    },
    IncomingCall(CallInfo),
    CallRinging(CallInfo),
    CallConnected(CallInfo),
    CallEnded {
        info: CallInfo,
        reason: CallEndReason,
    },
    CallFailed {
        info: CallInfo,
        error: BytesStr,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            CallEndReason::from_status(StatusCode::BUSY_HERE),
            CallEndReason::Busy
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::BUSY_EVERYWHERE),
            CallEndReason::Busy
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::REQUEST_TIMEOUT),
            CallEndReason::NoAnswer
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::TEMPORARILY_UNAVAILABLE),
            CallEndReason::NoAnswer
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::REQUEST_TERMINATED),
            CallEndReason::Cancelled
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::DECLINE),
            CallEndReason::Rejected
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::new(604)),
            CallEndReason::Rejected
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::NOT_FOUND),
            CallEndReason::Error
        );
        assert_eq!(
            CallEndReason::from_status(StatusCode::SERVER_INTERNAL_ERROR),
            CallEndReason::Error
        );
    }
}
