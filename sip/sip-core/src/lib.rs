//! Core plumbing below the SIP user agent: the abstract message transport
//! contract, the per-connection [`Endpoint`] and the transaction layer.
//!
//! The transport is message framed and ordered (the kind of stream a
//! WebSocket or length-prefixed TCP connection provides), so the
//! unreliable-transport retransmission machinery of RFC 3261 is not
//! implemented. Only the transaction timeout timers remain.

#![warn(unreachable_pub)]

use sip_msg::header::typed::{CSeq, CallId, FromTo, Via};
use sip_msg::{Headers, MessageError, Name};

mod endpoint;
pub mod transaction;
pub mod transport;

pub use endpoint::{Endpoint, IncomingRequest};

/// Errors surfaced by the endpoint and transaction layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("request timed out")]
    RequestTimedOut,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The headers every message must carry to be routable
#[derive(Debug, Clone)]
pub struct BaseHeaders {
    pub via: Vec<Via>,
    pub from: FromTo,
    pub to: FromTo,
    pub call_id: CallId,
    pub cseq: CSeq,
}

impl BaseHeaders {
    pub fn extract_from(headers: &Headers) -> Result<Self, MessageError> {
        Ok(Self {
            via: headers.get_all_type(&Name::VIA)?,
            from: headers.get_type(&Name::FROM)?,
            to: headers.get_type(&Name::TO)?,
            call_id: headers.get_named()?,
            cseq: headers.get_named()?,
        })
    }
}
