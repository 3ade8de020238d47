//! Client side SIP authentication.
//!
//! The only scheme implemented is Digest (RFC 2617 / RFC 7616 style with
//! `qop=auth`/`auth-int`), which is the only one SIP registrars use in
//! practice.

#![warn(unreachable_pub)]

use sip_msg::msg::{RequestLine, StatusLine};
use sip_msg::Headers;

mod digest;

pub use digest::{
    DigestAuthenticator, DigestCredentials, DigestError, DigestSecret, DigestUser,
};

/// Borrowed view on the request that is being (re)authorized
#[derive(Clone, Copy)]
pub struct RequestParts<'s> {
    pub line: &'s RequestLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}

/// Borrowed view on the `401`/`407` response that rejected the request
#[derive(Clone, Copy)]
pub struct ResponseParts<'s> {
    pub line: &'s StatusLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}

/// Solves authentication challenges for outgoing requests
pub trait ClientAuthenticator {
    type Error;

    /// Add `Authorization`/`Proxy-Authorization` headers for every realm
    /// that has been challenged so far
    fn authorize_request(&mut self, request_headers: &mut Headers);

    /// Digest the challenges of a `401`/`407` response.
    ///
    /// After this returns `Ok` the request may be retried with
    /// [`ClientAuthenticator::authorize_request`] providing the credentials.
    fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), Self::Error>;
}
