//! SIP message types, parsing and serialization.
//!
//! Messages are parsed from complete buffers as delivered by a message
//! framed transport. Headers are kept as an ordered list of name/value
//! pairs with typed accessors layered on top, so unknown headers survive
//! a parse/print round trip untouched.

#![warn(unreachable_pub)]

use bytesstr::BytesStr;

mod method;
mod parse;
mod status;

pub mod header;
pub mod msg;
pub mod uri;

pub use header::{HeaderValue, Headers, Name, NamedHeader};
pub use method::Method;
pub use msg::{Message, MessageLine, Request, RequestLine, Response, StatusLine};
pub use status::{CodeKind, StatusCode};

/// Errors produced while parsing messages, URIs or header values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message does not contain a start line")]
    MissingStartLine,
    #[error("invalid start line: {0:?}")]
    InvalidStartLine(BytesStr),
    #[error("message headers are truncated")]
    TruncatedHeaders,
    #[error("message head is not valid utf8")]
    InvalidEncoding,
    #[error("invalid header line: {0:?}")]
    InvalidHeaderLine(BytesStr),
    #[error("body is shorter than Content-Length, expected {expected} got {actual} bytes")]
    InvalidContentLength { expected: usize, actual: usize },
    #[error("invalid uri: {0:?}")]
    InvalidUri(BytesStr),
    #[error("invalid {0} header: {1:?}")]
    InvalidHeader(Name, BytesStr),
    #[error("missing {0} header")]
    MissingHeader(Name),
    #[error("invalid authentication header: {0:?}")]
    InvalidAuthHeader(BytesStr),
}
