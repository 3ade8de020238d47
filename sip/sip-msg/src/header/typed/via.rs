use crate::header::{HeaderValue, Name, NamedHeader};
use crate::parse::{split_once_outside_quotes, split_outside_quotes};
use crate::uri::Params;
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// `Via` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token after `SIP/2.0/`, e.g. `TCP`, `TLS` or `WSS`
    pub transport: BytesStr,
    /// `host` or `host:port` this message was sent by
    pub sent_by: BytesStr,
    pub params: Params,
}

impl Via {
    pub fn new<T, S, B>(transport: T, sent_by: S, branch: B) -> Self
    where
        T: Into<BytesStr>,
        S: Into<BytesStr>,
        B: Into<BytesStr>,
    {
        let mut params = Params::new();
        params.push_or_edit("branch", branch);

        Self {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params,
        }
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get_val("branch")
    }
}

impl HeaderValue for Via {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        let value = value.trim();

        let rem = value
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| MessageError::InvalidHeader(Name::VIA, value.into()))?;

        let (transport, rem) = rem
            .split_once(char::is_whitespace)
            .ok_or_else(|| MessageError::InvalidHeader(Name::VIA, value.into()))?;

        let (sent_by, params) = match split_once_outside_quotes(rem, ';') {
            Some((sent_by, tail)) => (
                sent_by,
                Params::parse_list(&split_outside_quotes(tail, ';')),
            ),
            None => (rem, Params::new()),
        };

        Ok(Via {
            transport: transport.trim().into(),
            sent_by: sent_by.trim().into(),
            params,
        })
    }
}

impl NamedHeader for Via {
    fn header_name() -> Name {
        Name::VIA
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}
