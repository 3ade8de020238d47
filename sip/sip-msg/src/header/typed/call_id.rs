use crate::header::{HeaderValue, Name, NamedHeader};
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// `Call-ID` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(pub BytesStr);

impl CallId {
    pub fn new<V>(value: V) -> Self
    where
        V: Into<BytesStr>,
    {
        Self(value.into())
    }
}

impl HeaderValue for CallId {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        let value = value.trim();

        if value.is_empty() {
            return Err(MessageError::InvalidHeader(Name::CALL_ID, value.into()));
        }

        Ok(Self(value.into()))
    }
}

impl NamedHeader for CallId {
    fn header_name() -> Name {
        Name::CALL_ID
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
