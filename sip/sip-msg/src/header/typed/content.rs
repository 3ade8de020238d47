use crate::header::{HeaderValue, Name, NamedHeader};
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// `Content-Type` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType(pub BytesStr);

impl HeaderValue for ContentType {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        Ok(Self(value.trim().into()))
    }
}

impl NamedHeader for ContentType {
    fn header_name() -> Name {
        Name::CONTENT_TYPE
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `Content-Length` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLength(pub usize);

impl HeaderValue for ContentLength {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        value
            .trim()
            .parse()
            .map(Self)
            .map_err(|_| MessageError::InvalidHeader(Name::CONTENT_LENGTH, value.clone()))
    }
}

impl NamedHeader for ContentLength {
    fn header_name() -> Name {
        Name::CONTENT_LENGTH
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
