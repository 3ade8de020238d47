use crate::header::{HeaderValue, Name, NamedHeader};
use crate::uri::NameAddr;
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// `Refer-To` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferTo(pub NameAddr);

impl HeaderValue for ReferTo {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        value.parse().map(Self)
    }
}

impl NamedHeader for ReferTo {
    fn header_name() -> Name {
        Name::REFER_TO
    }
}

impl fmt::Display for ReferTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
