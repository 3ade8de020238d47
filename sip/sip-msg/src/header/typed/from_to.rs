use crate::header::HeaderValue;
use crate::uri::NameAddr;
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// Value of the `From` and `To` headers
///
/// The `tag` parameter is held separately from the remaining address
/// parameters since all dialog state tracking revolves around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromTo {
    pub addr: NameAddr,
    pub tag: Option<BytesStr>,
}

impl FromTo {
    pub fn new(addr: NameAddr, tag: Option<BytesStr>) -> Self {
        Self { addr, tag }
    }
}

impl HeaderValue for FromTo {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        let mut addr: NameAddr = value.parse()?;

        let tag = addr.params.remove("tag").and_then(|p| p.value);

        Ok(Self { addr, tag })
    }
}

impl fmt::Display for FromTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)?;

        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }

        Ok(())
    }
}
