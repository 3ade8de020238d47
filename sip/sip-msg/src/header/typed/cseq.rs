use crate::header::{HeaderValue, Name, NamedHeader};
use crate::{MessageError, Method};
use bytesstr::BytesStr;
use std::fmt;

/// `CSeq` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }
}

impl HeaderValue for CSeq {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        let (cseq, method) = value
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| MessageError::InvalidHeader(Name::CSEQ, value.clone()))?;

        let cseq = cseq
            .parse()
            .map_err(|_| MessageError::InvalidHeader(Name::CSEQ, value.clone()))?;

        Ok(Self {
            cseq,
            method: Method::from_token(method.trim()),
        })
    }
}

impl NamedHeader for CSeq {
    fn header_name() -> Name {
        Name::CSEQ
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_print() {
        let cseq = CSeq::parse(&BytesStr::from_static("4711 INVITE")).unwrap();
        assert_eq!(cseq.cseq, 4711);
        assert_eq!(cseq.method, Method::INVITE);
        assert_eq!(cseq.to_string(), "4711 INVITE");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CSeq::parse(&BytesStr::from_static("INVITE")).is_err());
        assert!(CSeq::parse(&BytesStr::from_static("x INVITE")).is_err());
    }
}
