use crate::header::{HeaderValue, Name, NamedHeader};
use crate::uri::NameAddr;
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// `Contact` header
///
/// Address parameters carry the binding `expires` value and, for mobile
/// endpoints, the push notification parameters `pn-token` / `pn-provider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub addr: NameAddr,
}

impl Contact {
    pub fn new(addr: NameAddr) -> Self {
        Self { addr }
    }

    /// Value of the `expires` address parameter
    pub fn expires(&self) -> Option<u32> {
        self.addr
            .params
            .get_val("expires")
            .and_then(|v| v.parse().ok())
    }

    pub fn set_push_token<T, P>(&mut self, token: T, provider: P)
    where
        T: Into<BytesStr>,
        P: Into<BytesStr>,
    {
        self.addr.params.push_or_edit("pn-token", token);
        self.addr.params.push_or_edit("pn-provider", provider);
    }
}

impl HeaderValue for Contact {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        Ok(Self {
            addr: value.parse()?,
        })
    }
}

impl NamedHeader for Contact {
    fn header_name() -> Name {
        Name::CONTACT
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expires_param() {
        let contact =
            Contact::parse(&BytesStr::from_static("<sip:a@h>;expires=3600")).unwrap();
        assert_eq!(contact.expires(), Some(3600));
    }

    #[test]
    fn push_params_are_appended() {
        let mut contact = Contact::parse(&BytesStr::from_static("<sip:a@h>")).unwrap();
        contact.set_push_token("tok123", "fcm");

        assert_eq!(contact.to_string(), "<sip:a@h>;pn-token=tok123;pn-provider=fcm");
    }
}
