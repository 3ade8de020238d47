use crate::header::{HeaderValue, Name, NamedHeader};
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// `Event` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event(pub BytesStr);

impl HeaderValue for Event {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        Ok(Self(value.trim().into()))
    }
}

impl NamedHeader for Event {
    fn header_name() -> Name {
        Name::EVENT
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `Subscription-State` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState(pub BytesStr);

impl HeaderValue for SubscriptionState {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        Ok(Self(value.trim().into()))
    }
}

impl NamedHeader for SubscriptionState {
    fn header_name() -> Name {
        Name::SUBSCRIPTION_STATE
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
