use crate::header::{HeaderValue, Name, NamedHeader};
use crate::uri::NameAddr;
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

macro_rules! name_addr_header {
    ($(#[$doc:meta])* $name:ident, $header_name:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub NameAddr);

        impl HeaderValue for $name {
            fn parse(value: &BytesStr) -> Result<Self, MessageError> {
                value.parse().map($name)
            }
        }

        impl NamedHeader for $name {
            fn header_name() -> Name {
                $header_name
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

name_addr_header!(
    /// `Route` header element
    Route,
    Name::ROUTE
);

name_addr_header!(
    /// `Record-Route` header element
    RecordRoute,
    Name::RECORD_ROUTE
);

impl From<RecordRoute> for Route {
    fn from(rr: RecordRoute) -> Self {
        Route(rr.0)
    }
}
