use crate::header::{HeaderValue, Name, NamedHeader};
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

macro_rules! u32_header {
    ($(#[$doc:meta])* $name:ident, $header_name:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u32);

        impl HeaderValue for $name {
            fn parse(value: &BytesStr) -> Result<Self, MessageError> {
                value
                    .trim()
                    .parse()
                    .map($name)
                    .map_err(|_| MessageError::InvalidHeader($header_name, value.clone()))
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

u32_header!(
    /// `Expires` header
    Expires,
    Name::EXPIRES
);

u32_header!(
    /// `Min-Expires` header
    MinExpires,
    Name::MIN_EXPIRES
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_expires() {
        assert_eq!(
            Expires::parse(&BytesStr::from_static("3600")).unwrap(),
            Expires(3600)
        );
        assert!(Expires::parse(&BytesStr::from_static("soon")).is_err());
    }
}
