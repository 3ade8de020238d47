use bytesstr::BytesStr;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Header name, compared case-insensitively while preserving the spelling
/// it was created with for printing.
///
/// Compact forms (`v`, `f`, `t`, `i`, `m`, `c`, `l`, `k`) are expanded to
/// their canonical long form on parse.
#[derive(Debug, Clone)]
pub struct Name(BytesStr);

macro_rules! known_names {
    ($(($const_name:ident, $print:literal $(, $compact:literal)?)),* $(,)?) => {
        impl Name {
            $(
                pub const $const_name: Name = Name(BytesStr::from_static($print));
            )*

            /// Create a name from a raw header-field token
            pub fn from_wire(token: &str) -> Name {
                let token = token.trim();

                $(
                    if token.eq_ignore_ascii_case($print) {
                        return Name::$const_name;
                    }

                    $(
                        if token.eq_ignore_ascii_case($compact) {
                            return Name::$const_name;
                        }
                    )?
                )*

                Name(BytesStr::from(token))
            }
        }
    };
}

known_names! {
    (VIA, "Via", "v"),
    (FROM, "From", "f"),
    (TO, "To", "t"),
    (CALL_ID, "Call-ID", "i"),
    (CSEQ, "CSeq"),
    (CONTACT, "Contact", "m"),
    (CONTENT_TYPE, "Content-Type", "c"),
    (CONTENT_LENGTH, "Content-Length", "l"),
    (SUPPORTED, "Supported", "k"),
    (MAX_FORWARDS, "Max-Forwards"),
    (EXPIRES, "Expires"),
    (MIN_EXPIRES, "Min-Expires"),
    (ROUTE, "Route"),
    (RECORD_ROUTE, "Record-Route"),
    (USER_AGENT, "User-Agent"),
    (ALLOW, "Allow"),
    (WWW_AUTHENTICATE, "WWW-Authenticate"),
    (AUTHORIZATION, "Authorization"),
    (PROXY_AUTHENTICATE, "Proxy-Authenticate"),
    (PROXY_AUTHORIZATION, "Proxy-Authorization"),
    (REFER_TO, "Refer-To"),
    (REFERRED_BY, "Referred-By"),
    (EVENT, "Event"),
    (SUBSCRIPTION_STATE, "Subscription-State"),
}

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Name {}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl From<&'static str> for Name {
    fn from(name: &'static str) -> Self {
        Name::from_wire(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
