use bytesstr::BytesStr;
use std::fmt;

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Refer,
    Update,
    Notify,
    Subscribe,
    Message,
    Other(BytesStr),
}

impl Method {
    pub const REGISTER: Method = Method::Register;
    pub const INVITE: Method = Method::Invite;
    pub const ACK: Method = Method::Ack;
    pub const CANCEL: Method = Method::Cancel;
    pub const BYE: Method = Method::Bye;
    pub const OPTIONS: Method = Method::Options;
    pub const INFO: Method = Method::Info;
    pub const REFER: Method = Method::Refer;
    pub const UPDATE: Method = Method::Update;
    pub const NOTIFY: Method = Method::Notify;
    pub const SUBSCRIBE: Method = Method::Subscribe;
    pub const MESSAGE: Method = Method::Message;

    /// Parse a method token. Method names are case-sensitive per RFC 3261,
    /// unknown tokens are preserved as [`Method::Other`].
    pub fn from_token(token: &str) -> Method {
        match token {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "REFER" => Method::Refer,
            "UPDATE" => Method::Update,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            "MESSAGE" => Method::Message,
            other => Method::Other(BytesStr::from(other)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Refer => "REFER",
            Method::Update => "UPDATE",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Message => "MESSAGE",
            Method::Other(other) => other.as_ref(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
