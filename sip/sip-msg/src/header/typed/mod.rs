mod auth;
mod call_id;
mod contact;
mod content;
mod cseq;
mod event;
mod expires;
mod from_to;
mod refer_to;
mod routing;
mod via;

pub use auth::{
    Algorithm, AuthChallenge, DigestChallenge, DigestResponse, QopOption, QopResponse,
};
pub use call_id::CallId;
pub use contact::Contact;
pub use content::{ContentLength, ContentType};
pub use cseq::CSeq;
pub use event::{Event, SubscriptionState};
pub use expires::{Expires, MinExpires};
pub use from_to::FromTo;
pub use refer_to::ReferTo;
pub use routing::{RecordRoute, Route};
pub use via::Via;
