mod headers;
mod name;

pub mod typed;

pub use headers::{HeaderValue, Headers, NamedHeader};
pub use name::Name;
