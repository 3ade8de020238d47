use super::name::Name;
use crate::parse::split_outside_quotes;
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// A typed view on a header value
pub trait HeaderValue: fmt::Display + Sized {
    fn parse(value: &BytesStr) -> Result<Self, MessageError>;
}

/// A [`HeaderValue`] with a fixed header name
pub trait NamedHeader: HeaderValue {
    fn header_name() -> Name;
}

/// Ordered sequence of `(name, value)` pairs.
///
/// Names are matched case-insensitively, insertion order is preserved and
/// repeated names are kept as separate entries in order of insertion.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(Name, BytesStr)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Append a header
    pub fn insert<V>(&mut self, name: Name, value: V)
    where
        V: Into<BytesStr>,
    {
        self.entries.push((name, value.into()));
    }

    /// Insert a header before all existing entries
    pub fn insert_front<V>(&mut self, name: Name, value: V)
    where
        V: Into<BytesStr>,
    {
        self.entries.insert(0, (name, value.into()));
    }

    /// Append a typed header under an explicit name
    pub fn insert_type<H>(&mut self, name: Name, header: &H)
    where
        H: HeaderValue,
    {
        self.insert(name, header.to_string());
    }

    /// Append a typed header under its canonical name
    pub fn insert_named<H>(&mut self, header: &H)
    where
        H: NamedHeader,
    {
        self.insert_type(H::header_name(), header);
    }

    /// Insert a typed header under its canonical name before all entries
    pub fn insert_named_front<H>(&mut self, header: &H)
    where
        H: NamedHeader,
    {
        self.insert_front(H::header_name(), header.to_string());
    }

    /// First raw value for `name`
    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    /// All raw values for `name`, one per header line
    pub fn get_all<'s>(&'s self, name: &'s Name) -> impl Iterator<Item = &'s BytesStr> + 's {
        self.entries
            .iter()
            .filter_map(move |(n, v)| (n == name).then_some(v))
    }

    /// Remove every entry for `name`, returning the removed values
    pub fn remove(&mut self, name: &Name) -> Vec<BytesStr> {
        let mut removed = Vec::new();

        self.entries.retain(|(n, v)| {
            if n == name {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Replace all entries of `name` with a single value
    pub fn set<V>(&mut self, name: Name, value: V)
    where
        V: Into<BytesStr>,
    {
        self.remove(&name);
        self.insert(name, value);
    }

    /// Parse the first value of `name` into `H`
    pub fn get_type<H>(&self, name: &Name) -> Result<H, MessageError>
    where
        H: HeaderValue,
    {
        let value = self
            .get(name)
            .ok_or_else(|| MessageError::MissingHeader(name.clone()))?;

        H::parse(value)
    }

    /// Parse the first value of `H`'s canonical name
    pub fn get_named<H>(&self) -> Result<H, MessageError>
    where
        H: NamedHeader,
    {
        self.get_type(&H::header_name())
    }

    /// Like [`Headers::get_named`] but returns `None` if the header is absent
    pub fn try_get_named<H>(&self) -> Option<Result<H, MessageError>>
    where
        H: NamedHeader,
    {
        self.get(&H::header_name()).map(|value| H::parse(value))
    }

    /// Parse every value of `name` into `H`, splitting comma separated
    /// list headers (Via, Route, Record-Route, Contact) into their elements
    /// while preserving order.
    pub fn get_all_type<H>(&self, name: &Name) -> Result<Vec<H>, MessageError>
    where
        H: HeaderValue,
    {
        let mut out = Vec::new();

        for value in self.get_all(name) {
            for element in split_outside_quotes(value, ',') {
                let element = element.trim();

                if element.is_empty() {
                    continue;
                }

                out.push(H::parse(&BytesStr::from(element))?);
            }
        }

        Ok(out)
    }

    /// Copy all entries of `name` into `dst`, keeping their order
    pub fn clone_into(&self, dst: &mut Headers, name: &Name) {
        for value in self.get_all(name) {
            dst.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> + '_ {
        self.entries.iter().map(|(n, v)| (n, v))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_get_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert(Name::from_wire("Call-Id"), "abc");

        assert_eq!(headers.get(&Name::CALL_ID).map(|v| v.as_ref()), Some("abc"));
    }

    #[test]
    fn multiple_entries_keep_order() {
        let mut headers = Headers::new();
        headers.insert(Name::VIA, "first");
        headers.insert(Name::CSEQ, "1 INVITE");
        headers.insert(Name::VIA, "second");

        let via_name = Name::VIA;
        let vias: Vec<&str> = headers.get_all(&via_name).map(|v| v.as_ref()).collect();
        assert_eq!(vias, vec!["first", "second"]);
    }

    #[test]
    fn remove_returns_all_values() {
        let mut headers = Headers::new();
        headers.insert(Name::ROUTE, "<sip:a@x;lr>");
        headers.insert(Name::ROUTE, "<sip:b@x;lr>");

        assert_eq!(headers.remove(&Name::ROUTE).len(), 2);
        assert!(!headers.contains(&Name::ROUTE));
    }

    #[test]
    fn print_preserves_insertion_order() {
        let mut headers = Headers::new();
        headers.insert(Name::VIA, "SIP/2.0/WS h;branch=z9hG4bKa");
        headers.insert(Name::from_wire("X-Custom"), "1");

        assert_eq!(
            headers.to_string(),
            "Via: SIP/2.0/WS h;branch=z9hG4bKa\r\nX-Custom: 1\r\n"
        );
    }
}
