use crate::parse::{quote, split_once_outside_quotes, split_outside_quotes, unquote};
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;
use std::str::FromStr;

/// A single `;name` or `;name=value` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl Param {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag<N>(name: N) -> Self
    where
        N: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, ";{}={}", self.name, value),
            None => write!(f, ";{}", self.name),
        }
    }
}

/// Ordered list of parameters, names matched case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.0.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn get_val(&self, name: &str) -> Option<&BytesStr> {
        self.get(name).and_then(|p| p.value.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, param: Param) {
        self.0.push(param);
    }

    /// Set `name` to `value`, replacing an existing parameter of that name
    pub fn push_or_edit<V>(&mut self, name: &str, value: V)
    where
        V: Into<BytesStr>,
    {
        if let Some(param) = self
            .0
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            param.value = Some(value.into());
        } else {
            self.0.push(Param::new(name, value));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Param> {
        let i = self
            .0
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(i))
    }

    pub(crate) fn parse_list(parts: &[&str]) -> Params {
        let mut params = Params::new();

        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            match part.split_once('=') {
                Some((name, value)) => params.push(Param {
                    name: name.trim().into(),
                    value: Some(BytesStr::from(unquote(value))),
                }),
                None => params.push(Param::flag(part)),
            }
        }

        params
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.0 {
            write!(f, "{param}")?;
        }

        Ok(())
    }
}

/// `sip:` / `sips:` URI
///
/// Recognizes the user part, host, port and uri-parameters. Everything else
/// (headers after `?`) is rejected as this stack never produces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<BytesStr>,
    pub host: BytesStr,
    pub port: Option<u16>,
    pub params: Params,
}

impl SipUri {
    pub fn new<H>(host: H) -> Self
    where
        H: Into<BytesStr>,
    {
        Self {
            sips: false,
            user: None,
            host: host.into(),
            port: None,
            params: Params::new(),
        }
    }

    pub fn user<U>(mut self, user: U) -> Self
    where
        U: Into<BytesStr>,
    {
        self.user = Some(user.into());
        self
    }

    /// Value of the `transport` uri parameter, if set
    pub fn transport_param(&self) -> Option<&BytesStr> {
        self.params.get_val("transport")
    }

    /// `host` or `host:port`
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.to_string(),
        }
    }
}

impl FromStr for SipUri {
    type Err = MessageError;

    fn from_str(i: &str) -> Result<Self, Self::Err> {
        let i = i.trim();

        let (sips, rem) = if let Some(rem) = i.strip_prefix("sips:") {
            (true, rem)
        } else if let Some(rem) = i.strip_prefix("sip:") {
            (false, rem)
        } else {
            return Err(MessageError::InvalidUri(i.into()));
        };

        let (rem, params) = match split_once_outside_quotes(rem, ';') {
            Some((head, tail)) => (head, Params::parse_list(&split_outside_quotes(tail, ';'))),
            None => (rem, Params::new()),
        };

        if rem.contains('?') {
            return Err(MessageError::InvalidUri(i.into()));
        }

        let (user, host_port) = match rem.rsplit_once('@') {
            Some((user, host_port)) => (Some(BytesStr::from(user)), host_port),
            None => (None, rem),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| MessageError::InvalidUri(i.into()))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        if host.is_empty() {
            return Err(MessageError::InvalidUri(i.into()));
        }

        Ok(SipUri {
            sips,
            user,
            host: host.into(),
            port,
            params,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.sips { "sips:" } else { "sip:" })?;

        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        write!(f, "{}", self.params)
    }
}

/// URI with optional display name and address parameters, as found in
/// From, To, Contact, Route and Refer-To headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<BytesStr>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn new<D>(display_name: D, uri: SipUri) -> Self
    where
        D: Into<BytesStr>,
    {
        Self {
            display_name: Some(display_name.into()),
            uri,
            params: Params::new(),
        }
    }
}

impl FromStr for NameAddr {
    type Err = MessageError;

    fn from_str(i: &str) -> Result<Self, Self::Err> {
        let i = i.trim();

        if let Some(open) = i.find('<') {
            let close = i.rfind('>').ok_or_else(|| MessageError::InvalidUri(i.into()))?;

            if close < open {
                return Err(MessageError::InvalidUri(i.into()));
            }

            let display_name = i[..open].trim();
            let display_name = if display_name.is_empty() {
                None
            } else {
                Some(BytesStr::from(unquote(display_name)))
            };

            let uri = i[open + 1..close].parse()?;
            let params = Params::parse_list(&split_outside_quotes(&i[close + 1..], ';'));

            Ok(NameAddr {
                display_name,
                uri,
                params,
            })
        } else {
            // addr-spec form, everything after the first `;` is an
            // address parameter
            let (uri, params) = match split_once_outside_quotes(i, ';') {
                Some((uri, tail)) => (
                    uri,
                    Params::parse_list(&split_outside_quotes(tail, ';')),
                ),
                None => (i, Params::new()),
            };

            Ok(NameAddr {
                display_name: None,
                uri: uri.parse()?,
                params,
            })
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "{} ", quote(display_name))?;
        }

        write!(f, "<{}>{}", self.uri, self.params)
    }
}
