use crate::header::HeaderValue;
use crate::parse::{quote, split_outside_quotes, unquote};
use crate::MessageError;
use bytesstr::BytesStr;
use std::fmt;

/// Digest algorithm token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512Trunc256,
    Sha512Trunc256Sess,
    Other(BytesStr),
}

impl Algorithm {
    fn from_token(token: &str) -> Self {
        match token {
            t if t.eq_ignore_ascii_case("MD5") => Algorithm::Md5,
            t if t.eq_ignore_ascii_case("MD5-sess") => Algorithm::Md5Sess,
            t if t.eq_ignore_ascii_case("SHA-256") => Algorithm::Sha256,
            t if t.eq_ignore_ascii_case("SHA-256-sess") => Algorithm::Sha256Sess,
            t if t.eq_ignore_ascii_case("SHA-512-256") => Algorithm::Sha512Trunc256,
            t if t.eq_ignore_ascii_case("SHA-512-256-sess") => Algorithm::Sha512Trunc256Sess,
            t => Algorithm::Other(t.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
            Algorithm::Sha512Trunc256 => "SHA-512-256",
            Algorithm::Sha512Trunc256Sess => "SHA-512-256-sess",
            Algorithm::Other(other) => other,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `qop` option offered in a challenge or chosen in a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QopOption {
    Auth,
    AuthInt,
    Other(BytesStr),
}

impl QopOption {
    fn from_token(token: &str) -> Self {
        match token {
            t if t.eq_ignore_ascii_case("auth") => QopOption::Auth,
            t if t.eq_ignore_ascii_case("auth-int") => QopOption::AuthInt,
            t => QopOption::Other(t.into()),
        }
    }
}

impl fmt::Display for QopOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QopOption::Auth => f.write_str("auth"),
            QopOption::AuthInt => f.write_str("auth-int"),
            QopOption::Other(other) => f.write_str(other),
        }
    }
}

/// Challenge carried in `WWW-Authenticate` / `Proxy-Authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Digest(DigestChallenge),
    Other { scheme: BytesStr, value: BytesStr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: BytesStr,
    pub domain: Option<BytesStr>,
    pub nonce: BytesStr,
    pub opaque: Option<BytesStr>,
    pub stale: bool,
    pub algorithm: Algorithm,
    pub qop: Vec<QopOption>,
}

impl HeaderValue for AuthChallenge {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        let value_trimmed = value.trim();

        let (scheme, rem) = value_trimmed
            .split_once(char::is_whitespace)
            .ok_or_else(|| MessageError::InvalidAuthHeader(value.clone()))?;

        if !scheme.eq_ignore_ascii_case("Digest") {
            return Ok(AuthChallenge::Other {
                scheme: scheme.into(),
                value: rem.trim().into(),
            });
        }

        let mut challenge = DigestChallenge {
            realm: BytesStr::from_static(""),
            domain: None,
            nonce: BytesStr::from_static(""),
            opaque: None,
            stale: false,
            algorithm: Algorithm::Md5,
            qop: vec![],
        };

        for part in split_outside_quotes(rem, ',') {
            let Some((name, raw)) = part.split_once('=') else {
                continue;
            };

            let name = name.trim();
            let val = unquote(raw);

            if name.eq_ignore_ascii_case("realm") {
                challenge.realm = val.into();
            } else if name.eq_ignore_ascii_case("domain") {
                challenge.domain = Some(val.into());
            } else if name.eq_ignore_ascii_case("nonce") {
                challenge.nonce = val.into();
            } else if name.eq_ignore_ascii_case("opaque") {
                challenge.opaque = Some(val.into());
            } else if name.eq_ignore_ascii_case("stale") {
                challenge.stale = val.eq_ignore_ascii_case("true");
            } else if name.eq_ignore_ascii_case("algorithm") {
                challenge.algorithm = Algorithm::from_token(&val);
            } else if name.eq_ignore_ascii_case("qop") {
                challenge.qop = val
                    .split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(QopOption::from_token)
                    .collect();
            }
        }

        if challenge.realm.is_empty() || challenge.nonce.is_empty() {
            return Err(MessageError::InvalidAuthHeader(value.clone()));
        }

        Ok(AuthChallenge::Digest(challenge))
    }
}

impl fmt::Display for AuthChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthChallenge::Digest(digest) => {
                write!(
                    f,
                    "Digest realm={}, nonce={}",
                    quote(&digest.realm),
                    quote(&digest.nonce)
                )?;

                if let Some(domain) = &digest.domain {
                    write!(f, ", domain={}", quote(domain))?;
                }

                if let Some(opaque) = &digest.opaque {
                    write!(f, ", opaque={}", quote(opaque))?;
                }

                if digest.stale {
                    f.write_str(", stale=true")?;
                }

                write!(f, ", algorithm={}", digest.algorithm)?;

                if !digest.qop.is_empty() {
                    let qop = digest
                        .qop
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(",");

                    write!(f, ", qop={}", quote(&qop))?;
                }

                Ok(())
            }
            AuthChallenge::Other { scheme, value } => write!(f, "{scheme} {value}"),
        }
    }
}

/// qop-specific fields of a [`DigestResponse`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QopResponse {
    pub qop: QopOption,
    pub cnonce: BytesStr,
    pub nc: u32,
}

/// Credentials carried in `Authorization` / `Proxy-Authorization`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: BytesStr,
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub uri: BytesStr,
    pub response: BytesStr,
    pub algorithm: Algorithm,
    pub opaque: Option<BytesStr>,
    pub qop_response: Option<QopResponse>,
}

impl HeaderValue for DigestResponse {
    fn parse(value: &BytesStr) -> Result<Self, MessageError> {
        let value_trimmed = value.trim();

        let rem = value_trimmed
            .strip_prefix("Digest")
            .or_else(|| value_trimmed.strip_prefix("digest"))
            .ok_or_else(|| MessageError::InvalidAuthHeader(value.clone()))?;

        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut algorithm = Algorithm::Md5;
        let mut opaque = None;
        let mut qop = None;
        let mut cnonce = None;
        let mut nc = None;

        for part in split_outside_quotes(rem, ',') {
            let Some((name, raw)) = part.split_once('=') else {
                continue;
            };

            let name = name.trim();
            let val = unquote(raw);

            if name.eq_ignore_ascii_case("username") {
                username = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("realm") {
                realm = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("nonce") {
                nonce = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("uri") {
                uri = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("response") {
                response = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("algorithm") {
                algorithm = Algorithm::from_token(&val);
            } else if name.eq_ignore_ascii_case("opaque") {
                opaque = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("qop") {
                qop = Some(QopOption::from_token(&val));
            } else if name.eq_ignore_ascii_case("cnonce") {
                cnonce = Some(BytesStr::from(val));
            } else if name.eq_ignore_ascii_case("nc") {
                nc = u32::from_str_radix(val.trim(), 16).ok();
            }
        }

        let qop_response = match (qop, cnonce, nc) {
            (Some(qop), Some(cnonce), Some(nc)) => Some(QopResponse { qop, cnonce, nc }),
            _ => None,
        };

        match (username, realm, nonce, uri, response) {
            (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) => {
                Ok(DigestResponse {
                    username,
                    realm,
                    nonce,
                    uri,
                    response,
                    algorithm,
                    opaque,
                    qop_response,
                })
            }
            _ => Err(MessageError::InvalidAuthHeader(value.clone())),
        }
    }
}

impl fmt::Display for DigestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username={}, realm={}, nonce={}, uri={}, response={}",
            quote(&self.username),
            quote(&self.realm),
            quote(&self.nonce),
            quote(&self.uri),
            quote(&self.response),
        )?;

        write!(f, ", algorithm={}", self.algorithm)?;

        if let Some(qop_response) = &self.qop_response {
            write!(
                f,
                ", qop={}, cnonce={}, nc={:08x}",
                qop_response.qop,
                quote(&qop_response.cnonce),
                qop_response.nc
            )?;
        }

        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque={}", quote(opaque))?;
        }

        Ok(())
    }
}
