use crate::{ClientAuthenticator, RequestParts, ResponseParts};
use bytesstr::BytesStr;
use sha2::Digest;
use sip_msg::header::typed::{
    Algorithm, AuthChallenge, DigestChallenge, DigestResponse, QopOption, QopResponse,
};
use sip_msg::{Name, Headers, HeaderValue};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("failed to authenticate realms: {0:?}")]
    FailedToAuthenticate(Vec<BytesStr>),
    #[error("encountered unsupported algorithm {0}")]
    UnsupportedAlgorithm(BytesStr),
    #[error("missing credentials for realm {0}")]
    MissingCredentials(BytesStr),
    #[error("unsupported qop")]
    UnsupportedQop,
    #[error("response contains no digest challenge")]
    NoDigestChallenge,
}

/// Secret material of a [`DigestUser`].
///
/// Mobile clients commonly persist only the precomputed `HA1` hash instead
/// of the plaintext password, both forms are accepted.
#[derive(Clone)]
pub enum DigestSecret {
    Password(Vec<u8>),
    Ha1(String),
}

#[derive(Clone)]
pub struct DigestUser {
    user: String,
    secret: DigestSecret,
}

impl DigestUser {
    pub fn new<U, P>(user: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<Vec<u8>>,
    {
        Self {
            user: user.into(),
            secret: DigestSecret::Password(password.into()),
        }
    }

    /// Create a user from a precomputed `HA1 = hash(user:realm:password)`.
    ///
    /// Only usable with the algorithm the hash was created with.
    pub fn with_ha1<U, H>(user: U, ha1: H) -> Self
    where
        U: Into<String>,
        H: Into<String>,
    {
        Self {
            user: user.into(),
            secret: DigestSecret::Ha1(ha1.into()),
        }
    }
}

/// Credentials per realm with an optional fallback for unknown realms
#[derive(Default, Clone)]
pub struct DigestCredentials {
    default: Option<DigestUser>,
    map: HashMap<String, DigestUser>,
}

impl DigestCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set credentials used for realms without an explicit entry
    pub fn set_default(&mut self, credentials: DigestUser) {
        self.default = Some(credentials);
    }

    pub fn add_for_realm<R>(&mut self, realm: R, credentials: DigestUser)
    where
        R: Into<String>,
    {
        self.map.insert(realm.into(), credentials);
    }

    pub fn get_for_realm(&self, realm: &str) -> Option<&DigestUser> {
        self.map.get(realm).or(self.default.as_ref())
    }
}

type HashFn = fn(&[u8]) -> String;

/// One authenticated realm.
///
/// Tracks the last challenge parameters so the credentials can be replayed
/// with an incremented nonce count, and so a repeated challenge with an
/// unchanged nonce can be detected as a credential rejection.
struct RealmSession {
    realm: BytesStr,
    is_proxy: bool,
    header: DigestResponse,
    ha1: String,
    ha2: String,
    hash: HashFn,

    /// How often the cached response was attached to a request
    use_count: u32,
}

/// Solves Digest challenges from `401` / `407` responses
pub struct DigestAuthenticator {
    pub credentials: DigestCredentials,
    sessions: Vec<RealmSession>,

    /// Assume qop `auth` when a challenge carries no qop directive
    /// (RFC 8760 Section 2.6). Off by default.
    pub enforce_qop: bool,
}

impl DigestAuthenticator {
    pub fn new(credentials: DigestCredentials) -> Self {
        Self {
            credentials,
            sessions: vec![],
            enforce_qop: false,
        }
    }

    fn session_for_realm(&self, realm: &BytesStr) -> Option<&RealmSession> {
        self.sessions.iter().find(|s| &s.realm == realm)
    }

    fn handle_digest_challenge(
        &mut self,
        challenge: DigestChallenge,
        request: RequestParts<'_>,
        is_proxy: bool,
    ) -> Result<(), DigestError> {
        let (hash, is_session): (HashFn, bool) = match &challenge.algorithm {
            Algorithm::Md5 => (hash_md5, false),
            Algorithm::Md5Sess => (hash_md5, true),
            Algorithm::Sha256 => (hash_sha256, false),
            Algorithm::Sha256Sess => (hash_sha256, true),
            Algorithm::Sha512Trunc256 => (hash_sha512_trunc256, false),
            Algorithm::Sha512Trunc256Sess => (hash_sha512_trunc256, true),
            Algorithm::Other(other) => {
                return Err(DigestError::UnsupportedAlgorithm(other.clone()))
            }
        };

        let session = self.respond(challenge, request, is_session, is_proxy, hash)?;

        if let Some(i) = self.sessions.iter().position(|s| s.realm == session.realm) {
            self.sessions[i] = session;
        } else {
            self.sessions.push(session);
        }

        Ok(())
    }

    fn respond(
        &mut self,
        mut challenge: DigestChallenge,
        request: RequestParts<'_>,
        is_session: bool,
        is_proxy: bool,
        hash: HashFn,
    ) -> Result<RealmSession, DigestError> {
        let user = self
            .credentials
            .get_for_realm(&challenge.realm)
            .ok_or_else(|| DigestError::MissingCredentials(challenge.realm.clone()))?
            .clone();

        let cnonce = BytesStr::from(uuid::Uuid::new_v4().simple().to_string());

        let mut ha1 = match &user.secret {
            DigestSecret::Password(password) => hash(
                [
                    format!("{}:{}:", user.user, challenge.realm).as_bytes(),
                    password.as_slice(),
                ]
                .concat()
                .as_slice(),
            ),
            DigestSecret::Ha1(ha1) => ha1.clone(),
        };

        if is_session {
            ha1 = format!("{}:{}:{}", ha1, challenge.nonce, cnonce);
        }

        let uri = request.line.uri.to_string();

        if challenge.qop.is_empty() && self.enforce_qop {
            challenge.qop.push(QopOption::Auth);
        }

        let (ha2, response, qop_response) = if challenge.qop.is_empty() {
            let ha2 = hash(format!("{}:{}", request.line.method, uri).as_bytes());
            let response = hash(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes());

            (ha2, response, None)
        } else if challenge.qop.contains(&QopOption::Auth) {
            let ha2 = hash(format!("{}:{}", request.line.method, uri).as_bytes());
            let response = hash(
                format!("{}:{}:{:08x}:{}:auth:{}", ha1, challenge.nonce, 1, cnonce, ha2)
                    .as_bytes(),
            );

            let qop_response = QopResponse {
                qop: QopOption::Auth,
                cnonce,
                nc: 1,
            };

            (ha2, response, Some(qop_response))
        } else if challenge.qop.contains(&QopOption::AuthInt) {
            let ha2 = hash(
                format!(
                    "{}:{}:{}",
                    request.line.method,
                    uri,
                    hash(request.body)
                )
                .as_bytes(),
            );
            let response = hash(
                format!(
                    "{}:{}:{:08x}:{}:auth-int:{}",
                    ha1, challenge.nonce, 1, cnonce, ha2
                )
                .as_bytes(),
            );

            let qop_response = QopResponse {
                qop: QopOption::AuthInt,
                cnonce,
                nc: 1,
            };

            (ha2, response, Some(qop_response))
        } else {
            return Err(DigestError::UnsupportedQop);
        };

        Ok(RealmSession {
            realm: challenge.realm.clone(),
            is_proxy,
            header: DigestResponse {
                username: user.user.as_str().into(),
                realm: challenge.realm,
                nonce: challenge.nonce,
                uri: uri.into(),
                response: response.into(),
                algorithm: challenge.algorithm,
                opaque: challenge.opaque,
                qop_response,
            },
            ha1,
            ha2,
            hash,
            use_count: 0,
        })
    }
}

impl ClientAuthenticator for DigestAuthenticator {
    type Error = DigestError;

    fn authorize_request(&mut self, request_headers: &mut Headers) {
        for session in &mut self.sessions {
            let name = if session.is_proxy {
                Name::PROXY_AUTHORIZATION
            } else {
                Name::AUTHORIZATION
            };

            // A replayed qop response needs its nonce count incremented
            // and the digest recomputed, everything else stays valid.
            if session.use_count > 0 {
                if let Some(qop_response) = &mut session.header.qop_response {
                    qop_response.nc += 1;

                    let qop = match qop_response.qop {
                        QopOption::Auth => "auth",
                        QopOption::AuthInt => "auth-int",
                        QopOption::Other(_) => unreachable!("never created"),
                    };

                    session.header.response = (session.hash)(
                        format!(
                            "{}:{}:{:08x}:{}:{}:{}",
                            session.ha1,
                            session.header.nonce,
                            qop_response.nc,
                            qop_response.cnonce,
                            qop,
                            session.ha2,
                        )
                        .as_bytes(),
                    )
                    .into();
                }
            }

            session.use_count += 1;

            request_headers.insert_type(name, &session.header);
        }
    }

    fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), DigestError> {
        let mut handled_any = false;
        let mut failed_realms = vec![];

        for (header_name, is_proxy) in [
            (Name::WWW_AUTHENTICATE, false),
            (Name::PROXY_AUTHENTICATE, true),
        ] {
            for raw in reject_response.headers.get_all(&header_name) {
                let challenge = match AuthChallenge::parse(raw) {
                    Ok(AuthChallenge::Digest(challenge)) => challenge,
                    Ok(AuthChallenge::Other { scheme, .. }) => {
                        log::debug!("skipping unsupported auth scheme {scheme}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("failed to parse auth challenge, {e}");
                        continue;
                    }
                };

                // A challenge repeating the nonce we already answered means
                // the credentials were wrong, retrying cannot succeed.
                let already_answered = self
                    .session_for_realm(&challenge.realm)
                    .is_some_and(|session| session.header.nonce == challenge.nonce);

                if already_answered {
                    failed_realms.push(challenge.realm);
                    continue;
                }

                match self.handle_digest_challenge(challenge.clone(), rejected_request, is_proxy)
                {
                    Ok(()) => handled_any = true,
                    Err(e) => {
                        log::warn!("failed to answer challenge for {}, {e}", challenge.realm);
                        failed_realms.push(challenge.realm);
                    }
                }
            }
        }

        if !failed_realms.is_empty() {
            return Err(DigestError::FailedToAuthenticate(failed_realms));
        }

        if !handled_any {
            return Err(DigestError::NoDigestChallenge);
        }

        Ok(())
    }
}

fn hash_md5(i: &[u8]) -> String {
    format!("{:x}", md5::compute(i))
}

fn hash_sha256(i: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(i);
    format!("{:x}", hasher.finalize())
}

fn hash_sha512_trunc256(i: &[u8]) -> String {
    let mut hasher = sha2::Sha512_256::new();
    hasher.update(i);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_msg::msg::{RequestLine, StatusLine};
    use sip_msg::{Method, StatusCode};

    fn challenge_headers(value: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(Name::WWW_AUTHENTICATE, value.to_string());
        headers
    }

    fn rejection<'s>(headers: &'s Headers, line: &'s StatusLine) -> ResponseParts<'s> {
        ResponseParts {
            line,
            headers,
            body: &[],
        }
    }

    fn register_line() -> RequestLine {
        RequestLine {
            method: Method::REGISTER,
            uri: "sip:example.com".parse().unwrap(),
        }
    }

    fn authenticator() -> DigestAuthenticator {
        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("example.com", DigestUser::new("alice", "secret"));
        DigestAuthenticator::new(credentials)
    }

    const UNAUTHORIZED: StatusLine = StatusLine {
        code: StatusCode::UNAUTHORIZED,
        reason: None,
    };

    #[test]
    fn md5_without_qop() {
        let mut authenticator = authenticator();
        let line = register_line();
        let empty = Headers::new();

        let headers = challenge_headers("Digest realm=\"example.com\", nonce=\"abc\"");

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &empty,
                    body: &[],
                },
                rejection(&headers, &UNAUTHORIZED),
            )
            .unwrap();

        let mut request_headers = Headers::new();
        authenticator.authorize_request(&mut request_headers);

        let authorization: DigestResponse =
            request_headers.get_type(&Name::AUTHORIZATION).unwrap();

        assert_eq!(authorization.username, "alice");
        assert_eq!(authorization.realm, "example.com");
        assert_eq!(authorization.nonce, "abc");
        assert_eq!(authorization.uri, "sip:example.com");
        // md5(md5(alice:example.com:secret):abc:md5(REGISTER:sip:example.com))
        assert_eq!(authorization.response, "dbe98f00688a08a2dbda0b12e8c71319");
        assert_eq!(authorization.qop_response, None);
    }

    #[test]
    fn qop_auth_response_verifies() {
        let mut authenticator = authenticator();
        let line = register_line();
        let empty = Headers::new();

        let headers =
            challenge_headers("Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"");

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &empty,
                    body: &[],
                },
                rejection(&headers, &UNAUTHORIZED),
            )
            .unwrap();

        let mut request_headers = Headers::new();
        authenticator.authorize_request(&mut request_headers);

        let authorization: DigestResponse =
            request_headers.get_type(&Name::AUTHORIZATION).unwrap();

        let qop_response = authorization.qop_response.expect("qop=auth was offered");
        assert_eq!(qop_response.nc, 1);
        assert!(!qop_response.cnonce.is_empty());

        // recompute the digest with the cnonce the authenticator picked
        let ha1 = format!("{:x}", md5::compute(b"alice:example.com:secret"));
        let ha2 = format!("{:x}", md5::compute(b"REGISTER:sip:example.com"));
        let expected = format!(
            "{:x}",
            md5::compute(format!("{ha1}:abc:00000001:{}:auth:{ha2}", qop_response.cnonce))
        );

        assert_eq!(authorization.response, expected.as_str());
    }

    #[test]
    fn replay_increments_nonce_count() {
        let mut authenticator = authenticator();
        let line = register_line();
        let empty = Headers::new();

        let headers =
            challenge_headers("Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"");

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &empty,
                    body: &[],
                },
                rejection(&headers, &UNAUTHORIZED),
            )
            .unwrap();

        let mut first = Headers::new();
        authenticator.authorize_request(&mut first);
        let first: DigestResponse = first.get_type(&Name::AUTHORIZATION).unwrap();

        let mut second = Headers::new();
        authenticator.authorize_request(&mut second);
        let second: DigestResponse = second.get_type(&Name::AUTHORIZATION).unwrap();

        assert_eq!(first.qop_response.unwrap().nc, 1);
        assert_eq!(second.qop_response.unwrap().nc, 2);
        assert_ne!(first.response, second.response);
    }

    #[test]
    fn repeated_nonce_is_rejected() {
        let mut authenticator = authenticator();
        let line = register_line();
        let empty = Headers::new();

        let headers = challenge_headers("Digest realm=\"example.com\", nonce=\"abc\"");

        let request = RequestParts {
            line: &line,
            headers: &empty,
            body: &[],
        };

        authenticator
            .handle_rejection(request, rejection(&headers, &UNAUTHORIZED))
            .unwrap();

        // same nonce challenged again: credentials must be wrong
        let result = authenticator.handle_rejection(request, rejection(&headers, &UNAUTHORIZED));

        assert!(matches!(
            result,
            Err(DigestError::FailedToAuthenticate(realms)) if realms == vec![BytesStr::from_static("example.com")]
        ));
    }

    #[test]
    fn new_nonce_resets_nonce_count() {
        let mut authenticator = authenticator();
        let line = register_line();
        let empty = Headers::new();

        let request = RequestParts {
            line: &line,
            headers: &empty,
            body: &[],
        };

        let first =
            challenge_headers("Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"");
        authenticator
            .handle_rejection(request, rejection(&first, &UNAUTHORIZED))
            .unwrap();

        let mut headers = Headers::new();
        authenticator.authorize_request(&mut headers);
        let mut headers = Headers::new();
        authenticator.authorize_request(&mut headers);

        let second = challenge_headers(
            "Digest realm=\"example.com\", nonce=\"def\", qop=\"auth\", stale=true",
        );
        authenticator
            .handle_rejection(request, rejection(&second, &UNAUTHORIZED))
            .unwrap();

        let mut headers = Headers::new();
        authenticator.authorize_request(&mut headers);
        let authorization: DigestResponse = headers.get_type(&Name::AUTHORIZATION).unwrap();

        assert_eq!(authorization.nonce, "def");
        assert_eq!(authorization.qop_response.unwrap().nc, 1);
    }

    #[test]
    fn precomputed_ha1_matches_password() {
        let line = register_line();
        let empty = Headers::new();
        let headers = challenge_headers("Digest realm=\"example.com\", nonce=\"abc\"");

        let request = RequestParts {
            line: &line,
            headers: &empty,
            body: &[],
        };

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm(
            "example.com",
            DigestUser::with_ha1("alice", format!("{:x}", md5::compute(b"alice:example.com:secret"))),
        );
        let mut with_ha1 = DigestAuthenticator::new(credentials);

        with_ha1
            .handle_rejection(request, rejection(&headers, &UNAUTHORIZED))
            .unwrap();

        let mut request_headers = Headers::new();
        with_ha1.authorize_request(&mut request_headers);
        let authorization: DigestResponse =
            request_headers.get_type(&Name::AUTHORIZATION).unwrap();

        assert_eq!(authorization.response, "dbe98f00688a08a2dbda0b12e8c71319");
    }

    #[test]
    fn missing_credentials() {
        let mut authenticator = DigestAuthenticator::new(DigestCredentials::new());
        let line = register_line();
        let empty = Headers::new();
        let headers = challenge_headers("Digest realm=\"example.com\", nonce=\"abc\"");

        let result = authenticator.handle_rejection(
            RequestParts {
                line: &line,
                headers: &empty,
                body: &[],
            },
            rejection(&headers, &UNAUTHORIZED),
        );

        assert!(matches!(result, Err(DigestError::FailedToAuthenticate(_))));
    }
}
