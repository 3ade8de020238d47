use crate::util::{random_sequence_number, random_string};
use sip_core::transaction::TsxResponse;
use sip_msg::header::typed::{CSeq, CallId, Contact, Expires, FromTo, MinExpires};
use sip_msg::uri::{NameAddr, SipUri};
use sip_msg::{CodeKind, Method, Name, Request};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Builds and tracks the REGISTER binding of one account.
///
/// Owns the Call-ID and CSeq sequence all REGISTER requests of the
/// account share, the bound Contact (with push parameters) and the
/// refresh deadline derived from the granted expiry.
pub(crate) struct Registrar {
    registrar: SipUri,

    to: FromTo,
    from: FromTo,

    cseq: u32,
    call_id: CallId,
    contact: Contact,

    /// Expiry requested from the registrar
    request_expiry: Duration,

    refresh_at: Option<Instant>,
}

/// Refresh is scheduled `margin` before the binding expires, where
/// `margin = min(60s, expiry / 10)`
fn refresh_margin(expiry: Duration) -> Duration {
    (expiry / 10).min(Duration::from_secs(60))
}

impl Registrar {
    pub(crate) fn new(
        id: NameAddr,
        contact: Contact,
        registrar: SipUri,
        request_expiry: Duration,
    ) -> Self {
        Self {
            registrar,
            to: FromTo::new(id.clone(), None),
            from: FromTo::new(id, Some(random_string())),
            cseq: random_sequence_number(),
            call_id: CallId::new(random_string()),
            contact,
            request_expiry,
            refresh_at: None,
        }
    }

    pub(crate) fn contact(&self) -> &Contact {
        &self.contact
    }

    pub(crate) fn id(&self) -> &NameAddr {
        &self.to.addr
    }

    pub(crate) fn create_register(&mut self, remove_binding: bool, user_agent: &str) -> Request {
        let mut request = Request::new(Method::REGISTER, self.registrar.clone());

        request.headers.insert_type(Name::FROM, &self.from);
        request.headers.insert_type(Name::TO, &self.to);
        request.headers.insert_named(&self.call_id);

        self.cseq += 1;
        request
            .headers
            .insert_named(&CSeq::new(self.cseq, Method::REGISTER));

        let expires = if remove_binding {
            Expires(0)
        } else {
            Expires(self.request_expiry.as_secs() as u32)
        };

        request.headers.insert_named(&expires);
        request.headers.insert_named(&self.contact);
        request.headers.insert(Name::MAX_FORWARDS, "70");
        request.headers.insert(Name::USER_AGENT, user_agent.to_string());

        request
    }

    /// Digest a 2xx REGISTER response.
    ///
    /// Returns the instant the binding expires at. The granted expiry is
    /// taken from the `Expires` header, falling back to the `expires`
    /// parameter of the mirrored Contact, then to the requested value.
    pub(crate) fn receive_success_response(&mut self, response: &TsxResponse) -> SystemTime {
        debug_assert_eq!(response.line.code.kind(), CodeKind::Success);

        let granted = response
            .headers
            .try_get_named::<Expires>()
            .and_then(|e| e.ok())
            .map(|e| Duration::from_secs(e.0 as u64))
            .or_else(|| {
                let contact = response.headers.try_get_named::<Contact>()?.ok()?;
                Some(Duration::from_secs(contact.expires()? as u64))
            })
            .unwrap_or(self.request_expiry);

        self.refresh_at = Some(Instant::now() + granted.saturating_sub(refresh_margin(granted)));

        if self.to.tag.is_none() {
            self.to.tag = response.base_headers.to.tag.clone();
        }

        SystemTime::now() + granted
    }

    /// Digest a negative REGISTER response.
    ///
    /// Handles `423 Interval Too Brief` by adopting `Min-Expires`;
    /// returns whether the request should be re-issued.
    pub(crate) fn receive_error_response(&mut self, response: &TsxResponse) -> bool {
        if response.line.code != sip_msg::StatusCode::INTERVAL_TOO_BRIEF {
            return false;
        }

        let Some(Ok(min_expires)) = response.headers.try_get_named::<MinExpires>() else {
            return false;
        };

        self.request_expiry = Duration::from_secs(min_expires.0 as u64);
        true
    }

    pub(crate) fn clear_binding(&mut self) {
        self.refresh_at = None;
    }

    /// Sleep until the refresh deadline; pending forever while no
    /// binding is active
    pub(crate) async fn wait_for_refresh(&self) {
        match self.refresh_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
