use crate::util::{random_sequence_number, random_string};
use sip_core::transaction::TsxResponse;
use sip_core::{Endpoint, IncomingRequest};
use sip_msg::header::typed::{CSeq, CallId, Contact, FromTo, RecordRoute, Route};
use sip_msg::uri::{NameAddr, SipUri};
use sip_msg::{Method, Name, Request, Response, StatusCode};
use bytesstr::BytesStr;

/// Dialog state of one call: the identifying tag triple, both CSeq
/// sequences, the route set and the remote target.
///
/// Tags, once learned from the first response carrying one, are frozen
/// for the lifetime of the dialog.
#[derive(Debug)]
pub(crate) struct Dialog {
    /// From header of locally built requests, tag always present
    pub(crate) local: FromTo,
    /// To header of locally built requests, tag present once the dialog
    /// is established
    pub(crate) peer: FromTo,

    pub(crate) call_id: CallId,

    pub(crate) local_contact: Contact,
    /// Remote target learned from the peer's Contact
    pub(crate) peer_contact: Option<Contact>,

    /// CSeq of the next locally sent request
    pub(crate) local_cseq: u32,
    /// Highest CSeq seen from the peer
    pub(crate) peer_cseq: Option<u32>,

    /// Route set learned from Record-Route, in the order requests must
    /// carry it
    pub(crate) route_set: Vec<Route>,

    /// Request target when no peer Contact is known yet
    target: SipUri,
}

impl Dialog {
    /// Dialog for an outgoing call, before any response was received
    pub(crate) fn new_client(id: NameAddr, local_contact: Contact, target: SipUri) -> Self {
        Self {
            local: FromTo::new(id.clone(), Some(random_string())),
            peer: FromTo::new(NameAddr::uri(target.clone()), None),
            call_id: CallId::new(random_string()),
            local_contact,
            peer_contact: None,
            local_cseq: random_sequence_number(),
            peer_cseq: None,
            route_set: Vec::new(),
            target,
        }
    }

    /// Dialog from an incoming INVITE. The local tag is generated here
    /// and must be mirrored in every non-100 response.
    pub(crate) fn new_server(invite: &IncomingRequest, local_contact: Contact) -> Self {
        let peer_contact = invite
            .headers
            .try_get_named::<Contact>()
            .and_then(|c| c.ok());

        let target = peer_contact
            .as_ref()
            .map(|c| c.addr.uri.clone())
            .unwrap_or_else(|| invite.base_headers.from.addr.uri.clone());

        // from/to are reversed: the peer's From is our To
        Self {
            local: FromTo::new(
                invite.base_headers.to.addr.clone(),
                Some(random_string()),
            ),
            peer: invite.base_headers.from.clone(),
            call_id: invite.base_headers.call_id.clone(),
            local_contact,
            peer_contact,
            local_cseq: random_sequence_number(),
            peer_cseq: Some(invite.base_headers.cseq.cseq),
            route_set: invite
                .headers
                .get_all_type::<RecordRoute>(&Name::RECORD_ROUTE)
                .unwrap_or_default()
                .into_iter()
                .map(Route::from)
                .collect(),
            target,
        }
    }

    pub(crate) fn is_established(&self) -> bool {
        self.peer.tag.is_some()
    }

    /// Learn the peer half of the dialog from a UAC response.
    ///
    /// A no-op once established, so retransmissions and forked responses
    /// cannot rewrite the tags.
    pub(crate) fn establish_from_response(&mut self, response: &TsxResponse) {
        if self.is_established() {
            return;
        }

        self.peer.tag = response.base_headers.to.tag.clone();

        if let Some(Ok(contact)) = response.headers.try_get_named::<Contact>() {
            self.peer_contact = Some(contact);
        }

        // RFC 3261 12.1.2: the UAC route set is the Record-Route set in
        // reverse order
        self.route_set = response
            .headers
            .get_all_type::<RecordRoute>(&Name::RECORD_ROUTE)
            .unwrap_or_default()
            .into_iter()
            .rev()
            .map(Route::from)
            .collect();
    }

    /// Validate and record an in-dialog request CSeq. Remote CSeq values
    /// must never decrease.
    pub(crate) fn accept_peer_cseq(&mut self, cseq: u32) -> bool {
        match self.peer_cseq {
            Some(highest) if cseq < highest => false,
            _ => {
                self.peer_cseq = Some(cseq);
                true
            }
        }
    }

    /// Build an in-dialog request with the next CSeq
    pub(crate) fn create_request(&mut self, method: Method) -> Request {
        let uri = self
            .peer_contact
            .as_ref()
            .map(|c| c.addr.uri.clone())
            .unwrap_or_else(|| self.target.clone());

        let mut request = Request::new(method.clone(), uri);

        self.local_cseq += 1;

        request.headers.insert_type(Name::FROM, &self.local);
        request.headers.insert_type(Name::TO, &self.peer);
        request.headers.insert_named(&self.call_id);
        request
            .headers
            .insert_named(&CSeq::new(self.local_cseq, method));
        request.headers.insert(Name::MAX_FORWARDS, "70");

        for route in &self.route_set {
            request.headers.insert_named(route);
        }

        request
    }

    /// Build the ACK for a 2xx response. Per RFC 3261 13.2.2.4 the ACK
    /// CSeq equals the INVITE's, with method ACK.
    pub(crate) fn create_ack(&self, invite_cseq: u32) -> Request {
        let uri = self
            .peer_contact
            .as_ref()
            .map(|c| c.addr.uri.clone())
            .unwrap_or_else(|| self.target.clone());

        let mut request = Request::new(Method::ACK, uri);

        request.headers.insert_type(Name::FROM, &self.local);
        request.headers.insert_type(Name::TO, &self.peer);
        request.headers.insert_named(&self.call_id);
        request
            .headers
            .insert_named(&CSeq::new(invite_cseq, Method::ACK));
        request.headers.insert(Name::MAX_FORWARDS, "70");

        for route in &self.route_set {
            request.headers.insert_named(route);
        }

        request
    }

    /// Build a response within the dialog, stamping the local tag and,
    /// for INVITE responses that create or confirm the dialog, the
    /// local Contact
    pub(crate) fn create_response(
        &self,
        endpoint: &Endpoint,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> Response {
        let mut response = endpoint.create_response(request, code, reason);

        if code != StatusCode::TRYING {
            let mut to: FromTo = self.peer_to_local(request);
            to.tag = Some(
                self.local
                    .tag
                    .clone()
                    .expect("dialog local tag is always set"),
            );

            response.headers.remove(&Name::TO);
            response.headers.insert_type(Name::TO, &to);
        }

        if request.line.method == Method::INVITE {
            let code = code.into_u16();

            if matches!(code, 101..=399 | 485) {
                response.headers.insert_named(&self.local_contact);
            }
        }

        response
    }

    /// The To header of responses is the request's To, which on server
    /// dialogs is our local address
    fn peer_to_local(&self, request: &IncomingRequest) -> FromTo {
        FromTo::new(request.base_headers.to.addr.clone(), None)
    }
}
