use crate::account::Shared;
use crate::dialog::Dialog;
use crate::events::{CallDirection, CallEndReason, CallInfo, ClientEvent};
use crate::media::SdpDirection;
use crate::store::CallLogEntry;
use bytesstr::BytesStr;
use rand::Rng;
use sip_auth::{ClientAuthenticator, DigestAuthenticator, RequestParts, ResponseParts};
use sip_core::transaction::{ClientInvTsx, ClientTsx, ServerInvTsx, TsxResponse};
use sip_core::{Endpoint, IncomingRequest};
use sip_msg::header::typed::{ContentType, ReferTo};
use sip_msg::uri::{NameAddr, SipUri};
use sip_msg::{CodeKind, Method, StatusCode};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep_until, timeout_at, Instant};

const CONTENT_TYPE_SDP: ContentType = ContentType(BytesStr::from_static("application/sdp"));
const CONTENT_TYPE_DTMF: ContentType =
    ContentType(BytesStr::from_static("application/dtmf-relay"));

/// Pause between DTMF digits on top of the tone duration
const DTMF_EXTRA_GAP: Duration = Duration::from_millis(40);

/// Call state as driven by SIP methods and response classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    OutgoingInit,
    OutgoingProceeding,
    OutgoingRinging,
    IncomingReceived,
    IncomingRinging,
    Connected,
    Held,
    Ending,
    Ended,
}

/// In-dialog client transaction currently in flight.
///
/// Only one runs at a time; commands that need the slot while it is
/// taken are rejected or queued (DTMF).
enum Pending {
    Bye,
    Cancel,
    Reinvite { hold: bool, sdp: BytesStr },
    Refer,
    Info,
}

/// Either transaction flavor, re-INVITEs ride a client INVITE
/// transaction like the initial INVITE does
enum AnyClientTsx {
    Plain(ClientTsx),
    Invite(ClientInvTsx),
}

impl AnyClientTsx {
    async fn receive_final(&mut self) -> sip_core::Result<TsxResponse> {
        match self {
            AnyClientTsx::Plain(tsx) => tsx.receive_final().await,
            AnyClientTsx::Invite(tsx) => loop {
                match tsx.receive().await? {
                    Some(response) if response.line.code.is_final() => return Ok(response),
                    Some(_) => continue,
                    None => return Err(sip_core::Error::RequestTimedOut),
                }
            },
        }
    }
}

struct PendingTsx {
    kind: Pending,
    tsx: AnyClientTsx,
    deadline: Instant,
}

/// What [`CallMachine::drive`] woke up for
pub(crate) enum DriveEvent {
    InviteResponse(sip_core::Result<Option<TsxResponse>>),
    PendingResponse(sip_core::Result<TsxResponse>),
    DtmfTick,
    ReinviteRetry,
}

/// State machine of a single call, one per Call-ID.
///
/// All handlers run on the owning account's actor, so transitions are
/// serialized with every other stimulus of the account.
pub(crate) struct CallMachine {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    authenticator: DigestAuthenticator,

    pub(crate) state: CallState,
    dialog: Dialog,
    info: CallInfo,

    start_time: SystemTime,
    connect_time: Option<SystemTime>,
    last_status: Option<u16>,

    local_hold: bool,
    remote_hold: bool,
    muted: bool,

    // outgoing leg
    invite_tsx: Option<ClientInvTsx>,
    sdp_offer: Option<BytesStr>,
    /// Printed ACK, re-sent verbatim for 2xx retransmissions
    stored_ack: Option<BytesStr>,
    auth_attempts: u32,

    // incoming leg
    server_inv: Option<ServerInvTsx>,
    invite_request: Option<IncomingRequest>,
    remote_offer: Option<BytesStr>,

    pending: Option<PendingTsx>,
    /// Re-INVITE to re-issue after a 491 collision backoff
    reinvite_retry: Option<(Instant, bool, BytesStr)>,

    dtmf_queue: VecDeque<char>,
    dtmf_ready_at: Option<Instant>,
}

impl CallMachine {
    /// Start an outgoing call: fetch the SDP offer from the media engine
    /// and send the INVITE.
    pub(crate) async fn start_outgoing(
        shared: Arc<Shared>,
        endpoint: Endpoint,
        id: NameAddr,
        contact: sip_msg::header::typed::Contact,
        credentials: sip_auth::DigestCredentials,
        account: crate::account::AccountKey,
        target: SipUri,
    ) -> Result<CallMachine, CallInfo> {
        let dialog = Dialog::new_client(id.clone(), contact, target.clone());

        let info = CallInfo {
            account,
            call_id: dialog.call_id.0.clone(),
            direction: CallDirection::Outgoing,
            local: BytesStr::from(id.uri.to_string()),
            remote: BytesStr::from(target.to_string()),
            remote_display_name: None,
        };

        let offer = match shared.media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                shared.emit(ClientEvent::CallFailed {
                    info: info.clone(),
                    error: BytesStr::from(e.to_string()),
                });
                return Err(info);
            }
        };

        let mut machine = CallMachine {
            shared,
            endpoint,
            authenticator: DigestAuthenticator::new(credentials),
            state: CallState::OutgoingInit,
            dialog,
            info,
            start_time: SystemTime::now(),
            connect_time: None,
            last_status: None,
            local_hold: false,
            remote_hold: false,
            muted: false,
            invite_tsx: None,
            sdp_offer: Some(offer),
            stored_ack: None,
            auth_attempts: 0,
            server_inv: None,
            invite_request: None,
            remote_offer: None,
            pending: None,
            reinvite_retry: None,
            dtmf_queue: VecDeque::new(),
            dtmf_ready_at: None,
        };

        if let Err(e) = machine.send_invite().await {
            machine.shared.emit(ClientEvent::CallFailed {
                info: machine.info.clone(),
                error: BytesStr::from(e.to_string()),
            });
            return Err(machine.info);
        }

        Ok(machine)
    }

    async fn send_invite(&mut self) -> sip_core::Result<()> {
        let mut request = self.dialog.create_request(Method::INVITE);
        request.headers.insert_named(&self.dialog.local_contact);

        if let Some(offer) = &self.sdp_offer {
            request.headers.insert_named(&CONTENT_TYPE_SDP);
            request.body = bytes::Bytes::copy_from_slice(offer.as_bytes());
        }

        self.authenticator.authorize_request(&mut request.headers);

        let tsx = self
            .endpoint
            .send_invite(request, self.shared.config.invite_timeout)
            .await?;

        self.invite_tsx = Some(tsx);
        Ok(())
    }

    /// Take over an incoming INVITE: create the dialog, answer 100 and,
    /// once the media engine is prepared, 180.
    pub(crate) async fn start_incoming(
        shared: Arc<Shared>,
        endpoint: Endpoint,
        contact: sip_msg::header::typed::Contact,
        account: crate::account::AccountKey,
        invite: IncomingRequest,
    ) -> Result<CallMachine, ()> {
        let dialog = Dialog::new_server(&invite, contact);

        let info = CallInfo {
            account,
            call_id: dialog.call_id.0.clone(),
            direction: CallDirection::Incoming,
            local: BytesStr::from(invite.base_headers.to.addr.uri.to_string()),
            remote: BytesStr::from(invite.base_headers.from.addr.uri.to_string()),
            remote_display_name: invite.base_headers.from.addr.display_name.clone(),
        };

        let remote_offer = (invite
            .headers
            .try_get_named::<ContentType>()
            .is_some_and(|ct| ct.is_ok_and(|ct| ct.0 == CONTENT_TYPE_SDP.0))
            && !invite.body.is_empty())
        .then(|| BytesStr::from(String::from_utf8_lossy(&invite.body).into_owned()));

        let server_inv = endpoint.create_server_inv_tsx(&invite);

        let trying = dialog.create_response(&endpoint, &invite, StatusCode::TRYING, None);
        if let Err(e) = server_inv.respond_provisional(trying).await {
            log::warn!("failed to answer INVITE with 100 Trying, {e}");
            return Err(());
        }

        let mut machine = CallMachine {
            shared,
            endpoint,
            authenticator: DigestAuthenticator::new(Default::default()),
            state: CallState::IncomingReceived,
            dialog,
            info,
            start_time: SystemTime::now(),
            connect_time: None,
            last_status: None,
            local_hold: false,
            remote_hold: false,
            muted: false,
            invite_tsx: None,
            sdp_offer: None,
            stored_ack: None,
            auth_attempts: 0,
            server_inv: Some(server_inv),
            invite_request: Some(invite),
            remote_offer,
            pending: None,
            reinvite_retry: None,
            dtmf_queue: VecDeque::new(),
            dtmf_ready_at: None,
        };

        machine
            .shared
            .emit(ClientEvent::IncomingCall(machine.info.clone()));

        // let the media engine prepare before signaling ringing
        if let Err(e) = machine.shared.media.initialize().await {
            log::warn!("media engine failed to prepare, {e}");
        }

        let ringing = machine.dialog.create_response(
            &machine.endpoint,
            machine.invite_request.as_ref().expect("set above"),
            StatusCode::RINGING,
            None,
        );

        if let Some(server_inv) = &machine.server_inv {
            if let Err(e) = server_inv.respond_provisional(ringing).await {
                log::warn!("failed to answer INVITE with 180 Ringing, {e}");
            }
        }

        machine.state = CallState::IncomingRinging;

        Ok(machine)
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    pub(crate) fn call_id(&self) -> &BytesStr {
        &self.dialog.call_id.0
    }

    /// Wait for the next thing this call has to react to
    pub(crate) async fn drive(&mut self) -> DriveEvent {
        let invite_tsx = &mut self.invite_tsx;
        let pending = &mut self.pending;
        let dtmf_ready_at = self.dtmf_ready_at;
        let has_queued_dtmf = !self.dtmf_queue.is_empty();
        let reinvite_retry_at = self.reinvite_retry.as_ref().map(|(at, ..)| *at);

        tokio::select! {
            response = async {
                match invite_tsx {
                    Some(tsx) => tsx.receive().await,
                    None => std::future::pending().await,
                }
            } => DriveEvent::InviteResponse(response),

            response = async {
                match pending {
                    Some(p) => match timeout_at(p.deadline, p.tsx.receive_final()).await {
                        Ok(result) => result,
                        Err(_) => Err(sip_core::Error::RequestTimedOut),
                    },
                    None => std::future::pending().await,
                }
            } => DriveEvent::PendingResponse(response),

            _ = async {
                match dtmf_ready_at {
                    Some(at) if has_queued_dtmf => sleep_until(at).await,
                    _ => std::future::pending().await,
                }
            } => DriveEvent::DtmfTick,

            _ = async {
                match reinvite_retry_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => DriveEvent::ReinviteRetry,
        }
    }

    pub(crate) async fn on_drive_event(&mut self, event: DriveEvent) {
        match event {
            DriveEvent::InviteResponse(response) => self.on_invite_response(response).await,
            DriveEvent::PendingResponse(response) => self.on_pending_response(response).await,
            DriveEvent::DtmfTick => {
                self.dtmf_ready_at = None;
                self.try_send_dtmf().await;
            }
            DriveEvent::ReinviteRetry => self.retry_reinvite().await,
        }
    }

    // === outgoing INVITE responses ===

    async fn on_invite_response(&mut self, response: sip_core::Result<Option<TsxResponse>>) {
        let response = match response {
            Ok(Some(response)) => response,
            Ok(None) => {
                // 2xx retransmission window is over
                self.invite_tsx = None;
                self.stored_ack = None;
                return;
            }
            Err(e) => {
                // no final response at all, as opposed to a 408/480
                log::warn!("INVITE transaction failed, {e}");
                self.invite_tsx = None;

                if !matches!(self.state, CallState::Connected | CallState::Held) {
                    self.end(CallEndReason::Timeout).await;
                }
                return;
            }
        };

        self.last_status = Some(response.line.code.into_u16());

        match response.line.code.kind() {
            CodeKind::Provisional => self.on_invite_provisional(&response),
            CodeKind::Success => self.on_invite_success(response).await,
            _ => self.on_invite_failure(response).await,
        }
    }

    fn on_invite_provisional(&mut self, response: &TsxResponse) {
        if response.base_headers.to.tag.is_some() {
            self.dialog.establish_from_response(response);
        }

        match response.line.code.into_u16() {
            100 => {
                if self.state == CallState::OutgoingInit {
                    self.state = CallState::OutgoingProceeding;
                }
            }
            180 | 183 => {
                if matches!(
                    self.state,
                    CallState::OutgoingInit | CallState::OutgoingProceeding
                ) {
                    self.state = CallState::OutgoingRinging;
                    self.shared
                        .emit(ClientEvent::CallRinging(self.info.clone()));
                }
            }
            _ => {}
        }
    }

    async fn on_invite_success(&mut self, response: TsxResponse) {
        if matches!(self.state, CallState::Connected | CallState::Held) {
            // duplicate 2xx: re-acknowledge without touching the media
            // engine (RFC 3261 13.3.1.4)
            if let Some(ack) = self.stored_ack.clone() {
                if let Err(e) = self.endpoint.send_raw(&ack).await {
                    log::warn!("failed to retransmit ACK, {e}");
                }
            }
            return;
        }

        if self.state == CallState::Ending {
            // the call was cancelled but the peer picked up first: accept
            // the race and terminate the established dialog with BYE
            self.dialog.establish_from_response(&response);
            let ack = self.dialog.create_ack(response.base_headers.cseq.cseq);
            let _ = self.endpoint.send_outgoing_request(&ack).await;
            self.send_bye().await;
            return;
        }

        self.dialog.establish_from_response(&response);

        let answer = extract_sdp(&response);

        let Some(answer) = answer else {
            log::warn!("2xx INVITE response without SDP answer, terminating");
            let ack = self.dialog.create_ack(response.base_headers.cseq.cseq);
            let _ = self.endpoint.send_outgoing_request(&ack).await;
            self.shared.emit(ClientEvent::CallFailed {
                info: self.info.clone(),
                error: BytesStr::from_static("missing SDP answer"),
            });
            self.send_bye().await;
            return;
        };

        if let Err(e) = self.shared.media.apply_answer(&answer).await {
            log::warn!("media engine rejected SDP answer, {e}");
            let ack = self.dialog.create_ack(response.base_headers.cseq.cseq);
            let _ = self.endpoint.send_outgoing_request(&ack).await;
            self.shared.emit(ClientEvent::CallFailed {
                info: self.info.clone(),
                error: BytesStr::from(e.to_string()),
            });
            self.send_bye().await;
            return;
        }

        let ack = self.dialog.create_ack(response.base_headers.cseq.cseq);
        let printed = ack.print();

        match std::str::from_utf8(&printed) {
            Ok(text) => {
                if let Err(e) = self.endpoint.send_raw(text).await {
                    log::warn!("failed to send ACK, {e}");
                }
                self.stored_ack = Some(BytesStr::from(text));
            }
            Err(_) => unreachable!("printed requests are always utf8"),
        }

        self.connect_time = Some(SystemTime::now());
        self.state = CallState::Connected;
        self.shared
            .emit(ClientEvent::CallConnected(self.info.clone()));
    }

    async fn on_invite_failure(&mut self, response: TsxResponse) {
        let code = response.line.code;

        // the transaction has already acknowledged the failure

        if matches!(code, StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            && self.auth_attempts < 2
        {
            self.auth_attempts += 1;

            let handled = {
                let tsx = self
                    .invite_tsx
                    .as_ref()
                    .expect("failure response implies a live transaction");
                let request = tsx.request();

                self.authenticator.handle_rejection(
                    RequestParts {
                        line: &request.line,
                        headers: &request.headers,
                        body: &request.body,
                    },
                    ResponseParts {
                        line: &response.line,
                        headers: &response.headers,
                        body: &response.body,
                    },
                )
            };

            match handled {
                Ok(()) => {
                    self.invite_tsx = None;

                    if let Err(e) = self.send_invite().await {
                        log::warn!("failed to re-send authorized INVITE, {e}");
                        self.end(CallEndReason::NetworkError).await;
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("INVITE authentication failed, {e}");
                }
            }
        }

        self.invite_tsx = None;
        self.end(CallEndReason::from_status(code)).await;
    }

    // === in-dialog client transactions ===

    async fn on_pending_response(&mut self, response: sip_core::Result<TsxResponse>) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        match pending.kind {
            Pending::Bye => match &response {
                Ok(_) => self.end(CallEndReason::NormalHangup).await,
                Err(e) => {
                    log::warn!("BYE concluded without response, {e}");
                    self.end(CallEndReason::Timeout).await;
                }
            },
            Pending::Cancel => {
                if let Err(e) = &response {
                    log::warn!("CANCEL concluded without response, {e}");
                    self.end(CallEndReason::Cancelled).await;
                }
                // otherwise wait for the 487 on the INVITE transaction
            }
            Pending::Reinvite { hold, sdp } => {
                self.on_reinvite_response(hold, sdp, response).await;
            }
            Pending::Refer => match response {
                Ok(response) if response.line.code == StatusCode::ACCEPTED => {
                    self.finish_deflection().await;
                }
                Ok(response) => {
                    log::warn!(
                        "REFER rejected with {}, call keeps ringing",
                        response.line.code
                    );
                }
                Err(e) => log::warn!("REFER concluded without response, {e}"),
            },
            Pending::Info => {
                if let Err(e) = response {
                    log::warn!("INFO concluded without response, {e}");
                }

                self.dtmf_ready_at =
                    Some(Instant::now() + self.shared.config.dtmf_duration + DTMF_EXTRA_GAP);
            }
        }

        // a queued digit may have waited for the slot to free up
        if !self.dtmf_queue.is_empty() && self.dtmf_ready_at.is_none() {
            self.dtmf_ready_at = Some(Instant::now() + DTMF_EXTRA_GAP);
        }
    }

    async fn on_reinvite_response(
        &mut self,
        hold: bool,
        sdp: BytesStr,
        response: sip_core::Result<TsxResponse>,
    ) {
        match response {
            Ok(response) if response.line.code.kind() == CodeKind::Success => {
                let ack = self.dialog.create_ack(response.base_headers.cseq.cseq);
                if let Err(e) = self.endpoint.send_outgoing_request(&ack).await {
                    log::warn!("failed to ACK re-INVITE response, {e}");
                }

                self.local_hold = hold;
                self.reinvite_retry = None;
                self.state = if hold {
                    CallState::Held
                } else {
                    CallState::Connected
                };
            }
            Ok(response) if response.line.code == StatusCode::REQUEST_PENDING => {
                // glare: back off up to 2s and re-issue
                let delay = rand::rng().random_range(Duration::ZERO..Duration::from_secs(2));
                self.reinvite_retry = Some((Instant::now() + delay, hold, sdp));
            }
            Ok(response) => {
                log::warn!(
                    "re-INVITE failed with {}, keeping previous media state",
                    response.line.code
                );
                self.revert_hold(hold).await;
            }
            Err(e) => {
                log::warn!("re-INVITE concluded without response, {e}");
                self.revert_hold(hold).await;
            }
        }
    }

    async fn revert_hold(&mut self, attempted: bool) {
        self.reinvite_retry = None;

        if let Err(e) = self.shared.media.set_hold(!attempted).await {
            log::warn!("failed to revert media hold state, {e}");
        }
    }

    async fn retry_reinvite(&mut self) {
        let Some((_, hold, sdp)) = self.reinvite_retry.take() else {
            return;
        };

        if self.pending.is_some() {
            // slot is taken again, try after the pending request concludes
            self.reinvite_retry = Some((Instant::now() + Duration::from_millis(500), hold, sdp));
            return;
        }

        self.send_reinvite(hold, sdp).await;
    }

    async fn send_reinvite(&mut self, hold: bool, sdp: BytesStr) {
        let mut request = self.dialog.create_request(Method::INVITE);
        request.headers.insert_named(&self.dialog.local_contact);
        request.headers.insert_named(&CONTENT_TYPE_SDP);
        request.body = bytes::Bytes::copy_from_slice(sdp.as_bytes());

        match self
            .endpoint
            .send_invite(request, self.shared.config.reinvite_timeout)
            .await
        {
            Ok(tsx) => {
                self.pending = Some(PendingTsx {
                    kind: Pending::Reinvite {
                        hold,
                        sdp: sdp.clone(),
                    },
                    tsx: AnyClientTsx::Invite(tsx),
                    deadline: Instant::now() + self.shared.config.reinvite_timeout,
                });
            }
            Err(e) => {
                log::warn!("failed to send re-INVITE, {e}");
                self.revert_hold(hold).await;
            }
        }
    }

    // === application commands ===

    pub(crate) async fn accept(&mut self) {
        if !matches!(
            self.state,
            CallState::IncomingReceived | CallState::IncomingRinging
        ) {
            log::warn!("accept ignored in state {:?}", self.state);
            return;
        }

        let Some(server_inv) = self.server_inv.take() else {
            return;
        };

        let offer = self
            .remote_offer
            .clone()
            .unwrap_or(BytesStr::from_static(""));

        let answer = match self.shared.media.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("media engine failed to create answer, {e}");

                let response = self.dialog.create_response(
                    &self.endpoint,
                    self.invite_request.as_ref().expect("incoming call"),
                    StatusCode::SERVER_INTERNAL_ERROR,
                    None,
                );
                let _ = server_inv.respond_failure(response).await;

                self.shared.emit(ClientEvent::CallFailed {
                    info: self.info.clone(),
                    error: BytesStr::from(e.to_string()),
                });
                self.end(CallEndReason::Error).await;
                return;
            }
        };

        let mut response = self.dialog.create_response(
            &self.endpoint,
            self.invite_request.as_ref().expect("incoming call"),
            StatusCode::OK,
            None,
        );

        response.headers.insert_named(&CONTENT_TYPE_SDP);
        response.body = bytes::Bytes::copy_from_slice(answer.as_bytes());

        if let Err(e) = server_inv.respond_success(response).await {
            log::warn!("failed to answer INVITE with 200, {e}");
            self.end(CallEndReason::NetworkError).await;
            return;
        }

        self.connect_time = Some(SystemTime::now());
        self.state = CallState::Connected;
        self.shared
            .emit(ClientEvent::CallConnected(self.info.clone()));
    }

    pub(crate) async fn decline(&mut self) {
        if !matches!(
            self.state,
            CallState::IncomingReceived | CallState::IncomingRinging
        ) {
            log::warn!("decline ignored in state {:?}", self.state);
            return;
        }

        let Some(server_inv) = self.server_inv.take() else {
            return;
        };

        let response = self.dialog.create_response(
            &self.endpoint,
            self.invite_request.as_ref().expect("incoming call"),
            StatusCode::DECLINE,
            None,
        );

        if let Err(e) = server_inv.respond_failure(response).await {
            log::warn!("failed to decline INVITE, {e}");
        }

        self.end(CallEndReason::Rejected).await;
    }

    pub(crate) async fn hangup(&mut self) {
        match self.state {
            // BYE is valid from the connected states and, for incoming
            // calls, from either ringing state before any 200; both tags
            // exist there since the 180 carried ours
            CallState::Connected
            | CallState::Held
            | CallState::IncomingReceived
            | CallState::IncomingRinging => {
                self.send_bye().await;
            }
            CallState::OutgoingInit | CallState::OutgoingProceeding | CallState::OutgoingRinging => {
                self.cancel_outgoing().await;
            }
            CallState::Ending | CallState::Ended => {}
        }
    }

    async fn send_bye(&mut self) {
        let request = self.dialog.create_request(Method::BYE);

        match self.endpoint.send_request(request).await {
            Ok(tsx) => {
                self.state = CallState::Ending;
                self.pending = Some(PendingTsx {
                    kind: Pending::Bye,
                    tsx: AnyClientTsx::Plain(tsx),
                    deadline: Instant::now() + self.shared.config.bye_timeout,
                });
            }
            Err(e) => {
                log::warn!("failed to send BYE, {e}");
                self.end(CallEndReason::NetworkError).await;
            }
        }
    }

    async fn cancel_outgoing(&mut self) {
        let Some(invite_tsx) = &self.invite_tsx else {
            self.end(CallEndReason::Cancelled).await;
            return;
        };

        let Some(key) = invite_tsx.key() else {
            self.end(CallEndReason::Cancelled).await;
            return;
        };

        match self
            .endpoint
            .send_cancel(invite_tsx.request(), key.clone())
            .await
        {
            Ok(tsx) => {
                self.state = CallState::Ending;
                self.pending = Some(PendingTsx {
                    kind: Pending::Cancel,
                    tsx: AnyClientTsx::Plain(tsx),
                    deadline: Instant::now() + self.shared.config.bye_timeout,
                });
            }
            Err(e) => {
                log::warn!("failed to send CANCEL, {e}");
                self.end(CallEndReason::Cancelled).await;
            }
        }
    }

    pub(crate) async fn set_hold(&mut self, hold: bool) {
        if self.local_hold == hold {
            return;
        }

        if hold && self.state != CallState::Connected {
            log::warn!("hold ignored in state {:?}", self.state);
            return;
        }

        if !hold && self.state != CallState::Held {
            log::warn!("resume ignored in state {:?}", self.state);
            return;
        }

        if self.pending.is_some() {
            log::warn!("hold change ignored, another request is in flight");
            return;
        }

        let sdp = match self.shared.media.set_hold(hold).await {
            Ok(sdp) => sdp,
            Err(e) => {
                log::warn!("media engine rejected hold change, {e}");
                return;
            }
        };

        self.send_reinvite(hold, sdp).await;
    }

    pub(crate) async fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }

        self.muted = muted;
        self.shared.media.set_muted(muted).await;
    }

    pub(crate) fn queue_dtmf(&mut self, digits: &str) {
        if !matches!(self.state, CallState::Connected | CallState::Held) {
            log::warn!("DTMF ignored in state {:?}", self.state);
            return;
        }

        self.dtmf_queue.extend(digits.chars());

        if self.dtmf_ready_at.is_none() && self.pending.is_none() {
            // fire the first digit on the next drive pass
            self.dtmf_ready_at = Some(Instant::now());
        }
    }

    async fn try_send_dtmf(&mut self) {
        if self.pending.is_some() {
            self.dtmf_ready_at = Some(Instant::now() + DTMF_EXTRA_GAP);
            return;
        }

        let Some(digit) = self.dtmf_queue.pop_front() else {
            return;
        };

        let duration = self.shared.config.dtmf_duration.as_millis();

        let mut request = self.dialog.create_request(Method::INFO);
        request.headers.insert_named(&CONTENT_TYPE_DTMF);
        request.body =
            bytes::Bytes::from(format!("Signal={digit}\r\nDuration={duration}\r\n"));

        match self.endpoint.send_request(request).await {
            Ok(tsx) => {
                self.pending = Some(PendingTsx {
                    kind: Pending::Info,
                    tsx: AnyClientTsx::Plain(tsx),
                    deadline: Instant::now() + Duration::from_secs(5),
                });
            }
            Err(e) => log::warn!("failed to send DTMF INFO, {e}"),
        }
    }

    pub(crate) async fn deflect(&mut self, target: SipUri) {
        if !matches!(
            self.state,
            CallState::IncomingReceived | CallState::IncomingRinging
        ) {
            log::warn!("deflect ignored in state {:?}", self.state);
            return;
        }

        if self.pending.is_some() {
            log::warn!("deflect ignored, another request is in flight");
            return;
        }

        let mut request = self.dialog.create_request(Method::REFER);
        request
            .headers
            .insert_named(&ReferTo(NameAddr::uri(target)));

        match self.endpoint.send_request(request).await {
            Ok(tsx) => {
                self.pending = Some(PendingTsx {
                    kind: Pending::Refer,
                    tsx: AnyClientTsx::Plain(tsx),
                    deadline: Instant::now() + Duration::from_secs(5),
                });
            }
            Err(e) => log::warn!("failed to send REFER, {e}"),
        }
    }

    async fn finish_deflection(&mut self) {
        // the REFER was accepted: close the pending INVITE and the dialog
        if let Some(server_inv) = self.server_inv.take() {
            let response = self.dialog.create_response(
                &self.endpoint,
                self.invite_request.as_ref().expect("incoming call"),
                StatusCode::DECLINE,
                None,
            );

            if let Err(e) = server_inv.respond_failure(response).await {
                log::warn!("failed to close deflected INVITE, {e}");
            }
        }

        self.end(CallEndReason::Deflected).await;
    }

    // === incoming in-dialog requests ===

    pub(crate) async fn handle_request(&mut self, request: IncomingRequest) {
        match request.line.method.clone() {
            Method::ACK => {
                // ACK to our 200, nothing left to do on a reliable
                // transport
            }
            Method::CANCEL => self.handle_cancel(request).await,
            Method::BYE => self.handle_bye(request).await,
            Method::INVITE => self.handle_reinvite(request).await,
            Method::INFO | Method::UPDATE | Method::NOTIFY => {
                self.respond_simple(&request, StatusCode::OK).await;
            }
            method => {
                log::debug!("rejecting in-dialog {method} request");
                self.respond_simple(&request, StatusCode::new(501)).await;
            }
        }
    }

    async fn respond_simple(&mut self, request: &IncomingRequest, code: StatusCode) {
        if request.line.method == Method::ACK {
            return;
        }

        if !self.dialog.accept_peer_cseq(request.base_headers.cseq.cseq) {
            log::warn!("dropping in-dialog request with decreasing CSeq");
            return;
        }

        let tsx = self.endpoint.create_server_tsx(request);
        let response = self
            .dialog
            .create_response(&self.endpoint, request, code, None);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to respond to {}, {e}", request.line.method);
        }
    }

    async fn handle_cancel(&mut self, request: IncomingRequest) {
        let tsx = self.endpoint.create_server_tsx(&request);

        if !matches!(
            self.state,
            CallState::IncomingReceived | CallState::IncomingRinging
        ) {
            // no INVITE to cancel anymore
            let response = self.endpoint.create_response(
                &request,
                StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                None,
            );
            let _ = tsx.respond(response).await;
            return;
        }

        let response = self
            .endpoint
            .create_response(&request, StatusCode::OK, None);
        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to respond to CANCEL, {e}");
        }

        if let Some(server_inv) = self.server_inv.take() {
            let response = self.dialog.create_response(
                &self.endpoint,
                self.invite_request.as_ref().expect("incoming call"),
                StatusCode::REQUEST_TERMINATED,
                None,
            );

            if let Err(e) = server_inv.respond_failure(response).await {
                log::warn!("failed to answer cancelled INVITE with 487, {e}");
            }
        }

        self.end(CallEndReason::Cancelled).await;
    }

    async fn handle_bye(&mut self, request: IncomingRequest) {
        if !self.dialog.accept_peer_cseq(request.base_headers.cseq.cseq) {
            log::warn!("dropping BYE with decreasing CSeq");
            return;
        }

        let tsx = self.endpoint.create_server_tsx(&request);
        let response = self
            .dialog
            .create_response(&self.endpoint, &request, StatusCode::OK, None);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to respond to BYE, {e}");
        }

        if self.state == CallState::Ending {
            // both sides hung up at once; ours won, just acknowledge
            return;
        }

        self.end(CallEndReason::NormalHangup).await;
    }

    async fn handle_reinvite(&mut self, request: IncomingRequest) {
        if !self.dialog.accept_peer_cseq(request.base_headers.cseq.cseq) {
            log::warn!("dropping re-INVITE with decreasing CSeq");
            return;
        }

        let tsx = self.endpoint.create_server_inv_tsx(&request);

        if matches!(
            self.pending.as_ref().map(|p| &p.kind),
            Some(Pending::Reinvite { .. })
        ) {
            // re-INVITE collision, the peer has to back off
            let response = self.dialog.create_response(
                &self.endpoint,
                &request,
                StatusCode::REQUEST_PENDING,
                None,
            );
            let _ = tsx.respond_failure(response).await;
            return;
        }

        let Some(offer) = (!request.body.is_empty())
            .then(|| BytesStr::from(String::from_utf8_lossy(&request.body).into_owned()))
        else {
            let response = self.dialog.create_response(
                &self.endpoint,
                &request,
                StatusCode::BAD_REQUEST,
                None,
            );
            let _ = tsx.respond_failure(response).await;
            return;
        };

        let direction = SdpDirection::of(&offer);

        let answer = match self.shared.media.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("media engine rejected re-INVITE offer, {e}");
                let response = self.dialog.create_response(
                    &self.endpoint,
                    &request,
                    StatusCode::SERVER_INTERNAL_ERROR,
                    None,
                );
                let _ = tsx.respond_failure(response).await;
                return;
            }
        };

        let mut response =
            self.dialog
                .create_response(&self.endpoint, &request, StatusCode::OK, None);
        response.headers.insert_named(&CONTENT_TYPE_SDP);
        response.body = bytes::Bytes::copy_from_slice(answer.as_bytes());

        if let Err(e) = tsx.respond_success(response).await {
            log::warn!("failed to answer re-INVITE, {e}");
            return;
        }

        if self.remote_hold != direction.is_hold() {
            log::info!(
                "peer {} the call",
                if direction.is_hold() { "held" } else { "resumed" }
            );
        }

        self.remote_hold = direction.is_hold();
    }

    // === teardown ===

    /// The transport is gone: the dialog cannot be closed cleanly
    pub(crate) async fn on_transport_lost(&mut self) {
        if self.state != CallState::Ended {
            self.end(CallEndReason::NetworkError).await;
        }
    }

    async fn end(&mut self, reason: CallEndReason) {
        if self.state == CallState::Ended {
            return;
        }

        self.state = CallState::Ended;
        self.pending = None;
        self.reinvite_retry = None;
        self.dtmf_queue.clear();

        self.shared.media.dispose().await;

        self.shared.emit(ClientEvent::CallEnded {
            info: self.info.clone(),
            reason,
        });

        let entry = CallLogEntry {
            account: self.info.account.clone(),
            direction: self.info.direction,
            remote: self.info.remote.clone(),
            start_time: self.start_time,
            connect_time: self.connect_time,
            end_time: SystemTime::now(),
            reason,
            last_status: self.last_status,
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.store.append_call_log(&entry).await {
                log::warn!("failed to append call log entry, {e}");
            }
        });
    }
}

fn extract_sdp(response: &TsxResponse) -> Option<BytesStr> {
    let content_type = response.headers.try_get_named::<ContentType>()?.ok()?;

    if content_type.0 != CONTENT_TYPE_SDP.0 || response.body.is_empty() {
        return None;
    }

    Some(BytesStr::from(
        String::from_utf8_lossy(&response.body).into_owned(),
    ))
}
