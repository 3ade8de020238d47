use crate::account::{AccountConfig, AccountHandle, AccountKey, Command, Shared};
use crate::call::CallMachine;
use crate::events::{ClientEvent, RegistrationState};
use crate::reconnect::ControllerMsg;
use crate::registration::Registrar;
use crate::util::random_string;
use crate::ClientError;
use bytesstr::BytesStr;
use sip_auth::{ClientAuthenticator, DigestAuthenticator, RequestParts, ResponseParts};
use sip_core::transaction::{ClientTsx, TsxResponse};
use sip_core::transport::{TransportEvent, TransportEvents};
use sip_core::{Endpoint, IncomingRequest};
use sip_msg::header::typed::{Contact, FromTo};
use sip_msg::uri::{NameAddr, SipUri};
use sip_msg::{Method, Name, StatusCode};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Why a REGISTER transaction is in flight
enum RegisterKind {
    Initial,
    Refresh,
}

struct PendingRegister {
    tsx: ClientTsx,
    kind: RegisterKind,
    /// A 423 was already answered with the registrar's minimum once
    min_expires_retried: bool,
    /// Outcome channel of a reconnection attempt
    notify: Option<oneshot::Sender<Result<(), ClientError>>>,
}

/// Spawn the actor task of one account and hand out its mailbox
pub(crate) fn spawn_account(shared: Arc<Shared>, config: AccountConfig) -> AccountHandle {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (reg_tx, reg_rx) = watch::channel(RegistrationState::None);

    let actor = AccountActor::new(shared, config, commands, reg_tx);

    tokio::spawn(actor.run());

    AccountHandle {
        commands: commands_tx,
        registration: reg_rx,
    }
}

/// Owns all state of one account.
///
/// Every stimulus (application command, transport event, timer, incoming
/// message) is serialized through the single select loop in [`run`],
/// so the registration manager and the call machine never observe
/// half-applied transitions.
///
/// [`run`]: AccountActor::run
struct AccountActor {
    key: AccountKey,
    config: AccountConfig,
    shared: Arc<Shared>,

    commands: mpsc::UnboundedReceiver<Command>,
    reg_state: watch::Sender<RegistrationState>,

    endpoint: Option<Endpoint>,
    transport_events: Option<TransportEvents>,
    upstream: Option<mpsc::UnboundedReceiver<IncomingRequest>>,

    registrar: Registrar,
    authenticator: DigestAuthenticator,
    pending_register: Option<PendingRegister>,

    call: Option<CallMachine>,
}

impl AccountActor {
    fn new(
        shared: Arc<Shared>,
        config: AccountConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        reg_state: watch::Sender<RegistrationState>,
    ) -> Self {
        let key = config.key();

        // Stable per-account contact host; the registrar reaches us over
        // the connection, the host part only has to be unique
        let contact_host = format!("{}.invalid", crate::util::random_token());

        let id_uri: SipUri = SipUri::new(config.domain.as_str()).user(config.username.as_str());
        let id = match &config.display_name {
            Some(display_name) => NameAddr::new(display_name.as_str(), id_uri),
            None => NameAddr::uri(id_uri),
        };

        let contact_uri = SipUri::new(contact_host).user(config.username.as_str());
        let mut contact = Contact::new(NameAddr::uri(contact_uri));

        if let (Some(token), Some(provider)) = (&config.push_token, &config.push_provider) {
            contact.set_push_token(token.as_str(), provider.as_str());
        }

        let registrar = Registrar::new(
            id,
            contact,
            config.registrar_uri(),
            config.expiry.unwrap_or(shared.config.register_expiry),
        );

        let authenticator = DigestAuthenticator::new(config.credentials());

        Self {
            key,
            config,
            shared,
            commands,
            reg_state,
            endpoint: None,
            transport_events: None,
            upstream: None,
            registrar,
            authenticator,
            pending_register: None,
            call: None,
        }
    }

    async fn run(mut self) {
        loop {
            let register_pending = self.pending_register.is_some();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Unregister { done }) => {
                            self.unregister(Some(done)).await;
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.unregister(None).await;
                            break;
                        }
                    }
                }

                event = next_transport_event(&mut self.transport_events) => {
                    self.handle_transport_event(event).await;
                }

                request = next_incoming_request(&mut self.upstream) => {
                    self.handle_incoming_request(request).await;
                }

                result = await_register(&mut self.pending_register) => {
                    self.handle_register_outcome(result).await;
                }

                _ = self.registrar.wait_for_refresh(), if !register_pending => {
                    self.start_register(RegisterKind::Refresh, None).await;
                }

                event = drive_call(&mut self.call) => {
                    if let Some(call) = &mut self.call {
                        call.on_drive_event(event).await;
                    }
                    self.reap_call();
                }
            }
        }
    }

    // === commands ===

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register => {
                if self.pending_register.is_some() {
                    log::debug!("{}: REGISTER already in flight", self.key);
                    return;
                }

                self.start_register(RegisterKind::Initial, None).await;
            }
            Command::Reconnect { notify } => {
                // fresh transport no matter what state the old one is in
                self.drop_transport().await;
                self.start_register(RegisterKind::Initial, Some(notify)).await;
            }
            Command::NetworkLost => {
                self.drop_transport().await;
                self.fail_call_and_binding(false).await;
            }
            Command::MakeCall { target } => self.make_call(target).await,
            Command::Accept => {
                if let Some(call) = &mut self.call {
                    call.accept().await;
                }
                self.reap_call();
            }
            Command::Decline => {
                if let Some(call) = &mut self.call {
                    call.decline().await;
                }
                self.reap_call();
            }
            Command::Hangup => {
                if let Some(call) = &mut self.call {
                    call.hangup().await;
                }
                self.reap_call();
            }
            Command::Hold => {
                if let Some(call) = &mut self.call {
                    call.set_hold(true).await;
                }
            }
            Command::Resume => {
                if let Some(call) = &mut self.call {
                    call.set_hold(false).await;
                }
            }
            Command::SetMuted(muted) => {
                if let Some(call) = &mut self.call {
                    call.set_muted(muted).await;
                }
            }
            Command::SendDtmf { digits } => {
                if let Some(call) = &mut self.call {
                    call.queue_dtmf(&digits);
                }
            }
            Command::Deflect { target } => {
                if let Some(call) = &mut self.call {
                    call.deflect(target).await;
                }
                self.reap_call();
            }
            Command::Unregister { .. } => unreachable!("handled in run"),
        }
    }

    // === registration ===

    async fn start_register(
        &mut self,
        kind: RegisterKind,
        notify: Option<oneshot::Sender<Result<(), ClientError>>>,
    ) {
        if self.endpoint.is_none() {
            if let Err(e) = self.open_transport().await {
                log::warn!("{}: failed to open transport, {e}", self.key);

                self.set_reg_state(RegistrationState::Failed {
                    reason: BytesStr::from_static("transport"),
                });

                if let Some(notify) = notify {
                    let _ = notify.send(Err(ClientError::Transport(e.to_string())));
                } else {
                    // not controller driven: hand recovery over to it
                    let _ = self
                        .shared
                        .controller
                        .send(ControllerMsg::AccountDown(self.key.clone()));
                }
                return;
            }
        }

        self.set_reg_state(RegistrationState::InProgress);
        self.send_register(kind, false, notify).await;
    }

    async fn send_register(
        &mut self,
        kind: RegisterKind,
        min_expires_retried: bool,
        notify: Option<oneshot::Sender<Result<(), ClientError>>>,
    ) {
        let endpoint = self
            .endpoint
            .clone()
            .expect("send_register runs with an open transport");

        let mut request = self
            .registrar
            .create_register(false, &self.shared.config.user_agent);
        self.authenticator.authorize_request(&mut request.headers);

        match endpoint.send_request(request).await {
            Ok(tsx) => {
                self.pending_register = Some(PendingRegister {
                    tsx,
                    kind,
                    min_expires_retried,
                    notify,
                });
            }
            Err(e) => {
                log::warn!("{}: failed to send REGISTER, {e}", self.key);

                self.set_reg_state(RegistrationState::Failed {
                    reason: BytesStr::from_static("transport"),
                });

                if let Some(notify) = notify {
                    let _ = notify.send(Err(ClientError::Core(e)));
                }
            }
        }
    }

    async fn handle_register_outcome(&mut self, result: sip_core::Result<TsxResponse>) {
        let pending = self
            .pending_register
            .take()
            .expect("outcome implies pending REGISTER");

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{}: REGISTER concluded without response, {e}", self.key);

                self.set_reg_state(RegistrationState::Failed {
                    reason: BytesStr::from_static("timeout"),
                });

                if let Some(notify) = pending.notify {
                    let _ = notify.send(Err(ClientError::Core(e)));
                }
                return;
            }
        };

        let code = response.line.code;

        match code.into_u16() {
            200..=299 => {
                let expires_at = self.registrar.receive_success_response(&response);

                match pending.kind {
                    RegisterKind::Initial => log::info!("{}: registered", self.key),
                    RegisterKind::Refresh => log::debug!("{}: binding refreshed", self.key),
                }

                self.set_reg_state(RegistrationState::Ok { expires_at });

                if let Some(notify) = pending.notify {
                    let _ = notify.send(Ok(()));
                }
            }
            401 | 407 => {
                let request = pending.tsx.request();

                let handled = self.authenticator.handle_rejection(
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
                );

                match handled {
                    Ok(()) => {
                        self.send_register(
                            pending.kind,
                            pending.min_expires_retried,
                            pending.notify,
                        )
                        .await;
                    }
                    Err(e) => {
                        log::warn!("{}: registration not authorized, {e}", self.key);

                        self.set_reg_state(RegistrationState::Failed {
                            reason: BytesStr::from_static("auth"),
                        });

                        if let Some(notify) = pending.notify {
                            let _ = notify.send(Err(ClientError::AuthRejected));
                        }
                    }
                }
            }
            403 => {
                self.set_reg_state(RegistrationState::Failed {
                    reason: BytesStr::from_static("auth"),
                });

                if let Some(notify) = pending.notify {
                    let _ = notify.send(Err(ClientError::AuthRejected));
                }
            }
            423 if !pending.min_expires_retried
                && self.registrar.receive_error_response(&response) =>
            {
                log::debug!("{}: registrar wants a longer expiry, retrying", self.key);
                self.send_register(pending.kind, true, pending.notify).await;
            }
            _ => {
                log::warn!("{}: REGISTER rejected with {code}", self.key);

                self.set_reg_state(RegistrationState::Failed {
                    reason: BytesStr::from(code.to_string()),
                });

                if let Some(notify) = pending.notify {
                    let _ = notify.send(Err(ClientError::RegistrationRejected(code)));
                }
            }
        }
    }

    async fn unregister(&mut self, done: Option<oneshot::Sender<()>>) {
        self.pending_register = None;

        if let Some(call) = &mut self.call {
            call.hangup().await;
        }
        self.call = None;

        if let Some(endpoint) = self.endpoint.clone() {
            let mut request = self
                .registrar
                .create_register(true, &self.shared.config.user_agent);
            self.authenticator.authorize_request(&mut request.headers);

            if let Ok(mut tsx) = endpoint.send_request(request).await {
                match tokio::time::timeout(
                    self.shared.config.unregister_timeout,
                    tsx.receive_final(),
                )
                .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::debug!("{}: un-REGISTER failed, {e}", self.key),
                    Err(_) => log::debug!("{}: un-REGISTER timed out", self.key),
                }
            }
        }

        // unconditional per contract: whatever the registrar said, the
        // binding is gone from our point of view
        self.registrar.clear_binding();
        self.set_reg_state(RegistrationState::None);
        self.drop_transport().await;

        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn set_reg_state(&self, state: RegistrationState) {
        self.reg_state.send_replace(state.clone());

        self.shared.persist_registration_state(&self.key, &state);
        self.shared.emit(ClientEvent::RegistrationStateChanged {
            account: self.key.clone(),
            state,
        });
    }

    // === transport ===

    async fn open_transport(&mut self) -> std::io::Result<()> {
        let (transport, events) = tokio::time::timeout(
            self.shared.config.transport_open_timeout,
            self.shared.connector.connect(&self.config.transport_url),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "transport open timed out")
        })??;

        let (endpoint, upstream) = Endpoint::new(
            transport,
            transport_name(&self.config.transport_url),
            self.registrar.contact().addr.uri.host.clone(),
        );

        self.endpoint = Some(endpoint);
        self.transport_events = Some(events);
        self.upstream = Some(upstream);

        Ok(())
    }

    async fn drop_transport(&mut self) {
        self.pending_register = None;

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.transport().close(1000, "teardown").await;
        }

        self.transport_events = None;
        self.upstream = None;
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => {
                log::debug!("{}: transport is open", self.key);
            }
            Some(TransportEvent::Message(text)) => {
                if let Some(endpoint) = &self.endpoint {
                    endpoint.receive(&text);
                }
            }
            Some(TransportEvent::Error(e)) => {
                log::warn!("{}: transport error, {e}", self.key);
            }
            Some(TransportEvent::Closed { reason }) => {
                log::warn!("{}: transport closed, {reason}", self.key);
                self.on_transport_lost().await;
            }
            None => {
                self.on_transport_lost().await;
            }
        }
    }

    async fn on_transport_lost(&mut self) {
        self.drop_transport().await;
        self.fail_call_and_binding(true).await;
    }

    /// Shared teardown after transport loss. Recovery is requested from
    /// the controller only when the loss was not controller initiated.
    async fn fail_call_and_binding(&mut self, request_recovery: bool) {
        if let Some(call) = &mut self.call {
            call.on_transport_lost().await;
        }
        self.reap_call();

        self.registrar.clear_binding();
        self.set_reg_state(RegistrationState::None);

        if request_recovery {
            let _ = self
                .shared
                .controller
                .send(ControllerMsg::AccountDown(self.key.clone()));
        }
    }

    // === calls ===

    async fn make_call(&mut self, target: SipUri) {
        let info = crate::events::CallInfo {
            account: self.key.clone(),
            call_id: BytesStr::from_static(""),
            direction: crate::events::CallDirection::Outgoing,
            local: BytesStr::from(self.registrar.id().uri.to_string()),
            remote: BytesStr::from(target.to_string()),
            remote_display_name: None,
        };

        if self.call.is_some() {
            self.shared.emit(ClientEvent::CallFailed {
                info,
                error: BytesStr::from_static("another call is active"),
            });
            return;
        }

        let Some(endpoint) = self.endpoint.clone() else {
            self.shared.emit(ClientEvent::CallFailed {
                info,
                error: BytesStr::from_static("not connected"),
            });
            return;
        };

        match CallMachine::start_outgoing(
            self.shared.clone(),
            endpoint,
            self.registrar.id().clone(),
            self.registrar.contact().clone(),
            self.config.credentials(),
            self.key.clone(),
            target,
        )
        .await
        {
            Ok(machine) => self.call = Some(machine),
            Err(_info) => {
                // failure event was already emitted by the machine
            }
        }
    }

    async fn handle_incoming_request(&mut self, request: Option<IncomingRequest>) {
        let Some(request) = request else {
            // endpoint was dropped with the transport
            return;
        };

        // in-dialog requests and the CANCEL of a known INVITE belong to
        // the active call
        if let Some(call) = &mut self.call {
            if call.call_id() == &request.base_headers.call_id.0 {
                call.handle_request(request).await;
                self.reap_call();
                return;
            }
        }

        match request.line.method.clone() {
            Method::INVITE => {
                if self.call.is_some() {
                    // one call per account, anything else is busy
                    self.respond_busy(request).await;
                } else {
                    self.accept_incoming_invite(request).await;
                }
            }
            Method::ACK => {
                // stray ACK, nothing to do
            }
            _ => {
                if let Some(endpoint) = &self.endpoint {
                    if let Err(e) = endpoint.handle_unwanted_request(request).await {
                        log::warn!("{}: failed to reject stray request, {e}", self.key);
                    }
                }
            }
        }
    }

    async fn respond_busy(&mut self, request: IncomingRequest) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let tsx = endpoint.create_server_inv_tsx(&request);
        let mut response = endpoint.create_response(&request, StatusCode::BUSY_HERE, None);

        // busy is a final response and needs a To tag even without a dialog
        let to = FromTo::new(request.base_headers.to.addr.clone(), Some(random_string()));
        response.headers.remove(&Name::TO);
        response.headers.insert_type(Name::TO, &to);

        if let Err(e) = tsx.respond_failure(response).await {
            log::warn!("{}: failed to respond busy, {e}", self.key);
        }
    }

    async fn accept_incoming_invite(&mut self, request: IncomingRequest) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        match CallMachine::start_incoming(
            self.shared.clone(),
            endpoint,
            self.registrar.contact().clone(),
            self.key.clone(),
            request,
        )
        .await
        {
            Ok(machine) => self.call = Some(machine),
            Err(()) => {}
        }
    }

    fn reap_call(&mut self) {
        if self.call.as_ref().is_some_and(|call| call.is_ended()) {
            self.call = None;
        }
    }
}

/// Via transport token guessed from the url scheme; purely cosmetic on a
/// message framed transport
fn transport_name(url: &str) -> &'static str {
    if url.starts_with("wss:") {
        "WSS"
    } else if url.starts_with("ws:") {
        "WS"
    } else if url.starts_with("tls:") || url.starts_with("sips:") {
        "TLS"
    } else {
        "TCP"
    }
}

async fn next_transport_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_incoming_request(
    upstream: &mut Option<mpsc::UnboundedReceiver<IncomingRequest>>,
) -> Option<IncomingRequest> {
    match upstream {
        Some(upstream) => upstream.recv().await,
        None => std::future::pending().await,
    }
}

async fn await_register(pending: &mut Option<PendingRegister>) -> sip_core::Result<TsxResponse> {
    // the transaction enforces Timer F itself
    match pending {
        Some(pending) => pending.tsx.receive_final().await,
        None => std::future::pending().await,
    }
}

async fn drive_call(call: &mut Option<CallMachine>) -> crate::call::DriveEvent {
    match call {
        Some(call) => call.drive().await,
        None => std::future::pending().await,
    }
}
